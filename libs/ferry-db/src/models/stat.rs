use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// Daily business totals.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Stat {
    pub id: i64,
    pub record_at: NaiveDate,
    pub order_count: i64,
    pub order_total: i64,
    pub paid_count: i64,
    pub paid_total: i64,
    pub commission_count: i64,
    pub commission_total: i64,
    pub register_count: i64,
    pub invite_count: i64,
    pub transfer_used_total: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct StatUser {
    pub id: i64,
    pub user_id: i64,
    pub server_rate: f64,
    pub u: i64,
    pub d: i64,
    pub record_at: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ServerTraffic {
    pub server_id: i64,
    pub server_type: String,
    pub server_name: Option<String>,
    pub u: i64,
    pub d: i64,
    pub total: i64,
}

/// Income of one local day.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct DailyIncome {
    pub day: NaiveDate,
    pub total: i64,
    pub count: i64,
}

/// Paid orders of one local day and order type.
#[derive(Debug, Clone, FromRow)]
pub struct DailyTypeTotal {
    pub day: NaiveDate,
    pub order_type: i16,
    pub count: i64,
    pub amount: i64,
}

/// Values written to the daily `stats` row.
#[derive(Debug, Clone, Default, PartialEq, Eq, FromRow)]
pub struct DailyRecord {
    pub order_count: i64,
    pub order_total: i64,
    pub paid_count: i64,
    pub paid_total: i64,
    pub commission_count: i64,
    pub commission_total: i64,
    pub register_count: i64,
    pub invite_count: i64,
    pub transfer_used_total: i64,
}
