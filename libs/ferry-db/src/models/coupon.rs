use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
#[serde(rename_all = "snake_case")]
pub enum CouponType {
    /// `value` is an amount in cents.
    Amount = 1,
    /// `value` is a percentage.
    Percentage = 2,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Coupon {
    pub id: i64,
    pub code: String,
    pub name: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub coupon_type: CouponType,
    pub value: i64,
    pub show: bool,
    pub limit_use: Option<i32>,
    pub limit_use_with_user: Option<i32>,
    pub limit_plan_ids: Option<Vec<i64>>,
    pub limit_period: Option<Vec<String>>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Coupon {
    /// Discount for `total`, never exceeding it.
    pub fn discount_for(&self, total: i64) -> i64 {
        let raw = match self.coupon_type {
            CouponType::Amount => self.value,
            CouponType::Percentage => total * self.value / 100,
        };
        raw.clamp(0, total.max(0))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CouponInput {
    pub code: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub coupon_type: CouponType,
    pub value: i64,
    #[serde(default = "default_true")]
    pub show: bool,
    pub limit_use: Option<i32>,
    pub limit_use_with_user: Option<i32>,
    pub limit_plan_ids: Option<Vec<i64>>,
    pub limit_period: Option<Vec<String>>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coupon(coupon_type: CouponType, value: i64) -> Coupon {
        let now = Utc::now();
        Coupon {
            id: 1,
            code: "X".into(),
            name: "x".into(),
            coupon_type,
            value,
            show: true,
            limit_use: None,
            limit_use_with_user: None,
            limit_plan_ids: None,
            limit_period: None,
            started_at: now,
            ended_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn discount_is_capped_at_total() {
        assert_eq!(coupon(CouponType::Amount, 500).discount_for(300), 300);
        assert_eq!(coupon(CouponType::Amount, 100).discount_for(300), 100);
        assert_eq!(coupon(CouponType::Percentage, 25).discount_for(1000), 250);
        assert_eq!(coupon(CouponType::Percentage, 150).discount_for(1000), 1000);
        assert_eq!(coupon(CouponType::Percentage, 100).discount_for(0), 0);
    }
}
