use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: i64,
    pub group_id: i64,
    /// Traffic quota in GB.
    pub transfer_enable: i64,
    pub speed_limit: Option<i32>,
    pub name: String,
    pub content: Option<String>,
    pub show: bool,
    pub renew: bool,
    pub sort: i32,
    pub month_price: Option<i64>,
    pub quarter_price: Option<i64>,
    pub half_year_price: Option<i64>,
    pub year_price: Option<i64>,
    pub two_year_price: Option<i64>,
    pub three_year_price: Option<i64>,
    pub onetime_price: Option<i64>,
    pub reset_price: Option<i64>,
    pub reset_traffic_method: Option<i16>,
    pub capacity_limit: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn price(&self, period: Period) -> Option<i64> {
        match period {
            Period::Month => self.month_price,
            Period::Quarter => self.quarter_price,
            Period::HalfYear => self.half_year_price,
            Period::Year => self.year_price,
            Period::TwoYear => self.two_year_price,
            Period::ThreeYear => self.three_year_price,
            Period::Onetime => self.onetime_price,
            Period::ResetTraffic => self.reset_price,
        }
    }

    pub fn transfer_bytes(&self) -> i64 {
        self.transfer_enable.saturating_mul(super::GB)
    }
}

/// Billing period, stored as the name of the matching price column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Period {
    #[serde(rename = "month_price")]
    Month,
    #[serde(rename = "quarter_price")]
    Quarter,
    #[serde(rename = "half_year_price")]
    HalfYear,
    #[serde(rename = "year_price")]
    Year,
    #[serde(rename = "two_year_price")]
    TwoYear,
    #[serde(rename = "three_year_price")]
    ThreeYear,
    #[serde(rename = "onetime_price")]
    Onetime,
    #[serde(rename = "reset_price")]
    ResetTraffic,
}

impl Period {
    pub const ALL: [Period; 8] = [
        Period::Month,
        Period::Quarter,
        Period::HalfYear,
        Period::Year,
        Period::TwoYear,
        Period::ThreeYear,
        Period::Onetime,
        Period::ResetTraffic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Month => "month_price",
            Period::Quarter => "quarter_price",
            Period::HalfYear => "half_year_price",
            Period::Year => "year_price",
            Period::TwoYear => "two_year_price",
            Period::ThreeYear => "three_year_price",
            Period::Onetime => "onetime_price",
            Period::ResetTraffic => "reset_price",
        }
    }

    /// Length in months for recurring periods.
    pub fn months(&self) -> Option<u32> {
        match self {
            Period::Month => Some(1),
            Period::Quarter => Some(3),
            Period::HalfYear => Some(6),
            Period::Year => Some(12),
            Period::TwoYear => Some(24),
            Period::ThreeYear => Some(36),
            Period::Onetime | Period::ResetTraffic => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Period::Month => "Monthly",
            Period::Quarter => "Quarterly",
            Period::HalfYear => "Half-yearly",
            Period::Year => "Yearly",
            Period::TwoYear => "2 years",
            Period::ThreeYear => "3 years",
            Period::Onetime => "One-time",
            Period::ResetTraffic => "Traffic reset",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown period: {0}")]
pub struct UnknownPeriod(pub String);

impl FromStr for Period {
    type Err = UnknownPeriod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Period::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownPeriod(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_parses_column_names() {
        assert_eq!("quarter_price".parse::<Period>().unwrap(), Period::Quarter);
        assert_eq!("reset_price".parse::<Period>().unwrap(), Period::ResetTraffic);
        assert!("weekly".parse::<Period>().is_err());
    }

    #[test]
    fn only_recurring_periods_have_months() {
        assert_eq!(Period::ThreeYear.months(), Some(36));
        assert_eq!(Period::Onetime.months(), None);
        assert_eq!(Period::ResetTraffic.months(), None);
    }
}
