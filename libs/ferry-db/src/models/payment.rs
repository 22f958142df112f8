use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: i64,
    pub uuid: String,
    /// Driver name, e.g. `EPay` or `Cryptomus`.
    pub payment: String,
    pub name: String,
    pub icon: Option<String>,
    pub config: serde_json::Value,
    pub notify_domain: Option<String>,
    pub handling_fee_fixed: Option<i64>,
    pub handling_fee_percent: Option<f64>,
    pub enable: bool,
    pub sort: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Fee added on top of `total`, rounded to the nearest cent.
    pub fn handling_amount(&self, total: i64) -> Option<i64> {
        let fixed = self.handling_fee_fixed.unwrap_or(0);
        let percent = self.handling_fee_percent.unwrap_or(0.0);
        if fixed == 0 && percent == 0.0 {
            return None;
        }
        Some((total as f64 * (percent / 100.0) + fixed as f64).round() as i64)
    }
}

/// Public view returned to users choosing a payment method.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct PaymentMethod {
    pub id: i64,
    pub name: String,
    pub payment: String,
    pub icon: Option<String>,
    pub handling_fee_fixed: Option<i64>,
    pub handling_fee_percent: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handling_amount_combines_percent_and_fixed() {
        let now = Utc::now();
        let mut p = Payment {
            id: 1,
            uuid: "u".into(),
            payment: "EPay".into(),
            name: "epay".into(),
            icon: None,
            config: serde_json::json!({}),
            notify_domain: None,
            handling_fee_fixed: None,
            handling_fee_percent: None,
            enable: true,
            sort: 0,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(p.handling_amount(1000), None);

        p.handling_fee_percent = Some(2.5);
        p.handling_fee_fixed = Some(10);
        assert_eq!(p.handling_amount(1000), Some(35));

        p.handling_fee_percent = Some(0.5);
        p.handling_fee_fixed = None;
        assert_eq!(p.handling_amount(101), Some(1));
    }
}
