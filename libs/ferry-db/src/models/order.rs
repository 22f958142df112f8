use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending = 0,
    Processing = 1,
    Cancelled = 2,
    Completed = 3,
    /// Superseded by a plan change that consumed its remaining value.
    Discounted = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    New = 1,
    Renew = 2,
    Change = 3,
    ResetTraffic = 4,
    InviteReward = 6,
}

impl OrderType {
    pub fn label(&self) -> &'static str {
        match self {
            OrderType::New => "New purchase",
            OrderType::Renew => "Renewal",
            OrderType::Change => "Plan change",
            OrderType::ResetTraffic => "Traffic pack",
            OrderType::InviteReward => "Invite reward",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    Pending = 0,
    Processing = 1,
    Valid = 2,
    Invalid = 3,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: i64,
    pub invite_user_id: Option<i64>,
    pub user_id: i64,
    pub plan_id: i64,
    pub coupon_id: Option<i64>,
    pub payment_id: Option<i64>,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub period: String,
    pub trade_no: String,
    pub callback_no: Option<String>,
    pub total_amount: i64,
    pub handling_amount: Option<i64>,
    pub discount_amount: Option<i64>,
    pub surplus_amount: Option<i64>,
    pub refund_amount: Option<i64>,
    pub balance_amount: Option<i64>,
    pub surplus_order_ids: Option<Vec<i64>>,
    pub status: OrderStatus,
    pub commission_status: CommissionStatus,
    pub commission_balance: i64,
    pub actual_commission_balance: Option<i64>,
    pub gift_days: Option<f64>,
    pub invited_user_id: Option<i64>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An order being assembled before it is inserted.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: i64,
    pub plan_id: i64,
    pub period: String,
    pub trade_no: String,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub total_amount: i64,
    pub coupon_id: Option<i64>,
    pub discount_amount: Option<i64>,
    pub surplus_amount: Option<i64>,
    pub refund_amount: Option<i64>,
    pub balance_amount: Option<i64>,
    pub surplus_order_ids: Option<Vec<i64>>,
    pub invite_user_id: Option<i64>,
    pub commission_balance: i64,
    pub gift_days: Option<f64>,
    pub invited_user_id: Option<i64>,
}

impl NewOrder {
    pub fn new(user_id: i64, plan_id: i64, period: &str, trade_no: String, total_amount: i64) -> Self {
        Self {
            user_id,
            plan_id,
            period: period.to_string(),
            trade_no,
            order_type: OrderType::New,
            status: OrderStatus::Pending,
            total_amount,
            coupon_id: None,
            discount_amount: None,
            surplus_amount: None,
            refund_amount: None,
            balance_amount: None,
            surplus_order_ids: None,
            invite_user_id: None,
            commission_balance: 0,
            gift_days: None,
            invited_user_id: None,
        }
    }

    pub fn add_discount(&mut self, amount: i64) {
        self.discount_amount = Some(self.discount_amount.unwrap_or(0) + amount);
        self.total_amount -= amount;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discounts_accumulate() {
        let mut order = NewOrder::new(1, 1, "month_price", "T1".into(), 1000);
        order.add_discount(100);
        order.add_discount(50);
        assert_eq!(order.discount_amount, Some(150));
        assert_eq!(order.total_amount, 850);
    }

    #[test]
    fn status_serializes_as_snake_case() {
        let json = serde_json::to_string(&OrderStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }
}
