use anyhow::Result;
use ferry_db::models::order::{Order, OrderType};
use ferry_db::models::plan::Period;
use ferry_db::repositories::coupon_repo::CouponRepository;
use ferry_db::repositories::plan_repo::PlanRepository;
use ferry_db::repositories::user_repo::UserRepository;
use sqlx::PgPool;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tracing::{debug, error, info};

use crate::config::CommissionConfig;
use crate::services::commission_service;
use crate::utils;

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Which moment of the order life cycle a message reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEvent {
    Checkout,
    Paid,
}

/// Everything shown in an admin order message.
#[derive(Debug, Clone, Default)]
pub struct OrderDigest {
    pub amount: i64,
    pub trade_no: String,
    pub email: String,
    pub plan: String,
    pub order_type: String,
    pub period: String,
    pub discount: Option<i64>,
    pub coupon_code: Option<String>,
    pub commission: i64,
    pub inviter_email: Option<String>,
    /// Inviter's balance or commission balance after this order.
    pub inviter_total: Option<(bool, i64)>,
    pub signup_date: Option<String>,
}

impl OrderDigest {
    pub fn render(&self, event: OrderEvent) -> String {
        let heading = match event {
            OrderEvent::Checkout => "🧾 Checkout started",
            OrderEvent::Paid => "💰 Payment received",
        };
        let mut lines = vec![
            format!("{} {}", heading, utils::format_cents(self.amount)),
            "———————————————".to_string(),
            format!("Order: <code>{}</code>", escape_html(&self.trade_no)),
            format!("Email: <code>{}</code>", escape_html(&self.email)),
            format!("Plan: {}", escape_html(&self.plan)),
            format!("Type: {}", self.order_type),
            format!("Period: {}", self.period),
        ];
        if let Some(discount) = self.discount {
            lines.push(format!("Discount: {}", utils::format_cents(discount)));
        }
        if let Some(code) = &self.coupon_code {
            lines.push(format!("Coupon: <code>{}</code>", escape_html(code)));
        }
        lines.push(format!("Commission: {}", utils::format_cents(self.commission)));
        match (&self.inviter_email, self.inviter_total) {
            (Some(email), Some((withdraw_closed, total))) => {
                lines.push(format!("Inviter: <code>{}</code>", escape_html(email)));
                let label = if withdraw_closed { "Inviter balance" } else { "Inviter commission" };
                lines.push(format!("{}: {}", label, utils::format_cents(total)));
            }
            _ => lines.push("Inviter: none".to_string()),
        }
        if let Some(date) = &self.signup_date {
            lines.push(format!("Registered: {}", date));
        }
        lines.join("\n")
    }
}

#[derive(Clone)]
pub struct NotificationService {
    bot: Option<Bot>,
    users: UserRepository,
    plans: PlanRepository,
    coupons: CouponRepository,
    commission: CommissionConfig,
}

impl NotificationService {
    pub fn new(pool: PgPool, bot: Option<Bot>, commission: CommissionConfig) -> Self {
        Self {
            bot,
            users: UserRepository::new(pool.clone()),
            plans: PlanRepository::new(pool.clone()),
            coupons: CouponRepository::new(pool),
            commission,
        }
    }

    pub fn bot(&self) -> Option<&Bot> {
        self.bot.as_ref()
    }

    pub async fn send_to(&self, chat_id: i64, text: &str) -> Result<()> {
        let Some(bot) = &self.bot else {
            debug!("Telegram disabled, dropping message to {}", chat_id);
            return Ok(());
        };
        bot.send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .await?;
        Ok(())
    }

    pub async fn send_to_admins(&self, text: &str) -> Result<()> {
        if self.bot.is_none() {
            return Ok(());
        }
        for chat_id in self.users.admin_telegram_ids().await? {
            if let Err(e) = self.send_to(chat_id, text).await {
                error!("Failed to notify admin {}: {}", chat_id, e);
            }
        }
        Ok(())
    }

    /// Sends the admin order message. Failures are logged, never returned.
    pub async fn order(&self, order: &Order, event: OrderEvent) {
        let result = async {
            let digest = self.digest(order).await?;
            info!("Order notification for {} ({:?})", order.trade_no, event);
            self.send_to_admins(&digest.render(event)).await
        }
        .await;
        if let Err(e) = result {
            error!("Order notification for {} failed: {:#}", order.trade_no, e);
        }
    }

    async fn digest(&self, order: &Order) -> Result<OrderDigest> {
        let user = self.users.get_by_id(order.user_id).await?;
        let plan = self.plans.get_by_id(order.plan_id).await?;

        let mut digest = OrderDigest {
            amount: order.total_amount,
            trade_no: order.trade_no.clone(),
            email: user.as_ref().map(|u| u.email.clone()).unwrap_or_default(),
            plan: plan.map(|p| p.name).unwrap_or_default(),
            order_type: type_label(order.order_type).to_string(),
            period: order
                .period
                .parse::<Period>()
                .map(|p| p.label().to_string())
                .unwrap_or_else(|_| "Unknown".to_string()),
            signup_date: user.as_ref().map(|u| u.created_at.format("%Y-%m-%d").to_string()),
            ..OrderDigest::default()
        };

        if let Some(coupon_id) = order.coupon_id {
            digest.discount = order.discount_amount;
            digest.coupon_code = self.coupons.get_by_id(coupon_id).await?.map(|c| c.code);
        }

        if let Some(inviter_id) = order.invite_user_id
            && let Some(inviter) = self.users.get_by_id(inviter_id).await?
        {
            let share = commission_service::commission_shares(&self.commission)
                .first()
                .copied()
                .unwrap_or(0);
            digest.commission = commission_service::share_amount(order.commission_balance, share);
            let base = if self.commission.withdraw_close_enable {
                inviter.balance
            } else {
                inviter.commission_balance
            };
            digest.inviter_email = Some(inviter.email);
            digest.inviter_total = Some((self.commission.withdraw_close_enable, base + digest.commission));
        }
        Ok(digest)
    }
}

pub fn type_label(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::New | OrderType::Renew | OrderType::Change | OrderType::ResetTraffic => order_type.label(),
        OrderType::InviteReward => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paid_message_lists_inviter_totals() {
        let digest = OrderDigest {
            amount: 1990,
            trade_no: "20260101000000123456".into(),
            email: "a<b>@example.com".into(),
            plan: "Pro".into(),
            order_type: type_label(OrderType::Renew).into(),
            period: Period::Quarter.label().into(),
            commission: 199,
            inviter_email: Some("inviter@example.com".into()),
            inviter_total: Some((false, 1199)),
            ..OrderDigest::default()
        };
        let text = digest.render(OrderEvent::Paid);
        assert!(text.starts_with("💰 Payment received 19.90"));
        assert!(text.contains("a&lt;b&gt;@example.com"));
        assert!(text.contains("Type: Renewal"));
        assert!(text.contains("Period: Quarterly"));
        assert!(text.contains("Commission: 1.99"));
        assert!(text.contains("Inviter commission: 11.99"));
        assert!(!text.contains("Coupon"));
    }

    #[test]
    fn message_without_inviter() {
        let digest = OrderDigest {
            trade_no: "T".into(),
            coupon_code: Some("SPRING".into()),
            discount: Some(100),
            ..OrderDigest::default()
        };
        let text = digest.render(OrderEvent::Checkout);
        assert!(text.contains("Inviter: none"));
        assert!(text.contains("Coupon: <code>SPRING</code>"));
        assert!(text.contains("Discount: 1.00"));
    }

    #[test]
    fn reward_orders_have_no_type_label() {
        assert_eq!(type_label(OrderType::New), "New purchase");
        assert_eq!(type_label(OrderType::InviteReward), "Unknown");
    }
}
