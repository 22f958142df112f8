use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use ferry_db::models::order::{CommissionStatus, NewOrder, Order, OrderStatus, OrderType};
use ferry_db::models::plan::{Period, Plan};
use ferry_db::models::user::{CommissionType, User};
use ferry_db::repositories::invite_repo::InviteRepository;
use ferry_db::repositories::order_repo::OrderRepository;
use ferry_db::repositories::plan_repo::PlanRepository;
use ferry_db::repositories::user_repo::UserRepository;
use sqlx::PgPool;
use tracing::{debug, error, info, warn};

use crate::config::CommissionConfig;
use crate::utils;

/// Commission levels walked up the invite chain.
const MAX_LEVELS: usize = 3;
/// Days a paid order waits before its commission is approved.
const CHECK_DELAY_DAYS: i64 = 3;

#[derive(Clone)]
pub struct CommissionService {
    pool: PgPool,
    orders: OrderRepository,
    users: UserRepository,
    plans: PlanRepository,
    config: CommissionConfig,
}

impl CommissionService {
    pub fn new(pool: PgPool, config: CommissionConfig) -> Self {
        Self {
            orders: OrderRepository::new(pool.clone()),
            users: UserRepository::new(pool.clone()),
            plans: PlanRepository::new(pool.clone()),
            pool,
            config,
        }
    }

    pub fn config(&self) -> &CommissionConfig {
        &self.config
    }

    /// Attaches the inviter and their commission to an order being built.
    pub async fn set_invite(&self, order: &mut NewOrder, user: &User) -> Result<()> {
        if !self.config.enabled || order.total_amount <= 0 {
            return Ok(());
        }
        let Some(inviter_id) = user.invite_user_id else {
            return Ok(());
        };
        let Some(inviter) = self.users.get_by_id(inviter_id).await? else {
            return Ok(());
        };
        order.invite_user_id = Some(inviter.id);

        let has_paid_before = self.orders.has_paid_order(user.id).await?;
        order.commission_balance = commission_for(order.total_amount, &inviter, &self.config, has_paid_before);
        Ok(())
    }

    /// Approves commission on paid orders that have settled for a few days.
    pub async fn auto_check(&self) -> Result<usize> {
        if !self.config.commission_auto_check_enable {
            return Ok(0);
        }
        let before = Utc::now() - Duration::days(CHECK_DELAY_DAYS);
        let due = self.orders.commission_due(before).await?;
        for order in &due {
            self.orders
                .set_commission_status(order.id, CommissionStatus::Processing)
                .await?;
        }
        if !due.is_empty() {
            info!("Approved commission on {} orders", due.len());
        }
        Ok(due.len())
    }

    /// Pays approved commission. A failing order is logged and left for the next run.
    pub async fn auto_pay(&self) -> Result<usize> {
        let orders = self.orders.commission_processing().await?;
        let mut paid = 0;
        for order in orders {
            match self.pay_order(&order).await {
                Ok(()) => paid += 1,
                Err(e) => error!("Commission payout for order {} failed: {:#}", order.trade_no, e),
            }
        }
        if paid > 0 {
            info!("Paid commission on {} orders", paid);
        }
        Ok(paid)
    }

    async fn pay_order(&self, order: &Order) -> Result<()> {
        let Some(first_inviter) = order.invite_user_id else {
            return Ok(());
        };
        let shares = commission_shares(&self.config);

        let mut tx = self.pool.begin().await?;
        let mut actual = 0;
        let mut inviter_id = Some(first_inviter);

        for percent in shares {
            let Some(id) = inviter_id else { break };
            let Some(inviter) = UserRepository::lock_by_id(&mut tx, id).await? else {
                break;
            };
            inviter_id = inviter.invite_user_id;

            let amount = share_amount(order.commission_balance, percent);
            if amount <= 0 {
                continue;
            }

            let logged = InviteRepository::insert_log(
                &mut tx,
                inviter.id,
                order.user_id,
                &order.trade_no,
                order.total_amount,
                amount,
            )
            .await?;
            if !logged {
                warn!("Commission for {} already paid to user {}", order.trade_no, inviter.id);
                continue;
            }

            if self.config.withdraw_close_enable {
                UserRepository::add_balance(&mut tx, inviter.id, amount).await?;
            } else {
                UserRepository::add_commission_balance(&mut tx, inviter.id, amount).await?;
            }
            debug!("Credited {} to user {} for {}", amount, inviter.id, order.trade_no);
            actual += amount;
        }

        OrderRepository::settle_commission(&mut tx, order.id, actual).await?;
        tx.commit().await.context("Failed to commit commission payout")?;
        Ok(())
    }

    /// Rewards the inviter when their invitee completes a first paid order.
    /// Returns whether a reward order was created.
    pub async fn first_order_reward(&self, order: &Order) -> Result<bool> {
        let Some(plan_id) = self.config.complimentary_packages else {
            return Ok(false);
        };
        if order.order_type == OrderType::InviteReward || paid_value(order) <= 0 {
            return Ok(false);
        }
        let Some(user) = self.users.get_by_id(order.user_id).await? else {
            return Ok(false);
        };
        let Some(inviter_id) = user.invite_user_id else {
            return Ok(false);
        };
        if user.has_triggered_invite_reward {
            debug!("User {} already rewarded their inviter", user.id);
            return Ok(false);
        }
        if self.orders.has_other_paid_order(user.id, order.id).await? {
            debug!("Order {} is not the first paid order of user {}", order.trade_no, user.id);
            return Ok(false);
        }
        let Some(plan) = self.plans.get_by_id(plan_id).await? else {
            error!("Complimentary plan {} does not exist", plan_id);
            return Ok(false);
        };

        let hours = self.config.complimentary_package_duration;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        let Some(mut inviter) = UserRepository::lock_by_id(&mut tx, inviter_id).await? else {
            return Ok(false);
        };

        let mut reward = NewOrder::new(inviter.id, plan.id, reward_period(hours).as_str(), utils::guid(), 0);
        reward.status = OrderStatus::Completed;
        reward.order_type = OrderType::InviteReward;
        reward.gift_days = Some(gift_days(hours));
        reward.invited_user_id = Some(user.id);
        let reward = OrderRepository::insert(&mut tx, &reward).await?;

        if apply_gift(&mut inviter, &plan, Duration::hours(hours), now) {
            UserRepository::save_subscription(&mut tx, &inviter).await?;
        }
        UserRepository::mark_invite_reward_triggered(&mut tx, user.id).await?;
        tx.commit().await.context("Failed to commit invite reward")?;

        info!(
            "Invite reward {} granted to user {} for user {}",
            reward.trade_no, inviter.id, user.id
        );
        Ok(true)
    }
}

/// Money that actually changed hands for the order.
fn paid_value(order: &Order) -> i64 {
    order.total_amount + order.balance_amount.unwrap_or(0)
}

/// Commission owed to `inviter` for an order of `total` cents, rounded down.
pub fn commission_for(total: i64, inviter: &User, config: &CommissionConfig, has_paid_before: bool) -> i64 {
    let eligible = match CommissionType::from(inviter.commission_type) {
        CommissionType::System => !(config.commission_first_time_enable && has_paid_before),
        CommissionType::Always => true,
        CommissionType::FirstOrderOnly => !has_paid_before,
    };
    if !eligible {
        return 0;
    }
    let rate = inviter
        .commission_rate
        .map(i64::from)
        .unwrap_or(config.invite_commission);
    total * rate / 100
}

/// Percentage paid at each level of the invite chain.
pub fn commission_shares(config: &CommissionConfig) -> Vec<i64> {
    if config.distribution_enable {
        vec![config.distribution_l1, config.distribution_l2, config.distribution_l3]
            .into_iter()
            .take(MAX_LEVELS)
            .collect()
    } else {
        vec![100]
    }
}

pub fn share_amount(commission: i64, percent: i64) -> i64 {
    commission * percent / 100
}

/// Period recorded on a reward order of `hours`.
pub fn reward_period(hours: i64) -> Period {
    match hours {
        h if h <= 24 * 30 => Period::Month,
        h if h <= 24 * 90 => Period::Quarter,
        h if h <= 24 * 180 => Period::HalfYear,
        _ => Period::Year,
    }
}

pub fn gift_days(hours: i64) -> f64 {
    (hours as f64 / 24.0 * 100.0).round() / 100.0
}

/// Extends an active subscription by `gift`, or grants `plan` when the user has
/// none. Never-expiring subscriptions are left alone. Returns whether `user` changed.
pub fn apply_gift(user: &mut User, plan: &Plan, gift: Duration, now: DateTime<Utc>) -> bool {
    match (user.plan_id, user.expired_at) {
        (Some(_), None) => false,
        (Some(_), Some(at)) if at > now => {
            user.expired_at = Some(at + gift);
            true
        }
        _ => {
            user.plan_id = Some(plan.id);
            user.group_id = Some(plan.group_id);
            user.transfer_enable = plan.transfer_bytes();
            user.speed_limit = plan.speed_limit;
            user.u = 0;
            user.d = 0;
            user.expired_at = Some(now + gift);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_db::models::GB;

    fn user() -> User {
        let now = Utc::now();
        User {
            id: 9,
            email: "inviter@example.com".into(),
            password_hash: String::new(),
            password_algo: None,
            password_salt: None,
            uuid: "uuid".into(),
            token: "token".into(),
            invite_user_id: None,
            telegram_id: None,
            balance: 0,
            commission_balance: 0,
            commission_type: 0,
            commission_rate: None,
            discount: None,
            plan_id: None,
            group_id: None,
            transfer_enable: 0,
            u: 0,
            d: 0,
            speed_limit: None,
            expired_at: None,
            banned: false,
            is_admin: false,
            remind_expire: true,
            remind_traffic: true,
            has_triggered_invite_reward: false,
            last_login_at: None,
            traffic_updated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn plan() -> Plan {
        let now = Utc::now();
        Plan {
            id: 5,
            group_id: 2,
            transfer_enable: 100,
            speed_limit: Some(50),
            name: "Gift".into(),
            content: None,
            show: false,
            renew: false,
            sort: 0,
            month_price: None,
            quarter_price: None,
            half_year_price: None,
            year_price: None,
            two_year_price: None,
            three_year_price: None,
            onetime_price: None,
            reset_price: None,
            reset_traffic_method: None,
            capacity_limit: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn commission_follows_inviter_policy() {
        let config = CommissionConfig::default();
        let mut inviter = user();

        assert_eq!(commission_for(1000, &inviter, &config, false), 100);
        assert_eq!(commission_for(1000, &inviter, &config, true), 0);

        inviter.commission_type = 1;
        inviter.commission_rate = Some(25);
        assert_eq!(commission_for(1000, &inviter, &config, true), 250);

        inviter.commission_type = 2;
        assert_eq!(commission_for(1000, &inviter, &config, true), 0);
        assert_eq!(commission_for(999, &inviter, &config, false), 249);
    }

    #[test]
    fn system_policy_pays_every_order_when_first_time_is_off() {
        let config = CommissionConfig {
            commission_first_time_enable: false,
            ..CommissionConfig::default()
        };
        assert_eq!(commission_for(500, &user(), &config, true), 50);
    }

    #[test]
    fn shares_depend_on_distribution() {
        let mut config = CommissionConfig::default();
        assert_eq!(commission_shares(&config), vec![100]);

        config.distribution_enable = true;
        config.distribution_l1 = 50;
        config.distribution_l2 = 30;
        config.distribution_l3 = 20;
        assert_eq!(commission_shares(&config), vec![50, 30, 20]);
        assert_eq!(share_amount(333, 30), 99);
    }

    #[test]
    fn reward_period_tracks_duration() {
        assert_eq!(reward_period(24), Period::Month);
        assert_eq!(reward_period(720), Period::Month);
        assert_eq!(reward_period(721), Period::Quarter);
        assert_eq!(reward_period(4320), Period::HalfYear);
        assert_eq!(reward_period(9000), Period::Year);
        assert_eq!(gift_days(36), 1.5);
        assert_eq!(gift_days(10), 0.42);
    }

    #[test]
    fn gift_extends_active_subscription() {
        let now = Utc::now();
        let mut inviter = user();
        inviter.plan_id = Some(1);
        inviter.expired_at = Some(now + Duration::days(3));
        assert!(apply_gift(&mut inviter, &plan(), Duration::hours(48), now));
        assert_eq!(inviter.expired_at, Some(now + Duration::days(5)));
        assert_eq!(inviter.plan_id, Some(1));
    }

    #[test]
    fn gift_grants_plan_to_lapsed_user() {
        let now = Utc::now();
        let mut inviter = user();
        inviter.plan_id = Some(1);
        inviter.expired_at = Some(now - Duration::days(1));
        inviter.u = 10;
        assert!(apply_gift(&mut inviter, &plan(), Duration::hours(24), now));
        assert_eq!(inviter.plan_id, Some(5));
        assert_eq!(inviter.group_id, Some(2));
        assert_eq!(inviter.transfer_enable, 100 * GB);
        assert_eq!(inviter.u, 0);
        assert_eq!(inviter.expired_at, Some(now + Duration::hours(24)));
    }

    #[test]
    fn gift_leaves_permanent_plan_alone() {
        let mut inviter = user();
        inviter.plan_id = Some(1);
        assert!(!apply_gift(&mut inviter, &plan(), Duration::hours(24), Utc::now()));
        assert_eq!(inviter.expired_at, None);
    }
}
