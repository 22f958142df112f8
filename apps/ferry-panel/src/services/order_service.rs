use anyhow::{Context, Result};
use chrono::{DateTime, Duration, FixedOffset, Utc};
use ferry_db::models::GB;
use ferry_db::models::order::{NewOrder, Order, OrderStatus, OrderType};
use ferry_db::models::plan::{Period, Plan};
use ferry_db::models::user::User;
use ferry_db::repositories::coupon_repo::CouponRepository;
use ferry_db::repositories::order_repo::OrderRepository;
use ferry_db::repositories::plan_repo::PlanRepository;
use ferry_db::repositories::user_repo::UserRepository;
use serde::Serialize;
use serde_json::json;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

use crate::config::{OpenEvent, OrderConfig};
use crate::error::{not_found, rejected};
use crate::services::commission_service::{self, CommissionService};
use crate::services::coupon_service::CouponService;
use crate::services::notification_service::{NotificationService, OrderEvent};
use crate::services::payment::{PayResult, PaymentService};
use crate::services::plan_service::PlanService;
use crate::utils;

/// Pending orders older than this are cancelled by the check job.
const PENDING_TIMEOUT_HOURS: i64 = 2;

/// Callback number recorded when an administrator marks an order paid.
pub const MANUAL_CALLBACK: &str = "manual_operation";
const REDEEM_CALLBACK: &str = "redeem";

#[derive(Debug, Serialize)]
pub struct OrderWithPlan {
    #[serde(flatten)]
    pub order: Order,
    pub plan: Option<Plan>,
}

#[derive(Debug, Serialize)]
pub struct OrderDetail {
    #[serde(flatten)]
    pub order: Order,
    pub plan: Plan,
    pub try_out_plan_id: Option<i64>,
    pub surplus_orders: Vec<Order>,
}

/// Unused value of the current subscription and the orders that paid for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Surplus {
    pub amount: i64,
    pub order_ids: Vec<i64>,
}

#[derive(Clone)]
pub struct OrderService {
    pool: PgPool,
    orders: OrderRepository,
    users: UserRepository,
    plan_repo: PlanRepository,
    plans: PlanService,
    coupons: CouponService,
    commission: CommissionService,
    payments: PaymentService,
    notifier: NotificationService,
    config: OrderConfig,
    try_out_plan_id: Option<i64>,
    tz: FixedOffset,
}

impl OrderService {
    pub fn new(
        pool: PgPool,
        commission: CommissionService,
        payments: PaymentService,
        notifier: NotificationService,
        config: OrderConfig,
        try_out_plan_id: Option<i64>,
        tz: FixedOffset,
    ) -> Self {
        Self {
            orders: OrderRepository::new(pool.clone()),
            users: UserRepository::new(pool.clone()),
            plan_repo: PlanRepository::new(pool.clone()),
            plans: PlanService::new(pool.clone()),
            coupons: CouponService::new(pool.clone()),
            pool,
            commission,
            payments,
            notifier,
            config,
            try_out_plan_id,
            tz,
        }
    }

    pub async fn fetch(&self, user_id: i64, status: Option<OrderStatus>) -> Result<Vec<OrderWithPlan>> {
        let orders = self.orders.list_for_user(user_id, status).await?;
        let plans: HashMap<i64, Plan> = self
            .plan_repo
            .list()
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();
        Ok(orders
            .into_iter()
            .map(|order| OrderWithPlan {
                plan: plans.get(&order.plan_id).cloned(),
                order,
            })
            .collect())
    }

    pub async fn detail(&self, user_id: i64, trade_no: &str) -> Result<OrderDetail> {
        let order = self
            .orders
            .get_for_user(user_id, trade_no)
            .await?
            .ok_or_else(|| not_found("Order does not exist or has been paid"))?;
        let plan = self.plans.get(order.plan_id).await?;
        let surplus_orders = match order.surplus_order_ids.as_deref() {
            Some(ids) if !ids.is_empty() => self.orders.get_by_ids(ids).await?,
            _ => Vec::new(),
        };
        Ok(OrderDetail {
            order,
            plan,
            try_out_plan_id: self.try_out_plan_id,
            surplus_orders,
        })
    }

    pub async fn check(&self, user_id: i64, trade_no: &str) -> Result<OrderStatus> {
        self.orders
            .get_for_user(user_id, trade_no)
            .await?
            .map(|o| o.status)
            .ok_or_else(|| not_found("Order does not exist"))
    }

    /// Places an order. Returns the inserted order.
    pub async fn save(&self, user_id: i64, plan_id: i64, period: &str, coupon_code: Option<&str>) -> Result<Order> {
        let user = self
            .users
            .get_by_id(user_id)
            .await?
            .ok_or_else(|| not_found("The user does not exist"))?;
        if self.orders.has_unfinished(user.id).await? {
            return Err(rejected(
                "You have an unpaid or pending order, please try again later or cancel it",
            ));
        }
        let plan = self.plans.get(plan_id).await?;
        let period: Period = period.parse().map_err(|_| rejected("Wrong plan period"))?;
        let now = Utc::now();

        if user.plan_id != Some(plan.id)
            && period != Period::ResetTraffic
            && !self.plans.has_capacity(&plan).await?
        {
            return Err(rejected("Current product is sold out"));
        }
        let Some(price) = plan.price(period) else {
            return Err(rejected(
                "This payment period cannot be purchased, please choose another period",
            ));
        };
        check_purchase(&user, &plan, period, now)?;

        let mut tx = self.pool.begin().await?;
        let mut order = NewOrder::new(user.id, plan.id, period.as_str(), utils::trade_no(&self.tz), price);

        if let Some(code) = coupon_code.filter(|c| !c.trim().is_empty()) {
            let coupon = self.coupons.check(code.trim(), plan.id, Some(period), user.id).await?;
            if !CouponRepository::consume(&mut tx, coupon.id).await? {
                return Err(rejected("Coupon failed"));
            }
            order.add_discount(coupon.discount_for(order.total_amount));
            order.coupon_id = Some(coupon.id);
        }

        apply_vip_discount(&mut order, user.discount);
        self.set_order_type(&mut order, &user, period, now).await?;
        self.commission.set_invite(&mut order, &user).await?;

        let deducted = apply_balance(&mut order, user.balance);
        if deducted > 0 && !UserRepository::add_balance(&mut tx, user.id, -deducted).await? {
            return Err(rejected("Insufficient balance"));
        }

        let order = OrderRepository::insert(&mut tx, &order).await?;
        tx.commit().await.context("Failed to commit order")?;

        info!(
            "User {} placed order {} ({:?}, {}, {})",
            user.id,
            order.trade_no,
            order.order_type,
            order.period,
            utils::format_cents(order.total_amount)
        );
        Ok(order)
    }

    async fn set_order_type(&self, order: &mut NewOrder, user: &User, period: Period, now: DateTime<Utc>) -> Result<()> {
        let order_type = classify(user, order.plan_id, period, now);
        if order_type == OrderType::Change {
            if !self.config.plan_change_enable {
                return Err(rejected(
                    "Subscription changes are not allowed at the moment, please contact support",
                ));
            }
            if self.config.surplus_enable {
                let surplus = match user.expired_at {
                    None => {
                        let last = self.orders.last_completed_onetime(user.id).await?;
                        let ids = self.orders.completed_plan_order_ids(user.id).await?;
                        onetime_surplus(user, last.as_ref(), ids)
                    }
                    Some(_) => period_surplus(&self.orders.completed_recurring(user.id).await?, now),
                };
                if let Some(surplus) = surplus {
                    debug!("Surplus {} for user {}", surplus.amount, user.id);
                    apply_surplus(order, surplus);
                }
            }
        }
        order.order_type = order_type;
        Ok(())
    }

    pub async fn checkout(&self, user_id: i64, trade_no: &str, method: i64) -> Result<PayResult> {
        let order = self
            .orders
            .get_for_user(user_id, trade_no)
            .await?
            .filter(|o| o.status == OrderStatus::Pending)
            .ok_or_else(|| not_found("Order does not exist or has been paid"))?;

        if order.total_amount <= 0 {
            if !self.paid(&order.trade_no, &order.trade_no).await? {
                return Err(rejected("Request failed, please try again later"));
            }
            self.notifier.order(&order, OrderEvent::Paid).await;
            return Ok(PayResult {
                kind: -1,
                data: json!(true),
            });
        }

        let payment = self.payments.get_enabled(method).await?;
        let handling = payment.handling_amount(order.total_amount);
        self.orders.set_payment(order.id, payment.id, handling).await?;

        let result = self
            .payments
            .pay(
                &payment,
                &order.trade_no,
                order.user_id,
                order.total_amount + handling.unwrap_or(0),
            )
            .await?;
        self.notifier.order(&order, OrderEvent::Checkout).await;
        Ok(result)
    }

    pub async fn cancel(&self, user_id: i64, trade_no: &str) -> Result<()> {
        let order = self
            .orders
            .get_for_user(user_id, trade_no)
            .await?
            .ok_or_else(|| not_found("Order does not exist"))?;
        if order.status != OrderStatus::Pending {
            return Err(rejected("You can only cancel pending orders"));
        }
        if !self.cancel_order(&order).await? {
            return Err(rejected("Cancel failed"));
        }
        Ok(())
    }

    /// Cancels a pending order and refunds the balance it used.
    async fn cancel_order(&self, order: &Order) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(locked) = OrderRepository::lock_by_trade_no(&mut tx, &order.trade_no).await? else {
            return Ok(false);
        };
        if locked.status != OrderStatus::Pending {
            return Ok(false);
        }
        OrderRepository::set_status(&mut tx, locked.id, OrderStatus::Cancelled).await?;
        let refund = locked.balance_amount.unwrap_or(0);
        if refund > 0 {
            UserRepository::add_balance(&mut tx, locked.user_id, refund).await?;
        }
        tx.commit().await.context("Failed to commit order cancel")?;
        info!("Cancelled order {} (refunded {})", locked.trade_no, utils::format_cents(refund));
        Ok(true)
    }

    /// Records a payment. Returns false when the order was no longer pending.
    /// Opening the subscription happens after the commit; a failure there is
    /// retried by the check job.
    pub async fn paid(&self, trade_no: &str, callback_no: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(order) = OrderRepository::lock_by_trade_no(&mut tx, trade_no).await? else {
            return Err(not_found("Order does not exist"));
        };
        if order.status != OrderStatus::Pending {
            debug!("Order {} already handled (status {:?})", trade_no, order.status);
            return Ok(false);
        }
        if !OrderRepository::mark_paid(&mut tx, order.id, callback_no, Utc::now()).await? {
            return Ok(false);
        }
        tx.commit().await.context("Failed to commit order payment")?;
        info!("Order {} paid ({})", trade_no, callback_no);

        if let Err(e) = self.open(trade_no).await {
            error!("Failed to open order {}: {:#}", trade_no, e);
        }
        Ok(true)
    }

    /// Applies a paid order to its user's subscription.
    pub async fn open(&self, trade_no: &str) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let Some(order) = OrderRepository::lock_by_trade_no(&mut tx, trade_no).await? else {
            return Err(not_found("Order does not exist"));
        };
        if order.status != OrderStatus::Processing {
            return Ok(());
        }
        let plan = self.plans.get(order.plan_id).await?;
        let Some(mut user) = UserRepository::lock_by_id(&mut tx, order.user_id).await? else {
            return Err(not_found("The user does not exist"));
        };

        if let Some(ids) = order.surplus_order_ids.as_deref().filter(|ids| !ids.is_empty()) {
            OrderRepository::mark_discounted(&mut tx, ids).await?;
        }
        apply_order(&mut user, &order, &plan, &self.config, now)?;
        UserRepository::save_subscription(&mut tx, &user).await?;
        OrderRepository::set_status(&mut tx, order.id, OrderStatus::Completed).await?;
        tx.commit().await.context("Failed to commit order open")?;

        info!(
            "Opened order {} for user {}: plan {} until {:?}",
            order.trade_no, user.id, plan.id, user.expired_at
        );

        match self.commission.first_order_reward(&order).await {
            Ok(true) => debug!("Order {} triggered an invite reward", order.trade_no),
            Ok(false) => {}
            Err(e) => error!("Invite reward for order {} failed: {:#}", order.trade_no, e),
        }
        Ok(())
    }

    /// Redeems a code that covers a whole plan period.
    pub async fn redeem(&self, user_id: i64, code: &str) -> Result<Order> {
        let user = self
            .users
            .get_by_id(user_id)
            .await?
            .ok_or_else(|| not_found("The user does not exist"))?;
        if self.orders.has_unfinished(user.id).await? {
            return Err(rejected(
                "You have an unpaid or pending order, please try again later or cancel it",
            ));
        }
        let (coupon_id, order) = self.prepare_redemption(&user, code).await?;

        let mut tx = self.pool.begin().await?;
        let order = Self::book_redemption(&mut tx, coupon_id, &order).await?;
        tx.commit().await.context("Failed to commit redemption")?;

        self.settle_redemption(&order).await?;
        Ok(order)
    }

    /// Redemption for a user inserted by `tx`. Any error leaves `tx` to be rolled back.
    pub async fn redeem_in(&self, tx: &mut Transaction<'_, Postgres>, user: &User, code: &str) -> Result<Order> {
        let (coupon_id, order) = self.prepare_redemption(user, code).await?;
        Self::book_redemption(tx, coupon_id, &order).await
    }

    /// Checks the code against `user` and builds the zero-amount order it pays for.
    async fn prepare_redemption(&self, user: &User, code: &str) -> Result<(i64, NewOrder)> {
        let (coupon, plan_id, period) = self.coupons.redemption(code, user.id).await?;
        let plan = self.plans.get(plan_id).await?;
        check_redemption(user, &plan)?;
        let Some(price) = plan.price(period) else {
            return Err(rejected(
                "This payment period cannot be purchased, please choose another cycle",
            ));
        };

        let mut order = NewOrder::new(user.id, plan.id, period.as_str(), utils::trade_no(&self.tz), price);
        order.add_discount(coupon.discount_for(price));
        order.coupon_id = Some(coupon.id);
        if order.total_amount > 0 {
            return Err(rejected("This redemption code does not cover the plan price"));
        }
        order.order_type = classify(user, plan.id, period, Utc::now());
        Ok((coupon.id, order))
    }

    async fn book_redemption(tx: &mut Transaction<'_, Postgres>, coupon_id: i64, order: &NewOrder) -> Result<Order> {
        if !CouponRepository::consume(tx, coupon_id).await? {
            return Err(rejected("This redemption code has been used up"));
        }
        OrderRepository::insert(tx, order).await
    }

    /// Marks a committed redemption order paid so it opens like any other.
    pub async fn settle_redemption(&self, order: &Order) -> Result<()> {
        info!("User {} redeemed order {} for plan {}", order.user_id, order.trade_no, order.plan_id);
        self.paid(&order.trade_no, REDEEM_CALLBACK).await?;
        self.notifier.order(order, OrderEvent::Paid).await;
        Ok(())
    }

    /// Handles a verified gateway callback. Repeated callbacks are acknowledged.
    pub async fn payment_received(&self, trade_no: &str, callback_no: &str) -> Result<()> {
        if self.paid(trade_no, callback_no).await?
            && let Some(order) = self.orders.get_by_trade_no(trade_no).await?
        {
            self.notifier.order(&order, OrderEvent::Paid).await;
        }
        Ok(())
    }

    /// Cancels stale pending orders and opens paid ones.
    pub async fn check_orders(&self) -> Result<(usize, usize)> {
        let before = Utc::now() - Duration::hours(PENDING_TIMEOUT_HOURS);
        let mut cancelled = 0;
        for order in self.orders.stale_pending(before).await? {
            match self.cancel_order(&order).await {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(e) => error!("Failed to cancel stale order {}: {:#}", order.trade_no, e),
            }
        }

        let mut opened = 0;
        for order in self.orders.processing().await? {
            match self.open(&order.trade_no).await {
                Ok(()) => opened += 1,
                Err(e) => error!("Failed to open order {}: {:#}", order.trade_no, e),
            }
        }
        if cancelled + opened > 0 {
            info!("Order check: {} cancelled, {} opened", cancelled, opened);
        }
        Ok((cancelled, opened))
    }

    // ==================== ADMIN ====================

    pub async fn fetch_page(
        &self,
        user_id: Option<i64>,
        status: Option<OrderStatus>,
        trade_no: Option<&str>,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<Order>, i64)> {
        self.orders
            .fetch_page(user_id, status, trade_no, page, page_size.clamp(10, 100))
            .await
    }

    pub async fn admin_paid(&self, trade_no: &str) -> Result<()> {
        let order = self
            .orders
            .get_by_trade_no(trade_no)
            .await?
            .ok_or_else(|| not_found("Order does not exist"))?;
        if order.status != OrderStatus::Pending {
            return Err(rejected("Only pending orders can be marked as paid"));
        }
        if !self.paid(trade_no, MANUAL_CALLBACK).await? {
            return Err(rejected("Update failed"));
        }
        warn!("Order {} marked paid by an administrator", trade_no);
        Ok(())
    }

    pub async fn admin_cancel(&self, trade_no: &str) -> Result<()> {
        let order = self
            .orders
            .get_by_trade_no(trade_no)
            .await?
            .ok_or_else(|| not_found("Order does not exist"))?;
        if order.status != OrderStatus::Pending {
            return Err(rejected("Only pending orders can be cancelled"));
        }
        if !self.cancel_order(&order).await? {
            return Err(rejected("Update failed"));
        }
        Ok(())
    }
}

/// A hidden plan can only be redeemed as a renewal of the user's current plan.
pub fn check_redemption(user: &User, plan: &Plan) -> Result<()> {
    if (!plan.show && !plan.renew) || (!plan.show && user.plan_id != Some(plan.id)) {
        return Err(rejected(
            "This subscription has been sold out, please choose another subscription",
        ));
    }
    Ok(())
}

/// Purchase rules that only depend on the user and the plan.
pub fn check_purchase(user: &User, plan: &Plan, period: Period, now: DateTime<Utc>) -> Result<()> {
    let on_plan = user.plan_id == Some(plan.id);
    if period == Period::ResetTraffic && (!on_plan || !user.is_available_at(now)) {
        return Err(rejected(
            "Subscription has expired or no active subscription, unable to purchase a traffic reset",
        ));
    }
    if (!plan.show && !plan.renew) || (!plan.show && !on_plan) {
        return Err(rejected(
            "This subscription has been sold out, please choose another subscription",
        ));
    }
    if !plan.renew && on_plan && period != Period::ResetTraffic {
        return Err(rejected(
            "This subscription cannot be renewed, please change to another subscription",
        ));
    }
    if !plan.show && plan.renew && !user.is_available_at(now) {
        return Err(rejected(
            "This subscription has expired, please change to another subscription",
        ));
    }
    Ok(())
}

pub fn classify(user: &User, plan_id: i64, period: Period, now: DateTime<Utc>) -> OrderType {
    if period == Period::ResetTraffic {
        return OrderType::ResetTraffic;
    }
    match (user.plan_id, user.expired_at) {
        (Some(current), expiry) if current != plan_id && expiry.is_none_or(|at| at > now) => OrderType::Change,
        (Some(current), Some(at)) if current == plan_id && at > now => OrderType::Renew,
        _ => OrderType::New,
    }
}

pub fn apply_vip_discount(order: &mut NewOrder, discount: Option<i32>) {
    let Some(percent) = discount.filter(|d| *d > 0) else {
        return;
    };
    let amount = order.total_amount * i64::from(percent.min(100)) / 100;
    if amount > 0 {
        order.add_discount(amount);
    }
}

/// Pays as much of the order as `balance` allows. Returns the amount taken.
pub fn apply_balance(order: &mut NewOrder, balance: i64) -> i64 {
    if balance <= 0 || order.total_amount <= 0 {
        return 0;
    }
    let used = balance.min(order.total_amount);
    order.balance_amount = Some(used);
    order.total_amount -= used;
    used
}

pub fn apply_surplus(order: &mut NewOrder, surplus: Surplus) {
    if surplus.amount >= order.total_amount {
        order.refund_amount = Some(surplus.amount - order.total_amount);
        order.total_amount = 0;
    } else {
        order.total_amount -= surplus.amount;
    }
    order.surplus_amount = Some(surplus.amount);
    order.surplus_order_ids = Some(surplus.order_ids);
}

/// Value left on recurring orders, prorated by the seconds remaining.
pub fn period_surplus(orders: &[Order], now: DateTime<Utc>) -> Option<Surplus> {
    let mut last_valid = None;
    let mut months_sum = 0u32;
    let mut amount_sum = 0i64;

    for order in orders {
        let Some(months) = order.period.parse::<Period>().ok().and_then(|p| p.months()) else {
            continue;
        };
        if utils::add_months(order.created_at, months) < now {
            continue;
        }
        last_valid = Some(order.created_at);
        months_sum += months;
        amount_sum += order.total_amount + order.balance_amount.unwrap_or(0) + order.surplus_amount.unwrap_or(0)
            - order.refund_amount.unwrap_or(0);
    }

    let last_valid = last_valid?;
    let expires = utils::add_months(last_valid, months_sum);
    let remaining = (expires - now).num_seconds();
    let range = (expires - last_valid).num_seconds();
    if remaining <= 0 || range <= 0 {
        return None;
    }
    let amount = (i128::from(amount_sum) * i128::from(remaining) / i128::from(range)) as i64;
    if amount <= 0 {
        return None;
    }
    Some(Surplus {
        amount,
        order_ids: orders.iter().map(|o| o.id).collect(),
    })
}

/// Value of the unused traffic on a onetime plan, priced by its last order.
pub fn onetime_surplus(user: &User, last_onetime: Option<&Order>, order_ids: Vec<i64>) -> Option<Surplus> {
    let order = last_onetime?;
    let quota_gb = user.transfer_enable as f64 / GB as f64;
    if quota_gb <= 0.0 {
        return None;
    }
    let paid = order.total_amount + order.balance_amount.unwrap_or(0);
    if paid == 0 {
        return None;
    }
    let unit_price = paid as f64 / quota_gb;
    let unused_gb = quota_gb - user.used_traffic() as f64 / GB as f64;
    Some(Surplus {
        amount: (unit_price * unused_gb).max(0.0) as i64,
        order_ids,
    })
}

fn open_event(order_type: OrderType, config: &OrderConfig) -> OpenEvent {
    match order_type {
        OrderType::New => config.new_order_event,
        OrderType::Renew => config.renew_order_event,
        OrderType::Change => config.change_order_event,
        OrderType::ResetTraffic | OrderType::InviteReward => OpenEvent::None,
    }
}

/// Applies a paid order to `user`. The caller persists the result.
pub fn apply_order(user: &mut User, order: &Order, plan: &Plan, config: &OrderConfig, now: DateTime<Utc>) -> Result<()> {
    user.balance += order.refund_amount.unwrap_or(0);

    let period: Period = order.period.parse()?;
    match period {
        _ if order.order_type == OrderType::InviteReward => {
            let minutes = (order.gift_days.unwrap_or(0.0) * 24.0 * 60.0).round() as i64;
            commission_service::apply_gift(user, plan, Duration::minutes(minutes), now);
        }
        Period::Onetime => {
            user.u = 0;
            user.d = 0;
            user.transfer_enable = plan.transfer_bytes();
            user.plan_id = Some(plan.id);
            user.group_id = Some(plan.group_id);
            user.expired_at = None;
        }
        Period::ResetTraffic => {
            user.u = 0;
            user.d = 0;
        }
        recurring => {
            let months = recurring.months().unwrap_or(0);
            if order.order_type == OrderType::Change {
                user.expired_at = Some(now);
            }
            user.transfer_enable = plan.transfer_bytes();
            // Switching away from a onetime plan, or a fresh purchase.
            if user.expired_at.is_none() || order.order_type == OrderType::New {
                user.u = 0;
                user.d = 0;
            }
            user.plan_id = Some(plan.id);
            user.group_id = Some(plan.group_id);
            let base = user.expired_at.map_or(now, |at| at.max(now));
            user.expired_at = Some(utils::add_months(base, months));
        }
    }

    if open_event(order.order_type, config) == OpenEvent::ResetTraffic {
        user.u = 0;
        user.d = 0;
    }
    user.speed_limit = plan.speed_limit;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_db::models::order::CommissionStatus;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn user(now: DateTime<Utc>) -> User {
        User {
            id: 1,
            email: "a@example.com".into(),
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

    fn plan(id: i64) -> Plan {
        let now = Utc::now();
        Plan {
            id,
            group_id: 7,
            transfer_enable: 100,
            speed_limit: Some(50),
            name: "Pro".into(),
            content: None,
            show: true,
            renew: true,
            sort: 0,
            month_price: Some(1000),
            quarter_price: Some(2700),
            half_year_price: None,
            year_price: None,
            two_year_price: None,
            three_year_price: None,
            onetime_price: Some(5000),
            reset_price: Some(300),
            reset_traffic_method: None,
            capacity_limit: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn order(id: i64, period: Period, order_type: OrderType, total: i64, created_at: DateTime<Utc>) -> Order {
        Order {
            id,
            invite_user_id: None,
            user_id: 1,
            plan_id: 2,
            coupon_id: None,
            payment_id: None,
            order_type,
            period: period.as_str().into(),
            trade_no: format!("T{}", id),
            callback_no: None,
            total_amount: total,
            handling_amount: None,
            discount_amount: None,
            surplus_amount: None,
            refund_amount: None,
            balance_amount: None,
            surplus_order_ids: None,
            status: OrderStatus::Processing,
            commission_status: CommissionStatus::Pending,
            commission_balance: 0,
            actual_commission_balance: None,
            gift_days: None,
            invited_user_id: None,
            paid_at: None,
            created_at,
            updated_at: created_at,
        }
    }

    #[test]
    fn classify_order_types() {
        let now = ts("2026-05-10T00:00:00Z");
        let mut u = user(now);
        assert_eq!(classify(&u, 2, Period::Month, now), OrderType::New);
        assert_eq!(classify(&u, 2, Period::ResetTraffic, now), OrderType::ResetTraffic);

        u.plan_id = Some(2);
        u.expired_at = Some(now + Duration::days(3));
        assert_eq!(classify(&u, 2, Period::Month, now), OrderType::Renew);
        assert_eq!(classify(&u, 3, Period::Month, now), OrderType::Change);

        // Never-expiring plan counts as active.
        u.expired_at = None;
        assert_eq!(classify(&u, 3, Period::Month, now), OrderType::Change);
        assert_eq!(classify(&u, 2, Period::Month, now), OrderType::New);

        u.expired_at = Some(now - Duration::days(1));
        assert_eq!(classify(&u, 3, Period::Month, now), OrderType::New);
        assert_eq!(classify(&u, 2, Period::Month, now), OrderType::New);
    }

    #[test]
    fn purchase_rules() {
        let now = Utc::now();
        let mut u = user(now);
        let mut p = plan(2);

        assert!(check_purchase(&u, &p, Period::ResetTraffic, now).is_err());

        p.show = false;
        assert!(check_purchase(&u, &p, Period::Month, now).is_err());

        u.plan_id = Some(2);
        u.transfer_enable = 10;
        u.expired_at = Some(now + Duration::days(1));
        assert!(check_purchase(&u, &p, Period::Month, now).is_ok());
        assert!(check_purchase(&u, &p, Period::ResetTraffic, now).is_ok());

        u.expired_at = Some(now - Duration::days(1));
        assert!(check_purchase(&u, &p, Period::Month, now).is_err());

        p.show = true;
        p.renew = false;
        u.expired_at = Some(now + Duration::days(1));
        assert!(check_purchase(&u, &p, Period::Month, now).is_err());
        assert!(check_purchase(&u, &p, Period::ResetTraffic, now).is_ok());
    }

    #[test]
    fn discounts_then_balance() {
        let mut o = NewOrder::new(1, 2, "month_price", "T".into(), 1000);
        apply_vip_discount(&mut o, Some(15));
        assert_eq!(o.total_amount, 850);
        assert_eq!(o.discount_amount, Some(150));

        assert_eq!(apply_balance(&mut o, 300), 300);
        assert_eq!(o.total_amount, 550);
        assert_eq!(o.balance_amount, Some(300));

        let mut o = NewOrder::new(1, 2, "month_price", "T".into(), 500);
        assert_eq!(apply_balance(&mut o, 9000), 500);
        assert_eq!(o.total_amount, 0);

        let mut o = NewOrder::new(1, 2, "month_price", "T".into(), 500);
        apply_vip_discount(&mut o, None);
        assert_eq!(apply_balance(&mut o, 0), 0);
        assert_eq!(o.balance_amount, None);
    }

    #[test]
    fn surplus_larger_than_total_becomes_refund() {
        let mut o = NewOrder::new(1, 3, "month_price", "T".into(), 1000);
        apply_surplus(&mut o, Surplus { amount: 1500, order_ids: vec![4, 5] });
        assert_eq!(o.total_amount, 0);
        assert_eq!(o.refund_amount, Some(500));
        assert_eq!(o.surplus_order_ids, Some(vec![4, 5]));

        let mut o = NewOrder::new(1, 3, "month_price", "T".into(), 1000);
        apply_surplus(&mut o, Surplus { amount: 400, order_ids: vec![] });
        assert_eq!(o.total_amount, 600);
        assert_eq!(o.refund_amount, None);
    }

    #[test]
    fn period_surplus_prorates_remaining_time() {
        let start = ts("2026-01-01T00:00:00Z");
        let now = ts("2026-01-16T12:00:00Z");
        let orders = vec![
            // Long over, ignored for value but still superseded.
            order(1, Period::Month, OrderType::New, 900, ts("2025-06-01T00:00:00Z")),
            order(2, Period::Month, OrderType::New, 3100, start),
        ];
        let surplus = period_surplus(&orders, now).unwrap();
        // 31 days paid, 15.5 left.
        assert_eq!(surplus.amount, 1550);
        assert_eq!(surplus.order_ids, vec![1, 2]);

        assert!(period_surplus(&orders, ts("2026-03-01T00:00:00Z")).is_none());
        assert!(period_surplus(&[], now).is_none());
    }

    #[test]
    fn onetime_surplus_prices_unused_traffic() {
        let now = Utc::now();
        let mut u = user(now);
        u.transfer_enable = 100 * GB;
        u.u = 20 * GB;
        u.d = 5 * GB;
        let last = order(9, Period::Onetime, OrderType::New, 5000, now);

        let surplus = onetime_surplus(&u, Some(&last), vec![9]).unwrap();
        assert_eq!(surplus.amount, 3750);
        assert_eq!(surplus.order_ids, vec![9]);

        assert!(onetime_surplus(&u, None, vec![]).is_none());
        u.transfer_enable = 0;
        assert!(onetime_surplus(&u, Some(&last), vec![]).is_none());
    }

    #[test]
    fn open_new_period_order() {
        let now = ts("2026-01-31T08:00:00Z");
        let mut u = user(now);
        u.u = 5;
        let o = order(1, Period::Month, OrderType::New, 1000, now);
        apply_order(&mut u, &o, &plan(2), &OrderConfig::default(), now).unwrap();

        assert_eq!(u.plan_id, Some(2));
        assert_eq!(u.group_id, Some(7));
        assert_eq!(u.transfer_enable, 100 * GB);
        assert_eq!(u.u, 0);
        assert_eq!(u.speed_limit, Some(50));
        assert_eq!(u.expired_at, Some(ts("2026-02-28T08:00:00Z")));
    }

    #[test]
    fn open_renewal_extends_from_current_expiry() {
        let now = ts("2026-01-01T00:00:00Z");
        let mut u = user(now);
        u.plan_id = Some(2);
        u.u = 7;
        u.expired_at = Some(ts("2026-01-20T00:00:00Z"));
        let o = order(1, Period::Quarter, OrderType::Renew, 2700, now);
        apply_order(&mut u, &o, &plan(2), &OrderConfig::default(), now).unwrap();

        assert_eq!(u.expired_at, Some(ts("2026-04-20T00:00:00Z")));
        assert_eq!(u.u, 7);

        let config = OrderConfig {
            renew_order_event: OpenEvent::ResetTraffic,
            ..OrderConfig::default()
        };
        apply_order(&mut u, &o, &plan(2), &config, now).unwrap();
        assert_eq!(u.u, 0);
    }

    #[test]
    fn open_change_restarts_from_now_and_refunds() {
        let now = ts("2026-01-01T00:00:00Z");
        let mut u = user(now);
        u.plan_id = Some(1);
        u.balance = 100;
        u.u = 3;
        u.expired_at = Some(ts("2026-06-01T00:00:00Z"));
        let mut o = order(1, Period::Month, OrderType::Change, 0, now);
        o.refund_amount = Some(250);
        apply_order(&mut u, &o, &plan(2), &OrderConfig::default(), now).unwrap();

        assert_eq!(u.balance, 350);
        assert_eq!(u.expired_at, Some(ts("2026-02-01T00:00:00Z")));
        assert_eq!(u.u, 3);
    }

    #[test]
    fn open_onetime_and_reset_orders() {
        let now = Utc::now();
        let mut u = user(now);
        u.expired_at = Some(now + Duration::days(2));
        u.d = 9;
        let o = order(1, Period::Onetime, OrderType::New, 5000, now);
        apply_order(&mut u, &o, &plan(2), &OrderConfig::default(), now).unwrap();
        assert_eq!(u.expired_at, None);
        assert_eq!(u.d, 0);

        u.u = 4;
        let o = order(2, Period::ResetTraffic, OrderType::ResetTraffic, 300, now);
        apply_order(&mut u, &o, &plan(2), &OrderConfig::default(), now).unwrap();
        assert_eq!(u.u, 0);
        assert_eq!(u.plan_id, Some(2));
    }

    #[test]
    fn open_reward_order_extends_by_gift_days() {
        let now = ts("2026-01-01T00:00:00Z");
        let mut u = user(now);
        u.plan_id = Some(2);
        u.expired_at = Some(ts("2026-01-10T00:00:00Z"));
        let mut o = order(1, Period::Month, OrderType::InviteReward, 0, now);
        o.gift_days = Some(1.5);
        apply_order(&mut u, &o, &plan(2), &OrderConfig::default(), now).unwrap();
        assert_eq!(u.expired_at, Some(ts("2026-01-11T12:00:00Z")));
    }

    fn service(pool: PgPool) -> OrderService {
        let config = crate::config::CommissionConfig::default();
        OrderService::new(
            pool.clone(),
            CommissionService::new(pool.clone(), config.clone()),
            PaymentService::new(pool.clone(), "https://panel.example".into()),
            NotificationService::new(pool, None, config),
            OrderConfig::default(),
            None,
            FixedOffset::east_opt(0).unwrap(),
        )
    }

    #[tokio::test]
    async fn service_builds_without_connecting() {
        let pool = PgPool::connect_lazy("postgres://localhost/ferry_test").unwrap();
        let _service = service(pool);
    }

    #[test]
    fn hidden_plans_redeem_only_as_renewal() {
        let now = Utc::now();
        let mut u = user(now);
        let mut p = plan(4);
        assert!(check_redemption(&u, &p).is_ok());

        p.show = false;
        assert!(check_redemption(&u, &p).is_err());
        u.plan_id = Some(4);
        assert!(check_redemption(&u, &p).is_ok());

        p.renew = false;
        let err = check_redemption(&u, &p).unwrap_err();
        assert!(err.to_string().contains("sold out"));
    }

    /// Runs against a scratch database when `FERRY_TEST_DATABASE_URL` is set.
    #[tokio::test]
    async fn failed_redemption_rolls_back_the_new_user() {
        let Ok(url) = std::env::var("FERRY_TEST_DATABASE_URL") else {
            return;
        };
        let pool = ferry_db::db::init_db(&url, 4).await.unwrap();
        let orders = service(pool.clone());
        let email = format!("{}@redeem.test", uuid::Uuid::new_v4().simple());

        let mut tx = pool.begin().await.unwrap();
        let new_user = ferry_db::models::user::NewUser {
            email: email.clone(),
            uuid: uuid::Uuid::new_v4().to_string(),
            token: utils::guid(),
            ..Default::default()
        };
        let user = UserRepository::insert(&mut tx, &new_user).await.unwrap();
        let err = orders.redeem_in(&mut tx, &user, "no-such-code").await.unwrap_err();
        assert!(err.to_string().contains("Invalid redemption code"));
        drop(tx);

        let users = UserRepository::new(pool);
        assert!(users.get_by_email(&email).await.unwrap().is_none());
    }
}
