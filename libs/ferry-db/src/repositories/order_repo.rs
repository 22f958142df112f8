use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::order::{CommissionStatus, NewOrder, Order, OrderStatus};

#[derive(Debug, Clone)]
pub struct OrderRepository {
    pool: PgPool,
}

impl OrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_trade_no(&self, trade_no: &str) -> Result<Option<Order>> {
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE trade_no = $1")
            .bind(trade_no)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch order by trade number")
    }

    pub async fn get_for_user(&self, user_id: i64, trade_no: &str) -> Result<Option<Order>> {
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE trade_no = $1 AND user_id = $2")
            .bind(trade_no)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user order")
    }

    pub async fn list_for_user(&self, user_id: i64, status: Option<OrderStatus>) -> Result<Vec<Order>> {
        sqlx::query_as::<_, Order>(
            "SELECT * FROM orders WHERE user_id = $1 AND ($2::SMALLINT IS NULL OR status = $2) ORDER BY created_at DESC",
        )
        .bind(user_id)
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list user orders")
    }

    pub async fn get_by_ids(&self, ids: &[i64]) -> Result<Vec<Order>> {
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = ANY($1) ORDER BY id")
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch orders by IDs")
    }

    /// Pending or processing orders block a new checkout.
    pub async fn has_unfinished(&self, user_id: i64) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM orders WHERE user_id = $1 AND status IN (0, 1))",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check unfinished orders")
    }

    /// Whether the user ever had an order that was not pending or cancelled.
    pub async fn has_paid_order(&self, user_id: i64) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM orders WHERE user_id = $1 AND status NOT IN (0, 2))",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check paid orders")
    }

    /// Whether the user has a completed, non-free order other than `order_id`.
    pub async fn has_other_paid_order(&self, user_id: i64, order_id: i64) -> Result<bool> {
        sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM orders
                WHERE user_id = $1 AND id <> $2 AND status = 3 AND total_amount > 0
            )
            "#,
        )
        .bind(user_id)
        .bind(order_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check earlier paid orders")
    }

    /// Ids of completed orders that are not traffic resets.
    pub async fn completed_plan_order_ids(&self, user_id: i64) -> Result<Vec<i64>> {
        sqlx::query_scalar(
            "SELECT id FROM orders WHERE user_id = $1 AND status = 3 AND period <> 'reset_price' ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list completed plan orders")
    }

    /// Completed orders for recurring periods, oldest first.
    pub async fn completed_recurring(&self, user_id: i64) -> Result<Vec<Order>> {
        sqlx::query_as::<_, Order>(
            r#"
            SELECT * FROM orders
            WHERE user_id = $1
              AND status = 3
              AND period NOT IN ('reset_price', 'onetime_price')
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch completed recurring orders")
    }

    pub async fn last_completed_onetime(&self, user_id: i64) -> Result<Option<Order>> {
        sqlx::query_as::<_, Order>(
            r#"
            SELECT * FROM orders
            WHERE user_id = $1 AND status = 3 AND period = 'onetime_price'
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch last onetime order")
    }

    pub async fn count_coupon_uses(&self, user_id: i64, coupon_id: i64) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM orders WHERE user_id = $1 AND coupon_id = $2 AND status NOT IN (0, 2)",
        )
        .bind(user_id)
        .bind(coupon_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count coupon uses")
    }

    pub async fn set_payment(&self, id: i64, payment_id: i64, handling_amount: Option<i64>) -> Result<()> {
        sqlx::query(
            "UPDATE orders SET payment_id = $1, handling_amount = $2, updated_at = CURRENT_TIMESTAMP WHERE id = $3",
        )
        .bind(payment_id)
        .bind(handling_amount)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to attach payment to order")?;
        Ok(())
    }

    pub async fn stale_pending(&self, before: DateTime<Utc>) -> Result<Vec<Order>> {
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE status = 0 AND created_at <= $1")
            .bind(before)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch stale pending orders")
    }

    pub async fn processing(&self) -> Result<Vec<Order>> {
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE status = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch processing orders")
    }

    pub async fn fetch_page(
        &self,
        user_id: Option<i64>,
        status: Option<OrderStatus>,
        trade_no: Option<&str>,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<Order>, i64)> {
        const FILTER: &str = r#"
            ($1::BIGINT IS NULL OR user_id = $1)
            AND ($2::SMALLINT IS NULL OR status = $2)
            AND ($3::TEXT IS NULL OR trade_no = $3)
        "#;

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM orders WHERE {FILTER}"))
            .bind(user_id)
            .bind(status)
            .bind(trade_no)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count orders")?;

        let orders = sqlx::query_as::<_, Order>(&format!(
            "SELECT * FROM orders WHERE {FILTER} ORDER BY created_at DESC LIMIT $4 OFFSET $5"
        ))
        .bind(user_id)
        .bind(status)
        .bind(trade_no)
        .bind(page_size)
        .bind(super::page_offset(page, page_size))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch orders page")?;

        Ok((orders, total))
    }

    /// Paid orders owed commission that were last touched before `before`.
    pub async fn commission_due(&self, before: DateTime<Utc>) -> Result<Vec<Order>> {
        sqlx::query_as::<_, Order>(
            r#"
            SELECT * FROM orders
            WHERE commission_status = 0
              AND invite_user_id IS NOT NULL
              AND status NOT IN (0, 2)
              AND updated_at <= $1
            ORDER BY id
            "#,
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch orders awaiting commission check")
    }

    pub async fn commission_processing(&self) -> Result<Vec<Order>> {
        sqlx::query_as::<_, Order>(
            r#"
            SELECT * FROM orders
            WHERE commission_status = 1
              AND invite_user_id IS NOT NULL
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch orders awaiting commission payout")
    }

    pub async fn set_commission_status(&self, id: i64, status: CommissionStatus) -> Result<()> {
        sqlx::query(
            "UPDATE orders SET commission_status = $1, updated_at = CURRENT_TIMESTAMP WHERE id = $2",
        )
        .bind(status)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to update commission status")?;
        Ok(())
    }

    /// Commission earned by the inviter that is not yet settled.
    pub async fn pending_commission_total(&self, invite_user_id: i64) -> Result<i64> {
        sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(commission_balance), 0)::BIGINT FROM orders
            WHERE invite_user_id = $1 AND status = 3 AND commission_status = 0
            "#,
        )
        .bind(invite_user_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to sum pending commission")
    }

    // ==================== TRANSACTIONAL ====================

    pub async fn insert(tx: &mut Transaction<'_, Postgres>, order: &NewOrder) -> Result<Order> {
        sqlx::query_as::<_, Order>(
            r#"
            INSERT INTO orders (
                user_id, plan_id, period, trade_no, type, status, total_amount,
                coupon_id, discount_amount, surplus_amount, refund_amount, balance_amount,
                surplus_order_ids, invite_user_id, commission_balance, gift_days, invited_user_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING *
            "#,
        )
        .bind(order.user_id)
        .bind(order.plan_id)
        .bind(&order.period)
        .bind(&order.trade_no)
        .bind(order.order_type)
        .bind(order.status)
        .bind(order.total_amount)
        .bind(order.coupon_id)
        .bind(order.discount_amount)
        .bind(order.surplus_amount)
        .bind(order.refund_amount)
        .bind(order.balance_amount)
        .bind(&order.surplus_order_ids)
        .bind(order.invite_user_id)
        .bind(order.commission_balance)
        .bind(order.gift_days)
        .bind(order.invited_user_id)
        .fetch_one(&mut **tx)
        .await
        .context("Failed to insert order")
    }

    pub async fn lock_by_trade_no(
        tx: &mut Transaction<'_, Postgres>,
        trade_no: &str,
    ) -> Result<Option<Order>> {
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE trade_no = $1 FOR UPDATE")
            .bind(trade_no)
            .fetch_optional(&mut **tx)
            .await
            .context("Failed to lock order")
    }

    /// Moves a pending order to processing. Returns false if it was not pending.
    pub async fn mark_paid(
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
        callback_no: &str,
        paid_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = 1, callback_no = $1, paid_at = $2, updated_at = CURRENT_TIMESTAMP
            WHERE id = $3 AND status = 0
            "#,
        )
        .bind(callback_no)
        .bind(paid_at)
        .bind(id)
        .execute(&mut **tx)
        .await
        .context("Failed to mark order paid")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_status(
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
        status: OrderStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE orders SET status = $1, updated_at = CURRENT_TIMESTAMP WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(&mut **tx)
            .await
            .context("Failed to update order status")?;
        Ok(())
    }

    pub async fn mark_discounted(tx: &mut Transaction<'_, Postgres>, ids: &[i64]) -> Result<()> {
        sqlx::query(
            "UPDATE orders SET status = 4, updated_at = CURRENT_TIMESTAMP WHERE id = ANY($1)",
        )
        .bind(ids)
        .execute(&mut **tx)
        .await
        .context("Failed to mark surplus orders")?;
        Ok(())
    }

    pub async fn settle_commission(
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
        actual: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET commission_status = 2, actual_commission_balance = $1, updated_at = CURRENT_TIMESTAMP
            WHERE id = $2
            "#,
        )
        .bind(actual)
        .bind(id)
        .execute(&mut **tx)
        .await
        .context("Failed to settle commission")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_builds_without_connecting() {
        let pool = PgPool::connect_lazy("postgres://localhost/ferry_test").unwrap();
        let _repo = OrderRepository::new(pool);
    }
}
