use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::stat::{DailyIncome, DailyRecord, DailyTypeTotal, ServerTraffic, Stat, StatUser};

/// Local calendar day of `created_at`, given the offset in seconds as `$n`.
macro_rules! local_day {
    ($col:literal, $offset:literal) => {
        concat!("((", $col, " AT TIME ZONE 'UTC') + make_interval(secs => ", $offset, "))::date")
    };
}

#[derive(Debug, Clone)]
pub struct StatRepository {
    pool: PgPool,
}

impl StatRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ==================== ORDERS & USERS ====================

    /// Sum and count of paid orders created in `[start, end)`.
    pub async fn income_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(i64, i64)> {
        sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT COALESCE(SUM(total_amount), 0)::BIGINT, COUNT(*)
            FROM orders
            WHERE created_at >= $1 AND created_at < $2 AND status NOT IN (0, 2)
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
        .context("Failed to sum income")
    }

    pub async fn registrations_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE created_at >= $1 AND created_at < $2")
            .bind(start)
            .bind(end)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count registrations")
    }

    pub async fn commission_paid_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<i64> {
        sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(get_amount), 0)::BIGINT
            FROM commission_logs
            WHERE created_at >= $1 AND created_at < $2
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
        .context("Failed to sum commission payouts")
    }

    /// Paid orders still waiting for commission review.
    pub async fn count_pending_commission(&self) -> Result<i64> {
        sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM orders
            WHERE commission_status = 0
              AND invite_user_id IS NOT NULL
              AND status NOT IN (0, 2)
              AND commission_balance > 0
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to count pending commission")
    }

    pub async fn count_open_tickets(&self, user_id: Option<i64>) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM tickets WHERE status = 0 AND ($1::BIGINT IS NULL OR user_id = $1)",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count open tickets")
    }

    pub async fn count_pending_orders(&self, user_id: i64) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM orders WHERE user_id = $1 AND status = 0")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count pending orders")
    }

    /// Paid income per local day in `[start, end)`.
    pub async fn daily_income(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        offset_secs: i32,
    ) -> Result<Vec<DailyIncome>> {
        sqlx::query_as::<_, DailyIncome>(concat!(
            "SELECT ",
            local_day!("created_at", "$3"),
            r#" AS day,
                COALESCE(SUM(total_amount), 0)::BIGINT AS total,
                COUNT(*) AS count
            FROM orders
            WHERE created_at >= $1 AND created_at < $2 AND status NOT IN (0, 2)
            GROUP BY day
            ORDER BY day ASC
            "#
        ))
        .bind(start)
        .bind(end)
        .bind(f64::from(offset_secs))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch daily income")
    }

    /// Paid new and renewal orders per local day in `[start, end)`.
    pub async fn daily_type_totals(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        offset_secs: i32,
    ) -> Result<Vec<DailyTypeTotal>> {
        sqlx::query_as::<_, DailyTypeTotal>(concat!(
            "SELECT ",
            local_day!("created_at", "$3"),
            r#" AS day,
                type AS order_type,
                COUNT(*) AS count,
                COALESCE(SUM(total_amount), 0)::BIGINT AS amount
            FROM orders
            WHERE created_at >= $1 AND created_at < $2
              AND status NOT IN (0, 2)
              AND type IN (1, 2)
            GROUP BY day, type
            ORDER BY day ASC
            "#
        ))
        .bind(start)
        .bind(end)
        .bind(f64::from(offset_secs))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch order type totals")
    }

    // ==================== DAILY STATS ====================

    /// Latest daily rows, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<Stat>> {
        sqlx::query_as::<_, Stat>("SELECT * FROM stats ORDER BY record_at DESC LIMIT $1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch stats")
    }

    /// Aggregates `[start, end)` into the values of the `date` row.
    pub async fn collect_daily(
        &self,
        date: NaiveDate,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<DailyRecord> {
        sqlx::query_as::<_, DailyRecord>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM orders WHERE created_at >= $1 AND created_at < $2) AS order_count,
                (SELECT COALESCE(SUM(total_amount), 0)::BIGINT FROM orders
                    WHERE created_at >= $1 AND created_at < $2) AS order_total,
                (SELECT COUNT(*) FROM orders
                    WHERE created_at >= $1 AND created_at < $2 AND status NOT IN (0, 2)) AS paid_count,
                (SELECT COALESCE(SUM(total_amount), 0)::BIGINT FROM orders
                    WHERE created_at >= $1 AND created_at < $2 AND status NOT IN (0, 2)) AS paid_total,
                (SELECT COUNT(*) FROM commission_logs
                    WHERE created_at >= $1 AND created_at < $2) AS commission_count,
                (SELECT COALESCE(SUM(get_amount), 0)::BIGINT FROM commission_logs
                    WHERE created_at >= $1 AND created_at < $2) AS commission_total,
                (SELECT COUNT(*) FROM users WHERE created_at >= $1 AND created_at < $2) AS register_count,
                (SELECT COUNT(*) FROM users
                    WHERE created_at >= $1 AND created_at < $2 AND invite_user_id IS NOT NULL) AS invite_count,
                (SELECT COALESCE(SUM(u + d), 0)::BIGINT FROM stat_servers WHERE record_at = $3) AS transfer_used_total
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(date)
        .fetch_one(&self.pool)
        .await
        .context("Failed to collect daily stats")
    }

    pub async fn upsert_daily(&self, date: NaiveDate, record: &DailyRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stats (
                record_at, order_count, order_total, paid_count, paid_total, commission_count,
                commission_total, register_count, invite_count, transfer_used_total
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (record_at) DO UPDATE SET
                order_count = EXCLUDED.order_count,
                order_total = EXCLUDED.order_total,
                paid_count = EXCLUDED.paid_count,
                paid_total = EXCLUDED.paid_total,
                commission_count = EXCLUDED.commission_count,
                commission_total = EXCLUDED.commission_total,
                register_count = EXCLUDED.register_count,
                invite_count = EXCLUDED.invite_count,
                transfer_used_total = EXCLUDED.transfer_used_total,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(date)
        .bind(record.order_count)
        .bind(record.order_total)
        .bind(record.paid_count)
        .bind(record.paid_total)
        .bind(record.commission_count)
        .bind(record.commission_total)
        .bind(record.register_count)
        .bind(record.invite_count)
        .bind(record.transfer_used_total)
        .execute(&self.pool)
        .await
        .context("Failed to save daily stats")?;
        Ok(())
    }

    // ==================== TRAFFIC ====================

    /// Per-server traffic for record days in `[since, until]`, largest first.
    pub async fn server_traffic(
        &self,
        since: NaiveDate,
        until: NaiveDate,
        limit: Option<i64>,
    ) -> Result<Vec<ServerTraffic>> {
        sqlx::query_as::<_, ServerTraffic>(
            r#"
            SELECT
                st.server_id,
                st.server_type,
                MAX(s.name) AS server_name,
                SUM(st.u)::BIGINT AS u,
                SUM(st.d)::BIGINT AS d,
                SUM(st.u + st.d)::BIGINT AS total
            FROM stat_servers st
            LEFT JOIN servers s ON s.id = st.server_id
            WHERE st.record_at >= $1 AND st.record_at <= $2
            GROUP BY st.server_id, st.server_type
            ORDER BY total DESC
            LIMIT $3
            "#,
        )
        .bind(since)
        .bind(until)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch server traffic")
    }

    pub async fn user_traffic_page(&self, user_id: i64, page: i64, page_size: i64) -> Result<(Vec<StatUser>, i64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stat_users WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count user traffic rows")?;

        let rows = sqlx::query_as::<_, StatUser>(
            "SELECT * FROM stat_users WHERE user_id = $1 ORDER BY record_at DESC, id DESC LIMIT $2 OFFSET $3",
        )
        .bind(user_id)
        .bind(page_size)
        .bind(super::page_offset(page, page_size))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch user traffic")?;

        Ok((rows, total))
    }

    /// Distinct users that pushed traffic since `since`.
    pub async fn count_active_users(&self, since: DateTime<Utc>) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(DISTINCT user_id) FROM stat_users WHERE updated_at >= $1")
            .bind(since)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count active users")
    }

    pub async fn add_user_traffic(
        tx: &mut Transaction<'_, Postgres>,
        user_id: i64,
        server_rate: f64,
        u: i64,
        d: i64,
        date: NaiveDate,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stat_users (user_id, server_rate, u, d, record_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, server_rate, record_at) DO UPDATE SET
                u = stat_users.u + EXCLUDED.u,
                d = stat_users.d + EXCLUDED.d,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(user_id)
        .bind(server_rate)
        .bind(u)
        .bind(d)
        .bind(date)
        .execute(&mut **tx)
        .await
        .context("Failed to record user traffic")?;
        Ok(())
    }

    pub async fn add_server_traffic(
        tx: &mut Transaction<'_, Postgres>,
        server_id: i64,
        server_type: &str,
        u: i64,
        d: i64,
        date: NaiveDate,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stat_servers (server_id, server_type, u, d, record_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (server_id, server_type, record_at) DO UPDATE SET
                u = stat_servers.u + EXCLUDED.u,
                d = stat_servers.d + EXCLUDED.d,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(server_id)
        .bind(server_type)
        .bind(u)
        .bind(d)
        .bind(date)
        .execute(&mut **tx)
        .await
        .context("Failed to record server traffic")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_day_expression_uses_offset_parameter() {
        assert_eq!(
            local_day!("created_at", "$3"),
            "((created_at AT TIME ZONE 'UTC') + make_interval(secs => $3))::date"
        );
    }

    #[tokio::test]
    async fn repository_builds_without_connecting() {
        let pool = PgPool::connect_lazy("postgres://localhost/ferry_test").unwrap();
        let _repo = StatRepository::new(pool);
    }
}
