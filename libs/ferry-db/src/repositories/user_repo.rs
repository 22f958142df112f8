use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use crate::models::user::{AdminUserUpdate, NewUser, User};

/// A subscriber with a live, expiring subscription, joined with its plan's reset policy.
#[derive(Debug, Clone, FromRow)]
pub struct ResetCandidate {
    pub id: i64,
    pub plan_id: i64,
    pub expired_at: DateTime<Utc>,
    pub reset_traffic_method: Option<i16>,
    pub plan_transfer_enable: i64,
}

/// What a proxy node needs to know about a user.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct NodeUser {
    pub id: i64,
    pub uuid: String,
    pub speed_limit: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user by ID")
    }

    pub async fn get_by_email(&self, email: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user by email")
    }

    pub async fn get_by_token(&self, token: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user by token")
    }

    pub async fn get_by_email_and_uuid(&self, email: &str, uuid: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1 AND uuid = $2")
            .bind(email)
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user by email and uuid")
    }

    pub async fn get_by_telegram_id(&self, telegram_id: i64) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE telegram_id = $1")
            .bind(telegram_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user by Telegram ID")
    }

    pub async fn email_exists(&self, email: &str) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE email = $1)")
            .bind(email)
            .fetch_one(&self.pool)
            .await
            .context("Failed to check email")
    }

    pub async fn fetch_page(
        &self,
        email: Option<&str>,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<User>, i64)> {
        let pattern = email.map(|e| format!("%{}%", e));
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM users WHERE ($1::TEXT IS NULL OR email ILIKE $1)",
        )
        .bind(&pattern)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count users")?;

        let users = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE ($1::TEXT IS NULL OR email ILIKE $1) ORDER BY id DESC LIMIT $2 OFFSET $3",
        )
        .bind(&pattern)
        .bind(page_size)
        .bind(super::page_offset(page, page_size))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch users page")?;

        Ok((users, total))
    }

    pub async fn count_invited(&self, user_id: i64) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE invite_user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count invited users")
    }

    /// Users holding the plan whose subscription is still running.
    pub async fn count_active_on_plan(&self, plan_id: i64, now: DateTime<Utc>) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM users WHERE plan_id = $1 AND (expired_at IS NULL OR expired_at >= $2)",
        )
        .bind(plan_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count plan subscribers")
    }

    pub async fn admin_telegram_ids(&self) -> Result<Vec<i64>> {
        sqlx::query_scalar(
            "SELECT telegram_id FROM users WHERE is_admin = TRUE AND telegram_id IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch admin Telegram IDs")
    }

    pub async fn touch_last_login(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE users SET last_login_at = CURRENT_TIMESTAMP WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update last login")?;
        Ok(())
    }

    /// Stores a fresh hash and drops any legacy algorithm/salt.
    pub async fn update_password(&self, id: i64, password_hash: &str) -> Result<()> {
        sqlx::query(
            "UPDATE users SET password_hash = $1, password_algo = NULL, password_salt = NULL, updated_at = CURRENT_TIMESTAMP WHERE id = $2",
        )
        .bind(password_hash)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to update password")?;
        Ok(())
    }

    pub async fn reset_security(&self, id: i64, uuid: &str, token: &str) -> Result<()> {
        sqlx::query(
            "UPDATE users SET uuid = $1, token = $2, updated_at = CURRENT_TIMESTAMP WHERE id = $3",
        )
        .bind(uuid)
        .bind(token)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to reset user security")?;
        Ok(())
    }

    pub async fn update_reminders(
        &self,
        id: i64,
        remind_expire: Option<bool>,
        remind_traffic: Option<bool>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE users
            SET remind_expire = COALESCE($1, remind_expire),
                remind_traffic = COALESCE($2, remind_traffic),
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $3
            "#,
        )
        .bind(remind_expire)
        .bind(remind_traffic)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to update reminder preferences")?;
        Ok(())
    }

    /// Moves commission into the spendable balance. Returns false when the
    /// commission balance does not cover `amount`.
    pub async fn transfer_commission(&self, id: i64, amount: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET commission_balance = commission_balance - $1,
                balance = balance + $1,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $2 AND commission_balance >= $1
            "#,
        )
        .bind(amount)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to transfer commission")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn bind_telegram(&self, id: i64, telegram_id: i64) -> Result<()> {
        sqlx::query("UPDATE users SET telegram_id = $1, updated_at = CURRENT_TIMESTAMP WHERE id = $2")
            .bind(telegram_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to bind Telegram account")?;
        Ok(())
    }

    pub async fn unbind_telegram(&self, telegram_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET telegram_id = NULL, updated_at = CURRENT_TIMESTAMP WHERE telegram_id = $1",
        )
        .bind(telegram_id)
        .execute(&self.pool)
        .await
        .context("Failed to unbind Telegram account")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn admin_update(&self, id: i64, input: &AdminUserUpdate) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users SET
                email = COALESCE($1, email),
                balance = COALESCE($2, balance),
                commission_balance = COALESCE($3, commission_balance),
                commission_type = COALESCE($4, commission_type),
                commission_rate = COALESCE($5, commission_rate),
                discount = COALESCE($6, discount),
                plan_id = COALESCE($7, plan_id),
                group_id = COALESCE($8, group_id),
                transfer_enable = COALESCE($9, transfer_enable),
                u = COALESCE($10, u),
                d = COALESCE($11, d),
                speed_limit = COALESCE($12, speed_limit),
                expired_at = COALESCE($13, expired_at),
                banned = COALESCE($14, banned),
                is_admin = COALESCE($15, is_admin),
                invite_user_id = COALESCE($16, invite_user_id),
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $17
            "#,
        )
        .bind(&input.email)
        .bind(input.balance)
        .bind(input.commission_balance)
        .bind(input.commission_type)
        .bind(input.commission_rate)
        .bind(input.discount)
        .bind(input.plan_id)
        .bind(input.group_id)
        .bind(input.transfer_enable)
        .bind(input.u)
        .bind(input.d)
        .bind(input.speed_limit)
        .bind(input.expired_at)
        .bind(input.banned)
        .bind(input.is_admin)
        .bind(input.invite_user_id)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to update user")?;
        Ok(result.rows_affected() == 1)
    }

    /// Available users in any of the given groups.
    pub async fn list_for_groups(&self, group_ids: &[i64], now: DateTime<Utc>) -> Result<Vec<NodeUser>> {
        sqlx::query_as::<_, NodeUser>(
            r#"
            SELECT id, uuid, speed_limit FROM users
            WHERE group_id = ANY($1)
              AND banned = FALSE
              AND transfer_enable > u + d
              AND (expired_at IS NULL OR expired_at > $2)
            ORDER BY id
            "#,
        )
        .bind(group_ids)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch node users")
    }

    pub async fn reset_candidates(&self, now: DateTime<Utc>) -> Result<Vec<ResetCandidate>> {
        sqlx::query_as::<_, ResetCandidate>(
            r#"
            SELECT u.id, u.plan_id, u.expired_at, p.reset_traffic_method,
                   p.transfer_enable AS plan_transfer_enable
            FROM users u
            JOIN plans p ON p.id = u.plan_id
            WHERE u.expired_at IS NOT NULL AND u.expired_at > $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch traffic reset candidates")
    }

    pub async fn expiring_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<User>> {
        sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE remind_expire = TRUE AND banned = FALSE AND expired_at > $1 AND expired_at <= $2",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch expiring users")
    }

    /// Users at or above `percent` of their quota.
    pub async fn over_traffic_threshold(&self, percent: i64, now: DateTime<Utc>) -> Result<Vec<User>> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT * FROM users
            WHERE remind_traffic = TRUE AND banned = FALSE AND transfer_enable > 0
              AND (u + d) * 100 >= transfer_enable * $1
              AND (expired_at IS NULL OR expired_at > $2)
            "#,
        )
        .bind(percent)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch users over traffic threshold")
    }

    // ==================== TRANSACTIONAL ====================

    pub async fn insert(tx: &mut Transaction<'_, Postgres>, user: &NewUser) -> Result<User> {
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (
                email, password_hash, uuid, token, invite_user_id, plan_id, group_id,
                transfer_enable, speed_limit, expired_at, is_admin
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.uuid)
        .bind(&user.token)
        .bind(user.invite_user_id)
        .bind(user.plan_id)
        .bind(user.group_id)
        .bind(user.transfer_enable)
        .bind(user.speed_limit)
        .bind(user.expired_at)
        .bind(user.is_admin)
        .fetch_one(&mut **tx)
        .await
        .context("Failed to insert user")
    }

    pub async fn lock_by_id(tx: &mut Transaction<'_, Postgres>, id: i64) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .context("Failed to lock user")
    }

    /// Adds `delta` (which may be negative) to the balance. Returns false if
    /// the balance would go negative.
    pub async fn add_balance(tx: &mut Transaction<'_, Postgres>, id: i64, delta: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET balance = balance + $1, updated_at = CURRENT_TIMESTAMP WHERE id = $2 AND balance + $1 >= 0",
        )
        .bind(delta)
        .bind(id)
        .execute(&mut **tx)
        .await
        .context("Failed to update balance")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn add_commission_balance(
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
        delta: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE users SET commission_balance = commission_balance + $1, updated_at = CURRENT_TIMESTAMP WHERE id = $2",
        )
        .bind(delta)
        .bind(id)
        .execute(&mut **tx)
        .await
        .context("Failed to update commission balance")?;
        Ok(())
    }

    /// Persists the subscription-related columns of a locked user.
    pub async fn save_subscription(tx: &mut Transaction<'_, Postgres>, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE users SET
                plan_id = $1,
                group_id = $2,
                transfer_enable = $3,
                u = $4,
                d = $5,
                expired_at = $6,
                speed_limit = $7,
                balance = $8,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $9
            "#,
        )
        .bind(user.plan_id)
        .bind(user.group_id)
        .bind(user.transfer_enable)
        .bind(user.u)
        .bind(user.d)
        .bind(user.expired_at)
        .bind(user.speed_limit)
        .bind(user.balance)
        .bind(user.id)
        .execute(&mut **tx)
        .await
        .context("Failed to save user subscription")?;
        Ok(())
    }

    pub async fn add_traffic(
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
        upload: i64,
        download: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE users SET u = u + $1, d = d + $2, traffic_updated_at = CURRENT_TIMESTAMP WHERE id = $3",
        )
        .bind(upload)
        .bind(download)
        .bind(id)
        .execute(&mut **tx)
        .await
        .context("Failed to add user traffic")?;
        Ok(())
    }

    pub async fn reset_traffic(
        tx: &mut Transaction<'_, Postgres>,
        ids: &[i64],
        transfer_enable: i64,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE users SET u = 0, d = 0, transfer_enable = $1, updated_at = CURRENT_TIMESTAMP WHERE id = ANY($2)",
        )
        .bind(transfer_enable)
        .bind(ids)
        .execute(&mut **tx)
        .await
        .context("Failed to reset user traffic")?;
        Ok(result.rows_affected())
    }

    pub async fn mark_invite_reward_triggered(tx: &mut Transaction<'_, Postgres>, id: i64) -> Result<()> {
        sqlx::query("UPDATE users SET has_triggered_invite_reward = TRUE WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await
            .context("Failed to flag invite reward")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_builds_without_connecting() {
        let pool = PgPool::connect_lazy("postgres://localhost/ferry_test").unwrap();
        let repo = UserRepository::new(pool);
        let _ = repo.clone();
    }
}
