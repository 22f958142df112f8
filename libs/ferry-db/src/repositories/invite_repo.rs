use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::invite::{CommissionLog, InviteCode};

#[derive(Debug, Clone)]
pub struct InviteRepository {
    pool: PgPool,
}

impl InviteRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_unused_code(&self, code: &str) -> Result<Option<InviteCode>> {
        sqlx::query_as::<_, InviteCode>("SELECT * FROM invite_codes WHERE code = $1 AND status = 0")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch invite code")
    }

    pub async fn list_codes(&self, user_id: i64) -> Result<Vec<InviteCode>> {
        sqlx::query_as::<_, InviteCode>(
            "SELECT * FROM invite_codes WHERE user_id = $1 AND status = 0 ORDER BY id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list invite codes")
    }

    pub async fn count_unused(&self, user_id: i64) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM invite_codes WHERE user_id = $1 AND status = 0")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count invite codes")
    }

    pub async fn create_code(&self, user_id: i64, code: &str) -> Result<InviteCode> {
        sqlx::query_as::<_, InviteCode>(
            "INSERT INTO invite_codes (user_id, code) VALUES ($1, $2) RETURNING *",
        )
        .bind(user_id)
        .bind(code)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create invite code")
    }

    pub async fn increment_pv(&self, code: &str) -> Result<()> {
        sqlx::query("UPDATE invite_codes SET pv = pv + 1 WHERE code = $1")
            .bind(code)
            .execute(&self.pool)
            .await
            .context("Failed to record invite visit")?;
        Ok(())
    }

    /// Claims an unused code. Returns false if another registration got there first.
    pub async fn mark_used(tx: &mut Transaction<'_, Postgres>, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE invite_codes SET status = 1, updated_at = CURRENT_TIMESTAMP WHERE id = $1 AND status = 0",
        )
        .bind(id)
        .execute(&mut **tx)
        .await
        .context("Failed to mark invite code used")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn list_logs(&self, invite_user_id: i64, page: i64, page_size: i64) -> Result<(Vec<CommissionLog>, i64)> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM commission_logs WHERE invite_user_id = $1")
                .bind(invite_user_id)
                .fetch_one(&self.pool)
                .await
                .context("Failed to count commission logs")?;

        let logs = sqlx::query_as::<_, CommissionLog>(
            "SELECT * FROM commission_logs WHERE invite_user_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(invite_user_id)
        .bind(page_size)
        .bind(super::page_offset(page, page_size))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list commission logs")?;

        Ok((logs, total))
    }

    pub async fn total_earned(&self, invite_user_id: i64) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COALESCE(SUM(get_amount), 0)::BIGINT FROM commission_logs WHERE invite_user_id = $1",
        )
        .bind(invite_user_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to sum commission")
    }

    /// Records a payout. Returns false if this inviter was already paid for the order.
    pub async fn insert_log(
        tx: &mut Transaction<'_, Postgres>,
        invite_user_id: i64,
        user_id: i64,
        trade_no: &str,
        order_amount: i64,
        get_amount: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO commission_logs (invite_user_id, user_id, trade_no, order_amount, get_amount)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (trade_no, invite_user_id) DO NOTHING
            "#,
        )
        .bind(invite_user_id)
        .bind(user_id)
        .bind(trade_no)
        .bind(order_amount)
        .bind(get_amount)
        .execute(&mut **tx)
        .await
        .context("Failed to insert commission log")?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::user::NewUser;
    use crate::repositories::user_repo::UserRepository;

    /// Runs against a scratch database when `FERRY_TEST_DATABASE_URL` is set.
    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("FERRY_TEST_DATABASE_URL").ok()?;
        Some(crate::db::init_db(&url, 4).await.unwrap())
    }

    #[tokio::test]
    async fn repository_builds_without_connecting() {
        let pool = PgPool::connect_lazy("postgres://localhost/ferry_test").unwrap();
        let _repo = InviteRepository::new(pool);
    }

    #[tokio::test]
    async fn invite_code_is_claimed_once_under_concurrent_registrations() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let tag = uuid::Uuid::new_v4().simple().to_string();

        let mut tx = pool.begin().await.unwrap();
        let owner = UserRepository::insert(
            &mut tx,
            &NewUser {
                email: format!("{}@invite.test", tag),
                uuid: uuid::Uuid::new_v4().to_string(),
                token: tag.clone(),
                ..NewUser::default()
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let repo = InviteRepository::new(pool.clone());
        let code = repo.create_code(owner.id, &tag[..8]).await.unwrap();

        let mut first = pool.begin().await.unwrap();
        assert!(InviteRepository::mark_used(&mut first, code.id).await.unwrap());

        // Blocks on the row lock until the first claim commits, then sees status = 1.
        let (second_pool, code_id) = (pool.clone(), code.id);
        let second = tokio::spawn(async move {
            let mut tx = second_pool.begin().await.unwrap();
            let claimed = InviteRepository::mark_used(&mut tx, code_id).await.unwrap();
            tx.commit().await.unwrap();
            claimed
        });

        first.commit().await.unwrap();
        assert!(!second.await.unwrap());
        assert!(repo.get_unused_code(&code.code).await.unwrap().is_none());
    }
}
