use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::coupon::{Coupon, CouponInput};

#[derive(Debug, Clone)]
pub struct CouponRepository {
    pool: PgPool,
}

impl CouponRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_code(&self, code: &str) -> Result<Option<Coupon>> {
        sqlx::query_as::<_, Coupon>("SELECT * FROM coupons WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch coupon by code")
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Coupon>> {
        sqlx::query_as::<_, Coupon>("SELECT * FROM coupons WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch coupon")
    }

    pub async fn list(&self) -> Result<Vec<Coupon>> {
        sqlx::query_as::<_, Coupon>("SELECT * FROM coupons ORDER BY id DESC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list coupons")
    }

    pub async fn create(&self, code: &str, input: &CouponInput) -> Result<Coupon> {
        sqlx::query_as::<_, Coupon>(
            r#"
            INSERT INTO coupons (
                code, name, type, value, show, limit_use, limit_use_with_user,
                limit_plan_ids, limit_period, started_at, ended_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(code)
        .bind(&input.name)
        .bind(input.coupon_type)
        .bind(input.value)
        .bind(input.show)
        .bind(input.limit_use)
        .bind(input.limit_use_with_user)
        .bind(&input.limit_plan_ids)
        .bind(&input.limit_period)
        .bind(input.started_at)
        .bind(input.ended_at)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create coupon")
    }

    pub async fn update(&self, id: i64, input: &CouponInput) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE coupons SET
                code = COALESCE($1, code),
                name = $2,
                type = $3,
                value = $4,
                show = $5,
                limit_use = $6,
                limit_use_with_user = $7,
                limit_plan_ids = $8,
                limit_period = $9,
                started_at = $10,
                ended_at = $11,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $12
            "#,
        )
        .bind(&input.code)
        .bind(&input.name)
        .bind(input.coupon_type)
        .bind(input.value)
        .bind(input.show)
        .bind(input.limit_use)
        .bind(input.limit_use_with_user)
        .bind(&input.limit_plan_ids)
        .bind(&input.limit_period)
        .bind(input.started_at)
        .bind(input.ended_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to update coupon")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn toggle_show(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE coupons SET show = NOT show, updated_at = CURRENT_TIMESTAMP WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to toggle coupon")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM coupons WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete coupon")?;
        Ok(result.rows_affected() == 1)
    }

    /// Consumes one use of a limited coupon. Returns false when none are left.
    pub async fn consume(tx: &mut Transaction<'_, Postgres>, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE coupons
            SET limit_use = CASE WHEN limit_use IS NULL THEN NULL ELSE limit_use - 1 END,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $1 AND (limit_use IS NULL OR limit_use > 0)
            "#,
        )
        .bind(id)
        .execute(&mut **tx)
        .await
        .context("Failed to consume coupon")?;
        Ok(result.rows_affected() == 1)
    }
}
