use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::PgPool;

use crate::models::payment::{Payment, PaymentMethod};

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentInput {
    pub id: Option<i64>,
    pub payment: String,
    pub name: String,
    pub icon: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
    pub notify_domain: Option<String>,
    pub handling_fee_fixed: Option<i64>,
    pub handling_fee_percent: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct PaymentRepository {
    pool: PgPool,
}

impl PaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Payment>> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch payment")
    }

    pub async fn get_by_uuid(&self, uuid: &str) -> Result<Option<Payment>> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE uuid = $1")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch payment by uuid")
    }

    pub async fn list(&self) -> Result<Vec<Payment>> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments ORDER BY sort ASC, id ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list payments")
    }

    pub async fn list_enabled(&self) -> Result<Vec<PaymentMethod>> {
        sqlx::query_as::<_, PaymentMethod>(
            r#"
            SELECT id, name, payment, icon, handling_fee_fixed, handling_fee_percent
            FROM payments WHERE enable = TRUE ORDER BY sort ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list payment methods")
    }

    pub async fn create(&self, uuid: &str, input: &PaymentInput) -> Result<Payment> {
        sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (uuid, payment, name, icon, config, notify_domain, handling_fee_fixed, handling_fee_percent)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(uuid)
        .bind(&input.payment)
        .bind(&input.name)
        .bind(&input.icon)
        .bind(&input.config)
        .bind(&input.notify_domain)
        .bind(input.handling_fee_fixed)
        .bind(input.handling_fee_percent)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create payment")
    }

    pub async fn update(&self, id: i64, input: &PaymentInput) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments SET
                payment = $1, name = $2, icon = $3, config = $4, notify_domain = $5,
                handling_fee_fixed = $6, handling_fee_percent = $7, updated_at = CURRENT_TIMESTAMP
            WHERE id = $8
            "#,
        )
        .bind(&input.payment)
        .bind(&input.name)
        .bind(&input.icon)
        .bind(&input.config)
        .bind(&input.notify_domain)
        .bind(input.handling_fee_fixed)
        .bind(input.handling_fee_percent)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to update payment")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn toggle_enable(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE payments SET enable = NOT enable, updated_at = CURRENT_TIMESTAMP WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to toggle payment")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM payments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete payment")?;
        Ok(result.rows_affected() == 1)
    }

    /// Rewrites `sort` to follow the order of `ids`.
    pub async fn sort(&self, ids: &[i64]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (idx, id) in ids.iter().enumerate() {
            sqlx::query("UPDATE payments SET sort = $1 WHERE id = $2")
                .bind(idx as i32 + 1)
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("Failed to sort payments")?;
        }
        tx.commit().await?;
        Ok(())
    }
}
