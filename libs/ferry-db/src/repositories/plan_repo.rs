use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::PgPool;

use crate::models::plan::Plan;

#[derive(Debug, Clone, Deserialize)]
pub struct PlanInput {
    pub id: Option<i64>,
    pub group_id: i64,
    pub transfer_enable: i64,
    pub speed_limit: Option<i32>,
    pub name: String,
    pub content: Option<String>,
    pub month_price: Option<i64>,
    pub quarter_price: Option<i64>,
    pub half_year_price: Option<i64>,
    pub year_price: Option<i64>,
    pub two_year_price: Option<i64>,
    pub three_year_price: Option<i64>,
    pub onetime_price: Option<i64>,
    pub reset_price: Option<i64>,
    pub reset_traffic_method: Option<i16>,
    pub capacity_limit: Option<i32>,
    /// Push the new group/quota/speed limit to current subscribers.
    #[serde(default)]
    pub force_update: bool,
}

#[derive(Debug, Clone)]
pub struct PlanRepository {
    pool: PgPool,
}

impl PlanRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Plan>> {
        sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch plan")
    }

    pub async fn list(&self) -> Result<Vec<Plan>> {
        sqlx::query_as::<_, Plan>("SELECT * FROM plans ORDER BY sort ASC, id ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list plans")
    }

    pub async fn list_visible(&self) -> Result<Vec<Plan>> {
        sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE show = TRUE ORDER BY sort ASC, id ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list visible plans")
    }

    pub async fn create(&self, input: &PlanInput) -> Result<Plan> {
        sqlx::query_as::<_, Plan>(
            r#"
            INSERT INTO plans (
                group_id, transfer_enable, speed_limit, name, content,
                month_price, quarter_price, half_year_price, year_price, two_year_price,
                three_year_price, onetime_price, reset_price, reset_traffic_method, capacity_limit
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING *
            "#,
        )
        .bind(input.group_id)
        .bind(input.transfer_enable)
        .bind(input.speed_limit)
        .bind(&input.name)
        .bind(&input.content)
        .bind(input.month_price)
        .bind(input.quarter_price)
        .bind(input.half_year_price)
        .bind(input.year_price)
        .bind(input.two_year_price)
        .bind(input.three_year_price)
        .bind(input.onetime_price)
        .bind(input.reset_price)
        .bind(input.reset_traffic_method)
        .bind(input.capacity_limit)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create plan")
    }

    /// Updates the plan and, when `force_update` is set, its subscribers in the same transaction.
    pub async fn update(&self, id: i64, input: &PlanInput) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE plans SET
                group_id = $1, transfer_enable = $2, speed_limit = $3, name = $4, content = $5,
                month_price = $6, quarter_price = $7, half_year_price = $8, year_price = $9,
                two_year_price = $10, three_year_price = $11, onetime_price = $12, reset_price = $13,
                reset_traffic_method = $14, capacity_limit = $15, updated_at = CURRENT_TIMESTAMP
            WHERE id = $16
            "#,
        )
        .bind(input.group_id)
        .bind(input.transfer_enable)
        .bind(input.speed_limit)
        .bind(&input.name)
        .bind(&input.content)
        .bind(input.month_price)
        .bind(input.quarter_price)
        .bind(input.half_year_price)
        .bind(input.year_price)
        .bind(input.two_year_price)
        .bind(input.three_year_price)
        .bind(input.onetime_price)
        .bind(input.reset_price)
        .bind(input.reset_traffic_method)
        .bind(input.capacity_limit)
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("Failed to update plan")?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        if input.force_update {
            sqlx::query(
                r#"
                UPDATE users SET group_id = $1, transfer_enable = $2 * 1073741824, speed_limit = $3,
                    updated_at = CURRENT_TIMESTAMP
                WHERE plan_id = $4
                "#,
            )
            .bind(input.group_id)
            .bind(input.transfer_enable)
            .bind(input.speed_limit)
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("Failed to propagate plan to users")?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Flips `show` or `renew`.
    pub async fn toggle(&self, id: i64, field: PlanFlag) -> Result<bool> {
        let sql = match field {
            PlanFlag::Show => "UPDATE plans SET show = NOT show, updated_at = CURRENT_TIMESTAMP WHERE id = $1",
            PlanFlag::Renew => "UPDATE plans SET renew = NOT renew, updated_at = CURRENT_TIMESTAMP WHERE id = $1",
        };
        let result = sqlx::query(sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to toggle plan flag")?;
        Ok(result.rows_affected() == 1)
    }

    /// Deletes a plan nobody references. Returns false when it is still in use.
    pub async fn delete_unused(&self, id: i64) -> Result<bool> {
        let in_use: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(SELECT 1 FROM users WHERE plan_id = $1)
                OR EXISTS(SELECT 1 FROM orders WHERE plan_id = $1)
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check plan usage")?;

        if in_use {
            return Ok(false);
        }

        sqlx::query("DELETE FROM plans WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete plan")?;
        Ok(true)
    }

    pub async fn sort(&self, ids: &[i64]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (idx, id) in ids.iter().enumerate() {
            sqlx::query("UPDATE plans SET sort = $1 WHERE id = $2")
                .bind(idx as i32 + 1)
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("Failed to sort plans")?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Plan id to subscriber count.
    pub async fn subscriber_counts(&self) -> Result<Vec<(i64, i64)>> {
        sqlx::query_as::<_, (i64, i64)>(
            "SELECT plan_id, COUNT(*) FROM users WHERE plan_id IS NOT NULL GROUP BY plan_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to count plan subscribers")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanFlag {
    Show,
    Renew,
}
