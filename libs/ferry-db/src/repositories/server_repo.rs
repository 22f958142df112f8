use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::server::{Server, ServerInput, ServerRule, ServerRuleInput};

#[derive(Debug, Clone)]
pub struct ServerRepository {
    pool: PgPool,
}

impl ServerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ==================== SERVERS ====================

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Server>> {
        sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch server")
    }

    pub async fn list(&self) -> Result<Vec<Server>> {
        sqlx::query_as::<_, Server>("SELECT * FROM servers ORDER BY sort ASC, id ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list servers")
    }

    /// Visible servers reachable from `group_id`.
    pub async fn list_for_group(&self, group_id: i64) -> Result<Vec<Server>> {
        sqlx::query_as::<_, Server>(
            "SELECT * FROM servers WHERE show = TRUE AND $1 = ANY(group_ids) ORDER BY sort ASC, id ASC",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list servers for group")
    }

    pub async fn upsert(&self, input: &ServerInput) -> Result<Server> {
        match input.id {
            Some(id) => sqlx::query_as::<_, Server>(
                r#"
                UPDATE servers SET
                    type = $1, name = $2, group_ids = $3, parent_id = $4, tags = $5, host = $6,
                    port = $7, server_port = $8, rate = $9, show = $10, sort = $11, settings = $12,
                    updated_at = CURRENT_TIMESTAMP
                WHERE id = $13
                RETURNING *
                "#,
            )
            .bind(&input.server_type)
            .bind(&input.name)
            .bind(&input.group_ids)
            .bind(input.parent_id)
            .bind(&input.tags)
            .bind(&input.host)
            .bind(input.port)
            .bind(input.server_port)
            .bind(input.rate)
            .bind(input.show)
            .bind(input.sort)
            .bind(&input.settings)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to update server"),
            None => sqlx::query_as::<_, Server>(
                r#"
                INSERT INTO servers (type, name, group_ids, parent_id, tags, host, port, server_port, rate, show, sort, settings)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                RETURNING *
                "#,
            )
            .bind(&input.server_type)
            .bind(&input.name)
            .bind(&input.group_ids)
            .bind(input.parent_id)
            .bind(&input.tags)
            .bind(&input.host)
            .bind(input.port)
            .bind(input.server_port)
            .bind(input.rate)
            .bind(input.show)
            .bind(input.sort)
            .bind(&input.settings)
            .fetch_one(&self.pool)
            .await
            .context("Failed to create server"),
        }
    }

    pub async fn set_show(&self, id: i64, show: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE servers SET show = $1, updated_at = CURRENT_TIMESTAMP WHERE id = $2")
            .bind(show)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update server visibility")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM servers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete server")?;
        Ok(result.rows_affected() == 1)
    }

    // ==================== RULES ====================

    pub async fn list_rules(&self) -> Result<Vec<ServerRule>> {
        sqlx::query_as::<_, ServerRule>("SELECT * FROM server_rules ORDER BY sort ASC, id DESC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list server rules")
    }

    /// Inserts a rule, or updates `input.id`. `None` when that rule does not exist.
    pub async fn upsert_rule(&self, input: &ServerRuleInput) -> Result<Option<ServerRule>> {
        match input.id {
            Some(id) => sqlx::query_as::<_, ServerRule>(
                r#"
                UPDATE server_rules SET
                    name = $1, domain = $2, server_arr = $3, ua = $4, prot = $5, sort = $6,
                    updated_at = CURRENT_TIMESTAMP
                WHERE id = $7
                RETURNING *
                "#,
            )
            .bind(&input.name)
            .bind(&input.domain)
            .bind(&input.server_arr)
            .bind(&input.ua)
            .bind(&input.prot)
            .bind(input.sort)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to update server rule"),
            None => sqlx::query_as::<_, ServerRule>(
                r#"
                INSERT INTO server_rules (name, domain, server_arr, ua, prot, sort)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING *
                "#,
            )
            .bind(&input.name)
            .bind(&input.domain)
            .bind(&input.server_arr)
            .bind(&input.ua)
            .bind(&input.prot)
            .bind(input.sort)
            .fetch_one(&self.pool)
            .await
            .map(Some)
            .context("Failed to create server rule"),
        }
    }

    pub async fn delete_rule(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM server_rules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete server rule")?;
        Ok(result.rows_affected() == 1)
    }

    /// Rewrites rule `sort` to follow `ids`, all or nothing.
    /// Applies the order of `ids`. Returns false, changing nothing, if any id is unknown.
    pub async fn sort_rules(&self, ids: &[i64]) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        for (idx, id) in ids.iter().enumerate() {
            let result =
                sqlx::query("UPDATE server_rules SET sort = $1, updated_at = CURRENT_TIMESTAMP WHERE id = $2")
                    .bind(idx as i32 + 1)
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .context("Failed to sort server rules")?;
            if result.rows_affected() == 0 {
                return Ok(false);
            }
        }
        tx.commit().await?;
        Ok(true)
    }
}
