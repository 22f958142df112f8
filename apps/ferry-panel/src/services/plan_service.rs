use anyhow::Result;
use chrono::Utc;
use ferry_db::models::plan::Plan;
use ferry_db::models::user::User;
use ferry_db::repositories::plan_repo::{PlanFlag, PlanInput, PlanRepository};
use ferry_db::repositories::user_repo::UserRepository;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::info;

use crate::error::{not_found, rejected};

/// A plan as listed to users; `capacity_limit` is the number of seats left.
#[derive(Debug, Clone, Serialize)]
pub struct PlanView {
    #[serde(flatten)]
    pub plan: Plan,
}

/// A plan as listed to admins, with its subscriber count.
#[derive(Debug, Clone, Serialize)]
pub struct AdminPlan {
    #[serde(flatten)]
    pub plan: Plan,
    pub count: i64,
}

#[derive(Clone)]
pub struct PlanService {
    plans: PlanRepository,
    users: UserRepository,
}

impl PlanService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            plans: PlanRepository::new(pool.clone()),
            users: UserRepository::new(pool),
        }
    }

    pub async fn get(&self, id: i64) -> Result<Plan> {
        self.plans
            .get_by_id(id)
            .await?
            .ok_or_else(|| not_found("Subscription plan does not exist"))
    }

    /// Whether a new subscriber still fits on the plan.
    pub async fn has_capacity(&self, plan: &Plan) -> Result<bool> {
        let Some(limit) = plan.capacity_limit else {
            return Ok(true);
        };
        let active = self.users.count_active_on_plan(plan.id, Utc::now()).await?;
        Ok(active < limit as i64)
    }

    /// Visible plans, with remaining seats in place of the raw capacity.
    pub async fn fetch_visible(&self) -> Result<Vec<PlanView>> {
        let mut views = Vec::new();
        for plan in self.plans.list_visible().await? {
            views.push(self.with_remaining(plan).await?);
        }
        Ok(views)
    }

    /// A single plan for a user: visible ones, or the one they hold.
    pub async fn fetch_for_user(&self, id: i64, user: &User) -> Result<PlanView> {
        let plan = self.get(id).await?;
        if !plan.show && user.plan_id != Some(plan.id) {
            return Err(not_found("Subscription plan does not exist"));
        }
        self.with_remaining(plan).await
    }

    async fn with_remaining(&self, mut plan: Plan) -> Result<PlanView> {
        if let Some(limit) = plan.capacity_limit {
            let active = self.users.count_active_on_plan(plan.id, Utc::now()).await?;
            plan.capacity_limit = Some(remaining_seats(limit, active));
        }
        Ok(PlanView { plan })
    }

    // ==================== ADMIN ====================

    pub async fn list(&self) -> Result<Vec<AdminPlan>> {
        let counts: HashMap<i64, i64> = self.plans.subscriber_counts().await?.into_iter().collect();
        Ok(self
            .plans
            .list()
            .await?
            .into_iter()
            .map(|plan| AdminPlan {
                count: counts.get(&plan.id).copied().unwrap_or(0),
                plan,
            })
            .collect())
    }

    pub async fn save(&self, input: &PlanInput) -> Result<()> {
        if input.name.trim().is_empty() {
            return Err(rejected("Plan name is required"));
        }
        if input.transfer_enable < 0 {
            return Err(rejected("Traffic must not be negative"));
        }
        if matches!(input.reset_traffic_method, Some(m) if !(0..=6).contains(&m)) {
            return Err(rejected("Unknown traffic reset method"));
        }
        match input.id {
            Some(id) => {
                if !self.plans.update(id, input).await? {
                    return Err(not_found("Subscription plan does not exist"));
                }
                info!("Updated plan {} (force_update={})", id, input.force_update);
            }
            None => {
                let plan = self.plans.create(input).await?;
                info!("Created plan {} ({})", plan.id, plan.name);
            }
        }
        Ok(())
    }

    pub async fn toggle(&self, id: i64, flag: PlanFlag) -> Result<()> {
        if !self.plans.toggle(id, flag).await? {
            return Err(not_found("Subscription plan does not exist"));
        }
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        self.get(id).await?;
        if !self.plans.delete_unused(id).await? {
            return Err(rejected("This plan is still used by users or orders"));
        }
        info!("Deleted plan {}", id);
        Ok(())
    }

    pub async fn sort(&self, ids: &[i64]) -> Result<()> {
        self.plans.sort(ids).await
    }
}

pub fn remaining_seats(limit: i32, active: i64) -> i32 {
    (limit as i64 - active).max(0) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seats_never_go_negative() {
        assert_eq!(remaining_seats(10, 3), 7);
        assert_eq!(remaining_seats(10, 12), 0);
    }

    #[tokio::test]
    async fn service_builds_without_connecting() {
        let pool = PgPool::connect_lazy("postgres://localhost/ferry_test").unwrap();
        let _service = PlanService::new(pool);
    }
}
