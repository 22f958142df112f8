use anyhow::Result;
use chrono::{DateTime, Utc};
use ferry_db::models::coupon::{Coupon, CouponInput};
use ferry_db::models::plan::Period;
use ferry_db::repositories::coupon_repo::CouponRepository;
use ferry_db::repositories::order_repo::OrderRepository;
use sqlx::PgPool;
use tracing::info;

use crate::error::{not_found, rejected};
use crate::utils;

#[derive(Clone)]
pub struct CouponService {
    coupons: CouponRepository,
    orders: OrderRepository,
}

impl CouponService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            coupons: CouponRepository::new(pool.clone()),
            orders: OrderRepository::new(pool),
        }
    }

    /// Loads `code` and checks it may be used for this plan and period.
    pub async fn check(&self, code: &str, plan_id: i64, period: Option<Period>, user_id: i64) -> Result<Coupon> {
        let coupon = self
            .coupons
            .get_by_code(code.trim())
            .await?
            .ok_or_else(|| rejected("Invalid coupon"))?;

        validate(&coupon, plan_id, period, Utc::now())?;

        if let Some(per_user) = coupon.limit_use_with_user {
            let used = self.orders.count_coupon_uses(user_id, coupon.id).await?;
            if used >= per_user as i64 {
                return Err(rejected(format!(
                    "The coupon can only be used {} times per person",
                    per_user
                )));
            }
        }
        Ok(coupon)
    }

    /// Looks up a redemption code and returns the plan and period it grants.
    pub async fn redemption(&self, code: &str, user_id: i64) -> Result<(Coupon, i64, Period)> {
        let coupon = self
            .coupons
            .get_by_code(code.trim())
            .await?
            .ok_or_else(|| rejected("Invalid redemption code"))?;
        let (plan_id, period) =
            redemption_target(&coupon).ok_or_else(|| rejected("Invalid redemption code"))?;
        let coupon = self.check(&coupon.code, plan_id, Some(period), user_id).await?;
        Ok((coupon, plan_id, period))
    }

    // ==================== ADMIN ====================

    pub async fn list(&self) -> Result<Vec<Coupon>> {
        self.coupons.list().await
    }

    /// Creates or updates a coupon. A missing code is generated.
    pub async fn generate(&self, id: Option<i64>, input: &CouponInput) -> Result<Option<Coupon>> {
        if input.ended_at <= input.started_at {
            return Err(rejected("The end time must be after the start time"));
        }
        if let Some(periods) = &input.limit_period
            && let Some(bad) = periods.iter().find(|p| p.parse::<Period>().is_err())
        {
            return Err(rejected(format!("Unknown period: {}", bad)));
        }

        if let Some(id) = id {
            if !self.coupons.update(id, input).await? {
                return Err(not_found("Coupon does not exist"));
            }
            info!("Updated coupon {}", id);
            return Ok(self.coupons.get_by_id(id).await?);
        }

        let code = match input.code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => code.to_string(),
            _ => utils::random_string(8),
        };
        if self.coupons.get_by_code(&code).await?.is_some() {
            return Err(rejected("Coupon code already exists"));
        }
        let coupon = self.coupons.create(&code, input).await?;
        info!("Created coupon {} ({})", coupon.id, coupon.code);
        Ok(Some(coupon))
    }

    pub async fn toggle_show(&self, id: i64) -> Result<()> {
        if !self.coupons.toggle_show(id).await? {
            return Err(not_found("Coupon does not exist"));
        }
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        if !self.coupons.delete(id).await? {
            return Err(not_found("Coupon does not exist"));
        }
        info!("Deleted coupon {}", id);
        Ok(())
    }
}

/// Checks that do not need the database.
pub fn validate(coupon: &Coupon, plan_id: i64, period: Option<Period>, now: DateTime<Utc>) -> Result<()> {
    if !coupon.show {
        return Err(rejected("Invalid coupon"));
    }
    if matches!(coupon.limit_use, Some(n) if n <= 0) {
        return Err(rejected("This coupon is no longer available"));
    }
    if now < coupon.started_at {
        return Err(rejected("This coupon has not yet started"));
    }
    if now > coupon.ended_at {
        return Err(rejected("This coupon has expired"));
    }
    if let Some(plans) = &coupon.limit_plan_ids
        && !plans.is_empty()
        && !plans.contains(&plan_id)
    {
        return Err(rejected("The coupon code cannot be used for this subscription"));
    }
    if let (Some(periods), Some(period)) = (&coupon.limit_period, period)
        && !periods.is_empty()
        && !periods.iter().any(|p| p == period.as_str())
    {
        return Err(rejected("The coupon code cannot be used for this period"));
    }
    Ok(())
}

/// A redemption code names exactly one plan and one period.
pub fn redemption_target(coupon: &Coupon) -> Option<(i64, Period)> {
    match (coupon.limit_plan_ids.as_deref(), coupon.limit_period.as_deref()) {
        (Some([plan_id]), Some([period])) => Some((*plan_id, period.parse().ok()?)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ferry_db::models::coupon::CouponType;

    fn coupon() -> Coupon {
        let now = Utc::now();
        Coupon {
            id: 1,
            code: "SPRING".into(),
            name: "spring".into(),
            coupon_type: CouponType::Percentage,
            value: 20,
            show: true,
            limit_use: None,
            limit_use_with_user: None,
            limit_plan_ids: None,
            limit_period: None,
            started_at: now - Duration::days(1),
            ended_at: now + Duration::days(1),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn open_coupon_passes() {
        assert!(validate(&coupon(), 7, Some(Period::Month), Utc::now()).is_ok());
    }

    #[test]
    fn exhausted_and_hidden_coupons_fail() {
        let mut c = coupon();
        c.limit_use = Some(0);
        assert!(validate(&c, 1, None, Utc::now()).is_err());

        let mut c = coupon();
        c.show = false;
        assert!(validate(&c, 1, None, Utc::now()).is_err());
    }

    #[test]
    fn window_is_enforced() {
        let c = coupon();
        assert!(validate(&c, 1, None, Utc::now() + Duration::days(2)).is_err());
        assert!(validate(&c, 1, None, Utc::now() - Duration::days(2)).is_err());
    }

    #[test]
    fn plan_and_period_limits() {
        let mut c = coupon();
        c.limit_plan_ids = Some(vec![2, 3]);
        c.limit_period = Some(vec!["year_price".into()]);
        let now = Utc::now();
        assert!(validate(&c, 1, Some(Period::Year), now).is_err());
        assert!(validate(&c, 2, Some(Period::Month), now).is_err());
        assert!(validate(&c, 3, Some(Period::Year), now).is_ok());
        assert!(validate(&c, 3, None, now).is_ok());
    }

    #[test]
    fn redemption_needs_single_plan_and_period() {
        let mut c = coupon();
        assert_eq!(redemption_target(&c), None);

        c.limit_plan_ids = Some(vec![4]);
        c.limit_period = Some(vec!["quarter_price".into()]);
        assert_eq!(redemption_target(&c), Some((4, Period::Quarter)));

        c.limit_plan_ids = Some(vec![4, 5]);
        assert_eq!(redemption_target(&c), None);
    }
}
