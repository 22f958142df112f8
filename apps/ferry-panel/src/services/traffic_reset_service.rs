use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, Utc};
use ferry_db::models::GB;
use ferry_db::repositories::user_repo::{ResetCandidate, UserRepository};
use sqlx::PgPool;
use std::collections::BTreeMap;
use tracing::{error, info};

/// When a plan's usage counters are zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMethod {
    FirstDayOfMonth,
    ExpireDayOfMonth,
    Never,
    FirstDayOfYear,
    ExpireDayOfYear,
    Quarterly,
    HalfYearly,
}

impl ResetMethod {
    pub fn from_code(code: i16) -> Option<Self> {
        Some(match code {
            0 => ResetMethod::FirstDayOfMonth,
            1 => ResetMethod::ExpireDayOfMonth,
            2 => ResetMethod::Never,
            3 => ResetMethod::FirstDayOfYear,
            4 => ResetMethod::ExpireDayOfYear,
            5 => ResetMethod::Quarterly,
            6 => ResetMethod::HalfYearly,
            _ => return None,
        })
    }

    /// The plan's own method, else the site default.
    pub fn effective(plan_method: Option<i16>, default_method: i16) -> Self {
        plan_method
            .and_then(Self::from_code)
            .or_else(|| Self::from_code(default_method))
            .unwrap_or(ResetMethod::FirstDayOfMonth)
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// The expire day as it falls in `today`'s month.
fn is_expire_day(expire: NaiveDate, today: NaiveDate) -> bool {
    today.day() == expire.day().min(days_in_month(today.year(), today.month()))
}

fn month_distance(expire: NaiveDate, today: NaiveDate) -> i32 {
    (today.month() as i32 - expire.month() as i32).rem_euclid(12)
}

pub fn should_reset(method: ResetMethod, expire: NaiveDate, today: NaiveDate) -> bool {
    match method {
        ResetMethod::FirstDayOfMonth => today.day() == 1,
        ResetMethod::ExpireDayOfMonth => is_expire_day(expire, today),
        ResetMethod::Never => false,
        ResetMethod::FirstDayOfYear => today.month() == 1 && today.day() == 1,
        ResetMethod::ExpireDayOfYear => {
            today.month() == expire.month() && is_expire_day(expire, today)
        }
        ResetMethod::Quarterly => month_distance(expire, today) % 3 == 0 && is_expire_day(expire, today),
        ResetMethod::HalfYearly => month_distance(expire, today) % 6 == 0 && is_expire_day(expire, today),
    }
}

/// Days from `today` to the next reset strictly after it. `None` when it never resets.
pub fn next_reset_days(method: ResetMethod, expire: NaiveDate, today: NaiveDate) -> Option<i64> {
    if method == ResetMethod::Never {
        return None;
    }
    (1..=366 * 2)
        .find(|offset| should_reset(method, expire, today + Duration::days(*offset)))
}

#[derive(Clone)]
pub struct TrafficResetService {
    pool: PgPool,
    users: UserRepository,
    default_method: i16,
    tz: FixedOffset,
}

impl TrafficResetService {
    pub fn new(pool: PgPool, default_method: i16, tz: FixedOffset) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            pool,
            default_method,
            tz,
        }
    }

    pub fn method_for(&self, plan_method: Option<i16>) -> ResetMethod {
        ResetMethod::effective(plan_method, self.default_method)
    }

    /// Days until the user's next reset, for display.
    pub fn reset_day(&self, plan_method: Option<i16>, expired_at: Option<DateTime<Utc>>) -> Option<i64> {
        let expired_at = expired_at?;
        let now = Utc::now();
        if expired_at <= now {
            return None;
        }
        let today = now.with_timezone(&self.tz).date_naive();
        let expire = expired_at.with_timezone(&self.tz).date_naive();
        next_reset_days(self.method_for(plan_method), expire, today)
    }

    fn due<'a>(&self, candidates: &'a [ResetCandidate], today: NaiveDate) -> Vec<&'a ResetCandidate> {
        candidates
            .iter()
            .filter(|c| {
                let expire = c.expired_at.with_timezone(&self.tz).date_naive();
                should_reset(self.method_for(c.reset_traffic_method), expire, today)
            })
            .collect()
    }

    /// Resets every user due on `today`. Returns how many were reset.
    pub async fn run(&self, today: NaiveDate) -> Result<u64> {
        let candidates = self.users.reset_candidates(Utc::now()).await?;

        let mut by_plan: BTreeMap<i64, (i64, Vec<i64>)> = BTreeMap::new();
        for c in self.due(&candidates, today) {
            by_plan
                .entry(c.plan_id)
                .or_insert_with(|| (c.plan_transfer_enable, Vec::new()))
                .1
                .push(c.id);
        }

        let mut total = 0;
        for (plan_id, (transfer_gb, ids)) in by_plan {
            let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
            let reset = UserRepository::reset_traffic(&mut tx, &ids, transfer_gb.saturating_mul(GB)).await?;
            tx.commit().await.context("Failed to commit traffic reset")?;
            info!("Reset traffic for {} users on plan {}", reset, plan_id);
            total += reset;
        }

        Ok(total)
    }

    /// Runs at every local midnight.
    pub async fn start(self) {
        info!("Traffic reset scheduler started");
        loop {
            tokio::time::sleep(crate::jobs::until_next_local_midnight(&self.tz)).await;
            let today = crate::utils::local_today(&self.tz);
            match self.run(today).await {
                Ok(count) => info!("Daily traffic reset done: {} users", count),
                Err(e) => error!("Daily traffic reset failed: {:#}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn month_first_day() {
        assert!(should_reset(ResetMethod::FirstDayOfMonth, d(2024, 5, 17), d(2024, 6, 1)));
        assert!(!should_reset(ResetMethod::FirstDayOfMonth, d(2024, 5, 17), d(2024, 6, 2)));
    }

    #[test]
    fn expire_day_clamps_to_month_end() {
        let expire = d(2025, 1, 31);
        assert!(should_reset(ResetMethod::ExpireDayOfMonth, expire, d(2024, 4, 30)));
        assert!(!should_reset(ResetMethod::ExpireDayOfMonth, expire, d(2024, 4, 29)));
        assert!(should_reset(ResetMethod::ExpireDayOfMonth, expire, d(2024, 2, 29)));
        assert!(should_reset(ResetMethod::ExpireDayOfMonth, expire, d(2023, 2, 28)));
        assert!(should_reset(ResetMethod::ExpireDayOfMonth, d(2025, 1, 15), d(2024, 7, 15)));
    }

    #[test]
    fn leap_day_expiry_resets_on_feb_28() {
        let expire = d(2024, 2, 29);
        assert!(should_reset(ResetMethod::ExpireDayOfYear, expire, d(2025, 2, 28)));
        assert!(should_reset(ResetMethod::ExpireDayOfYear, expire, d(2028, 2, 29)));
        assert!(!should_reset(ResetMethod::ExpireDayOfYear, expire, d(2028, 2, 28)));
    }

    #[test]
    fn year_first_day_does_not_fall_through() {
        let expire = d(2025, 8, 20);
        assert!(should_reset(ResetMethod::FirstDayOfYear, expire, d(2025, 1, 1)));
        assert!(!should_reset(ResetMethod::FirstDayOfYear, expire, d(2025, 8, 20)));
    }

    #[test]
    fn quarterly_and_half_yearly_cycles() {
        let expire = d(2025, 11, 10);
        for m in [2, 5, 8, 11] {
            assert!(should_reset(ResetMethod::Quarterly, expire, d(2025, m, 10)), "month {m}");
        }
        assert!(!should_reset(ResetMethod::Quarterly, expire, d(2025, 3, 10)));
        assert!(should_reset(ResetMethod::HalfYearly, expire, d(2025, 5, 10)));
        assert!(!should_reset(ResetMethod::HalfYearly, expire, d(2025, 8, 10)));
    }

    #[test]
    fn never_never_resets() {
        assert!(!should_reset(ResetMethod::Never, d(2025, 1, 1), d(2025, 1, 1)));
        assert_eq!(next_reset_days(ResetMethod::Never, d(2025, 1, 1), d(2024, 6, 1)), None);
    }

    #[test]
    fn next_reset_is_strictly_after_today() {
        let today = d(2024, 6, 1);
        assert_eq!(next_reset_days(ResetMethod::FirstDayOfMonth, d(2025, 1, 1), today), Some(30));
        assert_eq!(next_reset_days(ResetMethod::ExpireDayOfMonth, d(2025, 1, 15), today), Some(14));
        assert_eq!(next_reset_days(ResetMethod::FirstDayOfYear, d(2025, 1, 15), today), Some(214));
        assert_eq!(next_reset_days(ResetMethod::ExpireDayOfYear, d(2025, 6, 1), today), Some(365));
    }

    #[test]
    fn null_plan_method_uses_default() {
        assert_eq!(ResetMethod::effective(None, 1), ResetMethod::ExpireDayOfMonth);
        assert_eq!(ResetMethod::effective(Some(2), 1), ResetMethod::Never);
        assert_eq!(ResetMethod::effective(Some(9), 4), ResetMethod::ExpireDayOfYear);
    }

    #[tokio::test]
    async fn due_filters_by_local_expire_date() {
        let pool = PgPool::connect_lazy("postgres://localhost/ferry_test").unwrap();
        let tz = FixedOffset::east_opt(8 * 3600).unwrap();
        let service = TrafficResetService::new(pool, 1, tz);

        // 2025-03-14 20:00 UTC is the 15th in UTC+8.
        let expired_at = "2025-03-14T20:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let candidates = vec![ResetCandidate {
            id: 1,
            plan_id: 1,
            expired_at,
            reset_traffic_method: None,
            plan_transfer_enable: 100,
        }];
        assert_eq!(service.due(&candidates, d(2024, 7, 15)).len(), 1);
        assert!(service.due(&candidates, d(2024, 7, 14)).is_empty());
    }
}
