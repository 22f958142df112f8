use anyhow::Result;
use chrono::{Duration as ChronoDuration, FixedOffset, Utc};
use ferry_db::repositories::user_repo::UserRepository;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};

use crate::AppState;
use crate::config::SiteConfig;
use crate::services::mail_service::{Mail, MailService};
use crate::utils;

const ORDER_CHECK_SECS: u64 = 60;
const COMMISSION_CHECK_SECS: u64 = 15 * 60;
const TRAFFIC_REMIND_PERCENT: i64 = 95;

/// Time left until the next midnight in `tz`.
pub fn until_next_local_midnight(tz: &FixedOffset) -> Duration {
    let now = Utc::now();
    let tomorrow = now.with_timezone(tz).date_naive() + ChronoDuration::days(1);
    let next = utils::local_day_start(tz, tomorrow);
    (next - now).to_std().unwrap_or(Duration::from_secs(1))
}

/// Sends expiry and traffic reminders. Returns `(expiring, over_traffic)` mail counts.
pub async fn send_remind_mail(users: &UserRepository, mail: &MailService, site: &SiteConfig) -> Result<(usize, usize)> {
    let now = Utc::now();
    let expiring = users.expiring_between(now, now + ChronoDuration::hours(24)).await?;
    for user in &expiring {
        mail.send_logged(&Mail::expire_reminder(&site.app_name, &site.app_url, &user.email))
            .await;
    }

    let heavy = users.over_traffic_threshold(TRAFFIC_REMIND_PERCENT, now).await?;
    for user in &heavy {
        mail.send_logged(&Mail::traffic_reminder(&site.app_name, &site.app_url, &user.email))
            .await;
    }

    info!(
        "Reminder mail sent: {} expiring, {} over traffic",
        expiring.len(),
        heavy.len()
    );
    Ok((expiring.len(), heavy.len()))
}

pub async fn check_commission(state: &AppState) -> Result<(usize, usize)> {
    let approved = state.commission_service.auto_check().await?;
    let paid = state.commission_service.auto_pay().await?;
    Ok((approved, paid))
}

/// Spawns every periodic task of the panel.
pub fn spawn_all(state: AppState) {
    let reset = (*state.traffic_reset_service).clone();
    tokio::spawn(async move {
        reset.start().await;
    });

    let orders = state.order_service.clone();
    tokio::spawn(async move {
        info!("Order check job started");
        let mut ticker = interval(Duration::from_secs(ORDER_CHECK_SECS));
        loop {
            ticker.tick().await;
            if let Err(e) = orders.check_orders().await {
                error!("Order check failed: {:#}", e);
            }
        }
    });

    let commission_state = state.clone();
    tokio::spawn(async move {
        info!("Commission job started");
        let mut ticker = interval(Duration::from_secs(COMMISSION_CHECK_SECS));
        loop {
            ticker.tick().await;
            if let Err(e) = check_commission(&commission_state).await {
                error!("Commission check failed: {:#}", e);
            }
        }
    });

    tokio::spawn(async move {
        info!("Daily stat and reminder job started");
        let tz = state.tz;
        let users = UserRepository::new(state.pool.clone());
        loop {
            tokio::time::sleep(until_next_local_midnight(&tz)).await;
            let yesterday = utils::local_today(&tz) - ChronoDuration::days(1);
            if let Err(e) = state.stat_service.record_daily(yesterday).await {
                error!("Recording stats for {} failed: {:#}", yesterday, e);
            }
            if let Err(e) = send_remind_mail(&users, &state.mail_service, &state.config.site).await {
                error!("Reminder mail failed: {:#}", e);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_midnight_is_within_a_day() {
        for hours in [-12, 0, 8, 14] {
            let tz = FixedOffset::east_opt(hours * 3600).unwrap();
            let wait = until_next_local_midnight(&tz);
            assert!(wait > Duration::ZERO);
            assert!(wait <= Duration::from_secs(24 * 3600));
        }
    }
}
