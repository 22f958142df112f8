use anyhow::{Context, Result};
use chrono::{FixedOffset, Utc};
use ferry_db::models::server::Server;
use ferry_db::repositories::stat_repo::StatRepository;
use ferry_db::repositories::user_repo::{NodeUser, UserRepository};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::debug;

use crate::error::not_found;
use crate::services::cache_service::{CacheService, keys};
use crate::services::server_service::ServerService;
use crate::utils;

type HmacSha256 = Hmac<Sha256>;

/// A node counts as online this long after its last push.
const ONLINE_WINDOW_SECS: u64 = 300;

/// Server as listed to a subscriber.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    #[serde(flatten)]
    pub server: Server,
    pub last_check_at: Option<i64>,
    pub is_online: bool,
}

/// Per-user upload and download in bytes, keyed by user id.
pub type TrafficReport = HashMap<i64, [i64; 2]>;

#[derive(Clone)]
pub struct TrafficService {
    pool: PgPool,
    users: UserRepository,
    servers: ServerService,
    cache: CacheService,
    node_token: String,
    tz: FixedOffset,
}

impl TrafficService {
    pub fn new(pool: PgPool, servers: ServerService, cache: CacheService, node_token: String, tz: FixedOffset) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            pool,
            servers,
            cache,
            node_token,
            tz,
        }
    }

    pub fn verify_token(&self, provided: &str) -> bool {
        node_token_matches(&self.node_token, provided)
    }

    /// The server a node reports as, checked against its declared type.
    pub async fn node(&self, node_id: i64, node_type: &str) -> Result<Server> {
        let server = self.servers.get(node_id).await?;
        if !server.server_type.eq_ignore_ascii_case(node_type) {
            return Err(not_found("Server does not exist"));
        }
        Ok(server)
    }

    /// Users the node should accept.
    pub async fn users_for(&self, server: &Server) -> Result<Vec<NodeUser>> {
        self.users.list_for_groups(&server.group_ids, Utc::now()).await
    }

    /// Books a traffic report: user counters scaled by the server rate,
    /// plus the daily user and server statistics.
    pub async fn push(&self, server: &Server, report: &TrafficReport) -> Result<usize> {
        let date = utils::local_today(&self.tz);
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let (mut total_u, mut total_d) = (0i64, 0i64);
        for (user_id, u, d) in billable(report) {
            let (rated_u, rated_d) = (scale(u, server.rate), scale(d, server.rate));
            UserRepository::add_traffic(&mut tx, user_id, rated_u, rated_d).await?;
            StatRepository::add_user_traffic(&mut tx, user_id, server.rate, rated_u, rated_d, date).await?;
            total_u = total_u.saturating_add(u);
            total_d = total_d.saturating_add(d);
        }
        StatRepository::add_server_traffic(&mut tx, server.id, &server.server_type, total_u, total_d, date).await?;
        tx.commit().await.context("Failed to commit traffic report")?;

        self.cache
            .set(
                &keys::server_last_push_at(server.id),
                &Utc::now().timestamp().to_string(),
                ONLINE_WINDOW_SECS * 12,
            )
            .await?;

        debug!(
            "Server {} pushed traffic for {} users ({} up, {} down)",
            server.id,
            report.len(),
            utils::format_bytes_str(total_u.max(0) as u64),
            utils::format_bytes_str(total_d.max(0) as u64)
        );
        Ok(report.len())
    }

    /// Attaches last push time and online state to each server.
    pub async fn with_status(&self, servers: Vec<Server>) -> Result<Vec<ServerStatus>> {
        let now = Utc::now().timestamp();
        let mut listed = Vec::with_capacity(servers.len());
        for server in servers {
            let last_check_at = self
                .cache
                .get(&keys::server_last_push_at(server.parent_id.unwrap_or(server.id)))
                .await?
                .and_then(|v| v.parse::<i64>().ok());
            listed.push(ServerStatus {
                is_online: last_check_at.is_some_and(|at| now - at <= ONLINE_WINDOW_SECS as i64),
                last_check_at,
                server,
            });
        }
        Ok(listed)
    }
}

/// Report entries in ascending user id order, so concurrent pushes lock
/// user rows in the same order. Negative counters count as zero.
fn billable(report: &TrafficReport) -> Vec<(i64, i64, i64)> {
    let mut entries: Vec<_> = report
        .iter()
        .map(|(&user_id, &[u, d])| (user_id, u.max(0), d.max(0)))
        .filter(|&(_, u, d)| u > 0 || d > 0)
        .collect();
    entries.sort_unstable_by_key(|&(user_id, _, _)| user_id);
    entries
}

fn scale(bytes: i64, rate: f64) -> i64 {
    (bytes as f64 * rate).round() as i64
}

/// Constant-time comparison of the configured node token with a presented one.
pub fn node_token_matches(expected: &str, provided: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    let digest = |key: &str| {
        HmacSha256::new_from_slice(key.as_bytes()).map(|mut mac| {
            mac.update(b"ferry-node-token");
            mac
        })
    };
    let (Ok(expected_mac), Ok(provided_mac)) = (digest(expected), digest(provided)) else {
        return false;
    };
    let tag = expected_mac.finalize().into_bytes();
    provided_mac.verify_slice(&tag).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_token_comparison() {
        assert!(node_token_matches("s3cret-token", "s3cret-token"));
        assert!(!node_token_matches("s3cret-token", "s3cret-tokeN"));
        assert!(!node_token_matches("s3cret-token", ""));
        assert!(!node_token_matches("", ""));
    }

    #[test]
    fn rate_scales_and_rounds() {
        assert_eq!(scale(1000, 1.0), 1000);
        assert_eq!(scale(1000, 0.5), 500);
        assert_eq!(scale(3, 1.5), 5);
        assert_eq!(scale(1024, 2.0), 2048);
    }

    #[test]
    fn billable_entries_are_sorted_and_never_negative() {
        let report: TrafficReport = serde_json::from_str(
            r#"{"42": [10, 20], "3": [-5, 100], "17": [0, 0], "9": [-1, -1], "5": [7, -3]}"#,
        )
        .unwrap();
        assert_eq!(billable(&report), vec![(3, 0, 100), (5, 7, 0), (42, 10, 20)]);
    }

    #[test]
    fn report_parses_string_keys() {
        let report: TrafficReport = serde_json::from_str(r#"{"12": [100, 200], "7": [0, 5]}"#).unwrap();
        assert_eq!(report[&12], [100, 200]);
        assert_eq!(report[&7], [0, 5]);
    }
}
