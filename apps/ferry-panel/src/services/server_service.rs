use anyhow::Result;
use ferry_db::models::server::{Server, ServerInput, ServerRule, ServerRuleInput};
use ferry_db::models::user::User;
use ferry_db::repositories::server_repo::ServerRepository;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::not_found;

/// Tags that mark a server for clients that send no platform.
const DEFAULT_TAGS: [&str; 2] = ["WEB", "dflt"];

#[derive(Clone)]
pub struct ServerService {
    servers: ServerRepository,
}

impl ServerService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            servers: ServerRepository::new(pool),
        }
    }

    /// Visible servers in the user's group, in display order.
    pub async fn available_for(&self, user: &User) -> Result<Vec<Server>> {
        match user.group_id {
            Some(group_id) => self.servers.list_for_group(group_id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Available servers with host rewrites for the requesting client applied.
    pub async fn available_for_client(&self, user: &User, user_agent: &str) -> Result<Vec<Server>> {
        let servers = self.available_for(user).await?;
        let rules = self.servers.list_rules().await?;
        Ok(apply_rules(servers, &rules, user_agent))
    }

    pub async fn get(&self, id: i64) -> Result<Server> {
        self.servers
            .get_by_id(id)
            .await?
            .ok_or_else(|| not_found("Server does not exist"))
    }

    // ==================== ADMIN ====================

    pub async fn list(&self) -> Result<Vec<Server>> {
        self.servers.list().await
    }

    pub async fn save(&self, input: &ServerInput) -> Result<Server> {
        if let Some(id) = input.id {
            self.get(id).await?;
        }
        let server = self.servers.upsert(input).await?;
        info!("Saved server {} ({})", server.id, server.name);
        Ok(server)
    }

    pub async fn set_show(&self, id: i64, show: bool) -> Result<()> {
        if !self.servers.set_show(id, show).await? {
            return Err(not_found("Server does not exist"));
        }
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        if !self.servers.delete(id).await? {
            return Err(not_found("Server does not exist"));
        }
        info!("Deleted server {}", id);
        Ok(())
    }

    pub async fn rules(&self) -> Result<Vec<ServerRule>> {
        self.servers.list_rules().await
    }

    pub async fn save_rule(&self, input: &ServerRuleInput) -> Result<ServerRule> {
        if input.name.trim().is_empty() {
            return Err(crate::error::rejected("Rule name is required"));
        }
        if input.domain.trim().is_empty() {
            return Err(crate::error::rejected("Domain is required"));
        }
        if input.server_arr.is_empty() {
            return Err(crate::error::rejected("Select at least one server group"));
        }
        if input.ua.trim().is_empty() {
            return Err(crate::error::rejected("User-Agent pattern is required"));
        }
        self.servers
            .upsert_rule(input)
            .await?
            .ok_or_else(|| not_found("Rule does not exist"))
    }

    pub async fn drop_rule(&self, id: i64) -> Result<()> {
        if !self.servers.delete_rule(id).await? {
            return Err(not_found("Rule does not exist"));
        }
        Ok(())
    }

    pub async fn sort_rules(&self, ids: &[i64]) -> Result<()> {
        if !self.servers.sort_rules(ids).await? {
            return Err(not_found("Rule does not exist"));
        }
        Ok(())
    }
}

/// Replaces each server's host with the domain of the first matching rule.
/// `rules` must already be in priority order.
pub fn apply_rules(mut servers: Vec<Server>, rules: &[ServerRule], user_agent: &str) -> Vec<Server> {
    for server in servers.iter_mut() {
        if let Some(rule) = rules.iter().find(|r| r.matches(user_agent, server)) {
            debug!("Rule {} rewrites server {} host to {}", rule.id, server.id, rule.domain);
            server.host = rule.domain.clone();
        }
    }
    servers
}

/// Keeps servers tagged for `platform`, or the default tags when it is empty.
pub fn filter_platform(servers: Vec<Server>, platform: &str) -> Vec<Server> {
    servers
        .into_iter()
        .filter(|s| {
            if platform.is_empty() {
                s.tags.iter().any(|t| DEFAULT_TAGS.contains(&t.as_str()))
            } else {
                s.tags.iter().any(|t| t == platform)
            }
        })
        .collect()
}

fn split_terms(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split([',', '|'])
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Name filter: any include term must match, no exclude term may match.
pub fn filter_names(servers: Vec<Server>, include: Option<&str>, exclude: Option<&str>) -> Vec<Server> {
    let include = split_terms(include);
    let exclude = split_terms(exclude);
    servers
        .into_iter()
        .filter(|s| {
            let name = s.name.to_lowercase();
            let included = include.is_empty() || include.iter().any(|t| name.contains(t.as_str()));
            let excluded = exclude.iter().any(|t| name.contains(t.as_str()));
            included && !excluded
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn server(id: i64, name: &str, tags: &[&str]) -> Server {
        let now = Utc::now();
        Server {
            id,
            server_type: "vmess".into(),
            name: name.into(),
            group_ids: vec![1],
            parent_id: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            host: "origin.example.com".into(),
            port: 443,
            server_port: 443,
            rate: 1.0,
            show: true,
            sort: 0,
            settings: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    fn rule(id: i64, ua: &str, domain: &str) -> ServerRule {
        let now = Utc::now();
        ServerRule {
            id,
            name: format!("rule {id}"),
            domain: domain.into(),
            server_arr: vec![1],
            ua: ua.into(),
            prot: None,
            sort: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn empty_platform_keeps_default_tags() {
        let servers = vec![
            server(1, "a", &["WEB"]),
            server(2, "b", &["dflt"]),
            server(3, "c", &["ios"]),
            server(4, "d", &[]),
        ];
        let ids: Vec<i64> = filter_platform(servers.clone(), "").iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2]);

        let ids: Vec<i64> = filter_platform(servers, "ios").iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn include_and_exclude_are_case_insensitive() {
        let servers = vec![
            server(1, "Hong Kong 01", &[]),
            server(2, "Japan 01", &[]),
            server(3, "Hong Kong IPLC", &[]),
        ];
        let ids: Vec<i64> = filter_names(servers.clone(), Some("hong|japan"), Some("iplc"))
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);

        assert_eq!(filter_names(servers, None, Some(",")).len(), 3);
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = vec![rule(2, "clash", "first.example.com"), rule(1, "clash", "second.example.com")];
        let out = apply_rules(vec![server(1, "a", &[])], &rules, "ClashMeta/1.18");
        assert_eq!(out[0].host, "first.example.com");

        let out = apply_rules(vec![server(1, "a", &[])], &rules, "v2rayN");
        assert_eq!(out[0].host, "origin.example.com");
    }

    /// Runs against a scratch database when `FERRY_TEST_DATABASE_URL` is set.
    #[tokio::test]
    async fn unknown_rules_are_not_found() {
        let Ok(url) = std::env::var("FERRY_TEST_DATABASE_URL") else {
            return;
        };
        let pool = ferry_db::db::init_db(&url, 4).await.unwrap();
        let service = ServerService::new(pool);
        let is_not_found = |e: anyhow::Error| {
            matches!(e.downcast_ref::<crate::error::ServiceError>(), Some(crate::error::ServiceError::NotFound(_)))
        };

        let input = ServerRuleInput {
            id: Some(i64::MAX),
            name: "missing".into(),
            domain: "cdn.example.com".into(),
            server_arr: vec![1],
            ua: "clash".into(),
            prot: None,
            sort: 0,
        };
        assert!(is_not_found(service.save_rule(&input).await.unwrap_err()));
        assert!(is_not_found(service.sort_rules(&[i64::MAX]).await.unwrap_err()));
    }
}
