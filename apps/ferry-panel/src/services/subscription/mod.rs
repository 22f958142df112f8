//! Client subscription output: picks servers for a user and renders them in
//! the format the requesting client understands.

pub mod clash;
pub mod general;
pub mod singbox;

use anyhow::Result;
use base64::Engine;
use chrono::{FixedOffset, Utc};
use ferry_db::models::server::Server;
use ferry_db::models::user::User;
use ferry_db::repositories::plan_repo::PlanRepository;
use serde::Deserialize;
use sqlx::PgPool;
use tracing::debug;

use crate::config::SiteConfig;
use crate::services::server_service::{self, ServerService};
use crate::services::traffic_reset_service::TrafficResetService;
use crate::utils;

/// Flags that select Clash-compatible YAML.
const CLASH_FLAGS: [&str; 4] = ["clash", "stash", "meta", "mihomo"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscribeParams {
    pub token: Option<String>,
    pub flag: Option<String>,
    pub platform: Option<String>,
    pub p: Option<String>,
    pub include: Option<String>,
    pub exclude: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFormat {
    SingBox,
    SingBoxLegacy,
    Clash,
    General,
}

impl ClientFormat {
    pub fn detect(flag: &str) -> Self {
        let flag = flag.to_lowercase();
        if flag.contains("sing") {
            return match singbox_version(&flag) {
                Some(v) if v >= [1, 12, 0] => ClientFormat::SingBox,
                _ => ClientFormat::SingBoxLegacy,
            };
        }
        if CLASH_FLAGS.iter().any(|f| flag.contains(f)) {
            return ClientFormat::Clash;
        }
        ClientFormat::General
    }
}

/// Version from a `sing-box 1.12.3` style flag, padded to three parts.
pub fn singbox_version(flag: &str) -> Option<[u32; 3]> {
    let rest = &flag[flag.find("sing-box")? + "sing-box".len()..];
    let trimmed = rest.trim_start();
    if trimmed.len() == rest.len() {
        return None;
    }
    let raw: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = [0u32; 3];
    let mut seen = 0;
    for (slot, piece) in parts.iter_mut().zip(raw.split('.').filter(|p| !p.is_empty())) {
        *slot = piece.parse().ok()?;
        seen += 1;
    }
    (seen > 0).then_some(parts)
}

pub struct Rendered {
    pub body: String,
    pub content_type: &'static str,
    pub filename: &'static str,
}

pub fn render(format: ClientFormat, servers: &[Server], user: &User, profile: &str) -> Result<Rendered> {
    Ok(match format {
        ClientFormat::SingBox => Rendered {
            body: singbox::render(servers, &user.uuid, false)?,
            content_type: "application/json",
            filename: "config.json",
        },
        ClientFormat::SingBoxLegacy => Rendered {
            body: singbox::render(servers, &user.uuid, true)?,
            content_type: "application/json",
            filename: "config.json",
        },
        ClientFormat::Clash => Rendered {
            body: clash::render(servers, &user.uuid, profile)?,
            content_type: "application/yaml",
            filename: "config.yaml",
        },
        ClientFormat::General => Rendered {
            body: general::render(servers, &user.uuid)?,
            content_type: "text/plain",
            filename: "config.txt",
        },
    })
}

/// Value of the `subscription-userinfo` header.
pub fn userinfo_header(user: &User) -> String {
    format!(
        "upload={}; download={}; total={}; expire={}",
        user.u,
        user.d,
        user.transfer_enable,
        user.expired_at.map(|t| t.timestamp()).unwrap_or(0)
    )
}

fn placeholder(name: String) -> Server {
    let now = Utc::now();
    Server {
        id: 0,
        server_type: "shadowsocks".to_string(),
        name,
        group_ids: Vec::new(),
        parent_id: None,
        tags: Vec::new(),
        host: "www.google.com".to_string(),
        port: 443,
        server_port: 443,
        rate: 1.0,
        show: true,
        sort: 0,
        settings: serde_json::json!({ "cipher": "aes-128-gcm" }),
        created_at: now,
        updated_at: now,
    }
}

/// Unusable entries telling an expired user where to renew.
pub fn placeholder_servers(host: &str) -> Vec<Server> {
    vec![
        placeholder("Your service has expired".to_string()),
        placeholder(format!("Please log in to {} to renew", host)),
    ]
}

/// Prepends informational entries that copy the first server's connection details.
pub fn prepend_info(servers: &mut Vec<Server>, site_url: &str, status: &str, reset_day: Option<i64>) {
    let Some(first) = servers.first().cloned() else {
        return;
    };
    let named = |name: String| Server {
        name,
        ..first.clone()
    };

    let mut info = vec![named(format!("Website: {}", site_url)), named(status.to_string())];
    if let Some(days) = reset_day {
        info.push(named(format!("Next reset in {} days", days)));
    }
    info.append(servers);
    *servers = info;
}

/// Shadowsocks password. 2022 ciphers combine the server key with a key
/// derived from the user's uuid.
pub(crate) fn ss_password(server: &Server, uuid: &str) -> String {
    let cipher = server.setting_str("cipher").unwrap_or("aes-128-gcm");
    if !cipher.starts_with("2022-blake3") {
        return uuid.to_string();
    }
    let len = if cipher.contains("128") { 16 } else { 32 };
    let user_key = base64::engine::general_purpose::STANDARD.encode(&uuid.as_bytes()[..len.min(uuid.len())]);
    match server.setting_str("server_key") {
        Some(key) => format!("{}:{}", key, user_key),
        None => user_key,
    }
}

/// TLS mode of a server, read from its settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Security {
    None,
    Tls,
    Reality,
}

pub(crate) fn security(server: &Server) -> Security {
    if server.setting_str("public_key").is_some() {
        Security::Reality
    } else if server.setting_bool("tls") || server.server_type == "trojan" || server.server_type == "hysteria" {
        Security::Tls
    } else {
        Security::None
    }
}

pub(crate) fn network(server: &Server) -> &str {
    server.setting_str("network").unwrap_or("tcp")
}

pub(crate) fn server_name(server: &Server) -> &str {
    server.setting_str("server_name").unwrap_or(&server.host)
}

/// Route the subscription endpoint is served on.
pub fn subscribe_path(site: &SiteConfig) -> String {
    site.subscribe_path
        .as_deref()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("/{}", p))
        .unwrap_or_else(|| "/api/v1/client/subscribe".to_string())
}

/// Public subscription link of a token.
pub fn subscribe_link(site: &SiteConfig, token: &str) -> String {
    let base = utils::pick_one(&site.subscribe_url).unwrap_or_else(|| site.app_url.clone());
    format!("{}{}?token={}", base.trim_end_matches('/'), subscribe_path(site), token)
}

#[derive(Clone)]
pub struct SubscriptionService {
    servers: ServerService,
    reset: TrafficResetService,
    plans: PlanRepository,
    site: SiteConfig,
    tz: FixedOffset,
}

impl SubscriptionService {
    pub fn new(
        pool: PgPool,
        servers: ServerService,
        reset: TrafficResetService,
        site: SiteConfig,
        tz: FixedOffset,
    ) -> Self {
        Self {
            servers,
            reset,
            plans: PlanRepository::new(pool),
            site,
            tz,
        }
    }

    /// Days until the user's next traffic reset.
    pub async fn reset_day(&self, user: &User) -> Result<Option<i64>> {
        let Some(plan_id) = user.plan_id else {
            return Ok(None);
        };
        let method = self
            .plans
            .get_by_id(plan_id)
            .await?
            .and_then(|p| p.reset_traffic_method);
        Ok(self.reset.reset_day(method, user.expired_at))
    }

    pub fn subscribe_url(&self, token: &str) -> String {
        subscribe_link(&self.site, token)
    }

    /// Servers the user should see, after rules and filters.
    pub async fn servers_for(&self, user: &User, params: &SubscribeParams, user_agent: &str) -> Result<Vec<Server>> {
        let platform = params
            .platform
            .as_deref()
            .or(params.p.as_deref())
            .unwrap_or_default();

        let servers = self.servers.available_for_client(user, user_agent).await?;
        let mut servers = server_service::filter_platform(servers, platform);

        if self.site.show_info_to_server_enable {
            let expire = user
                .expired_at
                .map(|t| t.with_timezone(&self.tz).format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "Long-term".to_string());
            let status = format!(
                "Expire: {}; Remaining: {}",
                expire,
                utils::format_bytes_str(user.remaining_traffic() as u64)
            );
            let reset_day = self.reset_day(user).await?;
            prepend_info(&mut servers, &self.site.app_url, &status, reset_day);
        }

        Ok(server_service::filter_names(
            servers,
            params.include.as_deref(),
            params.exclude.as_deref(),
        ))
    }

    pub async fn subscribe(
        &self,
        user: &User,
        params: &SubscribeParams,
        user_agent: &str,
        host: &str,
    ) -> Result<Rendered> {
        let flag = params.flag.as_deref().unwrap_or(user_agent).to_lowercase();

        let servers = if user.is_available_at(Utc::now()) {
            self.servers_for(user, params, user_agent).await?
        } else {
            placeholder_servers(host)
        };

        let format = ClientFormat::detect(&flag);
        debug!("Subscription for user {} as {:?} ({} servers)", user.id, format, servers.len());
        render(format, &servers, user, &self.site.app_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_selects_format() {
        assert_eq!(ClientFormat::detect("sing-box 1.12.0"), ClientFormat::SingBox);
        assert_eq!(ClientFormat::detect("SFA/1.11.4 (sing-box 1.13.1)"), ClientFormat::SingBox);
        assert_eq!(ClientFormat::detect("sing-box 1.11.9"), ClientFormat::SingBoxLegacy);
        assert_eq!(ClientFormat::detect("sing-box"), ClientFormat::SingBoxLegacy);
        assert_eq!(ClientFormat::detect("ClashMetaForAndroid/2.10"), ClientFormat::Clash);
        assert_eq!(ClientFormat::detect("mihomo/1.18"), ClientFormat::Clash);
        assert_eq!(ClientFormat::detect("Stash/2.4"), ClientFormat::Clash);
        assert_eq!(ClientFormat::detect("v2rayN/6.0"), ClientFormat::General);
        assert_eq!(ClientFormat::detect(""), ClientFormat::General);
    }

    #[test]
    fn subscribe_link_honours_custom_path() {
        let mut site = SiteConfig::default();
        site.app_url = "https://panel.example/".into();
        assert_eq!(
            subscribe_link(&site, "abc"),
            "https://panel.example/api/v1/client/subscribe?token=abc"
        );

        site.subscribe_url = "https://sub.example".into();
        site.subscribe_path = Some("/s/".into());
        assert_eq!(subscribe_link(&site, "abc"), "https://sub.example/s?token=abc");
    }

    #[test]
    fn version_parsing_pads_and_compares_numerically() {
        assert_eq!(singbox_version("sing-box 1.12"), Some([1, 12, 0]));
        assert_eq!(singbox_version("sing-box  1.9.7"), Some([1, 9, 7]));
        assert_eq!(singbox_version("sing-box"), None);
        assert_eq!(singbox_version("sing-box/1.12"), None);
        assert!([1, 9, 7] < [1, 12, 0]);
    }

    #[test]
    fn info_entries_precede_servers() {
        let mut servers = vec![placeholder("Tokyo".into())];
        prepend_info(&mut servers, "https://ferry.example", "Expire: 2030-01-01; Remaining: 1.00 GB", Some(3));
        let names: Vec<&str> = servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Website: https://ferry.example",
                "Expire: 2030-01-01; Remaining: 1.00 GB",
                "Next reset in 3 days",
                "Tokyo",
            ]
        );
        assert!(servers.iter().all(|s| s.host == "www.google.com"));
    }

    #[test]
    fn info_skipped_without_servers() {
        let mut servers = Vec::new();
        prepend_info(&mut servers, "https://ferry.example", "status", None);
        assert!(servers.is_empty());
    }

    #[test]
    fn placeholders_name_the_host() {
        let servers = placeholder_servers("panel.example.com");
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].name, "Please log in to panel.example.com to renew");
        assert_eq!(servers[0].setting_str("cipher"), Some("aes-128-gcm"));
    }

    #[test]
    fn ss_2022_password_combines_keys() {
        let mut server = placeholder("x".into());
        assert_eq!(ss_password(&server, "abc"), "abc");

        server.settings = serde_json::json!({ "cipher": "2022-blake3-aes-128-gcm", "server_key": "SERVER" });
        let uuid = "0123456789abcdef0123456789abcdef";
        let expected = base64::engine::general_purpose::STANDARD.encode("0123456789abcdef");
        assert_eq!(ss_password(&server, uuid), format!("SERVER:{}", expected));
    }
}
