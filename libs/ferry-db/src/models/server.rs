use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Server {
    pub id: i64,
    /// `shadowsocks`, `vmess`, `trojan`, `vless` or `hysteria`.
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub server_type: String,
    pub name: String,
    pub group_ids: Vec<i64>,
    pub parent_id: Option<i64>,
    pub tags: Vec<String>,
    pub host: String,
    pub port: i32,
    pub server_port: i32,
    pub rate: f64,
    pub show: bool,
    pub sort: i32,
    /// Protocol specific options (cipher, network, tls, ...).
    pub settings: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Server {
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }

    pub fn setting_bool(&self, key: &str) -> bool {
        match self.settings.get(key) {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInput {
    pub id: Option<i64>,
    #[serde(rename = "type")]
    pub server_type: String,
    pub name: String,
    #[serde(default)]
    pub group_ids: Vec<i64>,
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub host: String,
    pub port: i32,
    pub server_port: i32,
    #[serde(default = "default_rate")]
    pub rate: f64,
    #[serde(default)]
    pub show: bool,
    #[serde(default)]
    pub sort: i32,
    #[serde(default)]
    pub settings: serde_json::Value,
}

fn default_rate() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ServerRule {
    pub id: i64,
    pub name: String,
    /// Host that replaces the server address when the rule matches.
    pub domain: String,
    /// Server group ids the rule covers.
    pub server_arr: Vec<i64>,
    /// User-Agent fragment to match.
    pub ua: String,
    /// Optional protocol restriction.
    pub prot: Option<String>,
    pub sort: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServerRule {
    pub fn matches(&self, user_agent: &str, server: &Server) -> bool {
        let ua = self.ua.trim().to_lowercase();
        if ua.is_empty() || !user_agent.to_lowercase().contains(&ua) {
            return false;
        }
        if let Some(prot) = self.prot.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            if !prot.eq_ignore_ascii_case(&server.server_type) {
                return false;
            }
        }
        server.group_ids.iter().any(|g| self.server_arr.contains(g))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerRuleInput {
    pub id: Option<i64>,
    pub name: String,
    pub domain: String,
    pub server_arr: Vec<i64>,
    pub ua: String,
    pub prot: Option<String>,
    #[serde(default)]
    pub sort: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(server_type: &str, group_ids: Vec<i64>) -> Server {
        let now = Utc::now();
        Server {
            id: 1,
            server_type: server_type.into(),
            name: "node".into(),
            group_ids,
            parent_id: None,
            tags: vec![],
            host: "origin.example.com".into(),
            port: 443,
            server_port: 443,
            rate: 1.0,
            show: true,
            sort: 0,
            settings: serde_json::json!({"tls": 1}),
            created_at: now,
            updated_at: now,
        }
    }

    fn rule(ua: &str, prot: Option<&str>, groups: Vec<i64>) -> ServerRule {
        let now = Utc::now();
        ServerRule {
            id: 1,
            name: "r".into(),
            domain: "cdn.example.com".into(),
            server_arr: groups,
            ua: ua.into(),
            prot: prot.map(String::from),
            sort: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn rule_matches_ua_protocol_and_group() {
        let s = server("vmess", vec![2, 3]);
        assert!(rule("clash", None, vec![3]).matches("ClashForWindows/0.20", &s));
        assert!(rule("clash", Some("VMESS"), vec![3]).matches("clash-verge", &s));
        assert!(!rule("clash", Some("trojan"), vec![3]).matches("clash", &s));
        assert!(!rule("clash", None, vec![9]).matches("clash", &s));
        assert!(!rule("shadowrocket", None, vec![3]).matches("clash", &s));
        assert!(!rule("", None, vec![3]).matches("clash", &s));
    }

    #[test]
    fn numeric_and_bool_settings_are_flags() {
        let s = server("vmess", vec![]);
        assert!(s.setting_bool("tls"));
        assert!(!s.setting_bool("missing"));
        assert_eq!(s.setting_str("tls"), None);
    }
}
