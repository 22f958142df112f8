use axum::http::{HeaderMap, header};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::services::passport_service::ClientInfo;

pub mod admin;
pub mod client;
pub mod guest;
pub mod node;
pub mod passport;
pub mod user;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub current: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    10
}

#[derive(Debug, Serialize)]
pub struct Paged<T> {
    pub data: Vec<T>,
    pub total: i64,
}

#[derive(Debug, Deserialize)]
pub struct IdBody {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct IdsBody {
    pub ids: Vec<i64>,
}

/// Caller address, preferring the proxy-supplied header.
pub fn client_info(headers: &HeaderMap, peer: SocketAddr) -> ClientInfo {
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| peer.ip().to_string());
    ClientInfo {
        ip: Some(ip),
        ua: user_agent(headers),
    }
}

pub fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn forwarded_address_wins() {
        let peer: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_info(&headers, peer).ip.as_deref(), Some("10.0.0.1"));

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        headers.insert(header::USER_AGENT, HeaderValue::from_static("curl/8"));
        let info = client_info(&headers, peer);
        assert_eq!(info.ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(info.ua.as_deref(), Some("curl/8"));
    }

    #[test]
    fn page_query_defaults() {
        let q: PageQuery = serde_urlencoded::from_str("").unwrap();
        assert_eq!((q.current, q.page_size), (1, 10));
    }
}
