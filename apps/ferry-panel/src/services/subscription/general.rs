use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use ferry_db::models::server::Server;
use serde_json::json;

use super::{Security, network, security, server_name, ss_password};

/// Base64 list of share links, one per line.
pub fn render(servers: &[Server], uuid: &str) -> Result<String> {
    let mut links = String::new();
    for server in servers {
        if let Some(link) = link(server, uuid)? {
            links.push_str(&link);
            links.push_str("\r\n");
        }
    }
    Ok(STANDARD.encode(links))
}

fn link(server: &Server, uuid: &str) -> Result<Option<String>> {
    let label = urlencoding::encode(&server.name);
    let link = match server.server_type.as_str() {
        "shadowsocks" => {
            let cipher = server.setting_str("cipher").unwrap_or("aes-128-gcm");
            let userinfo = URL_SAFE_NO_PAD.encode(format!("{}:{}", cipher, ss_password(server, uuid)));
            format!("ss://{}@{}:{}#{}", userinfo, server.host, server.port, label)
        }
        "vmess" => {
            let net = network(server);
            let mut obj = json!({
                "v": "2",
                "ps": server.name,
                "add": server.host,
                "port": server.port.to_string(),
                "id": uuid,
                "aid": "0",
                "scy": "auto",
                "net": net,
                "type": "none",
                "tls": if security(server) == Security::Tls { "tls" } else { "" },
            });
            if security(server) == Security::Tls {
                obj["sni"] = json!(server_name(server));
            }
            match net {
                "ws" => {
                    obj["path"] = json!(server.setting_str("path").unwrap_or("/"));
                    if let Some(host) = server.setting_str("host") {
                        obj["host"] = json!(host);
                    }
                }
                "grpc" => {
                    obj["path"] = json!(server.setting_str("service_name").unwrap_or_default());
                }
                _ => {}
            }
            format!("vmess://{}", STANDARD.encode(serde_json::to_string(&obj)?))
        }
        "vless" | "trojan" => {
            let net = network(server);
            let mut params = vec![format!("type={}", net)];
            match security(server) {
                Security::Reality => {
                    params.push("security=reality".to_string());
                    params.push(format!("sni={}", server_name(server)));
                    params.push(format!("pbk={}", server.setting_str("public_key").unwrap_or_default()));
                    params.push(format!("sid={}", server.setting_str("short_id").unwrap_or_default()));
                    params.push("fp=chrome".to_string());
                }
                Security::Tls => {
                    params.push("security=tls".to_string());
                    params.push(format!("sni={}", server_name(server)));
                    if server.setting_bool("insecure") {
                        params.push("allowInsecure=1".to_string());
                    }
                }
                Security::None => params.push("security=none".to_string()),
            }
            if server.server_type == "vless" {
                params.insert(0, "encryption=none".to_string());
                if let Some(flow) = server.setting_str("flow") {
                    params.push(format!("flow={}", flow));
                }
            }
            match net {
                "ws" => {
                    params.push(format!("path={}", urlencoding::encode(server.setting_str("path").unwrap_or("/"))));
                    if let Some(host) = server.setting_str("host") {
                        params.push(format!("host={}", host));
                    }
                }
                "grpc" => params.push(format!(
                    "serviceName={}",
                    server.setting_str("service_name").unwrap_or_default()
                )),
                _ => {}
            }
            format!(
                "{}://{}@{}:{}?{}#{}",
                server.server_type,
                uuid,
                server.host,
                server.port,
                params.join("&"),
                label
            )
        }
        "hysteria" => {
            let mut params = vec![format!("sni={}", server_name(server))];
            if server.setting_bool("insecure") {
                params.push("insecure=1".to_string());
            }
            if let Some(obfs) = server.setting_str("obfs_password") {
                params.push("obfs=salamander".to_string());
                params.push(format!("obfs-password={}", obfs));
            }
            format!(
                "hysteria2://{}@{}:{}?{}#{}",
                uuid,
                server.host,
                server.port,
                params.join("&"),
                label
            )
        }
        _ => return Ok(None),
    };
    Ok(Some(link))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn server(server_type: &str, settings: serde_json::Value) -> Server {
        let now = Utc::now();
        Server {
            id: 1,
            server_type: server_type.into(),
            name: "Tokyo 01".into(),
            group_ids: vec![1],
            parent_id: None,
            tags: vec![],
            host: "jp.example.com".into(),
            port: 443,
            server_port: 8443,
            rate: 1.0,
            show: true,
            sort: 0,
            settings,
            created_at: now,
            updated_at: now,
        }
    }

    fn decode(body: &str) -> Vec<String> {
        let raw = String::from_utf8(STANDARD.decode(body).unwrap()).unwrap();
        raw.lines().map(str::to_string).collect()
    }

    #[test]
    fn renders_one_link_per_supported_server() {
        let servers = vec![
            server("vless", json!({ "network": "tcp", "public_key": "PBK", "short_id": "ab", "server_name": "www.apple.com", "flow": "xtls-rprx-vision" })),
            server("trojan", json!({ "network": "ws", "path": "/t", "server_name": "jp.example.com" })),
            server("wireguard", json!({})),
        ];
        let links = decode(&render(&servers, "uuid-1").unwrap());
        assert_eq!(links.len(), 2);
        assert_eq!(
            links[0],
            "vless://uuid-1@jp.example.com:443?encryption=none&type=tcp&security=reality&sni=www.apple.com&pbk=PBK&sid=ab&fp=chrome&flow=xtls-rprx-vision#Tokyo%2001"
        );
        assert!(links[1].starts_with("trojan://uuid-1@jp.example.com:443?type=ws&security=tls"));
        assert!(links[1].contains("path=%2Ft"));
    }

    #[test]
    fn vmess_link_is_base64_json() {
        let s = server("vmess", json!({ "network": "ws", "tls": 1, "path": "/v", "host": "cdn.example.com" }));
        let link = link(&s, "uuid-2").unwrap().unwrap();
        let payload = link.strip_prefix("vmess://").unwrap();
        let obj: serde_json::Value = serde_json::from_slice(&STANDARD.decode(payload).unwrap()).unwrap();
        assert_eq!(obj["add"], "jp.example.com");
        assert_eq!(obj["tls"], "tls");
        assert_eq!(obj["path"], "/v");
        assert_eq!(obj["host"], "cdn.example.com");
    }

    #[test]
    fn shadowsocks_userinfo_is_url_safe() {
        let s = server("shadowsocks", json!({ "cipher": "aes-256-gcm" }));
        let link = link(&s, "pw").unwrap().unwrap();
        let expected = URL_SAFE_NO_PAD.encode("aes-256-gcm:pw");
        assert_eq!(link, format!("ss://{}@jp.example.com:443#Tokyo%2001", expected));
    }
}
