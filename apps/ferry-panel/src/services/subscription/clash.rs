use anyhow::Result;
use ferry_db::models::server::Server;
use serde_json::{Value, json};

use super::{Security, network, security, server_name, ss_password};

/// Clash/Mihomo YAML profile with one selector group named after the site.
pub fn render(servers: &[Server], uuid: &str, profile: &str) -> Result<String> {
    let proxies: Vec<Value> = servers.iter().filter_map(|s| proxy(s, uuid)).collect();
    let names: Vec<String> = proxies
        .iter()
        .filter_map(|p| p["name"].as_str().map(str::to_string))
        .collect();

    let config = json!({
        "mixed-port": 7890,
        "allow-lan": false,
        "mode": "rule",
        "log-level": "info",
        "proxies": proxies,
        "proxy-groups": [{
            "name": profile,
            "type": "select",
            "proxies": names,
        }, {
            "name": "Auto",
            "type": "url-test",
            "proxies": names,
            "url": "http://www.gstatic.com/generate_204",
            "interval": 300,
        }],
        "rules": [format!("MATCH,{}", profile)],
    });

    Ok(serde_yaml::to_string(&config)?)
}

fn transport_opts(server: &Server, proxy: &mut Value) {
    match network(server) {
        "ws" => {
            proxy["network"] = json!("ws");
            let mut opts = json!({ "path": server.setting_str("path").unwrap_or("/") });
            if let Some(host) = server.setting_str("host") {
                opts["headers"] = json!({ "Host": host });
            }
            proxy["ws-opts"] = opts;
        }
        "grpc" => {
            proxy["network"] = json!("grpc");
            proxy["grpc-opts"] = json!({
                "grpc-service-name": server.setting_str("service_name").unwrap_or_default()
            });
        }
        _ => {}
    }
}

fn proxy(server: &Server, uuid: &str) -> Option<Value> {
    let mut proxy = match server.server_type.as_str() {
        "shadowsocks" => json!({
            "name": server.name,
            "type": "ss",
            "server": server.host,
            "port": server.port,
            "cipher": server.setting_str("cipher").unwrap_or("aes-128-gcm"),
            "password": ss_password(server, uuid),
            "udp": true,
        }),
        "vmess" => {
            let mut p = json!({
                "name": server.name,
                "type": "vmess",
                "server": server.host,
                "port": server.port,
                "uuid": uuid,
                "alterId": 0,
                "cipher": "auto",
                "udp": true,
            });
            if security(server) == Security::Tls {
                p["tls"] = json!(true);
                p["servername"] = json!(server_name(server));
                p["skip-cert-verify"] = json!(server.setting_bool("insecure"));
            }
            p
        }
        "vless" => {
            let mut p = json!({
                "name": server.name,
                "type": "vless",
                "server": server.host,
                "port": server.port,
                "uuid": uuid,
                "network": network(server),
                "udp": true,
            });
            if let Some(flow) = server.setting_str("flow") {
                p["flow"] = json!(flow);
            }
            match security(server) {
                Security::Reality => {
                    p["tls"] = json!(true);
                    p["servername"] = json!(server_name(server));
                    p["client-fingerprint"] = json!("chrome");
                    p["reality-opts"] = json!({
                        "public-key": server.setting_str("public_key").unwrap_or_default(),
                        "short-id": server.setting_str("short_id").unwrap_or_default(),
                    });
                }
                Security::Tls => {
                    p["tls"] = json!(true);
                    p["servername"] = json!(server_name(server));
                }
                Security::None => {}
            }
            p
        }
        "trojan" => json!({
            "name": server.name,
            "type": "trojan",
            "server": server.host,
            "port": server.port,
            "password": uuid,
            "sni": server_name(server),
            "skip-cert-verify": server.setting_bool("insecure"),
            "udp": true,
        }),
        "hysteria" => {
            let mut p = json!({
                "name": server.name,
                "type": "hysteria2",
                "server": server.host,
                "port": server.port,
                "password": uuid,
                "sni": server_name(server),
                "skip-cert-verify": server.setting_bool("insecure"),
            });
            if let Some(obfs) = server.setting_str("obfs_password") {
                p["obfs"] = json!("salamander");
                p["obfs-password"] = json!(obfs);
            }
            return Some(p);
        }
        _ => return None,
    };
    if server.server_type != "shadowsocks" {
        transport_opts(server, &mut proxy);
    }
    Some(proxy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn server(id: i64, server_type: &str, name: &str, settings: Value) -> Server {
        let now = Utc::now();
        Server {
            id,
            server_type: server_type.into(),
            name: name.into(),
            group_ids: vec![1],
            parent_id: None,
            tags: vec![],
            host: "node.example.com".into(),
            port: 443,
            server_port: 443,
            rate: 1.0,
            show: true,
            sort: 0,
            settings,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn profile_groups_every_proxy() {
        let servers = vec![
            server(1, "vmess", "HK", json!({ "network": "ws", "tls": true, "path": "/ws" })),
            server(2, "shadowsocks", "SG", json!({ "cipher": "aes-256-gcm" })),
            server(3, "tuic", "Skipped", json!({})),
        ];
        let yaml = render(&servers, "uuid", "Ferry").unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        let proxies = doc["proxies"].as_sequence().unwrap();
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[0]["ws-opts"]["path"], "/ws");
        assert_eq!(proxies[1]["type"], "ss");

        let group = &doc["proxy-groups"][0];
        assert_eq!(group["name"], "Ferry");
        assert_eq!(group["proxies"].as_sequence().unwrap().len(), 2);
        assert_eq!(doc["rules"][0], "MATCH,Ferry");
    }

    #[test]
    fn reality_vless_carries_opts() {
        let s = server(1, "vless", "JP", json!({ "public_key": "PBK", "short_id": "01", "server_name": "www.apple.com" }));
        let p = proxy(&s, "uuid").unwrap();
        assert_eq!(p["reality-opts"]["public-key"], "PBK");
        assert_eq!(p["servername"], "www.apple.com");
        assert_eq!(p["tls"], true);
    }
}
