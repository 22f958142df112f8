use anyhow::Result;
use ferry_db::models::server::Server;
use serde_json::{Value, json};

use super::{Security, network, security, server_name, ss_password};

/// sing-box profile. `legacy` targets clients before 1.12, which still use
/// special `dns`/`block` outbounds and address-style DNS servers.
pub fn render(servers: &[Server], uuid: &str, legacy: bool) -> Result<String> {
    let nodes: Vec<Value> = servers.iter().filter_map(|s| outbound(s, uuid)).collect();
    let tags: Vec<String> = nodes
        .iter()
        .filter_map(|o| o["tag"].as_str().map(str::to_string))
        .collect();

    let mut outbounds = vec![
        json!({
            "type": "selector",
            "tag": "proxy",
            "outbounds": tags.iter().map(String::as_str).chain(["auto"]).collect::<Vec<_>>(),
            "default": "auto",
        }),
        json!({
            "type": "urltest",
            "tag": "auto",
            "outbounds": tags,
            "url": "https://www.gstatic.com/generate_204",
            "interval": "3m",
            "tolerance": 50,
        }),
        json!({ "type": "direct", "tag": "direct" }),
    ];
    if legacy {
        outbounds.push(json!({ "type": "block", "tag": "block" }));
        outbounds.push(json!({ "type": "dns", "tag": "dns-out" }));
    }
    outbounds.extend(nodes);

    let (dns, rules) = if legacy {
        (
            json!({
                "servers": [
                    { "tag": "remote", "address": "tls://8.8.8.8", "detour": "proxy" },
                    { "tag": "local", "address": "223.5.5.5", "detour": "direct" }
                ],
                "final": "remote",
            }),
            json!([
                { "protocol": "dns", "outbound": "dns-out" },
                { "ip_is_private": true, "outbound": "direct" }
            ]),
        )
    } else {
        (
            json!({
                "servers": [
                    { "tag": "remote", "type": "tls", "server": "8.8.8.8", "detour": "proxy" },
                    { "tag": "local", "type": "udp", "server": "223.5.5.5" }
                ],
                "final": "remote",
            }),
            json!([
                { "action": "sniff" },
                { "protocol": "dns", "action": "hijack-dns" },
                { "ip_is_private": true, "outbound": "direct" }
            ]),
        )
    };

    let config = json!({
        "log": { "level": "info" },
        "dns": dns,
        "inbounds": [{
            "type": "mixed",
            "tag": "mixed-in",
            "listen": "127.0.0.1",
            "listen_port": 2080,
        }],
        "outbounds": outbounds,
        "route": {
            "rules": rules,
            "final": "proxy",
            "auto_detect_interface": true,
        },
    });

    Ok(serde_json::to_string_pretty(&config)?)
}

fn tls(server: &Server) -> Option<Value> {
    match security(server) {
        Security::None => None,
        Security::Tls => Some(json!({
            "enabled": true,
            "server_name": server_name(server),
            "insecure": server.setting_bool("insecure"),
        })),
        Security::Reality => Some(json!({
            "enabled": true,
            "server_name": server_name(server),
            "utls": { "enabled": true, "fingerprint": "chrome" },
            "reality": {
                "enabled": true,
                "public_key": server.setting_str("public_key").unwrap_or_default(),
                "short_id": server.setting_str("short_id").unwrap_or_default(),
            },
        })),
    }
}

fn transport(server: &Server) -> Option<Value> {
    match network(server) {
        "ws" => {
            let mut t = json!({ "type": "ws", "path": server.setting_str("path").unwrap_or("/") });
            if let Some(host) = server.setting_str("host") {
                t["headers"] = json!({ "Host": host });
            }
            Some(t)
        }
        "grpc" => Some(json!({
            "type": "grpc",
            "service_name": server.setting_str("service_name").unwrap_or_default(),
        })),
        _ => None,
    }
}

fn outbound(server: &Server, uuid: &str) -> Option<Value> {
    let mut ob = json!({
        "tag": server.name,
        "server": server.host,
        "server_port": server.port,
    });
    match server.server_type.as_str() {
        "shadowsocks" => {
            ob["type"] = json!("shadowsocks");
            ob["method"] = json!(server.setting_str("cipher").unwrap_or("aes-128-gcm"));
            ob["password"] = json!(ss_password(server, uuid));
            return Some(ob);
        }
        "vmess" => {
            ob["type"] = json!("vmess");
            ob["uuid"] = json!(uuid);
            ob["security"] = json!("auto");
            ob["alter_id"] = json!(0);
        }
        "vless" => {
            ob["type"] = json!("vless");
            ob["uuid"] = json!(uuid);
            if let Some(flow) = server.setting_str("flow") {
                ob["flow"] = json!(flow);
            }
        }
        "trojan" => {
            ob["type"] = json!("trojan");
            ob["password"] = json!(uuid);
        }
        "hysteria" => {
            ob["type"] = json!("hysteria2");
            ob["password"] = json!(uuid);
            if let Some(obfs) = server.setting_str("obfs_password") {
                ob["obfs"] = json!({ "type": "salamander", "password": obfs });
            }
        }
        _ => return None,
    }
    if let Some(tls) = tls(server) {
        ob["tls"] = tls;
    }
    if let Some(transport) = transport(server) {
        ob["transport"] = transport;
    }
    Some(ob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn server(server_type: &str, name: &str, settings: Value) -> Server {
        let now = Utc::now();
        Server {
            id: 1,
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

    fn servers() -> Vec<Server> {
        vec![
            server("vless", "JP", json!({ "public_key": "PBK", "short_id": "01" })),
            server("trojan", "US", json!({ "network": "grpc", "service_name": "svc" })),
        ]
    }

    #[test]
    fn new_format_uses_rule_actions() {
        let config: Value = serde_json::from_str(&render(&servers(), "uuid", false).unwrap()).unwrap();
        let types: Vec<&str> = config["outbounds"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|o| o["type"].as_str())
            .collect();
        assert!(!types.contains(&"dns"));
        assert!(!types.contains(&"block"));
        assert_eq!(config["route"]["rules"][1]["action"], "hijack-dns");
        assert_eq!(config["dns"]["servers"][0]["type"], "tls");
    }

    #[test]
    fn legacy_format_keeps_special_outbounds() {
        let config: Value = serde_json::from_str(&render(&servers(), "uuid", true).unwrap()).unwrap();
        let types: Vec<&str> = config["outbounds"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|o| o["type"].as_str())
            .collect();
        assert!(types.contains(&"dns"));
        assert_eq!(config["route"]["rules"][0]["outbound"], "dns-out");
        assert_eq!(config["dns"]["servers"][0]["address"], "tls://8.8.8.8");
    }

    #[test]
    fn outbounds_carry_tls_and_transport() {
        let list = servers();
        let vless = outbound(&list[0], "uuid").unwrap();
        assert_eq!(vless["tls"]["reality"]["public_key"], "PBK");

        let trojan = outbound(&list[1], "uuid").unwrap();
        assert_eq!(trojan["transport"]["service_name"], "svc");
        assert_eq!(trojan["tls"]["server_name"], "node.example.com");

        let config: Value = serde_json::from_str(&render(&list, "uuid", false).unwrap()).unwrap();
        assert_eq!(config["outbounds"][0]["outbounds"], json!(["JP", "US", "auto"]));
    }
}
