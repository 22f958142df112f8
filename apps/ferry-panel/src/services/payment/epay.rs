use crate::services::payment::{FormField, PaidNotice, PayRequest, PayResult, PaymentAdapter};
use crate::utils;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

pub const NAME: &str = "EPay";

pub fn form() -> Vec<FormField> {
    vec![
        FormField { key: "url", label: "URL", description: "Gateway address, e.g. https://pay.example.com" },
        FormField { key: "pid", label: "PID", description: "Merchant id" },
        FormField { key: "key", label: "KEY", description: "Merchant key" },
    ]
}

pub struct EPayAdapter {
    url: String,
    pid: String,
    key: String,
}

impl EPayAdapter {
    pub fn new(url: String, pid: String, key: String) -> Self {
        Self { url, pid, key }
    }

    /// md5 over the sorted, unescaped `k=v&...` string followed by the key.
    fn sign(&self, params: &BTreeMap<String, String>) -> String {
        let joined = params
            .iter()
            .filter(|(k, v)| k.as_str() != "sign" && k.as_str() != "sign_type" && !v.is_empty())
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        format!("{:x}", md5::compute(format!("{}{}", joined, self.key)))
    }
}

#[async_trait]
impl PaymentAdapter for EPayAdapter {
    async fn pay(&self, request: &PayRequest) -> Result<PayResult> {
        let mut params = BTreeMap::new();
        params.insert("money".to_string(), utils::format_cents(request.total_amount));
        params.insert("name".to_string(), request.trade_no.clone());
        params.insert("notify_url".to_string(), request.notify_url.clone());
        params.insert("return_url".to_string(), request.return_url.clone());
        params.insert("out_trade_no".to_string(), request.trade_no.clone());
        params.insert("pid".to_string(), self.pid.clone());

        let sign = self.sign(&params);
        params.insert("sign".to_string(), sign);
        params.insert("sign_type".to_string(), "MD5".to_string());

        let query = serde_urlencoded::to_string(&params)?;
        Ok(PayResult {
            kind: 1,
            data: json!(format!("{}/submit.php?{}", self.url.trim_end_matches('/'), query)),
        })
    }

    fn notify(&self, _body: &str, params: &HashMap<String, String>) -> Result<Option<PaidNotice>> {
        let Some(sign) = params.get("sign") else {
            return Ok(None);
        };
        let sorted: BTreeMap<String, String> = params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        if self.sign(&sorted) != *sign {
            warn!("EPay callback with a bad signature");
            return Ok(None);
        }
        if params.get("trade_status").map(String::as_str) != Some("TRADE_SUCCESS") {
            return Ok(None);
        }
        let (Some(trade_no), Some(callback_no)) = (params.get("out_trade_no"), params.get("trade_no")) else {
            return Ok(None);
        };
        Ok(Some(PaidNotice {
            trade_no: trade_no.clone(),
            callback_no: callback_no.clone(),
            custom_result: None,
        }))
    }

    fn name(&self) -> &str {
        NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> EPayAdapter {
        EPayAdapter::new("https://pay.example/".into(), "1001".into(), "secret".into())
    }

    fn callback(adapter: &EPayAdapter, status: &str) -> HashMap<String, String> {
        let mut params: BTreeMap<String, String> = [
            ("pid", "1001"),
            ("trade_no", "GW123"),
            ("out_trade_no", "20260101000000123456"),
            ("type", "alipay"),
            ("name", "20260101000000123456"),
            ("money", "12.34"),
            ("trade_status", status),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let sign = adapter.sign(&params);
        params.insert("sign".into(), sign);
        params.insert("sign_type".into(), "MD5".into());
        params.into_iter().collect()
    }

    #[tokio::test]
    async fn pay_builds_signed_redirect() {
        let a = adapter();
        let result = a
            .pay(&PayRequest {
                trade_no: "T1".into(),
                total_amount: 1234,
                user_id: 1,
                notify_url: "https://panel.example/notify".into(),
                return_url: "https://panel.example/#/order/T1".into(),
            })
            .await
            .unwrap();
        assert_eq!(result.kind, 1);
        let url = result.data.as_str().unwrap();
        assert!(url.starts_with("https://pay.example/submit.php?"));
        assert!(url.contains("money=12.34"));
        assert!(url.contains("sign_type=MD5"));
    }

    #[test]
    fn notify_accepts_valid_signature() {
        let a = adapter();
        let notice = a.notify("", &callback(&a, "TRADE_SUCCESS")).unwrap().unwrap();
        assert_eq!(notice.trade_no, "20260101000000123456");
        assert_eq!(notice.callback_no, "GW123");
    }

    #[test]
    fn notify_rejects_tampering_and_unpaid_status() {
        let a = adapter();
        let mut params = callback(&a, "TRADE_SUCCESS");
        params.insert("money".into(), "0.01".into());
        assert_eq!(a.notify("", &params).unwrap(), None);

        assert_eq!(a.notify("", &callback(&a, "WAIT_BUYER_PAY")).unwrap(), None);
    }
}
