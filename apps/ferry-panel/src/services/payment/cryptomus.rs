use crate::services::payment::{FormField, PaidNotice, PayRequest, PayResult, PaymentAdapter};
use crate::utils;
use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::warn;

pub const NAME: &str = "Cryptomus";

const API_URL: &str = "https://api.cryptomus.com/v1/payment";
const PAID_STATUSES: [&str; 2] = ["paid", "paid_over"];

pub fn form() -> Vec<FormField> {
    vec![
        FormField { key: "merchant_id", label: "Merchant ID", description: "Merchant uuid from the Cryptomus dashboard" },
        FormField { key: "api_key", label: "Payment API key", description: "Used to sign requests and callbacks" },
    ]
}

pub struct CryptomusAdapter {
    merchant_id: String,
    api_key: String,
}

impl CryptomusAdapter {
    pub fn new(merchant_id: String, api_key: String) -> Self {
        Self {
            merchant_id,
            api_key,
        }
    }

    fn generate_signature(&self, body: &str) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(body);
        let to_hash = format!("{}{}", encoded, self.api_key);
        format!("{:x}", md5::compute(to_hash.as_bytes()))
    }
}

/// Callback bodies are signed over PHP-style JSON, which escapes `/`.
fn php_json(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?.replace('/', "\\/"))
}

#[async_trait]
impl PaymentAdapter for CryptomusAdapter {
    async fn pay(&self, request: &PayRequest) -> Result<PayResult> {
        let body_json = json!({
            "amount": utils::format_cents(request.total_amount),
            "currency": "USD",
            "order_id": request.trade_no,
            "url_callback": request.notify_url,
            "url_return": request.return_url,
            "additional_data": request.user_id.to_string(),
        });

        let body_str = serde_json::to_string(&body_json)?;
        let sign = self.generate_signature(&body_str);

        let client = reqwest::Client::new();
        let resp = client
            .post(API_URL)
            .header("merchant", &self.merchant_id)
            .header("sign", sign)
            .header("Content-Type", "application/json")
            .body(body_str)
            .send()
            .await?;

        let resp_json: Value = resp.json().await?;

        if let Some(url) = resp_json
            .get("result")
            .and_then(|r| r.get("url"))
            .and_then(Value::as_str)
        {
            return Ok(PayResult {
                kind: 1,
                data: json!(url),
            });
        }

        Err(anyhow::anyhow!("Cryptomus Error: {:?}", resp_json))
    }

    fn notify(&self, body: &str, _params: &HashMap<String, String>) -> Result<Option<PaidNotice>> {
        let mut payload: Value = serde_json::from_str(body)?;
        let Some(object) = payload.as_object_mut() else {
            return Ok(None);
        };
        let Some(sign) = object.shift_remove("sign").and_then(|s| s.as_str().map(str::to_string)) else {
            warn!("Cryptomus callback without a sign field");
            return Ok(None);
        };

        if self.generate_signature(&php_json(&payload)?) != sign {
            warn!("Invalid Cryptomus signature");
            return Ok(None);
        }

        let status = payload.get("status").and_then(Value::as_str).unwrap_or_default();
        if !PAID_STATUSES.contains(&status) {
            return Ok(None);
        }

        let (Some(trade_no), Some(callback_no)) = (
            payload.get("order_id").and_then(Value::as_str),
            payload.get("uuid").and_then(Value::as_str),
        ) else {
            return Ok(None);
        };
        Ok(Some(PaidNotice {
            trade_no: trade_no.to_string(),
            callback_no: callback_no.to_string(),
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

    fn signed_body(adapter: &CryptomusAdapter, status: &str) -> String {
        let mut payload = json!({
            "type": "payment",
            "uuid": "62f88b36-a9d5-4fa6-aa26-e040c3dbf26d",
            "order_id": "20260101000000123456",
            "amount": "15.00",
            "status": status,
            "url": "https://pay.cryptomus.com/pay/x",
        });
        let sign = adapter.generate_signature(&php_json(&payload).unwrap());
        payload["sign"] = json!(sign);
        serde_json::to_string(&payload).unwrap()
    }

    #[test]
    fn paid_callback_is_accepted() {
        let a = CryptomusAdapter::new("merchant".into(), "key".into());
        let notice = a.notify(&signed_body(&a, "paid"), &HashMap::new()).unwrap().unwrap();
        assert_eq!(notice.trade_no, "20260101000000123456");
        assert_eq!(notice.callback_no, "62f88b36-a9d5-4fa6-aa26-e040c3dbf26d");
    }

    #[test]
    fn wrong_key_or_status_is_ignored() {
        let a = CryptomusAdapter::new("merchant".into(), "key".into());
        let other = CryptomusAdapter::new("merchant".into(), "other".into());
        assert_eq!(a.notify(&signed_body(&other, "paid"), &HashMap::new()).unwrap(), None);
        assert_eq!(a.notify(&signed_body(&a, "check"), &HashMap::new()).unwrap(), None);
    }

    #[test]
    fn php_json_escapes_slashes() {
        assert_eq!(php_json(&json!({ "u": "a/b" })).unwrap(), r#"{"u":"a\/b"}"#);
    }
}
