use anyhow::Result;
use async_trait::async_trait;
use ferry_db::models::payment::{Payment, PaymentMethod};
use ferry_db::repositories::payment_repo::{PaymentInput, PaymentRepository};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::info;

use crate::error::{not_found, rejected};
use crate::utils;

pub mod cryptomus;
pub mod epay;

/// What the gateway needs to know about an order.
#[derive(Debug, Clone)]
pub struct PayRequest {
    pub trade_no: String,
    /// Cents, handling fee included.
    pub total_amount: i64,
    pub user_id: i64,
    pub notify_url: String,
    pub return_url: String,
}

/// Checkout answer: `type` 0 is a QR code payload, 1 a redirect URL,
/// -1 an order that needed no payment.
#[derive(Debug, Clone, Serialize)]
pub struct PayResult {
    #[serde(rename = "type")]
    pub kind: i32,
    pub data: Value,
}

/// A verified gateway callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaidNotice {
    pub trade_no: String,
    pub callback_no: String,
    /// Body the gateway expects instead of `success`.
    pub custom_result: Option<String>,
}

#[async_trait]
pub trait PaymentAdapter: Send + Sync {
    /// Create the payment on the gateway side.
    async fn pay(&self, request: &PayRequest) -> Result<PayResult>;

    /// Verify a callback. `None` means the callback is not a successful payment.
    fn notify(&self, body: &str, params: &HashMap<String, String>) -> Result<Option<PaidNotice>>;

    /// Get the adapter name
    fn name(&self) -> &str;
}

/// A configuration field shown in the admin form of a driver.
#[derive(Debug, Clone, Serialize)]
pub struct FormField {
    pub key: &'static str,
    pub label: &'static str,
    pub description: &'static str,
}

pub const DRIVERS: [&str; 2] = [epay::NAME, cryptomus::NAME];

pub fn form_for(driver: &str) -> Option<Vec<FormField>> {
    match driver {
        epay::NAME => Some(epay::form()),
        cryptomus::NAME => Some(cryptomus::form()),
        _ => None,
    }
}

pub fn adapter_for(payment: &Payment) -> Result<Box<dyn PaymentAdapter>> {
    let field = |key: &str| -> Result<String> {
        payment
            .config
            .get(key)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Payment {} is missing config '{}'", payment.id, key))
    };
    match payment.payment.as_str() {
        epay::NAME => Ok(Box::new(epay::EPayAdapter::new(field("url")?, field("pid")?, field("key")?))),
        cryptomus::NAME => Ok(Box::new(cryptomus::CryptomusAdapter::new(
            field("merchant_id")?,
            field("api_key")?,
        ))),
        other => Err(anyhow::anyhow!("Unknown payment driver {}", other)),
    }
}

#[derive(Clone)]
pub struct PaymentService {
    payments: PaymentRepository,
    app_url: String,
}

impl PaymentService {
    pub fn new(pool: PgPool, app_url: String) -> Self {
        Self {
            payments: PaymentRepository::new(pool),
            app_url,
        }
    }

    pub async fn methods(&self) -> Result<Vec<PaymentMethod>> {
        self.payments.list_enabled().await
    }

    pub async fn get_enabled(&self, id: i64) -> Result<Payment> {
        self.payments
            .get_by_id(id)
            .await?
            .filter(|p| p.enable)
            .ok_or_else(|| rejected("Payment method is not available"))
    }

    /// Resolves the gateway behind a callback URL.
    pub async fn get_for_notify(&self, method: &str, uuid: &str) -> Result<Payment> {
        self.payments
            .get_by_uuid(uuid)
            .await?
            .filter(|p| p.payment == method && p.enable)
            .ok_or_else(|| not_found("Payment method is not available"))
    }

    pub fn notify_url(&self, payment: &Payment) -> String {
        let base = payment
            .notify_domain
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or(&self.app_url);
        format!(
            "{}/api/v1/guest/payment/notify/{}/{}",
            base.trim_end_matches('/'),
            payment.payment,
            payment.uuid
        )
    }

    pub fn return_url(&self, trade_no: &str) -> String {
        format!("{}/#/order/{}", self.app_url.trim_end_matches('/'), trade_no)
    }

    pub async fn pay(&self, payment: &Payment, trade_no: &str, user_id: i64, total: i64) -> Result<PayResult> {
        let adapter = adapter_for(payment)?;
        let request = PayRequest {
            trade_no: trade_no.to_string(),
            total_amount: total,
            user_id,
            notify_url: self.notify_url(payment),
            return_url: self.return_url(trade_no),
        };
        info!("Creating {} payment for order {} ({})", adapter.name(), trade_no, utils::format_cents(total));
        adapter.pay(&request).await
    }

    // ==================== ADMIN ====================

    pub async fn list(&self) -> Result<Vec<Payment>> {
        self.payments.list().await
    }

    pub async fn save(&self, input: &PaymentInput) -> Result<()> {
        let Some(form) = form_for(&input.payment) else {
            return Err(rejected(format!("Unknown payment driver {}", input.payment)));
        };
        if input.name.trim().is_empty() {
            return Err(rejected("Display name is required"));
        }
        if let Some(missing) = form.iter().find(|f| {
            input
                .config
                .get(f.key)
                .and_then(Value::as_str)
                .is_none_or(str::is_empty)
        }) {
            return Err(rejected(format!("{} is required", missing.label)));
        }

        match input.id {
            Some(id) => {
                if !self.payments.update(id, input).await? {
                    return Err(not_found("Payment method does not exist"));
                }
                info!("Updated payment {}", id);
            }
            None => {
                let uuid = utils::random_string(8);
                let payment = self.payments.create(&uuid, input).await?;
                info!("Created payment {} ({})", payment.id, payment.payment);
            }
        }
        Ok(())
    }

    pub async fn toggle(&self, id: i64) -> Result<()> {
        if !self.payments.toggle_enable(id).await? {
            return Err(not_found("Payment method does not exist"));
        }
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        if !self.payments.delete(id).await? {
            return Err(not_found("Payment method does not exist"));
        }
        info!("Deleted payment {}", id);
        Ok(())
    }

    pub async fn sort(&self, ids: &[i64]) -> Result<()> {
        self.payments.sort(ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn payment(driver: &str, config: Value) -> Payment {
        let now = Utc::now();
        Payment {
            id: 3,
            uuid: "AbCd1234".into(),
            payment: driver.into(),
            name: "Gateway".into(),
            icon: None,
            config,
            notify_domain: None,
            handling_fee_fixed: None,
            handling_fee_percent: None,
            enable: true,
            sort: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn adapter_requires_complete_config() {
        let p = payment("EPay", json!({ "url": "https://pay.example", "pid": "1001" }));
        assert!(adapter_for(&p).is_err());

        let p = payment("EPay", json!({ "url": "https://pay.example", "pid": "1001", "key": "k" }));
        assert_eq!(adapter_for(&p).unwrap().name(), "EPay");

        assert!(adapter_for(&payment("Stripe", json!({}))).is_err());
    }

    #[tokio::test]
    async fn notify_url_prefers_notify_domain() {
        let pool = PgPool::connect_lazy("postgres://localhost/ferry_test").unwrap();
        let service = PaymentService::new(pool, "https://panel.example/".into());

        let mut p = payment("Cryptomus", json!({}));
        assert_eq!(
            service.notify_url(&p),
            "https://panel.example/api/v1/guest/payment/notify/Cryptomus/AbCd1234"
        );

        p.notify_domain = Some("https://callback.example".into());
        assert!(service.notify_url(&p).starts_with("https://callback.example/api/v1/guest"));
        assert_eq!(service.return_url("T1"), "https://panel.example/#/order/T1");
    }

    #[test]
    fn every_driver_has_a_form() {
        for driver in DRIVERS {
            assert!(form_for(driver).is_some_and(|f| !f.is_empty()));
        }
    }
}
