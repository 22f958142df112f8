use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info};

use crate::config::{MailConfig, MailDriver};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Mail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl Mail {
    pub fn verify_code(app_name: &str, to: &str, code: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: format!("{} email verification code", app_name),
            body: format!(
                "Your verification code is {}. It is valid for 5 minutes.\n\nIf you did not request this, ignore this email.",
                code
            ),
        }
    }

    pub fn login_link(app_name: &str, to: &str, link: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: format!("Log in to {}", app_name),
            body: format!(
                "Open the link below to log in. It is valid for 5 minutes.\n\n{}",
                link
            ),
        }
    }

    pub fn expire_reminder(app_name: &str, app_url: &str, to: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: format!("Your {} subscription expires soon", app_name),
            body: format!(
                "Your subscription will expire within 24 hours. Renew at {} to keep your service.",
                app_url
            ),
        }
    }

    pub fn traffic_reminder(app_name: &str, app_url: &str, to: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: format!("Your {} traffic is almost used up", app_name),
            body: format!(
                "You have used 95% of your traffic. Visit {} to buy a traffic reset.",
                app_url
            ),
        }
    }
}

#[derive(Debug, Serialize)]
struct HttpMail<'a> {
    from: Option<&'a str>,
    #[serde(flatten)]
    mail: &'a Mail,
}

#[derive(Clone)]
pub struct MailService {
    config: MailConfig,
    client: reqwest::Client,
}

impl MailService {
    pub fn new(config: MailConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build mail HTTP client")?;
        Ok(Self { config, client })
    }

    pub async fn send(&self, mail: &Mail) -> Result<()> {
        match self.config.driver {
            MailDriver::Log => {
                info!("[mail] to={} subject={:?}\n{}", mail.to, mail.subject, mail.body);
                Ok(())
            }
            MailDriver::Http => {
                let endpoint = self
                    .config
                    .endpoint
                    .as_deref()
                    .context("mail.endpoint is not configured")?;
                let mut request = self.client.post(endpoint).json(&HttpMail {
                    from: self.config.from.as_deref(),
                    mail,
                });
                if let Some(key) = &self.config.api_key {
                    request = request.bearer_auth(key);
                }
                let resp = request.send().await.context("Mail request failed")?;
                if !resp.status().is_success() {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    anyhow::bail!("Mail endpoint returned {}: {}", status, body);
                }
                info!("Mail '{}' sent to {}", mail.subject, mail.to);
                Ok(())
            }
        }
    }

    /// Sends without failing the caller.
    pub async fn send_logged(&self, mail: &Mail) {
        if let Err(e) = self.send(mail).await {
            error!("Failed to send mail to {}: {:#}", mail.to, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_payload_flattens_mail() {
        let mail = Mail::verify_code("Ferry", "a@example.com", "123456");
        let payload = serde_json::to_value(HttpMail {
            from: Some("noreply@example.com"),
            mail: &mail,
        })
        .unwrap();
        assert_eq!(payload["to"], "a@example.com");
        assert_eq!(payload["from"], "noreply@example.com");
        assert!(payload["body"].as_str().unwrap().contains("123456"));
    }

    #[tokio::test]
    async fn log_driver_always_succeeds() {
        let service = MailService::new(MailConfig::default()).unwrap();
        let mail = Mail::login_link("Ferry", "a@example.com", "https://panel.example/#/login?verify=x");
        assert!(service.send(&mail).await.is_ok());
    }
}
