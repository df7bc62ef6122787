//! Chat gateway client.
//!
//! Sends plain-text messages through
//! `POST {base}/message/sendText/{instance}` with an `apikey` header. Any
//! 2xx is success; everything else is classified for the retry policy.

use async_trait::async_trait;
use bl_common::retry::{classify_status, RetryClass};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct GatewayClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// `delay` field in the gateway body (typing simulation, ms).
    pub send_delay_ms: u32,
}

impl Default for GatewayClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".to_string(),
            api_key: String::new(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            send_delay_ms: 1200,
        }
    }
}

/// Outcome of one transmission attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Delivered,
    /// Transient; the caller should back off and retry.
    Retryable {
        status: Option<u16>,
        retry_after: Option<Duration>,
        error: String,
    },
    /// Permanent rejection (bad number, auth failure); never retried.
    Rejected { status: u16, error: String },
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered)
    }
}

#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn send_text(&self, instance: &str, phone: &str, text: &str) -> SendOutcome;
}

#[derive(Debug, Serialize)]
struct SendTextBody<'a> {
    number: &'a str,
    text: &'a str,
    delay: u32,
}

pub struct HttpChatGateway {
    config: GatewayClientConfig,
    client: reqwest::Client,
}

impl HttpChatGateway {
    pub fn new(config: GatewayClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
        response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

#[async_trait]
impl ChatGateway for HttpChatGateway {
    async fn send_text(&self, instance: &str, phone: &str, text: &str) -> SendOutcome {
        let url = format!("{}/message/sendText/{}", self.config.base_url, instance);
        let body = SendTextBody {
            number: phone,
            text,
            delay: self.config.send_delay_ms,
        };

        let result = self
            .client
            .post(&url)
            .header("apikey", &self.config.api_key)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    debug!(instance, phone, "Message delivered to gateway");
                    return SendOutcome::Delivered;
                }

                let retry_after = Self::parse_retry_after(&response);
                let error_body = response.text().await.unwrap_or_default();
                let error = format!("HTTP {}: {}", status, error_body);
                warn!(instance, phone, status = status.as_u16(), "Gateway send failed");

                match classify_status(status.as_u16()) {
                    RetryClass::Retryable => SendOutcome::Retryable {
                        status: Some(status.as_u16()),
                        retry_after,
                        error,
                    },
                    RetryClass::Fatal => SendOutcome::Rejected {
                        status: status.as_u16(),
                        error,
                    },
                }
            }
            Err(e) => {
                // Connection resets, refusals, DNS failures and timeouts
                // all land here; all retryable.
                warn!(instance, phone, error = %e, "Gateway transport error");
                SendOutcome::Retryable {
                    status: None,
                    retry_after: None,
                    error: e.to_string(),
                }
            }
        }
    }
}
