//! Dialogue collaborator hand-off.
//!
//! Messages that are neither opt-out keywords nor pending-reply answers go
//! to an external dialogue service. Its reply is transmitted through the
//! gateway verbatim and is not subject to dedup.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait DialogueService: Send + Sync {
    /// Returns the text to send back, if any.
    async fn reply(
        &self,
        tenant_id: &str,
        phone: &str,
        text: &str,
        push_name: Option<&str>,
    ) -> anyhow::Result<Option<String>>;
}

/// Disabled dialogue: inbound free text is dropped after logging.
pub struct NoopDialogue;

#[async_trait]
impl DialogueService for NoopDialogue {
    async fn reply(
        &self,
        tenant_id: &str,
        phone: &str,
        _text: &str,
        _push_name: Option<&str>,
    ) -> anyhow::Result<Option<String>> {
        debug!(tenant_id, phone, "Dialogue disabled; dropping inbound text");
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct DialogueResponse {
    #[serde(default)]
    reply: Option<String>,
}

pub struct HttpDialogueService {
    url: String,
    client: reqwest::Client,
}

impl HttpDialogueService {
    pub fn new(url: String, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl DialogueService for HttpDialogueService {
    async fn reply(
        &self,
        tenant_id: &str,
        phone: &str,
        text: &str,
        push_name: Option<&str>,
    ) -> anyhow::Result<Option<String>> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "tenant_id": tenant_id,
                "phone": phone,
                "text": text,
                "push_name": push_name,
            }))
            .send()
            .await?
            .error_for_status()?;

        let parsed: DialogueResponse = response.json().await?;
        Ok(parsed.reply)
    }
}
