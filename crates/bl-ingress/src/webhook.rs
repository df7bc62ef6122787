//! Inbound chat webhook.
//!
//! Pipeline stages, in order, each able to short-circuit:
//! own-message filter → tenant resolution → delivery dedupe → no-show reply
//! machine (pending reply + recognized token) → opt-out keywords →
//! disambiguation (pending reply, unrecognized token) → dialogue hand-off.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use bl_common::text::digits_only;
use bl_common::{templates, OptOutKind};
use bl_config::TenantSettings;
use chrono_tz::Tz;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::optout::{parse_keyword, KeywordAction};
use crate::replies::{self, ReplyAction};
use crate::{IngressContext, IngressError};

/// One inbound message as delivered by the chat platform. Unknown fields
/// pass through untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub from_me: bool,
    /// Sender identifier; normalized to digits-only E.164.
    pub remote_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl InboundMessage {
    pub fn body(&self) -> Option<&str> {
        self.text
            .as_deref()
            .or(self.caption.as_deref())
            .filter(|t| !t.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    /// Platform event kind, e.g. "messages.upsert".
    #[serde(default)]
    pub event: String,
    /// Instance identifier; the URL path segment is authoritative.
    #[serde(default)]
    pub instance: Option<String>,
    pub message: InboundMessage,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    IgnoredFromMe,
    IgnoredEmpty,
    UnknownInstance,
    /// The platform redelivered an event we already processed.
    DuplicateDelivery,
    OptOutRegistered,
    OptInRegistered,
    ReplyHandled(ReplyAction),
    DialogueReplied,
    DialogueSilent,
}

impl InboundOutcome {
    fn label(&self) -> &'static str {
        match self {
            InboundOutcome::IgnoredFromMe => "ignored_from_me",
            InboundOutcome::IgnoredEmpty => "ignored_empty",
            InboundOutcome::UnknownInstance => "unknown_instance",
            InboundOutcome::DuplicateDelivery => "duplicate",
            InboundOutcome::OptOutRegistered => "opt_out",
            InboundOutcome::OptInRegistered => "opt_in",
            InboundOutcome::ReplyHandled(_) => "noshow_reply",
            InboundOutcome::DialogueReplied => "dialogue",
            InboundOutcome::DialogueSilent => "dialogue_silent",
        }
    }
}

pub async fn process_inbound(
    ctx: &IngressContext,
    instance: &str,
    envelope: WebhookEnvelope,
) -> Result<InboundOutcome, IngressError> {
    metrics::counter!("bookline.ingress.inbound_total").increment(1);
    let message = envelope.message;

    if message.from_me {
        return Ok(InboundOutcome::IgnoredFromMe);
    }

    let Some(tenant) = ctx.tenants.find_by_instance(instance).await? else {
        warn!(instance, "Webhook for unknown instance");
        return Ok(InboundOutcome::UnknownInstance);
    };
    let settings =
        TenantSettings::from_value_with_defaults(&tenant.settings, &ctx.tenant_defaults);
    let tz: Tz = tenant.timezone.parse().unwrap_or(chrono_tz::UTC);

    let phone = digits_only(&message.remote_id);
    let Some(text) = message.body().map(str::to_string) else {
        debug!(tenant_id = %tenant.id, "Inbound without text; ignoring");
        return Ok(InboundOutcome::IgnoredEmpty);
    };
    if phone.is_empty() {
        return Ok(InboundOutcome::IgnoredEmpty);
    }

    // Delivery dedupe: platforms redeliver webhooks. A cache failure
    // degrades to processing (the downstream stages are idempotent).
    let delivery_id = format!("{}:{}", phone, message.timestamp);
    match ctx.inbound_dedupe.first_seen(&tenant.id, &delivery_id).await {
        Ok(true) => {}
        Ok(false) => {
            metrics::counter!("bookline.ingress.duplicates_total").increment(1);
            return Ok(InboundOutcome::DuplicateDelivery);
        }
        Err(e) => warn!(tenant_id = %tenant.id, error = %e, "Inbound dedupe unavailable"),
    }

    // No-show reply machine first: while a question is pending, its own
    // vocabulary ("sim", "nao", "2") binds tighter than the opt-out
    // keywords that overlap with it.
    let pending = match ctx.pending_replies.get(&tenant.id, &phone).await {
        Ok(pending) => pending,
        Err(e) => {
            warn!(tenant_id = %tenant.id, error = %e, "Pending-reply cache unavailable");
            None
        }
    };
    let had_pending = pending.is_some();

    if let Some(pending) = pending {
        if let Some(token) = replies::parse_reply(&text) {
            metrics::counter!("bookline.ingress.replies_total").increment(1);
            let action =
                replies::handle_reply(ctx, &tenant, &settings, tz, &phone, token, pending)
                    .await?;
            return Ok(InboundOutcome::ReplyHandled(action));
        }
    }

    // Opt-out keywords terminate the pipeline.
    if let Some(action) = parse_keyword(&text) {
        return match action {
            KeywordAction::OptOut => {
                ctx.opt_outs
                    .register(&tenant.id, &phone, OptOutKind::All)
                    .await?;
                metrics::counter!("bookline.ingress.optouts_total").increment(1);
                info!(tenant_id = %tenant.id, "Recipient opted out");
                ack(ctx, &settings, &phone, &templates::optout_ack()).await;
                Ok(InboundOutcome::OptOutRegistered)
            }
            KeywordAction::OptIn => {
                ctx.opt_outs
                    .release(&tenant.id, &phone, OptOutKind::All)
                    .await?;
                info!(tenant_id = %tenant.id, "Recipient opted back in");
                ack(ctx, &settings, &phone, &templates::optin_ack()).await;
                Ok(InboundOutcome::OptInRegistered)
            }
        };
    }

    // A pending question with an unrecognized answer: ask again, keep state.
    if had_pending {
        ack(ctx, &settings, &phone, &templates::disambiguation()).await;
        return Ok(InboundOutcome::ReplyHandled(ReplyAction::Disambiguated));
    }

    // Everything else belongs to the dialogue collaborator. Its reply goes
    // straight out, not enqueued and not deduped; its failure is graceful.
    match ctx
        .dialogue
        .reply(&tenant.id, &phone, &text, message.push_name.as_deref())
        .await
    {
        Ok(Some(reply)) => {
            ack(ctx, &settings, &phone, &reply).await;
            Ok(InboundOutcome::DialogueReplied)
        }
        Ok(None) => Ok(InboundOutcome::DialogueSilent),
        Err(e) => {
            warn!(tenant_id = %tenant.id, error = %e, "Dialogue collaborator failed");
            Ok(InboundOutcome::DialogueSilent)
        }
    }
}

async fn ack(ctx: &IngressContext, settings: &TenantSettings, phone: &str, text: &str) {
    let outcome = ctx
        .gateway
        .send_text(&settings.instance, phone, text)
        .await;
    if !outcome.is_delivered() {
        warn!(phone, ?outcome, "Failed to deliver acknowledgment");
    }
}

/// POST /webhook/{instance}
pub async fn handle(
    State(ctx): State<IngressContext>,
    Path(instance): Path<String>,
    Json(envelope): Json<WebhookEnvelope>,
) -> (StatusCode, Json<serde_json::Value>) {
    match process_inbound(&ctx, &instance, envelope).await {
        Ok(InboundOutcome::UnknownInstance) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "unknown instance"})),
        ),
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "ok", "outcome": outcome.label()})),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Webhook processing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "internal error"})),
            )
        }
    }
}
