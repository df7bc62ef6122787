//! Inbound ingress.
//!
//! The webhook pipeline runs declared stages with documented short-circuit
//! semantics: sender filter → tenant resolution → delivery dedupe → no-show
//! reply machine (when a pending reply exists and the text matches its
//! vocabulary) → opt-out keywords → dialogue hand-off. Replies produced
//! here go straight through the gateway; they are never enqueued and never
//! deduped.

pub mod admin;
pub mod dialogue;
pub mod optout;
pub mod replies;
pub mod webhook;

use axum::routing::{get, post};
use axum::Router;
use bl_cache::{IdempotencyStore, InboundDedupe, PendingReplyStore, SlotOfferStore};
use bl_clients::{CalendarApi, ChatGateway};
use bl_config::TenantSettings;
use bl_scheduler::AuditReconciler;
use bl_store::{HandoffStore, NotificationLog, OptOutStore, TenantStore};
use std::sync::Arc;
use thiserror::Error;

pub use dialogue::{DialogueService, HttpDialogueService, NoopDialogue};
pub use webhook::{process_inbound, InboundMessage, InboundOutcome, WebhookEnvelope};

#[derive(Error, Debug)]
pub enum IngressError {
    #[error("store error: {0}")]
    Store(#[from] bl_store::StoreError),
    #[error("cache error: {0}")]
    Cache(#[from] bl_cache::CacheError),
    #[error("calendar error: {0}")]
    Calendar(#[from] bl_clients::CalendarError),
}

/// Everything the ingress needs, passed explicitly.
#[derive(Clone)]
pub struct IngressContext {
    pub tenants: Arc<dyn TenantStore>,
    pub notifications: Arc<dyn NotificationLog>,
    pub opt_outs: Arc<dyn OptOutStore>,
    pub handoffs: Arc<dyn HandoffStore>,
    pub pending_replies: Arc<dyn PendingReplyStore>,
    pub slot_offers: Arc<dyn SlotOfferStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub inbound_dedupe: Arc<dyn InboundDedupe>,
    pub gateway: Arc<dyn ChatGateway>,
    pub calendar: Arc<dyn CalendarApi>,
    pub dialogue: Arc<dyn DialogueService>,
    pub audit: Arc<AuditReconciler>,
    pub tenant_defaults: TenantSettings,
    pub admin_token: String,
}

/// Build the HTTP surface: webhook, health and the admin endpoints.
pub fn router(ctx: IngressContext) -> Router {
    Router::new()
        .route("/webhook/:instance", post(webhook::handle))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route(
            "/admin/handoff/:tenant/:phone",
            axum::routing::put(admin::enable_handoff).delete(admin::disable_handoff),
        )
        .route(
            "/admin/handoff/:tenant",
            axum::routing::put(admin::enable_global_handoff)
                .delete(admin::disable_global_handoff),
        )
        .route("/admin/handoffs", get(admin::list_handoffs))
        .route("/admin/audit/:tenant/:date", post(admin::rerun_audit))
        .route(
            "/admin/optouts/:tenant/:phone",
            get(admin::list_optouts).delete(admin::remove_optout),
        )
        .with_state(ctx)
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn ready(
    axum::extract::State(ctx): axum::extract::State<IngressContext>,
) -> (axum::http::StatusCode, axum::Json<serde_json::Value>) {
    // One SQL and one cache round-trip; either failing means not ready.
    let sql_ok = ctx.tenants.list_active_tenants().await.is_ok();
    let cache_ok = ctx.idempotency.get("_ready", "probe").await.is_ok();

    if sql_ok && cache_ok {
        (
            axum::http::StatusCode::OK,
            axum::Json(serde_json::json!({"status": "READY"})),
        )
    } else {
        (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(serde_json::json!({
                "status": "NOT_READY",
                "sql": sql_ok,
                "cache": cache_ok,
            })),
        )
    }
}
