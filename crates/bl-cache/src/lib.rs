//! Ephemeral key-value state.
//!
//! The cache is authoritative only for short-lived state: the booking
//! idempotency protocol, pending no-show replies, offered rebook slots, and
//! inbound webhook dedupe. Durable "was this sent" evidence lives in the SQL
//! notification log, never here.
//!
//! Two backends: Redis for production, an in-memory map for tests and local
//! development.

pub mod memory;
pub mod redis_cache;

use async_trait::async_trait;
use bl_common::Slot;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryCache;
pub use redis_cache::RedisCache;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache operation timed out")]
    Timeout,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Default entry lifetimes.
pub const IDEMPOTENCY_TTL: Duration = Duration::from_secs(30 * 60);
pub const PENDING_REPLY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const SLOT_OFFER_TTL: Duration = Duration::from_secs(60 * 60);
pub const INBOUND_DEDUPE_TTL: Duration = Duration::from_secs(10 * 60);

/// Hash identifying a logical booking attempt:
/// `sha256(phone|service_id|date|time)`, hex-encoded.
pub fn booking_key_hash(phone: &str, service_id: &str, date: NaiveDate, time: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{phone}|{service_id}|{date}|{time}"));
    hex::encode(hasher.finalize())
}

/// State of a booking idempotency entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IdempotencyState {
    InProgress {
        started_at: DateTime<Utc>,
    },
    Completed {
        result: Value,
        finished_at: DateTime<Utc>,
    },
    Failed {
        error: String,
        finished_at: DateTime<Utc>,
    },
}

/// What `begin` observed. Callers that see `InProgress` must refuse to start
/// a duplicate attempt; `Completed`/`Failed` return the prior outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    Started,
    InProgress,
    Completed(Value),
    Failed(String),
}

/// The four-step idempotency protocol: hash key, set-if-absent in_progress,
/// execute, write the result. Transitioning out of `in_progress` is the
/// holder's responsibility.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn begin(&self, tenant_id: &str, key_hash: &str) -> Result<BeginOutcome>;
    async fn complete(&self, tenant_id: &str, key_hash: &str, result: Value) -> Result<()>;
    async fn fail(&self, tenant_id: &str, key_hash: &str, error: &str) -> Result<()>;
    async fn get(&self, tenant_id: &str, key_hash: &str) -> Result<Option<IdempotencyState>>;
}

/// The question we are waiting for a recipient to answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReply {
    pub appointment_id: String,
    pub service_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub professional_id: Option<String>,
    pub appointment_date: NaiveDate,
    pub question_sent_at: DateTime<Utc>,
}

#[async_trait]
pub trait PendingReplyStore: Send + Sync {
    async fn put(&self, tenant_id: &str, phone: &str, reply: &PendingReply) -> Result<()>;
    async fn get(&self, tenant_id: &str, phone: &str) -> Result<Option<PendingReply>>;
    async fn clear(&self, tenant_id: &str, phone: &str) -> Result<()>;
}

/// Slots offered to a recipient as a numbered list, kept while they pick.
#[async_trait]
pub trait SlotOfferStore: Send + Sync {
    async fn put(&self, tenant_id: &str, phone: &str, slots: &[Slot]) -> Result<()>;
    async fn get(&self, tenant_id: &str, phone: &str) -> Result<Option<Vec<Slot>>>;
    async fn clear(&self, tenant_id: &str, phone: &str) -> Result<()>;
}

/// Webhook delivery dedupe: platforms redeliver, we process once.
#[async_trait]
pub trait InboundDedupe: Send + Sync {
    /// Returns true the first time a message id is seen within the TTL.
    async fn first_seen(&self, tenant_id: &str, message_id: &str) -> Result<bool>;
}

pub(crate) fn idem_key(tenant_id: &str, key_hash: &str) -> String {
    format!("idem:{tenant_id}:{key_hash}")
}

pub(crate) fn reply_key(tenant_id: &str, phone: &str) -> String {
    format!("reply:{tenant_id}:{phone}")
}

pub(crate) fn slots_key(tenant_id: &str, phone: &str) -> String {
    format!("slots:{tenant_id}:{phone}")
}

pub(crate) fn inbound_key(tenant_id: &str, message_id: &str) -> String {
    format!("inbound:{tenant_id}:{message_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booking_hash_is_deterministic_and_input_sensitive() {
        let date = NaiveDate::from_ymd_opt(2025, 2, 11).unwrap();
        let a = booking_key_hash("5571900000001", "svc1", date, "11:00");
        let b = booking_key_hash("5571900000001", "svc1", date, "11:00");
        let c = booking_key_hash("5571900000001", "svc1", date, "10:00");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn idempotency_state_serializes_tagged() {
        let state = IdempotencyState::Failed {
            error: "slot taken".into(),
            finished_at: Utc::now(),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "failed");
        let back: IdempotencyState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn key_namespaces_are_tenant_scoped() {
        assert_eq!(idem_key("t1", "abc"), "idem:t1:abc");
        assert_eq!(reply_key("t1", "557190"), "reply:t1:557190");
        assert_eq!(slots_key("t1", "557190"), "slots:t1:557190");
        assert_eq!(inbound_key("t1", "m1"), "inbound:t1:m1");
    }
}
