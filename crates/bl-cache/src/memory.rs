//! In-memory cache backend for tests and local development.
//!
//! Same expiry semantics as the Redis backend, scoped to the process.

use async_trait::async_trait;
use bl_common::Slot;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::{
    idem_key, inbound_key, reply_key, slots_key, BeginOutcome, IdempotencyState,
    IdempotencyStore, InboundDedupe, PendingReply, PendingReplyStore, Result, SlotOfferStore,
    INBOUND_DEDUPE_TTL, IDEMPOTENCY_TTL, PENDING_REPLY_TTL, SLOT_OFFER_TTL,
};

#[derive(Debug, Clone)]
pub struct MemoryCacheTtls {
    pub idempotency: Duration,
    pub pending_reply: Duration,
    pub slot_offer: Duration,
    pub inbound: Duration,
}

impl Default for MemoryCacheTtls {
    fn default() -> Self {
        Self {
            idempotency: IDEMPOTENCY_TTL,
            pending_reply: PENDING_REPLY_TTL,
            slot_offer: SLOT_OFFER_TTL,
            inbound: INBOUND_DEDUPE_TTL,
        }
    }
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    ttls: MemoryCacheTtls,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override lifetimes; tests use short TTLs to exercise expiry.
    pub fn with_ttls(ttls: MemoryCacheTtls) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttls,
        }
    }

    fn set_nx(&self, key: &str, value: String, ttl: Duration) -> bool {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get(key) {
            Some((_, expires)) if *expires > now => false,
            _ => {
                entries.insert(key.to_string(), (value, now + ttl));
                true
            }
        }
    }

    fn overwrite(&self, key: &str, value: String) {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if let Some((stored, expires)) = entries.get_mut(key) {
            if *expires > now {
                *stored = value;
            }
        }
    }

    fn set(&self, key: &str, value: String, ttl: Duration) {
        self.entries
            .lock()
            .insert(key.to_string(), (value, Instant::now() + ttl));
    }

    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            _ => None,
        }
    }

    fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

#[async_trait]
impl IdempotencyStore for MemoryCache {
    async fn begin(&self, tenant_id: &str, key_hash: &str) -> Result<BeginOutcome> {
        let key = idem_key(tenant_id, key_hash);
        let fresh = serde_json::to_string(&IdempotencyState::InProgress {
            started_at: Utc::now(),
        })?;

        loop {
            if self.set_nx(&key, fresh.clone(), self.ttls.idempotency) {
                return Ok(BeginOutcome::Started);
            }
            match self.get(&key) {
                Some(raw) => {
                    let state: IdempotencyState = serde_json::from_str(&raw)?;
                    return Ok(match state {
                        IdempotencyState::InProgress { .. } => BeginOutcome::InProgress,
                        IdempotencyState::Completed { result, .. } => {
                            BeginOutcome::Completed(result)
                        }
                        IdempotencyState::Failed { error, .. } => BeginOutcome::Failed(error),
                    });
                }
                // Expired between set and get; take it on the next pass.
                None => continue,
            }
        }
    }

    async fn complete(&self, tenant_id: &str, key_hash: &str, result: Value) -> Result<()> {
        let state = IdempotencyState::Completed {
            result,
            finished_at: Utc::now(),
        };
        self.overwrite(&idem_key(tenant_id, key_hash), serde_json::to_string(&state)?);
        Ok(())
    }

    async fn fail(&self, tenant_id: &str, key_hash: &str, error: &str) -> Result<()> {
        let state = IdempotencyState::Failed {
            error: error.to_string(),
            finished_at: Utc::now(),
        };
        self.overwrite(&idem_key(tenant_id, key_hash), serde_json::to_string(&state)?);
        Ok(())
    }

    async fn get(&self, tenant_id: &str, key_hash: &str) -> Result<Option<IdempotencyState>> {
        match MemoryCache::get(self, &idem_key(tenant_id, key_hash)) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl PendingReplyStore for MemoryCache {
    async fn put(&self, tenant_id: &str, phone: &str, reply: &PendingReply) -> Result<()> {
        self.set(
            &reply_key(tenant_id, phone),
            serde_json::to_string(reply)?,
            self.ttls.pending_reply,
        );
        Ok(())
    }

    async fn get(&self, tenant_id: &str, phone: &str) -> Result<Option<PendingReply>> {
        match MemoryCache::get(self, &reply_key(tenant_id, phone)) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn clear(&self, tenant_id: &str, phone: &str) -> Result<()> {
        self.delete(&reply_key(tenant_id, phone));
        Ok(())
    }
}

#[async_trait]
impl SlotOfferStore for MemoryCache {
    async fn put(&self, tenant_id: &str, phone: &str, slots: &[Slot]) -> Result<()> {
        self.set(
            &slots_key(tenant_id, phone),
            serde_json::to_string(slots)?,
            self.ttls.slot_offer,
        );
        Ok(())
    }

    async fn get(&self, tenant_id: &str, phone: &str) -> Result<Option<Vec<Slot>>> {
        match MemoryCache::get(self, &slots_key(tenant_id, phone)) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn clear(&self, tenant_id: &str, phone: &str) -> Result<()> {
        self.delete(&slots_key(tenant_id, phone));
        Ok(())
    }
}

#[async_trait]
impl InboundDedupe for MemoryCache {
    async fn first_seen(&self, tenant_id: &str, message_id: &str) -> Result<bool> {
        Ok(self.set_nx(
            &inbound_key(tenant_id, message_id),
            "1".to_string(),
            self.ttls.inbound,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking_key_hash;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn idempotency_three_state_protocol() {
        let cache = MemoryCache::new();
        let hash = booking_key_hash(
            "5571900000001",
            "svc1",
            NaiveDate::from_ymd_opt(2025, 2, 11).unwrap(),
            "11:00",
        );

        assert_eq!(
            cache.begin("t1", &hash).await.unwrap(),
            BeginOutcome::Started
        );
        // A concurrent caller with the same hash must refuse to start.
        assert_eq!(
            cache.begin("t1", &hash).await.unwrap(),
            BeginOutcome::InProgress
        );

        cache
            .complete("t1", &hash, serde_json::json!({"booking_id": "bk9"}))
            .await
            .unwrap();
        match cache.begin("t1", &hash).await.unwrap() {
            BeginOutcome::Completed(result) => {
                assert_eq!(result["booking_id"], "bk9");
            }
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn idempotency_failure_is_returned_to_later_callers() {
        let cache = MemoryCache::new();
        assert_eq!(
            cache.begin("t1", "h1").await.unwrap(),
            BeginOutcome::Started
        );
        cache.fail("t1", "h1", "slot taken").await.unwrap();
        assert_eq!(
            cache.begin("t1", "h1").await.unwrap(),
            BeginOutcome::Failed("slot taken".into())
        );
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let cache = MemoryCache::with_ttls(MemoryCacheTtls {
            idempotency: Duration::from_millis(10),
            pending_reply: Duration::from_millis(10),
            slot_offer: Duration::from_millis(10),
            inbound: Duration::from_millis(10),
        });

        assert_eq!(
            cache.begin("t1", "h1").await.unwrap(),
            BeginOutcome::Started
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
        // TTL elapsed: the protocol restarts from absent.
        assert_eq!(
            cache.begin("t1", "h1").await.unwrap(),
            BeginOutcome::Started
        );
    }

    #[tokio::test]
    async fn pending_reply_roundtrip_and_clear() {
        let cache = MemoryCache::new();
        let reply = PendingReply {
            appointment_id: "ap1".into(),
            service_id: "svc1".into(),
            professional_id: Some("pro1".into()),
            appointment_date: NaiveDate::from_ymd_opt(2025, 2, 10).unwrap(),
            question_sent_at: Utc::now(),
        };

        PendingReplyStore::put(&cache, "t1", "5571900000001", &reply)
            .await
            .unwrap();
        assert_eq!(
            PendingReplyStore::get(&cache, "t1", "5571900000001")
                .await
                .unwrap(),
            Some(reply)
        );

        PendingReplyStore::clear(&cache, "t1", "5571900000001")
            .await
            .unwrap();
        assert_eq!(
            PendingReplyStore::get(&cache, "t1", "5571900000001")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn inbound_dedupe_sees_each_id_once() {
        let cache = MemoryCache::new();
        assert!(cache.first_seen("t1", "m1").await.unwrap());
        assert!(!cache.first_seen("t1", "m1").await.unwrap());
        // Different tenant, same id: independent namespace.
        assert!(cache.first_seen("t2", "m1").await.unwrap());
    }
}
