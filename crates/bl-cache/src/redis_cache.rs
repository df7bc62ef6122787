//! Redis cache backend.
//!
//! Every round-trip runs under a deadline (default 2 s) so a degraded Redis
//! cannot stall the delivery worker or the ingress.

use async_trait::async_trait;
use bl_common::Slot;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::{
    idem_key, inbound_key, reply_key, slots_key, BeginOutcome, CacheError, IdempotencyState,
    IdempotencyStore, InboundDedupe, PendingReply, PendingReplyStore, Result, SlotOfferStore,
    INBOUND_DEDUPE_TTL, IDEMPOTENCY_TTL, PENDING_REPLY_TTL, SLOT_OFFER_TTL,
};

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl RedisCache {
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| CacheError::Backend(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(Self { conn, op_timeout })
    }

    pub fn new(conn: ConnectionManager, op_timeout: Duration) -> Self {
        Self { conn, op_timeout }
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CacheError::Backend(e.to_string())),
            Err(_) => Err(CacheError::Timeout),
        }
    }

    /// SET key value NX EX ttl; true when the key was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let set: Option<String> = self
            .timed(async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl.as_secs())
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(set.is_some())
    }

    /// SET key value XX KEEPTTL; overwrite only if present, keep expiry.
    async fn overwrite(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: Option<String> = self
            .timed(async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("XX")
                    .arg("KEEPTTL")
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(())
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.timed(async move { conn.get(key).await }).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let value = value.to_string();
        self.timed(async move { conn.set_ex(key, value, ttl.as_secs()).await })
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let _: i64 = self.timed(async move { conn.del(key).await }).await?;
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for RedisCache {
    async fn begin(&self, tenant_id: &str, key_hash: &str) -> Result<BeginOutcome> {
        let key = idem_key(tenant_id, key_hash);
        let fresh = serde_json::to_string(&IdempotencyState::InProgress {
            started_at: Utc::now(),
        })?;

        // Two passes cover the race where the holder's entry expires between
        // our failed SET NX and the GET.
        for _ in 0..2 {
            if self.set_nx(&key, &fresh, IDEMPOTENCY_TTL).await? {
                debug!(key = %key, "Idempotency entry acquired");
                return Ok(BeginOutcome::Started);
            }
            match self.get_string(&key).await? {
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
                None => continue,
            }
        }
        Err(CacheError::Backend(
            "idempotency entry kept vanishing between set and get".into(),
        ))
    }

    async fn complete(&self, tenant_id: &str, key_hash: &str, result: Value) -> Result<()> {
        let state = IdempotencyState::Completed {
            result,
            finished_at: Utc::now(),
        };
        self.overwrite(&idem_key(tenant_id, key_hash), &serde_json::to_string(&state)?)
            .await
    }

    async fn fail(&self, tenant_id: &str, key_hash: &str, error: &str) -> Result<()> {
        let state = IdempotencyState::Failed {
            error: error.to_string(),
            finished_at: Utc::now(),
        };
        self.overwrite(&idem_key(tenant_id, key_hash), &serde_json::to_string(&state)?)
            .await
    }

    async fn get(&self, tenant_id: &str, key_hash: &str) -> Result<Option<IdempotencyState>> {
        match self.get_string(&idem_key(tenant_id, key_hash)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl PendingReplyStore for RedisCache {
    async fn put(&self, tenant_id: &str, phone: &str, reply: &PendingReply) -> Result<()> {
        self.set_with_ttl(
            &reply_key(tenant_id, phone),
            &serde_json::to_string(reply)?,
            PENDING_REPLY_TTL,
        )
        .await
    }

    async fn get(&self, tenant_id: &str, phone: &str) -> Result<Option<PendingReply>> {
        match self.get_string(&reply_key(tenant_id, phone)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn clear(&self, tenant_id: &str, phone: &str) -> Result<()> {
        self.delete(&reply_key(tenant_id, phone)).await
    }
}

#[async_trait]
impl SlotOfferStore for RedisCache {
    async fn put(&self, tenant_id: &str, phone: &str, slots: &[Slot]) -> Result<()> {
        self.set_with_ttl(
            &slots_key(tenant_id, phone),
            &serde_json::to_string(slots)?,
            SLOT_OFFER_TTL,
        )
        .await
    }

    async fn get(&self, tenant_id: &str, phone: &str) -> Result<Option<Vec<Slot>>> {
        match self.get_string(&slots_key(tenant_id, phone)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn clear(&self, tenant_id: &str, phone: &str) -> Result<()> {
        self.delete(&slots_key(tenant_id, phone)).await
    }
}

#[async_trait]
impl InboundDedupe for RedisCache {
    async fn first_seen(&self, tenant_id: &str, message_id: &str) -> Result<bool> {
        self.set_nx(&inbound_key(tenant_id, message_id), "1", INBOUND_DEDUPE_TTL)
            .await
    }
}
