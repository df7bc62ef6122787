//! Opt-out and handoff gates with short-lived memoization.
//!
//! Gate reads are allowed to be up to `memo_ttl` (default 30 s) stale; a new
//! opt-out still takes effect on the next claim cycle at the latest.

use bl_common::JobKind;
use bl_store::{HandoffStore, OptOutStore, StoreError};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Gate {
    opt_outs: Arc<dyn OptOutStore>,
    handoffs: Arc<dyn HandoffStore>,
    memo_ttl: Duration,
    optout_memo: Mutex<HashMap<(String, String, JobKind), (bool, Instant)>>,
    handoff_memo: Mutex<HashMap<(String, String), (bool, Instant)>>,
}

impl Gate {
    pub fn new(
        opt_outs: Arc<dyn OptOutStore>,
        handoffs: Arc<dyn HandoffStore>,
        memo_ttl: Duration,
    ) -> Self {
        Self {
            opt_outs,
            handoffs,
            memo_ttl,
            optout_memo: Mutex::new(HashMap::new()),
            handoff_memo: Mutex::new(HashMap::new()),
        }
    }

    pub async fn is_opted_out(
        &self,
        tenant_id: &str,
        phone: &str,
        kind: JobKind,
    ) -> Result<bool, StoreError> {
        let key = (tenant_id.to_string(), phone.to_string(), kind);
        if let Some((cached, at)) = self.optout_memo.lock().get(&key) {
            if at.elapsed() < self.memo_ttl {
                return Ok(*cached);
            }
        }

        let suppressed = self.opt_outs.is_suppressed(tenant_id, phone, kind).await?;
        self.optout_memo
            .lock()
            .insert(key, (suppressed, Instant::now()));
        Ok(suppressed)
    }

    pub async fn handoff_active(
        &self,
        tenant_id: &str,
        phone: &str,
    ) -> Result<bool, StoreError> {
        let key = (tenant_id.to_string(), phone.to_string());
        if let Some((cached, at)) = self.handoff_memo.lock().get(&key) {
            if at.elapsed() < self.memo_ttl {
                return Ok(*cached);
            }
        }

        let active = self
            .handoffs
            .find_active(tenant_id, phone, Utc::now())
            .await?
            .is_some();
        self.handoff_memo
            .lock()
            .insert(key, (active, Instant::now()));
        Ok(active)
    }
}
