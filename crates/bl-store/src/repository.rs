//! Storage traits and row types.
//!
//! Every trait here is implemented by both SQL backends. Callers hold
//! `Arc<dyn Trait>` and never see backend types.

use async_trait::async_trait;
use bl_common::{
    HandoffRecord, JobKind, JobSpec, JobTransition, MessageJob, NotificationKind,
    NotificationRecord, OptOutKind, OptOutRecord,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("job not found: {0}")]
    JobNotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Result of an idempotent enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(String),
    /// A pending row with the same (tenant, booking_id, kind) already
    /// exists; its id is returned and nothing was inserted.
    Duplicate(String),
}

impl EnqueueOutcome {
    pub fn id(&self) -> &str {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Duplicate(id) => id,
        }
    }
}

/// Result of an idempotent notification-log insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    /// (tenant, dedupe_key) already present. Informational, not an error.
    Duplicate,
}

/// Durable table of scheduled message jobs (the source of pending work).
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Idempotent on (tenant, booking_id, kind) among pending rows.
    async fn enqueue(&self, spec: JobSpec) -> Result<EnqueueOutcome>;

    /// Claim up to `max` due pending jobs of one tenant for `worker_id`,
    /// leasing them until `now + lease`. `max` and `lease` come from the
    /// tenant's settings, so batch size and visibility timeout are
    /// per-tenant. Never returns two rows for the same phone; concurrent
    /// callers observe disjoint batches. Expired leases are claimable
    /// again.
    async fn claim_batch(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
        max: u32,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Vec<MessageJob>>;

    /// Atomically apply a transition to a pending job. Transitions against
    /// rows already in a terminal state are no-ops (absorbing states).
    async fn commit(&self, id: &str, transition: JobTransition) -> Result<()>;

    /// Clear leases that expired before `now`. The claim predicate already
    /// ignores them; this keeps the table tidy and returns the count for
    /// observability.
    async fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Retention sweep: delete rows that left `pending` before `cutoff`.
    async fn delete_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn get_job(&self, id: &str) -> Result<Option<MessageJob>>;
}

/// Append-only evidence of sends; the authority on "did this go out".
#[async_trait]
pub trait NotificationLog: Send + Sync {
    /// Insert a record unless (tenant, dedupe_key) already exists.
    /// `ref_date` is the appointment/report date the record refers to,
    /// used to scope audit fetches.
    async fn record_sent(
        &self,
        tenant_id: &str,
        dedupe_key: &str,
        kind: NotificationKind,
        phone: &str,
        payload: Value,
        ref_date: Option<NaiveDate>,
    ) -> Result<RecordOutcome>;

    async fn has_sent(&self, tenant_id: &str, dedupe_key: &str) -> Result<bool>;

    /// All records whose `ref_date` is the given day.
    async fn list_for_date(
        &self,
        tenant_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<NotificationRecord>>;
}

/// Per-tenant, per-recipient suppression list.
#[async_trait]
pub trait OptOutStore: Send + Sync {
    /// Upsert; re-registering an existing triple is a no-op.
    async fn register(&self, tenant_id: &str, phone: &str, kind: OptOutKind) -> Result<()>;

    /// True iff a record with kind `all` or the message's own kind exists.
    async fn is_suppressed(&self, tenant_id: &str, phone: &str, kind: JobKind) -> Result<bool>;

    /// Remove exactly one row; returns whether anything was removed.
    async fn release(&self, tenant_id: &str, phone: &str, kind: OptOutKind) -> Result<bool>;

    async fn list_for_phone(&self, tenant_id: &str, phone: &str) -> Result<Vec<OptOutRecord>>;
}

/// Operator handoff switches. Expiry is applied by readers: a record with
/// `expires_at <= now` is never returned as active.
#[async_trait]
pub trait HandoffStore: Send + Sync {
    /// Upsert by (tenant, phone) scope; `phone = None` is the tenant-global
    /// switch.
    async fn upsert_handoff(&self, record: HandoffRecord) -> Result<()>;

    async fn clear_handoff(&self, tenant_id: &str, phone: Option<&str>) -> Result<bool>;

    /// The record that pauses this recipient right now: their own, or the
    /// tenant-global one.
    async fn find_active(
        &self,
        tenant_id: &str,
        phone: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<HandoffRecord>>;

    async fn list_active_handoffs(
        &self,
        tenant_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<HandoffRecord>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCatalogEntry {
    pub tenant_id: String,
    pub service_id: String,
    pub name: String,
    /// trim + casefold + accent-strip of `name`; unique per tenant.
    pub normalized_name: String,
    pub active: bool,
    pub client_visible: bool,
    pub duration_min: i32,
    pub price_cents: i64,
}

impl ServiceCatalogEntry {
    pub fn new(tenant_id: &str, service_id: &str, name: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            service_id: service_id.to_string(),
            name: name.to_string(),
            normalized_name: bl_common::text::normalize(name),
            active: true,
            client_visible: true,
            duration_min: 30,
            price_cents: 0,
        }
    }
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Upsert by (tenant, service_id); recomputes the normalized name.
    async fn upsert_service(&self, entry: ServiceCatalogEntry) -> Result<()>;

    /// Lookup by name; normalization is applied to the query too.
    async fn find_service_by_name(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Option<ServiceCatalogEntry>>;

    async fn list_services(
        &self,
        tenant_id: &str,
        only_client_visible: bool,
    ) -> Result<Vec<ServiceCatalogEntry>>;
}

#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    /// IANA zone name, e.g. "America/Sao_Paulo".
    pub timezone: String,
    /// Opaque settings JSON; deserialized by consumers.
    pub settings: Value,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn list_active_tenants(&self) -> Result<Vec<Tenant>>;
    async fn get_tenant(&self, id: &str) -> Result<Option<Tenant>>;
    /// Resolve the tenant that owns a chat gateway instance.
    async fn find_by_instance(&self, instance: &str) -> Result<Option<Tenant>>;
    async fn upsert_tenant(&self, tenant: Tenant) -> Result<()>;
}
