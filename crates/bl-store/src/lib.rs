//! SQL persistence for the bookline messaging substrate.
//!
//! All durable state lives behind the traits in [`repository`]: the job
//! store, the append-only notification log, the opt-out registry, handoff
//! records, the service catalog and the tenant registry. Two backends are
//! provided: PostgreSQL for production and SQLite for tests and local
//! development.

pub mod repository;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use repository::{
    CatalogStore, EnqueueOutcome, HandoffStore, JobStore, NotificationLog, OptOutStore,
    RecordOutcome, Result, ServiceCatalogEntry, StoreError, Tenant, TenantStore,
};
