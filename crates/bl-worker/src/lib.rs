//! Delivery worker pool.
//!
//! Workers are the only component that transmits scheduled messages. Each
//! consumer loops over the active tenants, claims a batch per tenant at
//! that tenant's cadence and batch size, gates every job through opt-out
//! and handoff, checks the dedup index, renders, transmits, records
//! evidence and commits. A crashed consumer's claims become reclaimable
//! after the tenant's visibility timeout.

pub mod gate;
pub mod recovery;
pub mod worker;

pub use gate::Gate;
pub use recovery::{RecoveryConfig, RecoveryTask};
pub use worker::{DeliveryWorker, DeliveryWorkerConfig, WorkerContext};
