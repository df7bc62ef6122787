//! Stale-claim recovery.
//!
//! The claim predicate already ignores expired leases, so this task is
//! hygiene plus observability: it clears expired claim columns and counts
//! how many a crashed consumer left behind.

use bl_store::JobStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub check_interval: Duration,
    pub enabled: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            enabled: true,
        }
    }
}

pub struct RecoveryTask {
    jobs: Arc<dyn JobStore>,
    config: RecoveryConfig,
}

impl RecoveryTask {
    pub fn new(jobs: Arc<dyn JobStore>, config: RecoveryConfig) -> Self {
        Self { jobs, config }
    }

    /// Run until the shutdown signal fires.
    pub async fn run(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        if !self.config.enabled {
            info!("Claim recovery task is disabled");
            return;
        }

        info!(interval_secs = self.config.check_interval.as_secs(), "Starting claim recovery task");

        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.recover_once().await,
                _ = shutdown.recv() => {
                    info!("Claim recovery task shutting down");
                    break;
                }
            }
        }
    }

    pub async fn recover_once(&self) {
        debug!("Checking for expired claim leases");
        match self.jobs.release_expired_leases(Utc::now()).await {
            Ok(count) => {
                if count > 0 {
                    metrics::counter!("bookline.worker.leases_recovered_total")
                        .increment(count);
                    info!(count, "Released expired claim leases");
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to release expired leases");
            }
        }
    }
}
