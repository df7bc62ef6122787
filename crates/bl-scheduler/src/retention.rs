//! Retention sweep: terminal message jobs are kept for a bounded window,
//! then deleted. The notification log is never swept; it is the audit's
//! evidence.

use bl_store::JobStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::info;

pub struct RetentionSweep {
    jobs: Arc<dyn JobStore>,
    retention_days: u32,
}

impl RetentionSweep {
    pub fn new(jobs: Arc<dyn JobStore>, retention_days: u32) -> Self {
        Self {
            jobs,
            retention_days,
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let cutoff = now - ChronoDuration::days(i64::from(self.retention_days));
        let removed = self.jobs.delete_terminal_older_than(cutoff).await?;
        if removed > 0 {
            metrics::counter!("bookline.scheduler.jobs_swept_total").increment(removed);
            info!(removed, retention_days = self.retention_days, "Swept terminal jobs");
        }
        Ok(removed)
    }
}
