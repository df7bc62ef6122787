//! Cron-driven producers.
//!
//! One tick loop drives everything: every `tick_secs` it walks the active
//! tenants and fires each producer at most once per tenant-local day, at the
//! first tick after the configured hour. A missed tick or a restart
//! double-fire is harmless because every producer is idempotent through the
//! notification log and the job store's natural key.

pub mod audit;
pub mod noshow;
pub mod previsit;
pub mod retention;

use bl_clients::CalendarApi;
use bl_common::logging::tenant_span;
use bl_config::{SchedulerConfig, TenantSettings};
use bl_store::{JobStore, NotificationLog, OptOutStore, Tenant, TenantStore};
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

pub use audit::{AuditReconciler, AuditReport, Divergence, DivergenceKind, Severity};
pub use noshow::NoShowProducer;
pub use previsit::PreVisitProducer;
pub use retention::RetentionSweep;

/// Dependencies shared by all producers, passed explicitly.
#[derive(Clone)]
pub struct ProducerContext {
    pub jobs: Arc<dyn JobStore>,
    pub notifications: Arc<dyn NotificationLog>,
    pub opt_outs: Arc<dyn OptOutStore>,
    pub tenants: Arc<dyn TenantStore>,
    pub calendar: Arc<dyn CalendarApi>,
}

/// Parse a tenant's IANA timezone, falling back to UTC.
pub(crate) fn tenant_tz(tenant: &Tenant) -> Tz {
    tenant.timezone.parse().unwrap_or_else(|_| {
        warn!(tenant_id = %tenant.id, timezone = %tenant.timezone, "Invalid tenant timezone; using UTC");
        chrono_tz::UTC
    })
}

pub struct CronScheduler {
    ctx: ProducerContext,
    config: SchedulerConfig,
    tenant_defaults: TenantSettings,
    previsit: PreVisitProducer,
    noshow: NoShowProducer,
    audit: AuditReconciler,
    retention: RetentionSweep,
    /// (tenant, task) → last tenant-local date it fired.
    fired: Mutex<HashMap<(String, &'static str), NaiveDate>>,
}

impl CronScheduler {
    pub fn new(
        ctx: ProducerContext,
        config: SchedulerConfig,
        tenant_defaults: TenantSettings,
    ) -> Self {
        let previsit = PreVisitProducer::new(ctx.clone(), tenant_defaults.clone());
        let noshow = NoShowProducer::new(ctx.clone(), tenant_defaults.clone());
        let audit = AuditReconciler::new(ctx.clone(), tenant_defaults.clone());
        let retention = RetentionSweep::new(ctx.jobs.clone(), config.retention_days);
        Self {
            ctx,
            config,
            tenant_defaults,
            previsit,
            noshow,
            audit,
            retention,
            fired: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(tick_secs = self.config.tick_secs, "Starting cron scheduler");

        let mut ticker = interval(Duration::from_secs(self.config.tick_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Cron scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// One trigger evaluation pass; `now` is injectable for tests.
    pub async fn tick(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let tenants = self.ctx.tenants.list_active_tenants().await?;
        for tenant in &tenants {
            let settings =
                TenantSettings::from_value_with_defaults(&tenant.settings, &self.tenant_defaults);
            let local = now.with_timezone(&tenant_tz(tenant));
            let local_date = local.date_naive();

            if settings.previsit_enabled
                && local.hour() >= u32::from(settings.previsit_hour)
                && self.latch(&tenant.id, "previsit", local_date)
            {
                match self
                    .previsit
                    .run_for_tenant(tenant, now)
                    .instrument(tenant_span(&tenant.id))
                    .await
                {
                    Ok(stats) => {
                        metrics::counter!("bookline.scheduler.previsit_runs_total").increment(1);
                        info!(tenant_id = %tenant.id, ?stats, "Pre-visit producer run complete");
                    }
                    Err(e) => {
                        // Unlatch so the next tick retries the aborted run.
                        self.unlatch(&tenant.id, "previsit");
                        error!(tenant_id = %tenant.id, error = %e, "Pre-visit producer run failed");
                    }
                }
            }

            if settings.noshow_enabled
                && local.hour() >= u32::from(settings.previsit_hour)
                && self.latch(&tenant.id, "noshow", local_date)
            {
                match self
                    .noshow
                    .run_for_tenant(tenant, now)
                    .instrument(tenant_span(&tenant.id))
                    .await
                {
                    Ok(stats) => {
                        metrics::counter!("bookline.scheduler.noshow_runs_total").increment(1);
                        info!(tenant_id = %tenant.id, ?stats, "No-show producer run complete");
                    }
                    Err(e) => {
                        self.unlatch(&tenant.id, "noshow");
                        error!(tenant_id = %tenant.id, error = %e, "No-show producer run failed");
                    }
                }
            }

            if settings.audit_enabled
                && local.hour() >= u32::from(settings.audit_hour)
                && self.latch(&tenant.id, "audit", local_date)
            {
                match self
                    .audit
                    .run_for_tenant(tenant, now)
                    .instrument(tenant_span(&tenant.id))
                    .await
                {
                    Ok(reports) => {
                        metrics::counter!("bookline.scheduler.audit_runs_total").increment(1);
                        let divergences: usize =
                            reports.iter().map(|r| r.divergences.len()).sum();
                        info!(tenant_id = %tenant.id, days = reports.len(), divergences, "Audit run complete");
                    }
                    Err(e) => {
                        self.unlatch(&tenant.id, "audit");
                        error!(tenant_id = %tenant.id, error = %e, "Audit run failed");
                    }
                }
            }
        }

        // The retention sweep is tenant-independent; once per UTC day.
        let utc_date = now.date_naive();
        if now.hour() >= 3 && self.latch("_global", "retention", utc_date) {
            match self.retention.run_once(now).await {
                Ok(removed) => {
                    debug!(removed, "Retention sweep complete");
                }
                Err(e) => {
                    self.unlatch("_global", "retention");
                    error!(error = %e, "Retention sweep failed");
                }
            }
        }

        Ok(())
    }

    /// Returns true the first time a (tenant, task) is evaluated for a
    /// given local date.
    fn latch(&self, tenant_id: &str, task: &'static str, date: NaiveDate) -> bool {
        let mut fired = self.fired.lock();
        let key = (tenant_id.to_string(), task);
        if fired.get(&key) == Some(&date) {
            return false;
        }
        fired.insert(key, date);
        true
    }

    fn unlatch(&self, tenant_id: &str, task: &'static str) {
        self.fired.lock().remove(&(tenant_id.to_string(), task));
    }
}
