//! The delivery worker: claim → gate → dedup → render → transmit → commit.
//!
//! Each cycle walks the active tenants and claims per tenant, so batch
//! size, poll cadence and claim visibility all come from that tenant's
//! settings. Settings changes take effect on the next cycle; nothing is
//! cached past it except the 30 s gate memos.

use bl_cache::{PendingReply, PendingReplyStore};
use bl_clients::{ChatGateway, SendOutcome};
use bl_common::logging::tenant_span;
use bl_common::retry::RetryPolicy;
use bl_common::{templates, JobKind, JobTransition, MessageJob, NotificationKind};
use bl_config::TenantSettings;
use bl_store::{HandoffStore, JobStore, NotificationLog, OptOutStore, TenantStore};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::gate::Gate;

/// Everything a worker needs, passed explicitly.
#[derive(Clone)]
pub struct WorkerContext {
    pub jobs: Arc<dyn JobStore>,
    pub notifications: Arc<dyn NotificationLog>,
    pub opt_outs: Arc<dyn OptOutStore>,
    pub handoffs: Arc<dyn HandoffStore>,
    pub tenants: Arc<dyn TenantStore>,
    pub pending_replies: Arc<dyn PendingReplyStore>,
    pub gateway: Arc<dyn ChatGateway>,
}

#[derive(Debug, Clone)]
pub struct DeliveryWorkerConfig {
    pub concurrency: usize,
    /// Consumer loop tick; the floor for every tenant's poll cadence.
    pub tick: Duration,
    pub inter_message_delay: Duration,
    pub gate_memo_ttl: Duration,
    pub tenant_defaults: TenantSettings,
}

impl Default for DeliveryWorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            tick: Duration::from_secs(30),
            inter_message_delay: Duration::from_secs(2),
            gate_memo_ttl: Duration::from_secs(30),
            tenant_defaults: TenantSettings::default(),
        }
    }
}

pub struct DeliveryWorker {
    ctx: WorkerContext,
    config: DeliveryWorkerConfig,
    gate: Gate,
    /// Last outbound send per (tenant, phone); enforces pacing.
    last_send: DashMap<(String, String), Instant>,
    /// Last claim attempt per tenant; enforces the tenant poll cadence
    /// across the whole consumer pool.
    last_poll: Mutex<HashMap<String, Instant>>,
}

impl DeliveryWorker {
    pub fn new(ctx: WorkerContext, config: DeliveryWorkerConfig) -> Self {
        let gate = Gate::new(
            ctx.opt_outs.clone(),
            ctx.handoffs.clone(),
            config.gate_memo_ttl,
        );
        Self {
            ctx,
            config,
            gate,
            last_send: DashMap::new(),
            last_poll: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the consumer pool. Each consumer polls independently and exits
    /// on the shutdown signal after finishing its in-flight batch.
    pub fn spawn(
        self: &Arc<Self>,
        shutdown: &tokio::sync::broadcast::Sender<()>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        info!(
            concurrency = self.config.concurrency,
            tick_secs = self.config.tick.as_secs(),
            "Starting delivery worker pool"
        );

        (0..self.config.concurrency)
            .map(|n| {
                let worker = Arc::clone(self);
                let mut shutdown_rx = shutdown.subscribe();
                let worker_id = format!("{}-{}", &Uuid::new_v4().to_string()[..8], n);
                tokio::spawn(async move {
                    let mut ticker = interval(worker.config.tick);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                if let Err(e) = worker.run_cycle(&worker_id).await {
                                    error!(worker_id = %worker_id, error = %e, "Worker cycle failed");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                info!(worker_id = %worker_id, "Delivery worker shutting down");
                                break;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// One pass over the active tenants. Returns the number of jobs
    /// handled. A claim failure for one tenant never blocks the others.
    pub async fn run_cycle(&self, worker_id: &str) -> anyhow::Result<usize> {
        let now = Utc::now();
        let tenants = self.ctx.tenants.list_active_tenants().await?;
        let mut handled = 0;

        for tenant in &tenants {
            let settings = TenantSettings::from_value_with_defaults(
                &tenant.settings,
                &self.config.tenant_defaults,
            );
            if !self.poll_due(&tenant.id, settings.poll_interval()) {
                continue;
            }

            let batch = match self
                .ctx
                .jobs
                .claim_batch(
                    &tenant.id,
                    now,
                    settings.batch_size,
                    worker_id,
                    settings.visibility_timeout(),
                )
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    error!(tenant_id = %tenant.id, error = %e, "Claim failed");
                    continue;
                }
            };
            if batch.is_empty() {
                continue;
            }

            metrics::counter!("bookline.worker.claimed_total").increment(batch.len() as u64);
            handled += batch.len();

            for job in batch {
                self.process_job(job, &settings).await;
            }
        }
        Ok(handled)
    }

    async fn process_job(&self, job: MessageJob, settings: &TenantSettings) {
        let job_id = job.id.clone();
        let span = tenant_span(&job.tenant_id);
        debug!(job_id = %job_id, kind = %job.kind, "Processing job");

        if let Err(e) = self.try_process_job(&job, settings).instrument(span).await {
            // The claim is abandoned; the lease expiry makes the job
            // reclaimable and the dedup index guards against a re-send.
            error!(job_id = %job_id, error = %e, "Job processing failed; leaving claim to expire");
        }
    }

    async fn try_process_job(
        &self,
        job: &MessageJob,
        settings: &TenantSettings,
    ) -> anyhow::Result<()> {
        // Opt-out gate: terminal skip, no attempt consumed.
        if self
            .gate
            .is_opted_out(&job.tenant_id, &job.phone, job.kind)
            .await?
        {
            metrics::counter!("bookline.worker.skipped_total").increment(1);
            self.ctx
                .jobs
                .commit(
                    &job.id,
                    JobTransition::Skip {
                        reason: "opted out".into(),
                    },
                )
                .await?;
            return Ok(());
        }

        // Handoff gate: return the job to the pool, pushed by the grace.
        if self.gate.handoff_active(&job.tenant_id, &job.phone).await? {
            metrics::counter!("bookline.worker.released_total").increment(1);
            let next = Utc::now()
                + ChronoDuration::from_std(settings.handoff_grace())
                    .unwrap_or_else(|_| ChronoDuration::minutes(5));
            self.ctx
                .jobs
                .commit(&job.id, JobTransition::Release { next_run_at: next })
                .await?;
            return Ok(());
        }

        // Dedup pre-check: a prior worker may have transmitted and crashed
        // before committing. The log is the authority; no second send.
        if self
            .ctx
            .notifications
            .has_sent(&job.tenant_id, &job.dedupe_key)
            .await?
        {
            metrics::counter!("bookline.worker.deduped_total").increment(1);
            debug!(job_id = %job.id, dedupe_key = %job.dedupe_key, "Already sent; committing without transmit");
            self.ctx.jobs.commit(&job.id, JobTransition::Sent).await?;
            return Ok(());
        }

        self.pace(&job.tenant_id, &job.phone).await;

        let text = match job.kind {
            JobKind::PreVisit => templates::previsit_reminder(&job.payload),
            JobKind::NoShowCheck => templates::noshow_question(&job.payload),
        };

        let outcome = self
            .ctx
            .gateway
            .send_text(&settings.instance, &job.phone, &text)
            .await;
        self.last_send.insert(
            (job.tenant_id.clone(), job.phone.clone()),
            Instant::now(),
        );

        match outcome {
            SendOutcome::Delivered => {
                self.record_delivery(job).await;
                metrics::counter!("bookline.worker.sent_total").increment(1);
                self.ctx.jobs.commit(&job.id, JobTransition::Sent).await?;
            }
            SendOutcome::Retryable {
                status,
                retry_after,
                error,
            } => {
                metrics::counter!("bookline.worker.retried_total").increment(1);
                let policy = RetryPolicy {
                    base_delay: Duration::from_secs(settings.base_delay_secs),
                    max_delay: Duration::from_secs(settings.max_delay_secs),
                    ..RetryPolicy::default()
                };
                let failed_attempt = (job.attempts + 1).max(1) as u32;
                let next = policy.next_run_at(Utc::now(), failed_attempt, retry_after);
                warn!(job_id = %job.id, status = ?status, "Transient send failure; backing off");
                self.ctx
                    .jobs
                    .commit(
                        &job.id,
                        JobTransition::Retry {
                            error,
                            next_run_at: next,
                        },
                    )
                    .await?;
            }
            SendOutcome::Rejected { status, error } => {
                metrics::counter!("bookline.worker.failed_total").increment(1);
                warn!(job_id = %job.id, status, "Permanent send failure");
                self.ctx
                    .jobs
                    .commit(&job.id, JobTransition::Fail { error })
                    .await?;
            }
        }
        Ok(())
    }

    /// Record evidence after a successful transmission. At-most-once wins
    /// over evidence completeness: a storage failure here is logged loudly
    /// but never leaves the job pending, because a pending job would be
    /// transmitted again.
    async fn record_delivery(&self, job: &MessageJob) {
        let kind = match job.kind {
            JobKind::PreVisit => NotificationKind::Previsit,
            JobKind::NoShowCheck => NotificationKind::NoshowQuestion,
        };
        let snapshot = serde_json::json!({
            "appointment_id": job.payload.appointment_id,
            "appointment_date": job.payload.appointment_date,
            "appointment_time": job.payload.appointment_time,
            "service_id": job.payload.service_id,
            "booking_id": job.booking_id,
            "job_id": job.id,
        });

        if let Err(e) = self
            .ctx
            .notifications
            .record_sent(
                &job.tenant_id,
                &job.dedupe_key,
                kind,
                &job.phone,
                snapshot,
                Some(job.payload.appointment_date),
            )
            .await
        {
            error!(
                job_id = %job.id,
                dedupe_key = %job.dedupe_key,
                error = %e,
                "Transmitted but failed to record evidence"
            );
        }

        if job.kind == JobKind::NoShowCheck {
            let reply = PendingReply {
                appointment_id: job.payload.appointment_id.clone(),
                service_id: job.payload.service_id.clone(),
                professional_id: job.payload.professional_id.clone(),
                appointment_date: job.payload.appointment_date,
                question_sent_at: Utc::now(),
            };
            if let Err(e) = self
                .ctx
                .pending_replies
                .put(&job.tenant_id, &job.phone, &reply)
                .await
            {
                // Degraded: the recipient's answer will fall through to the
                // dialogue collaborator instead of the reply machine.
                warn!(job_id = %job.id, error = %e, "Failed to store pending reply");
            }
        }
    }

    /// Respect the inter-message delay between sends to the same recipient.
    async fn pace(&self, tenant_id: &str, phone: &str) {
        let key = (tenant_id.to_string(), phone.to_string());
        let wait = self.last_send.get(&key).and_then(|last| {
            self.config
                .inter_message_delay
                .checked_sub(last.elapsed())
        });
        if let Some(wait) = wait {
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// True when this tenant's queue is due for a poll; the pool shares the
    /// latch, so collectively it polls each tenant at the tenant's cadence.
    fn poll_due(&self, tenant_id: &str, poll_interval: Duration) -> bool {
        let mut last_poll = self.last_poll.lock();
        let now = Instant::now();
        match last_poll.get(tenant_id) {
            Some(at) if now.duration_since(*at) < poll_interval => false,
            _ => {
                last_poll.insert(tenant_id.to_string(), now);
                true
            }
        }
    }
}
