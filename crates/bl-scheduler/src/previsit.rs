//! Pre-visit reminder producer.
//!
//! For every remindable appointment starting 24-40 h from now, enqueue one
//! reminder job scheduled at `start - 32 h`. Idempotent three ways: the
//! notification log (already sent), the opt-out registry, and the job
//! store's pending natural key.

use bl_clients::calendar::list_all_appointments;
use bl_common::text::digits_only;
use bl_common::{dedupe, JobKind, JobPayload, JobSpec};
use bl_config::TenantSettings;
use bl_store::{EnqueueOutcome, Tenant};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::debug;

use crate::{tenant_tz, ProducerContext};

const WINDOW_START_HOURS: i64 = 24;
const WINDOW_END_HOURS: i64 = 40;
const REMINDER_LEAD_HOURS: i64 = 32;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PreVisitStats {
    pub examined: usize,
    pub enqueued: usize,
    pub skipped_already_sent: usize,
    pub skipped_opted_out: usize,
    /// A pending job for the same (tenant, booking, kind) already existed.
    pub skipped_pending: usize,
}

pub struct PreVisitProducer {
    ctx: ProducerContext,
    tenant_defaults: TenantSettings,
}

impl PreVisitProducer {
    pub fn new(ctx: ProducerContext, tenant_defaults: TenantSettings) -> Self {
        Self {
            ctx,
            tenant_defaults,
        }
    }

    pub async fn run_for_tenant(
        &self,
        tenant: &Tenant,
        now: DateTime<Utc>,
    ) -> anyhow::Result<PreVisitStats> {
        let settings =
            TenantSettings::from_value_with_defaults(&tenant.settings, &self.tenant_defaults);
        let tz = tenant_tz(tenant);

        let window_start = now + ChronoDuration::hours(WINDOW_START_HOURS);
        let window_end = now + ChronoDuration::hours(WINDOW_END_HOURS);
        let date_from = window_start.with_timezone(&tz).date_naive();
        let date_to = window_end.with_timezone(&tz).date_naive();

        // A page failure aborts the whole run; the next cron run catches up.
        let appointments =
            list_all_appointments(self.ctx.calendar.as_ref(), date_from, date_to).await?;

        let mut stats = PreVisitStats::default();
        for appointment in appointments {
            if !appointment.status.is_remindable() {
                continue;
            }
            let phone = match appointment.phone.as_deref().map(digits_only) {
                Some(digits) if !digits.is_empty() => digits,
                _ => continue,
            };
            if appointment.start < window_start || appointment.start > window_end {
                continue;
            }
            stats.examined += 1;

            let local_start = appointment.start.with_timezone(&tz);
            let local_date = local_start.date_naive();

            let key = dedupe::previsit(&appointment.id, local_date);
            if self.ctx.notifications.has_sent(&tenant.id, &key).await? {
                stats.skipped_already_sent += 1;
                continue;
            }
            if self
                .ctx
                .opt_outs
                .is_suppressed(&tenant.id, &phone, JobKind::PreVisit)
                .await?
            {
                stats.skipped_opted_out += 1;
                continue;
            }

            let spec = JobSpec {
                tenant_id: tenant.id.clone(),
                phone,
                kind: JobKind::PreVisit,
                run_at: appointment.start - ChronoDuration::hours(REMINDER_LEAD_HOURS),
                payload: JobPayload {
                    appointment_id: appointment.id.clone(),
                    service_id: appointment.service_id.clone(),
                    service_name: appointment.service_name.clone(),
                    professional_id: appointment.professional_id.clone(),
                    professional_name: appointment.professional_name.clone(),
                    appointment_date: local_date,
                    appointment_time: local_start.format("%H:%M").to_string(),
                    business_name: settings.business_name.clone(),
                    business_address: settings.business_address.clone(),
                },
                booking_id: appointment.id.clone(),
                max_attempts: settings.max_attempts as i32,
            };

            // Natural-key collisions with an existing pending job are benign.
            match self.ctx.jobs.enqueue(spec).await? {
                EnqueueOutcome::Created(_) => {
                    stats.enqueued += 1;
                    debug!(tenant_id = %tenant.id, appointment_id = %appointment.id, "Enqueued pre-visit reminder");
                }
                EnqueueOutcome::Duplicate(_) => stats.skipped_pending += 1,
            }
        }

        Ok(stats)
    }
}
