//! No-show shield, phase 1: the D-1 confirmation question.
//!
//! For every remindable appointment on the tenant-local day after tomorrow's
//! eve (D+1), enqueue an immediate `no_show_check` job. The delivery worker
//! transmits the question, records the `noshow_question` key and opens the
//! pending-reply window; phase 2 lives in the ingress reply machine.

use bl_clients::calendar::list_all_appointments;
use bl_common::text::digits_only;
use bl_common::{dedupe, JobKind, JobPayload, JobSpec};
use bl_config::TenantSettings;
use bl_store::{EnqueueOutcome, Tenant};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::debug;

use crate::{tenant_tz, ProducerContext};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NoShowStats {
    pub examined: usize,
    pub enqueued: usize,
    pub skipped_already_sent: usize,
    pub skipped_opted_out: usize,
    pub skipped_pending: usize,
}

pub struct NoShowProducer {
    ctx: ProducerContext,
    tenant_defaults: TenantSettings,
}

impl NoShowProducer {
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
    ) -> anyhow::Result<NoShowStats> {
        let settings =
            TenantSettings::from_value_with_defaults(&tenant.settings, &self.tenant_defaults);
        let tz = tenant_tz(tenant);
        let tomorrow = (now.with_timezone(&tz) + ChronoDuration::days(1)).date_naive();

        let appointments =
            list_all_appointments(self.ctx.calendar.as_ref(), tomorrow, tomorrow).await?;

        let mut stats = NoShowStats::default();
        for appointment in appointments {
            if !appointment.status.is_remindable() {
                continue;
            }
            let phone = match appointment.phone.as_deref().map(digits_only) {
                Some(digits) if !digits.is_empty() => digits,
                _ => continue,
            };
            let local_start = appointment.start.with_timezone(&tz);
            if local_start.date_naive() != tomorrow {
                continue;
            }
            stats.examined += 1;

            let key = dedupe::noshow_question(&appointment.id, tomorrow);
            if self.ctx.notifications.has_sent(&tenant.id, &key).await? {
                stats.skipped_already_sent += 1;
                continue;
            }
            if self
                .ctx
                .opt_outs
                .is_suppressed(&tenant.id, &phone, JobKind::NoShowCheck)
                .await?
            {
                stats.skipped_opted_out += 1;
                continue;
            }

            let spec = JobSpec {
                tenant_id: tenant.id.clone(),
                phone,
                kind: JobKind::NoShowCheck,
                run_at: now,
                payload: JobPayload {
                    appointment_id: appointment.id.clone(),
                    service_id: appointment.service_id.clone(),
                    service_name: appointment.service_name.clone(),
                    professional_id: appointment.professional_id.clone(),
                    professional_name: appointment.professional_name.clone(),
                    appointment_date: tomorrow,
                    appointment_time: local_start.format("%H:%M").to_string(),
                    business_name: settings.business_name.clone(),
                    business_address: settings.business_address.clone(),
                },
                booking_id: appointment.id.clone(),
                max_attempts: settings.max_attempts as i32,
            };

            match self.ctx.jobs.enqueue(spec).await? {
                EnqueueOutcome::Created(_) => {
                    stats.enqueued += 1;
                    debug!(tenant_id = %tenant.id, appointment_id = %appointment.id, "Enqueued no-show question");
                }
                EnqueueOutcome::Duplicate(_) => stats.skipped_pending += 1,
            }
        }

        Ok(stats)
    }
}
