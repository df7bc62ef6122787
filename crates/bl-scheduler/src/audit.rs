//! Daily audit reconciler.
//!
//! Diffs the calendar's appointment set against the notification log for
//! each of the previous N days and emits divergences. The report itself is
//! persisted as a notification-log entry under `audit_report:{date}:{tenant}`
//! so a rerun of the same day is a no-op. Divergences are evidence, not
//! remediation.

use bl_clients::calendar::list_all_appointments;
use bl_common::{dedupe, Appointment, NotificationKind, NotificationRecord};
use bl_config::TenantSettings;
use bl_store::{RecordOutcome, Tenant};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::{tenant_tz, ProducerContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    /// A remindable appointment with a phone got no notification.
    MissingNotification,
    /// A notification references an appointment the calendar does not have.
    OrphanNotification,
    /// Appointment and notification disagree (e.g. canceled but reminded).
    StatusMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Divergence {
    pub kind: DivergenceKind,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appointment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub tenant_id: String,
    pub date: NaiveDate,
    pub appointments: usize,
    pub notifications: usize,
    pub divergences: Vec<Divergence>,
    /// True when the report was already persisted by an earlier run.
    pub already_reported: bool,
}

/// Freshness-driven severity: the closer the audited day, the more urgent
/// the divergence. Status mismatches never drop below Medium.
fn severity_for(kind: DivergenceKind, age_days: i64) -> Severity {
    let base = match age_days {
        0 | 1 => Severity::High,
        2 | 3 => Severity::Medium,
        _ => Severity::Low,
    };
    if kind == DivergenceKind::StatusMismatch {
        base.max(Severity::Medium)
    } else {
        base
    }
}

pub struct AuditReconciler {
    ctx: ProducerContext,
    tenant_defaults: TenantSettings,
}

impl AuditReconciler {
    pub fn new(ctx: ProducerContext, tenant_defaults: TenantSettings) -> Self {
        Self {
            ctx,
            tenant_defaults,
        }
    }

    /// Audit the previous `audit_days` tenant-local days. Days whose report
    /// already exists are skipped without touching the calendar.
    pub async fn run_for_tenant(
        &self,
        tenant: &Tenant,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<AuditReport>> {
        let settings =
            TenantSettings::from_value_with_defaults(&tenant.settings, &self.tenant_defaults);
        let today = now.with_timezone(&tenant_tz(tenant)).date_naive();

        let mut reports = Vec::new();
        for offset in 1..=i64::from(settings.audit_days) {
            let date = today - ChronoDuration::days(offset);

            let report_key = dedupe::audit_report(date, &tenant.id);
            if self.ctx.notifications.has_sent(&tenant.id, &report_key).await? {
                debug!(tenant_id = %tenant.id, %date, "Audit already reported");
                reports.push(AuditReport {
                    tenant_id: tenant.id.clone(),
                    date,
                    appointments: 0,
                    notifications: 0,
                    divergences: Vec::new(),
                    already_reported: true,
                });
                continue;
            }

            reports.push(self.audit_day(tenant, date, today).await?);
        }
        Ok(reports)
    }

    /// Reconcile one day and persist the report. Used by the cron run and by
    /// the admin rerun endpoint (which recomputes even if a report exists;
    /// persistence stays idempotent).
    pub async fn audit_day(
        &self,
        tenant: &Tenant,
        date: NaiveDate,
        today: NaiveDate,
    ) -> anyhow::Result<AuditReport> {
        let tz = tenant_tz(tenant);
        let appointments =
            list_all_appointments(self.ctx.calendar.as_ref(), date, date).await?;
        let appointments: Vec<Appointment> = appointments
            .into_iter()
            .filter(|a| a.start.with_timezone(&tz).date_naive() == date)
            .collect();

        let notifications = self.ctx.notifications.list_for_date(&tenant.id, date).await?;
        // The audit's own reports never count as delivery evidence.
        let notifications: Vec<NotificationRecord> = notifications
            .into_iter()
            .filter(|n| n.kind != NotificationKind::Audit)
            .collect();

        let by_id: HashMap<&str, &Appointment> =
            appointments.iter().map(|a| (a.id.as_str(), a)).collect();

        let mut by_appt: HashMap<String, Vec<&NotificationRecord>> = HashMap::new();
        for notification in &notifications {
            if let Some(appointment_id) = notification
                .payload
                .get("appointment_id")
                .and_then(|v| v.as_str())
            {
                by_appt
                    .entry(appointment_id.to_string())
                    .or_default()
                    .push(notification);
            }
        }

        let age_days = (today - date).num_days();
        let mut divergences = Vec::new();

        // Remindable appointments that never produced a notification.
        for appointment in &appointments {
            let has_phone = appointment
                .phone
                .as_deref()
                .map(|p| !p.trim().is_empty())
                .unwrap_or(false);
            if appointment.status.is_remindable()
                && has_phone
                && !by_appt.contains_key(appointment.id.as_str())
            {
                divergences.push(Divergence {
                    kind: DivergenceKind::MissingNotification,
                    severity: severity_for(DivergenceKind::MissingNotification, age_days),
                    appointment_id: Some(appointment.id.clone()),
                    dedupe_key: None,
                    detail: format!(
                        "appointment {} ({:?}) has no notification",
                        appointment.id, appointment.status
                    ),
                });
            }
        }

        // Notifications whose appointment the calendar does not know.
        for notification in &notifications {
            let appointment_id = notification
                .payload
                .get("appointment_id")
                .and_then(|v| v.as_str());
            match appointment_id {
                Some(id) if by_id.contains_key(id) => {}
                Some(id) => divergences.push(Divergence {
                    kind: DivergenceKind::OrphanNotification,
                    severity: severity_for(DivergenceKind::OrphanNotification, age_days),
                    appointment_id: Some(id.to_string()),
                    dedupe_key: Some(notification.dedupe_key.clone()),
                    detail: format!(
                        "notification {} references unknown appointment {}",
                        notification.dedupe_key, id
                    ),
                }),
                None => divergences.push(Divergence {
                    kind: DivergenceKind::OrphanNotification,
                    severity: severity_for(DivergenceKind::OrphanNotification, age_days),
                    appointment_id: None,
                    dedupe_key: Some(notification.dedupe_key.clone()),
                    detail: format!(
                        "notification {} carries no appointment id",
                        notification.dedupe_key
                    ),
                }),
            }
        }

        // Appointment/notification pairs in incompatible states.
        for appointment in &appointments {
            if appointment.status.is_remindable() {
                continue;
            }
            if let Some(sent) = by_appt.get(appointment.id.as_str()) {
                for notification in sent {
                    divergences.push(Divergence {
                        kind: DivergenceKind::StatusMismatch,
                        severity: severity_for(DivergenceKind::StatusMismatch, age_days),
                        appointment_id: Some(appointment.id.clone()),
                        dedupe_key: Some(notification.dedupe_key.clone()),
                        detail: format!(
                            "appointment {} is {:?} but notification {} was sent",
                            appointment.id, appointment.status, notification.dedupe_key
                        ),
                    });
                }
            }
        }

        let report = AuditReport {
            tenant_id: tenant.id.clone(),
            date,
            appointments: appointments.len(),
            notifications: notifications.len(),
            divergences,
            already_reported: false,
        };

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for divergence in &report.divergences {
            let key = match divergence.kind {
                DivergenceKind::MissingNotification => "missing_notification",
                DivergenceKind::OrphanNotification => "orphan_notification",
                DivergenceKind::StatusMismatch => "status_mismatch",
            };
            *counts.entry(key).or_default() += 1;
        }

        let outcome = self
            .ctx
            .notifications
            .record_sent(
                &tenant.id,
                &dedupe::audit_report(date, &tenant.id),
                NotificationKind::Audit,
                "",
                serde_json::json!({
                    "date": date,
                    "appointments": report.appointments,
                    "notifications": report.notifications,
                    "counts": counts,
                    "divergences": report.divergences,
                }),
                Some(date),
            )
            .await?;

        if outcome == RecordOutcome::Inserted {
            info!(
                tenant_id = %tenant.id,
                %date,
                divergences = report.divergences.len(),
                "Audit report persisted"
            );
        }

        Ok(report)
    }
}
