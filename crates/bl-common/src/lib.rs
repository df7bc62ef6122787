//! Shared domain types for the bookline messaging substrate.
//!
//! Everything that crosses a crate boundary lives here: the message job and
//! its state machine, notification-log records, opt-out/handoff records,
//! calendar entities, and the retry policy applied to outbound transmission.

pub mod logging;
pub mod retry;
pub mod templates;
pub mod text;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Message Jobs
// ============================================================================

/// What kind of scheduled message a job carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    PreVisit,
    NoShowCheck,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::PreVisit => "pre_visit",
            JobKind::NoShowCheck => "no_show_check",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pre_visit" => Some(JobKind::PreVisit),
            "no_show_check" => Some(JobKind::NoShowCheck),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a message job.
///
/// `Pending` is the only claimable state. `Sent`, `Canceled`,
/// `PermanentlyFailed` and `Skipped` are absorbing; `Failed` marks a fatal
/// outcome kept for inspection and is never reclaimed either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Sent,
    Failed,
    Canceled,
    PermanentlyFailed,
    Skipped,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Sent => "sent",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
            JobState::PermanentlyFailed => "permanently_failed",
            JobState::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "sent" => Some(JobState::Sent),
            "failed" => Some(JobState::Failed),
            "canceled" => Some(JobState::Canceled),
            "permanently_failed" => Some(JobState::PermanentlyFailed),
            "skipped" => Some(JobState::Skipped),
            _ => None,
        }
    }

    /// A terminal job is eligible for the retention sweep.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured body needed to render a message without another calendar
/// round-trip. Date and time are already in the tenant's local zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub appointment_id: String,
    pub service_id: String,
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub professional_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub professional_name: Option<String>,
    /// Appointment date in the tenant timezone (yyyy-mm-dd).
    pub appointment_date: NaiveDate,
    /// Appointment time in the tenant timezone (HH:MM).
    pub appointment_time: String,
    pub business_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_address: Option<String>,
}

/// One durably scheduled outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageJob {
    pub id: String,
    pub tenant_id: String,
    /// Recipient phone, digits-only E.164.
    pub phone: String,
    pub kind: JobKind,
    pub run_at: DateTime<Utc>,
    pub payload: JobPayload,
    pub state: JobState,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    /// Business booking id, for dedup and audit linkage.
    pub booking_id: String,
    /// Deterministic key this job records in the notification log on send.
    pub dedupe_key: String,
    pub claimed_by: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to enqueue a job; the store assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub tenant_id: String,
    pub phone: String,
    pub kind: JobKind,
    pub run_at: DateTime<Utc>,
    pub payload: JobPayload,
    pub booking_id: String,
    pub max_attempts: i32,
}

impl JobSpec {
    /// The notification-log key this job will claim when delivered.
    pub fn dedupe_key(&self) -> String {
        match self.kind {
            JobKind::PreVisit => format!(
                "previsit:{}:{}",
                self.payload.appointment_id, self.payload.appointment_date
            ),
            JobKind::NoShowCheck => format!(
                "noshow_question:{}:{}",
                self.payload.appointment_id, self.payload.appointment_date
            ),
        }
    }
}

/// A state transition applied through `JobStore::commit`.
#[derive(Debug, Clone)]
pub enum JobTransition {
    /// Outbound transmission succeeded (or the dedup index proved a prior
    /// send); job becomes `sent`.
    Sent,
    /// Retryable failure: attempts += 1, `run_at` extended monotonically to
    /// `next_run_at`, state stays `pending` unless the attempt cap is
    /// reached, in which case the job becomes `permanently_failed`.
    Retry {
        error: String,
        next_run_at: DateTime<Utc>,
    },
    /// Fatal, non-retryable failure.
    Fail { error: String },
    /// Operator or producer cancellation.
    Cancel { reason: String },
    /// Suppressed by the opt-out gate; no outbound attempt was made.
    Skip { reason: String },
    /// Handoff active: job returns to the pending pool with `run_at`
    /// pushed forward and the claim released. Attempts are not consumed.
    Release { next_run_at: DateTime<Utc> },
}

// ============================================================================
// Notification Log
// ============================================================================

/// Kind of evidence recorded in the notification log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Previsit,
    NoshowQuestion,
    NoshowYes,
    NoshowNo,
    Rebook,
    Audit,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Previsit => "previsit",
            NotificationKind::NoshowQuestion => "noshow_question",
            NotificationKind::NoshowYes => "noshow_yes",
            NotificationKind::NoshowNo => "noshow_no",
            NotificationKind::Rebook => "rebook",
            NotificationKind::Audit => "audit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "previsit" => Some(NotificationKind::Previsit),
            "noshow_question" => Some(NotificationKind::NoshowQuestion),
            "noshow_yes" => Some(NotificationKind::NoshowYes),
            "noshow_no" => Some(NotificationKind::NoshowNo),
            "rebook" => Some(NotificationKind::Rebook),
            "audit" => Some(NotificationKind::Audit),
        _ => None,
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only evidence that a send (or audit run) occurred.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub tenant_id: String,
    pub phone: String,
    pub dedupe_key: String,
    pub kind: NotificationKind,
    /// Snapshot at send time; carries `appointment_id` where applicable.
    pub payload: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

// ============================================================================
// Opt-Out & Handoff
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptOutKind {
    All,
    PreVisit,
    NoShowCheck,
}

impl OptOutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptOutKind::All => "all",
            OptOutKind::PreVisit => "pre_visit",
            OptOutKind::NoShowCheck => "no_show_check",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(OptOutKind::All),
            "pre_visit" => Some(OptOutKind::PreVisit),
            "no_show_check" => Some(OptOutKind::NoShowCheck),
            _ => None,
        }
    }
}

impl From<JobKind> for OptOutKind {
    fn from(kind: JobKind) -> Self {
        match kind {
            JobKind::PreVisit => OptOutKind::PreVisit,
            JobKind::NoShowCheck => OptOutKind::NoShowCheck,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptOutRecord {
    pub tenant_id: String,
    pub phone: String,
    pub kind: OptOutKind,
    pub created_at: DateTime<Utc>,
}

/// Operator-controlled pause of outbound traffic.
///
/// `phone = None` means the whole tenant. Expiry is evaluated by readers:
/// an expired record is equivalent to absence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub tenant_id: String,
    pub phone: Option<String>,
    pub enabled: bool,
    pub reason: String,
    pub opened_by: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl HandoffRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.expires_at.map_or(true, |exp| exp > now)
    }
}

// ============================================================================
// Calendar entities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    Canceled,
    Completed,
    NoShow,
    #[serde(other)]
    Unknown,
}

impl AppointmentStatus {
    /// Only these statuses get reminders and no-show questions.
    pub fn is_remindable(&self) -> bool {
        matches!(self, AppointmentStatus::Scheduled | AppointmentStatus::Confirmed)
    }
}

/// An appointment as reported by the external calendar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    #[serde(default)]
    pub phone: Option<String>,
    pub service_id: String,
    pub service_name: String,
    #[serde(default)]
    pub professional_id: Option<String>,
    #[serde(default)]
    pub professional_name: Option<String>,
    pub status: AppointmentStatus,
    pub start: DateTime<Utc>,
    /// Fields the calendar sends that we do not model.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A free slot offered for rebooking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub start: DateTime<Utc>,
    pub service_id: String,
    #[serde(default)]
    pub professional_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ============================================================================
// Dedupe key grammar
// ============================================================================

/// Deterministic notification-log keys. One logical outbound message maps to
/// exactly one key; (tenant, key) is unique in storage.
pub mod dedupe {
    use chrono::NaiveDate;

    pub fn previsit(appointment_id: &str, date: NaiveDate) -> String {
        format!("previsit:{appointment_id}:{date}")
    }

    pub fn noshow_question(appointment_id: &str, date: NaiveDate) -> String {
        format!("noshow_question:{appointment_id}:{date}")
    }

    pub fn noshow_yes(appointment_id: &str, date: NaiveDate) -> String {
        format!("noshow_yes:{appointment_id}:{date}")
    }

    pub fn noshow_no(appointment_id: &str, date: NaiveDate) -> String {
        format!("noshow_no:{appointment_id}:{date}")
    }

    pub fn rebook(appointment_id: &str, original_date: NaiveDate) -> String {
        format!("rebook:{appointment_id}:{original_date}")
    }

    pub fn audit_report(date: NaiveDate, tenant_id: &str) -> String {
        format!("audit_report:{date}:{tenant_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn job_state_roundtrip() {
        for state in [
            JobState::Pending,
            JobState::Sent,
            JobState::Failed,
            JobState::Canceled,
            JobState::PermanentlyFailed,
            JobState::Skipped,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("queued"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Pending.is_terminal());
        assert!(JobState::Sent.is_terminal());
        assert!(JobState::Skipped.is_terminal());
        assert!(JobState::PermanentlyFailed.is_terminal());
    }

    #[test]
    fn dedupe_key_grammar() {
        let date = NaiveDate::from_ymd_opt(2025, 2, 10).unwrap();
        assert_eq!(dedupe::previsit("ap1", date), "previsit:ap1:2025-02-10");
        assert_eq!(
            dedupe::noshow_question("ap1", date),
            "noshow_question:ap1:2025-02-10"
        );
        assert_eq!(dedupe::rebook("ap1", date), "rebook:ap1:2025-02-10");
        assert_eq!(dedupe::audit_report(date, "t1"), "audit_report:2025-02-10:t1");
    }

    #[test]
    fn optout_kind_from_job_kind() {
        assert_eq!(OptOutKind::from(JobKind::PreVisit), OptOutKind::PreVisit);
        assert_eq!(OptOutKind::from(JobKind::NoShowCheck), OptOutKind::NoShowCheck);
    }

    #[test]
    fn handoff_expiry_read_as_absent() {
        let now = Utc::now();
        let record = HandoffRecord {
            tenant_id: "t1".into(),
            phone: Some("5571900000001".into()),
            enabled: true,
            reason: "operator".into(),
            opened_by: "admin".into(),
            expires_at: Some(now - chrono::Duration::seconds(1)),
            created_at: now - chrono::Duration::hours(1),
        };
        assert!(!record.is_active(now));

        let open_ended = HandoffRecord {
            expires_at: None,
            ..record
        };
        assert!(open_ended.is_active(now));
    }

    #[test]
    fn appointment_status_passthrough() {
        let appt: Appointment = serde_json::from_value(serde_json::json!({
            "id": "ap1",
            "phone": "5571900000001",
            "service_id": "svc1",
            "service_name": "Corte",
            "status": "waiting_room",
            "start": "2025-02-10T17:00:00Z",
            "room": 3
        }))
        .unwrap();
        assert_eq!(appt.status, AppointmentStatus::Unknown);
        assert_eq!(appt.extra.get("room"), Some(&serde_json::json!(3)));
    }
}
