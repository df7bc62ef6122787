//! Producer and reconciler tests against the SQLite store and a scripted
//! calendar.

use async_trait::async_trait;
use bl_clients::{AppointmentsPage, CalendarApi, CalendarError, RebookOutcome};
use bl_common::{
    dedupe, Appointment, AppointmentStatus, JobKind, NotificationKind, OptOutKind, Slot,
};
use bl_config::{SchedulerConfig, TenantSettings};
use bl_scheduler::{
    AuditReconciler, CronScheduler, DivergenceKind, NoShowProducer, PreVisitProducer,
    ProducerContext, Severity,
};
use bl_store::sqlite::SqliteStore;
use bl_store::{JobStore, NotificationLog, OptOutStore, Tenant, TenantStore};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct MockCalendar {
    appointments: Vec<Appointment>,
    list_calls: AtomicU32,
}

impl MockCalendar {
    fn new(appointments: Vec<Appointment>) -> Self {
        Self {
            appointments,
            list_calls: AtomicU32::new(0),
        }
    }

    fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CalendarApi for MockCalendar {
    async fn list_appointments(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
        _page: u32,
    ) -> Result<AppointmentsPage, CalendarError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let items = self
            .appointments
            .iter()
            .filter(|a| {
                let date = a.start.date_naive();
                date >= date_from && date <= date_to
            })
            .cloned()
            .collect();
        Ok(AppointmentsPage {
            items,
            total_pages: 1,
        })
    }

    async fn get_appointment(&self, id: &str) -> Result<Option<Appointment>, CalendarError> {
        Ok(self.appointments.iter().find(|a| a.id == id).cloned())
    }

    async fn search_slots(
        &self,
        _service_id: &str,
        _professional_id: Option<&str>,
        _starting_at: DateTime<Utc>,
        _limit: u32,
    ) -> Result<Vec<Slot>, CalendarError> {
        Ok(Vec::new())
    }

    async fn rebook(
        &self,
        _appointment_id: &str,
        _new_start: DateTime<Utc>,
        _service_id: &str,
        _professional_id: Option<&str>,
        _idempotency_key: &str,
    ) -> Result<RebookOutcome, CalendarError> {
        Ok(RebookOutcome::Confirmed)
    }

    async fn create_booking(
        &self,
        _payload: Value,
        _idempotency_key: &str,
    ) -> Result<Value, CalendarError> {
        Ok(serde_json::json!({}))
    }
}

fn appointment(id: &str, phone: Option<&str>, status: AppointmentStatus, start: &str) -> Appointment {
    Appointment {
        id: id.to_string(),
        phone: phone.map(str::to_string),
        service_id: "svc1".to_string(),
        service_name: "Corte".to_string(),
        professional_id: Some("pro1".to_string()),
        professional_name: Some("Ana".to_string()),
        status,
        start: start.parse().unwrap(),
        extra: serde_json::Map::new(),
    }
}

async fn store_with_tenant() -> Arc<SqliteStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = Arc::new(SqliteStore::new(pool));
    store.init_schema().await.unwrap();
    store
        .upsert_tenant(Tenant {
            id: "t1".into(),
            name: "Studio Dez".into(),
            timezone: "America/Sao_Paulo".into(),
            settings: serde_json::json!({"instance": "inst-1", "business_name": "Studio Dez"}),
            active: true,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    store
}

fn context(store: &Arc<SqliteStore>, calendar: Arc<MockCalendar>) -> ProducerContext {
    ProducerContext {
        jobs: store.clone(),
        notifications: store.clone(),
        opt_outs: store.clone(),
        tenants: store.clone(),
        calendar,
    }
}

async fn tenant(store: &Arc<SqliteStore>) -> Tenant {
    store.get_tenant("t1").await.unwrap().unwrap()
}

const LEASE: Duration = Duration::from_secs(600);

#[tokio::test]
async fn previsit_schedules_at_start_minus_32h() {
    let store = store_with_tenant().await;
    // 14:00 -03:00 on Feb 10 = 17:00 UTC.
    let calendar = Arc::new(MockCalendar::new(vec![appointment(
        "ap1",
        Some("5571900000001"),
        AppointmentStatus::Scheduled,
        "2025-02-10T17:00:00Z",
    )]));
    let producer = PreVisitProducer::new(context(&store, calendar), TenantSettings::default());

    let now: DateTime<Utc> = "2025-02-09T09:00:00Z".parse().unwrap();
    let stats = producer
        .run_for_tenant(&tenant(&store).await, now)
        .await
        .unwrap();
    assert_eq!(stats.enqueued, 1);

    // run_at = start - 32h = exactly `now` in this scenario.
    let batch = store.claim_batch("t1", now, 10, "w1", LEASE).await.unwrap();
    assert_eq!(batch.len(), 1);
    let job = &batch[0];
    assert_eq!(job.kind, JobKind::PreVisit);
    assert_eq!(job.run_at, now);
    assert_eq!(
        job.payload.appointment_date,
        NaiveDate::from_ymd_opt(2025, 2, 10).unwrap()
    );
    assert_eq!(job.payload.appointment_time, "14:00");
    assert_eq!(job.payload.business_name, "Studio Dez");
    assert_eq!(job.dedupe_key, "previsit:ap1:2025-02-10");
}

#[tokio::test]
async fn previsit_rerun_creates_nothing_new() {
    let store = store_with_tenant().await;
    let calendar = Arc::new(MockCalendar::new(vec![appointment(
        "ap1",
        Some("5571900000001"),
        AppointmentStatus::Scheduled,
        "2025-02-10T17:00:00Z",
    )]));
    let producer = PreVisitProducer::new(context(&store, calendar), TenantSettings::default());
    let now: DateTime<Utc> = "2025-02-09T09:00:00Z".parse().unwrap();
    let t = tenant(&store).await;

    let first = producer.run_for_tenant(&t, now).await.unwrap();
    assert_eq!(first.enqueued, 1);

    // While the job is still pending, the natural key absorbs the rerun.
    let second = producer.run_for_tenant(&t, now).await.unwrap();
    assert_eq!(second.enqueued, 0);
    assert_eq!(second.skipped_pending, 1);

    // After the worker delivered it, the notification log absorbs the rerun.
    let batch = store.claim_batch("t1", now, 10, "w1", LEASE).await.unwrap();
    store
        .commit(&batch[0].id, bl_common::JobTransition::Sent)
        .await
        .unwrap();
    let date = NaiveDate::from_ymd_opt(2025, 2, 10).unwrap();
    store
        .record_sent(
            "t1",
            &dedupe::previsit("ap1", date),
            NotificationKind::Previsit,
            "5571900000001",
            serde_json::json!({"appointment_id": "ap1"}),
            Some(date),
        )
        .await
        .unwrap();

    let third = producer.run_for_tenant(&t, now).await.unwrap();
    assert_eq!(third.enqueued, 0);
    assert_eq!(third.skipped_already_sent, 1);
}

#[tokio::test]
async fn previsit_ignores_out_of_window_and_unremindable() {
    let store = store_with_tenant().await;
    let calendar = Arc::new(MockCalendar::new(vec![
        // Starts in 2 hours: too close.
        appointment(
            "ap-soon",
            Some("5571900000001"),
            AppointmentStatus::Scheduled,
            "2025-02-09T11:00:00Z",
        ),
        // Canceled: not remindable.
        appointment(
            "ap-cancel",
            Some("5571900000002"),
            AppointmentStatus::Canceled,
            "2025-02-10T17:00:00Z",
        ),
        // No phone.
        appointment("ap-nophone", None, AppointmentStatus::Scheduled, "2025-02-10T17:00:00Z"),
    ]));
    let producer = PreVisitProducer::new(context(&store, calendar), TenantSettings::default());
    let now: DateTime<Utc> = "2025-02-09T09:00:00Z".parse().unwrap();

    let stats = producer
        .run_for_tenant(&tenant(&store).await, now)
        .await
        .unwrap();
    assert_eq!(stats.enqueued, 0);
    assert!(store.claim_batch("t1", now, 10, "w1", LEASE).await.unwrap().is_empty());
}

#[tokio::test]
async fn previsit_respects_optout() {
    let store = store_with_tenant().await;
    store
        .register("t1", "5571900000001", OptOutKind::PreVisit)
        .await
        .unwrap();
    let calendar = Arc::new(MockCalendar::new(vec![appointment(
        "ap1",
        Some("5571900000001"),
        AppointmentStatus::Scheduled,
        "2025-02-10T17:00:00Z",
    )]));
    let producer = PreVisitProducer::new(context(&store, calendar), TenantSettings::default());
    let now: DateTime<Utc> = "2025-02-09T09:00:00Z".parse().unwrap();

    let stats = producer
        .run_for_tenant(&tenant(&store).await, now)
        .await
        .unwrap();
    assert_eq!(stats.enqueued, 0);
    assert_eq!(stats.skipped_opted_out, 1);
}

#[tokio::test]
async fn noshow_enqueues_question_for_tomorrow() {
    let store = store_with_tenant().await;
    let calendar = Arc::new(MockCalendar::new(vec![
        appointment(
            "ap1",
            Some("5571900000001"),
            AppointmentStatus::Confirmed,
            "2025-02-10T17:00:00Z",
        ),
        // Tomorrow but canceled.
        appointment(
            "ap2",
            Some("5571900000002"),
            AppointmentStatus::Canceled,
            "2025-02-10T18:00:00Z",
        ),
    ]));
    let producer = NoShowProducer::new(context(&store, calendar), TenantSettings::default());
    // 18:00 -03:00 on Feb 9 = 21:00 UTC; tomorrow local is Feb 10.
    let now: DateTime<Utc> = "2025-02-09T21:00:00Z".parse().unwrap();

    let stats = producer
        .run_for_tenant(&tenant(&store).await, now)
        .await
        .unwrap();
    assert_eq!(stats.enqueued, 1);

    let batch = store.claim_batch("t1", now, 10, "w1", LEASE).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].kind, JobKind::NoShowCheck);
    assert_eq!(batch[0].dedupe_key, "noshow_question:ap1:2025-02-10");
    // The question goes out immediately.
    assert!(batch[0].run_at <= now);
}

#[tokio::test]
async fn audit_detects_missing_notification() {
    let store = store_with_tenant().await;
    let calendar = Arc::new(MockCalendar::new(vec![appointment(
        "ap1",
        Some("5571900000001"),
        AppointmentStatus::Scheduled,
        "2025-02-10T17:00:00Z",
    )]));
    let reconciler = AuditReconciler::new(context(&store, calendar), TenantSettings::default());
    let t = tenant(&store).await;

    let date = NaiveDate::from_ymd_opt(2025, 2, 10).unwrap();
    let today = NaiveDate::from_ymd_opt(2025, 2, 11).unwrap();
    let report = reconciler.audit_day(&t, date, today).await.unwrap();

    assert_eq!(report.divergences.len(), 1);
    let divergence = &report.divergences[0];
    assert_eq!(divergence.kind, DivergenceKind::MissingNotification);
    assert_eq!(divergence.severity, Severity::High);
    assert_eq!(divergence.appointment_id.as_deref(), Some("ap1"));

    // The report itself is idempotent evidence.
    assert!(store
        .has_sent("t1", "audit_report:2025-02-10:t1")
        .await
        .unwrap());
}

#[tokio::test]
async fn audit_detects_orphan_and_status_mismatch() {
    let store = store_with_tenant().await;
    let date = NaiveDate::from_ymd_opt(2025, 2, 10).unwrap();

    // Notification for an appointment the calendar no longer returns.
    store
        .record_sent(
            "t1",
            &dedupe::previsit("ghost", date),
            NotificationKind::Previsit,
            "5571900000009",
            serde_json::json!({"appointment_id": "ghost"}),
            Some(date),
        )
        .await
        .unwrap();
    // Notification for an appointment that was later canceled.
    store
        .record_sent(
            "t1",
            &dedupe::previsit("ap2", date),
            NotificationKind::Previsit,
            "5571900000002",
            serde_json::json!({"appointment_id": "ap2"}),
            Some(date),
        )
        .await
        .unwrap();

    let calendar = Arc::new(MockCalendar::new(vec![appointment(
        "ap2",
        Some("5571900000002"),
        AppointmentStatus::Canceled,
        "2025-02-10T17:00:00Z",
    )]));
    let reconciler = AuditReconciler::new(context(&store, calendar), TenantSettings::default());
    let t = tenant(&store).await;

    let today = NaiveDate::from_ymd_opt(2025, 2, 15).unwrap();
    let report = reconciler.audit_day(&t, date, today).await.unwrap();

    let kinds: Vec<DivergenceKind> = report.divergences.iter().map(|d| d.kind).collect();
    assert!(kinds.contains(&DivergenceKind::OrphanNotification));
    assert!(kinds.contains(&DivergenceKind::StatusMismatch));

    // Five days old: orphans decay to Low, mismatches stay Medium.
    for divergence in &report.divergences {
        match divergence.kind {
            DivergenceKind::OrphanNotification => {
                assert_eq!(divergence.severity, Severity::Low)
            }
            DivergenceKind::StatusMismatch => {
                assert_eq!(divergence.severity, Severity::Medium)
            }
            other => panic!("unexpected divergence {other:?}"),
        }
    }
}

#[tokio::test]
async fn audit_rerun_skips_reported_days() {
    let store = store_with_tenant().await;
    let calendar = Arc::new(MockCalendar::new(Vec::new()));
    let mut defaults = TenantSettings::default();
    defaults.audit_days = 2;
    let reconciler = AuditReconciler::new(context(&store, calendar), defaults);
    let t = tenant(&store).await;

    let now: DateTime<Utc> = "2025-02-11T05:00:00Z".parse().unwrap();
    let first = reconciler.run_for_tenant(&t, now).await.unwrap();
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|r| !r.already_reported));

    let second = reconciler.run_for_tenant(&t, now).await.unwrap();
    assert!(second.iter().all(|r| r.already_reported));
}

#[tokio::test]
async fn scheduler_tick_fires_once_per_local_day() {
    let store = store_with_tenant().await;
    let calendar = Arc::new(MockCalendar::new(Vec::new()));
    let scheduler = CronScheduler::new(
        context(&store, calendar.clone()),
        SchedulerConfig::default(),
        TenantSettings::default(),
    );

    // 18:05 local (-03:00) on Feb 9: past the pre-visit hour and the audit hour.
    let now: DateTime<Utc> = "2025-02-09T21:05:00Z".parse().unwrap();
    scheduler.tick(now).await.unwrap();
    let calls_after_first = calendar.list_calls();
    assert!(calls_after_first > 0);

    // Same day, later tick: the latch holds, nothing re-runs.
    let later: DateTime<Utc> = "2025-02-09T21:35:00Z".parse().unwrap();
    scheduler.tick(later).await.unwrap();
    assert_eq!(calendar.list_calls(), calls_after_first);

    // Next local day: producers fire again.
    let next_day: DateTime<Utc> = "2025-02-10T21:05:00Z".parse().unwrap();
    scheduler.tick(next_day).await.unwrap();
    assert!(calendar.list_calls() > calls_after_first);
}

#[tokio::test]
async fn scheduler_respects_disabled_flags() {
    let store = store_with_tenant().await;
    store
        .upsert_tenant(Tenant {
            id: "t1".into(),
            name: "Studio Dez".into(),
            timezone: "America/Sao_Paulo".into(),
            settings: serde_json::json!({
                "instance": "inst-1",
                "previsit_enabled": false,
                "noshow_enabled": false,
                "audit_enabled": false
            }),
            active: true,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let calendar = Arc::new(MockCalendar::new(vec![appointment(
        "ap1",
        Some("5571900000001"),
        AppointmentStatus::Scheduled,
        "2025-02-10T17:00:00Z",
    )]));
    let scheduler = CronScheduler::new(
        context(&store, calendar.clone()),
        SchedulerConfig::default(),
        TenantSettings::default(),
    );

    let now: DateTime<Utc> = "2025-02-09T21:05:00Z".parse().unwrap();
    scheduler.tick(now).await.unwrap();
    assert_eq!(calendar.list_calls(), 0);
    assert_eq!(
        store.claim_batch("t1", now, 10, "w1", LEASE).await.unwrap().len(),
        0
    );
}
