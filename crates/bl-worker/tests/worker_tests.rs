//! Delivery worker state-machine tests against the SQLite store, the
//! in-memory cache and a scripted gateway.

use async_trait::async_trait;
use bl_cache::{MemoryCache, PendingReplyStore};
use bl_clients::{ChatGateway, SendOutcome};
use bl_common::{
    dedupe, HandoffRecord, JobKind, JobPayload, JobSpec, JobState, NotificationKind, OptOutKind,
};
use bl_config::TenantSettings;
use bl_store::sqlite::SqliteStore;
use bl_store::{HandoffStore, JobStore, NotificationLog, OptOutStore, Tenant, TenantStore};
use bl_worker::{DeliveryWorker, DeliveryWorkerConfig, WorkerContext};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use parking_lot::Mutex;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

struct MockGateway {
    calls: Mutex<Vec<(String, String, String)>>,
    script: Mutex<VecDeque<SendOutcome>>,
}

impl MockGateway {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
        }
    }

    fn push_outcome(&self, outcome: SendOutcome) {
        self.script.lock().push_back(outcome);
    }

    fn calls(&self) -> Vec<(String, String, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ChatGateway for MockGateway {
    async fn send_text(&self, instance: &str, phone: &str, text: &str) -> SendOutcome {
        self.calls
            .lock()
            .push((instance.to_string(), phone.to_string(), text.to_string()));
        self.script
            .lock()
            .pop_front()
            .unwrap_or(SendOutcome::Delivered)
    }
}

struct Harness {
    store: Arc<SqliteStore>,
    cache: Arc<MemoryCache>,
    gateway: Arc<MockGateway>,
    worker: DeliveryWorker,
}

async fn harness() -> Harness {
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

    let cache = Arc::new(MemoryCache::new());
    let gateway = Arc::new(MockGateway::new());

    let ctx = WorkerContext {
        jobs: store.clone(),
        notifications: store.clone(),
        opt_outs: store.clone(),
        handoffs: store.clone(),
        tenants: store.clone(),
        pending_replies: cache.clone(),
        gateway: gateway.clone(),
    };
    // Zero poll interval so back-to-back run_cycle calls both claim.
    let config = DeliveryWorkerConfig {
        inter_message_delay: Duration::from_millis(0),
        tenant_defaults: TenantSettings {
            poll_interval_secs: 0,
            ..TenantSettings::default()
        },
        ..Default::default()
    };

    Harness {
        store: store.clone(),
        cache,
        gateway,
        worker: DeliveryWorker::new(ctx, config),
    }
}

fn payload() -> JobPayload {
    JobPayload {
        appointment_id: "ap1".into(),
        service_id: "svc1".into(),
        service_name: "Corte".into(),
        professional_id: Some("pro1".into()),
        professional_name: Some("Ana".into()),
        appointment_date: NaiveDate::from_ymd_opt(2025, 2, 10).unwrap(),
        appointment_time: "14:00".into(),
        business_name: "Studio Dez".into(),
        business_address: None,
    }
}

fn due_spec(kind: JobKind, max_attempts: i32) -> JobSpec {
    JobSpec {
        tenant_id: "t1".into(),
        phone: "5571900000001".into(),
        kind,
        run_at: Utc::now() - ChronoDuration::minutes(1),
        payload: payload(),
        booking_id: "bk1".into(),
        max_attempts,
    }
}

#[tokio::test]
async fn previsit_happy_path_sends_and_records() {
    let h = harness().await;
    let outcome = h.store.enqueue(due_spec(JobKind::PreVisit, 3)).await.unwrap();
    let id = outcome.id().to_string();

    let processed = h.worker.run_cycle("w1").await.unwrap();
    assert_eq!(processed, 1);

    let calls = h.gateway.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "inst-1");
    assert_eq!(calls[0].1, "5571900000001");
    assert!(calls[0].2.contains("Corte"));
    assert!(calls[0].2.contains("14:00"));

    let job = h.store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Sent);

    let date = NaiveDate::from_ymd_opt(2025, 2, 10).unwrap();
    assert!(h
        .store
        .has_sent("t1", &dedupe::previsit("ap1", date))
        .await
        .unwrap());
}

#[tokio::test]
async fn existing_dedupe_record_suppresses_transmit() {
    let h = harness().await;
    let date = NaiveDate::from_ymd_opt(2025, 2, 10).unwrap();
    // A previous worker transmitted and crashed before committing.
    h.store
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

    let outcome = h.store.enqueue(due_spec(JobKind::PreVisit, 3)).await.unwrap();
    h.worker.run_cycle("w1").await.unwrap();

    assert!(h.gateway.calls().is_empty(), "no second outbound call");
    let job = h.store.get_job(outcome.id()).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Sent);
}

#[tokio::test]
async fn opted_out_job_is_skipped_without_attempt() {
    let h = harness().await;
    h.store
        .register("t1", "5571900000001", OptOutKind::All)
        .await
        .unwrap();

    let outcome = h.store.enqueue(due_spec(JobKind::PreVisit, 3)).await.unwrap();
    h.worker.run_cycle("w1").await.unwrap();

    assert!(h.gateway.calls().is_empty());
    let job = h.store.get_job(outcome.id()).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Skipped);
    assert_eq!(job.last_error.as_deref(), Some("opted out"));
    assert_eq!(job.attempts, 0);
}

#[tokio::test]
async fn active_handoff_returns_job_with_grace() {
    let h = harness().await;
    let now = Utc::now();
    h.store
        .upsert_handoff(HandoffRecord {
            tenant_id: "t1".into(),
            phone: Some("5571900000001".into()),
            enabled: true,
            reason: "operator".into(),
            opened_by: "admin".into(),
            expires_at: None,
            created_at: now,
        })
        .await
        .unwrap();

    let outcome = h.store.enqueue(due_spec(JobKind::PreVisit, 3)).await.unwrap();
    h.worker.run_cycle("w1").await.unwrap();

    assert!(h.gateway.calls().is_empty());
    let job = h.store.get_job(outcome.id()).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0, "handoff must not consume attempts");
    // Default grace is 5 minutes.
    assert!(job.run_at >= now + ChronoDuration::minutes(4));
}

#[tokio::test]
async fn transient_failure_backs_off_and_stays_pending() {
    let h = harness().await;
    h.gateway.push_outcome(SendOutcome::Retryable {
        status: Some(503),
        retry_after: None,
        error: "HTTP 503".into(),
    });

    let now = Utc::now();
    let outcome = h.store.enqueue(due_spec(JobKind::PreVisit, 3)).await.unwrap();
    h.worker.run_cycle("w1").await.unwrap();

    let job = h.store.get_job(outcome.id()).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("HTTP 503"));
    assert!(job.run_at > now);

    // Backoff holds: an immediate second cycle claims nothing.
    h.worker.run_cycle("w1").await.unwrap();
    assert_eq!(h.gateway.calls().len(), 1);
}

#[tokio::test]
async fn permanent_rejection_fails_the_job() {
    let h = harness().await;
    h.gateway.push_outcome(SendOutcome::Rejected {
        status: 404,
        error: "HTTP 404: unknown number".into(),
    });

    let outcome = h.store.enqueue(due_spec(JobKind::PreVisit, 3)).await.unwrap();
    h.worker.run_cycle("w1").await.unwrap();

    let job = h.store.get_job(outcome.id()).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.last_error.unwrap().contains("404"));
}

#[tokio::test]
async fn last_allowed_attempt_exhausts_to_permanently_failed() {
    let h = harness().await;
    h.gateway.push_outcome(SendOutcome::Retryable {
        status: Some(502),
        retry_after: None,
        error: "HTTP 502".into(),
    });

    let outcome = h.store.enqueue(due_spec(JobKind::PreVisit, 1)).await.unwrap();
    h.worker.run_cycle("w1").await.unwrap();

    let job = h.store.get_job(outcome.id()).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::PermanentlyFailed);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn noshow_question_records_key_and_pending_reply() {
    let h = harness().await;
    let outcome = h
        .store
        .enqueue(due_spec(JobKind::NoShowCheck, 3))
        .await
        .unwrap();

    h.worker.run_cycle("w1").await.unwrap();

    let job = h.store.get_job(outcome.id()).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Sent);

    let date = NaiveDate::from_ymd_opt(2025, 2, 10).unwrap();
    assert!(h
        .store
        .has_sent("t1", &dedupe::noshow_question("ap1", date))
        .await
        .unwrap());

    let pending = PendingReplyStore::get(h.cache.as_ref(), "t1", "5571900000001")
        .await
        .unwrap()
        .expect("pending reply stored");
    assert_eq!(pending.appointment_id, "ap1");
    assert_eq!(pending.appointment_date, date);
}

#[tokio::test]
async fn same_recipient_jobs_are_serialized_across_cycles() {
    let h = harness().await;
    let first = h.store.enqueue(due_spec(JobKind::PreVisit, 3)).await.unwrap();

    let mut second_spec = due_spec(JobKind::NoShowCheck, 3);
    second_spec.booking_id = "bk2".into();
    second_spec.run_at = Utc::now() - ChronoDuration::seconds(30);
    let second = h.store.enqueue(second_spec).await.unwrap();

    // First cycle only touches the earlier job for this phone.
    let processed = h.worker.run_cycle("w1").await.unwrap();
    assert_eq!(processed, 1);
    assert_eq!(
        h.store.get_job(first.id()).await.unwrap().unwrap().state,
        JobState::Sent
    );
    assert_eq!(
        h.store.get_job(second.id()).await.unwrap().unwrap().state,
        JobState::Pending
    );

    let processed = h.worker.run_cycle("w1").await.unwrap();
    assert_eq!(processed, 1);
    assert_eq!(
        h.store.get_job(second.id()).await.unwrap().unwrap().state,
        JobState::Sent
    );
}

#[tokio::test]
async fn tenant_batch_size_bounds_each_cycle() {
    let h = harness().await;
    // This tenant caps claims at one job per poll.
    h.store
        .upsert_tenant(Tenant {
            id: "t1".into(),
            name: "Studio Dez".into(),
            timezone: "America/Sao_Paulo".into(),
            settings: serde_json::json!({"instance": "inst-1", "batch_size": 1}),
            active: true,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let mut first = due_spec(JobKind::PreVisit, 3);
    first.phone = "5571900000001".into();
    let mut second = due_spec(JobKind::PreVisit, 3);
    second.phone = "5571900000002".into();
    second.booking_id = "bk2".into();
    h.store.enqueue(first).await.unwrap();
    h.store.enqueue(second).await.unwrap();

    let processed = h.worker.run_cycle("w1").await.unwrap();
    assert_eq!(processed, 1, "per-tenant batch size honored");
    let processed = h.worker.run_cycle("w1").await.unwrap();
    assert_eq!(processed, 1);
}

#[tokio::test]
async fn tenant_poll_interval_gates_claim_cadence() {
    let h = harness().await;
    // This tenant polls at most once per hour; the second cycle within the
    // window must not claim.
    h.store
        .upsert_tenant(Tenant {
            id: "t1".into(),
            name: "Studio Dez".into(),
            timezone: "America/Sao_Paulo".into(),
            settings: serde_json::json!({"instance": "inst-1", "poll_interval_secs": 3600}),
            active: true,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let mut second_spec = due_spec(JobKind::NoShowCheck, 3);
    second_spec.phone = "5571900000002".into();
    second_spec.booking_id = "bk2".into();
    h.store.enqueue(due_spec(JobKind::PreVisit, 3)).await.unwrap();
    h.store.enqueue(second_spec).await.unwrap();

    let processed = h.worker.run_cycle("w1").await.unwrap();
    assert_eq!(processed, 2);
    let processed = h.worker.run_cycle("w1").await.unwrap();
    assert_eq!(processed, 0, "tenant not due again within its interval");
}
