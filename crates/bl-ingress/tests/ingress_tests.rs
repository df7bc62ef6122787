//! Inbound pipeline tests: opt-out short-circuit, the no-show reply
//! machine, dedupe, dialogue fallthrough and the admin surface.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use bl_cache::{MemoryCache, PendingReply, PendingReplyStore};
use bl_clients::{
    AppointmentsPage, CalendarApi, CalendarError, ChatGateway, RebookOutcome, SendOutcome,
};
use bl_common::{Appointment, JobKind, OptOutKind, Slot};
use bl_config::TenantSettings;
use bl_ingress::{
    process_inbound, router, InboundMessage, InboundOutcome, IngressContext, NoopDialogue,
    WebhookEnvelope,
};
use bl_scheduler::{AuditReconciler, ProducerContext};
use bl_store::sqlite::SqliteStore;
use bl_store::{HandoffStore, NotificationLog, OptOutStore, Tenant, TenantStore};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use tower::ServiceExt;

struct MockGateway {
    calls: Mutex<Vec<(String, String, String)>>,
}

impl MockGateway {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<(String, String, String)> {
        self.calls.lock().clone()
    }

    fn last_text(&self) -> Option<String> {
        self.calls.lock().last().map(|(_, _, text)| text.clone())
    }
}

#[async_trait]
impl ChatGateway for MockGateway {
    async fn send_text(&self, instance: &str, phone: &str, text: &str) -> SendOutcome {
        self.calls
            .lock()
            .push((instance.to_string(), phone.to_string(), text.to_string()));
        SendOutcome::Delivered
    }
}

struct MockCalendar {
    slots: Vec<Slot>,
    rebook_calls: Mutex<Vec<(String, DateTime<Utc>, String)>>,
    rebook_outcome: RebookOutcome,
}

impl MockCalendar {
    fn new(slots: Vec<Slot>) -> Self {
        Self {
            slots,
            rebook_calls: Mutex::new(Vec::new()),
            rebook_outcome: RebookOutcome::Confirmed,
        }
    }

    fn conflicting(slots: Vec<Slot>) -> Self {
        Self {
            rebook_outcome: RebookOutcome::Conflict,
            ..Self::new(slots)
        }
    }

    fn rebook_calls(&self) -> Vec<(String, DateTime<Utc>, String)> {
        self.rebook_calls.lock().clone()
    }
}

#[async_trait]
impl CalendarApi for MockCalendar {
    async fn list_appointments(
        &self,
        _date_from: NaiveDate,
        _date_to: NaiveDate,
        _page: u32,
    ) -> Result<AppointmentsPage, CalendarError> {
        Ok(AppointmentsPage {
            items: Vec::new(),
            total_pages: 1,
        })
    }

    async fn get_appointment(&self, _id: &str) -> Result<Option<Appointment>, CalendarError> {
        Ok(None)
    }

    async fn search_slots(
        &self,
        _service_id: &str,
        _professional_id: Option<&str>,
        _starting_at: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Slot>, CalendarError> {
        Ok(self.slots.iter().take(limit as usize).cloned().collect())
    }

    async fn rebook(
        &self,
        appointment_id: &str,
        new_start: DateTime<Utc>,
        _service_id: &str,
        _professional_id: Option<&str>,
        idempotency_key: &str,
    ) -> Result<RebookOutcome, CalendarError> {
        self.rebook_calls.lock().push((
            appointment_id.to_string(),
            new_start,
            idempotency_key.to_string(),
        ));
        Ok(self.rebook_outcome.clone())
    }

    async fn create_booking(
        &self,
        _payload: Value,
        _idempotency_key: &str,
    ) -> Result<Value, CalendarError> {
        Ok(serde_json::json!({}))
    }
}

struct Harness {
    store: Arc<SqliteStore>,
    cache: Arc<MemoryCache>,
    gateway: Arc<MockGateway>,
    calendar: Arc<MockCalendar>,
    ctx: IngressContext,
}

async fn harness(slots: Vec<Slot>) -> Harness {
    harness_with_calendar(Arc::new(MockCalendar::new(slots))).await
}

async fn harness_with_calendar(calendar: Arc<MockCalendar>) -> Harness {
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

    let audit = Arc::new(AuditReconciler::new(
        ProducerContext {
            jobs: store.clone(),
            notifications: store.clone(),
            opt_outs: store.clone(),
            tenants: store.clone(),
            calendar: calendar.clone(),
        },
        TenantSettings::default(),
    ));

    let ctx = IngressContext {
        tenants: store.clone(),
        notifications: store.clone(),
        opt_outs: store.clone(),
        handoffs: store.clone(),
        pending_replies: cache.clone(),
        slot_offers: cache.clone(),
        idempotency: cache.clone(),
        inbound_dedupe: cache.clone(),
        gateway: gateway.clone(),
        calendar: calendar.clone(),
        dialogue: Arc::new(NoopDialogue),
        audit,
        tenant_defaults: TenantSettings::default(),
        admin_token: "secret".into(),
    };

    Harness {
        store,
        cache,
        gateway,
        calendar,
        ctx,
    }
}

fn envelope(text: &str, timestamp: i64) -> WebhookEnvelope {
    WebhookEnvelope {
        event: "messages.upsert".into(),
        instance: Some("inst-1".into()),
        message: InboundMessage {
            from_me: false,
            remote_id: "5571900000001@s.whatsapp.net".into(),
            text: Some(text.into()),
            caption: None,
            timestamp,
            push_name: Some("Maria".into()),
            extra: serde_json::Map::new(),
        },
        extra: serde_json::Map::new(),
    }
}

async fn put_pending(h: &Harness) {
    let pending = PendingReply {
        appointment_id: "ap1".into(),
        service_id: "svc1".into(),
        professional_id: Some("pro1".into()),
        appointment_date: NaiveDate::from_ymd_opt(2025, 2, 10).unwrap(),
        question_sent_at: Utc::now(),
    };
    h.cache.put("t1", "5571900000001", &pending).await.unwrap();
}

fn slot(start: &str) -> Slot {
    Slot {
        start: start.parse().unwrap(),
        service_id: "svc1".into(),
        professional_id: Some("pro1".into()),
        extra: serde_json::Map::new(),
    }
}

#[tokio::test]
async fn own_messages_are_ignored() {
    let h = harness(Vec::new()).await;
    let mut env = envelope("oi", 1);
    env.message.from_me = true;

    let outcome = process_inbound(&h.ctx, "inst-1", env).await.unwrap();
    assert_eq!(outcome, InboundOutcome::IgnoredFromMe);
    assert!(h.gateway.calls().is_empty());
}

#[tokio::test]
async fn unknown_instance_is_rejected() {
    let h = harness(Vec::new()).await;
    let outcome = process_inbound(&h.ctx, "inst-9", envelope("oi", 1))
        .await
        .unwrap();
    assert_eq!(outcome, InboundOutcome::UnknownInstance);
}

#[tokio::test]
async fn redelivered_webhook_is_processed_once() {
    let h = harness(Vec::new()).await;
    let first = process_inbound(&h.ctx, "inst-1", envelope("parar", 42))
        .await
        .unwrap();
    assert_eq!(first, InboundOutcome::OptOutRegistered);

    let second = process_inbound(&h.ctx, "inst-1", envelope("parar", 42))
        .await
        .unwrap();
    assert_eq!(second, InboundOutcome::DuplicateDelivery);
    // Only the first delivery produced an acknowledgment.
    assert_eq!(h.gateway.calls().len(), 1);
}

#[tokio::test]
async fn optout_keyword_registers_and_acknowledges() {
    let h = harness(Vec::new()).await;
    let outcome = process_inbound(&h.ctx, "inst-1", envelope("PARAR!", 1))
        .await
        .unwrap();
    assert_eq!(outcome, InboundOutcome::OptOutRegistered);

    assert!(h
        .store
        .is_suppressed("t1", "5571900000001", JobKind::PreVisit)
        .await
        .unwrap());
    assert!(h
        .store
        .is_suppressed("t1", "5571900000001", JobKind::NoShowCheck)
        .await
        .unwrap());

    let calls = h.gateway.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "inst-1");
    assert!(calls[0].2.contains("não vai mais receber"));
}

#[tokio::test]
async fn optin_keyword_releases_suppression() {
    let h = harness(Vec::new()).await;
    h.store
        .register("t1", "5571900000001", OptOutKind::All)
        .await
        .unwrap();

    let outcome = process_inbound(&h.ctx, "inst-1", envelope("voltar", 1))
        .await
        .unwrap();
    assert_eq!(outcome, InboundOutcome::OptInRegistered);
    assert!(!h
        .store
        .is_suppressed("t1", "5571900000001", JobKind::PreVisit)
        .await
        .unwrap());
}

#[tokio::test]
async fn yes_reply_confirms_and_clears_pending() {
    let h = harness(Vec::new()).await;
    put_pending(&h).await;

    let outcome = process_inbound(&h.ctx, "inst-1", envelope("sim", 1))
        .await
        .unwrap();
    assert!(matches!(outcome, InboundOutcome::ReplyHandled(_)));

    assert!(h
        .store
        .has_sent("t1", "noshow_yes:ap1:2025-02-10")
        .await
        .unwrap());
    assert!(
        PendingReplyStore::get(h.cache.as_ref(), "t1", "5571900000001")
            .await
            .unwrap()
            .is_none(),
        "pending reply consumed"
    );
    assert!(h.gateway.last_text().unwrap().contains("confirmada"));
}

#[tokio::test]
async fn no_reply_offers_slots_then_digit_rebooks() {
    // 10:00, 11:00 (-03:00) on Feb 11 and 09:00 on Feb 12.
    let h = harness(vec![
        slot("2025-02-11T13:00:00Z"),
        slot("2025-02-11T14:00:00Z"),
        slot("2025-02-12T12:00:00Z"),
    ])
    .await;
    put_pending(&h).await;

    let outcome = process_inbound(&h.ctx, "inst-1", envelope("não", 1))
        .await
        .unwrap();
    assert!(matches!(outcome, InboundOutcome::ReplyHandled(_)));

    assert!(h
        .store
        .has_sent("t1", "noshow_no:ap1:2025-02-10")
        .await
        .unwrap());

    let list = h.gateway.last_text().unwrap();
    assert!(list.contains("1) 11/02/2025 às 10:00"));
    assert!(list.contains("2) 11/02/2025 às 11:00"));
    assert!(list.contains("3) 12/02/2025 às 09:00"));

    // The pending reply survives the offer.
    assert!(
        PendingReplyStore::get(h.cache.as_ref(), "t1", "5571900000001")
            .await
            .unwrap()
            .is_some()
    );

    // Picking option 2 rebooks onto the 11:00 slot.
    let outcome = process_inbound(&h.ctx, "inst-1", envelope("2", 2))
        .await
        .unwrap();
    assert!(matches!(outcome, InboundOutcome::ReplyHandled(_)));

    let rebooks = h.calendar.rebook_calls();
    assert_eq!(rebooks.len(), 1);
    assert_eq!(rebooks[0].0, "ap1");
    assert_eq!(rebooks[0].1, "2025-02-11T14:00:00Z".parse::<DateTime<Utc>>().unwrap());
    assert!(!rebooks[0].2.is_empty(), "idempotency key supplied");

    assert!(h
        .store
        .has_sent("t1", "rebook:ap1:2025-02-10")
        .await
        .unwrap());
    let ack = h.gateway.last_text().unwrap();
    assert!(ack.contains("11:00"));
    assert!(
        PendingReplyStore::get(h.cache.as_ref(), "t1", "5571900000001")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn duplicate_digit_pick_does_not_rebook_twice() {
    let h = harness(vec![slot("2025-02-11T13:00:00Z")]).await;
    put_pending(&h).await;

    process_inbound(&h.ctx, "inst-1", envelope("nao", 1))
        .await
        .unwrap();
    process_inbound(&h.ctx, "inst-1", envelope("1", 2))
        .await
        .unwrap();
    assert_eq!(h.calendar.rebook_calls().len(), 1);

    // Replaying the pick (new delivery, same slot) hits the completed
    // idempotency entry: acknowledged again, no second calendar call.
    put_pending(&h).await;
    h.ctx
        .slot_offers
        .put("t1", "5571900000001", &[slot("2025-02-11T13:00:00Z")])
        .await
        .unwrap();

    process_inbound(&h.ctx, "inst-1", envelope("1", 3))
        .await
        .unwrap();
    assert_eq!(h.calendar.rebook_calls().len(), 1, "no duplicate rebook");
}

#[tokio::test]
async fn rebook_conflict_falls_back_and_clears_state() {
    let h = harness_with_calendar(Arc::new(MockCalendar::conflicting(vec![slot(
        "2025-02-11T13:00:00Z",
    )])))
    .await;
    put_pending(&h).await;

    process_inbound(&h.ctx, "inst-1", envelope("nao", 1))
        .await
        .unwrap();
    process_inbound(&h.ctx, "inst-1", envelope("1", 2))
        .await
        .unwrap();

    assert_eq!(h.calendar.rebook_calls().len(), 1);
    assert!(!h.store.has_sent("t1", "rebook:ap1:2025-02-10").await.unwrap());
    assert!(h.gateway.last_text().unwrap().contains("Não consegui remarcar"));
    assert!(
        PendingReplyStore::get(h.cache.as_ref(), "t1", "5571900000001")
            .await
            .unwrap()
            .is_none(),
        "pending cleared after fallback"
    );
}

#[tokio::test]
async fn unrecognized_reply_keeps_pending_and_asks_again() {
    let h = harness(Vec::new()).await;
    put_pending(&h).await;

    let outcome = process_inbound(&h.ctx, "inst-1", envelope("talvez amanhã?", 1))
        .await
        .unwrap();
    assert!(matches!(outcome, InboundOutcome::ReplyHandled(_)));
    assert!(h.gateway.last_text().unwrap().contains("não entendi"));
    assert!(
        PendingReplyStore::get(h.cache.as_ref(), "t1", "5571900000001")
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn optout_wins_over_pending_for_its_own_keywords() {
    let h = harness(Vec::new()).await;
    put_pending(&h).await;

    // "parar" is not part of the reply vocabulary, so even with a pending
    // question it registers the opt-out.
    let outcome = process_inbound(&h.ctx, "inst-1", envelope("parar", 1))
        .await
        .unwrap();
    assert_eq!(outcome, InboundOutcome::OptOutRegistered);
}

#[tokio::test]
async fn without_pending_reply_yes_falls_through_to_dialogue() {
    let h = harness(Vec::new()).await;
    let outcome = process_inbound(&h.ctx, "inst-1", envelope("sim", 1))
        .await
        .unwrap();
    assert_eq!(outcome, InboundOutcome::DialogueSilent);
    assert!(h
        .store
        .list_for_phone("t1", "5571900000001")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn admin_requires_bearer_token() {
    let h = harness(Vec::new()).await;
    let app = router(h.ctx.clone());

    let request = Request::builder()
        .method("PUT")
        .uri("/admin/handoff/t1/5571900000001")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"reason": "vip"}"#))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("PUT")
        .uri("/admin/handoff/t1/5571900000001")
        .header("content-type", "application/json")
        .header("authorization", "Bearer secret")
        .body(Body::from(r#"{"reason": "vip", "ttl_minutes": 60}"#))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let active = h
        .store
        .find_active("t1", "5571900000001", Utc::now())
        .await
        .unwrap();
    assert!(active.is_some());
}

#[tokio::test]
async fn global_handoff_requires_ttl() {
    let h = harness(Vec::new()).await;
    let app = router(h.ctx.clone());

    let request = Request::builder()
        .method("PUT")
        .uri("/admin/handoff/t1")
        .header("content-type", "application/json")
        .header("authorization", "Bearer secret")
        .body(Body::from(r#"{"reason": "maintenance"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_endpoint_is_open() {
    let h = harness(Vec::new()).await;
    let app = router(h.ctx);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
