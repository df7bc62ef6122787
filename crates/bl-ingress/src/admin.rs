//! Token-authenticated admin surface.
//!
//! Operators pause recipients (handoff), inspect or remove opt-outs, and
//! rerun the audit for a date. The token is compared in constant time.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use bl_common::{HandoffRecord, OptOutKind};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::IngressContext;

type AdminResponse = (StatusCode, Json<serde_json::Value>);

fn unauthorized() -> AdminResponse {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": "unauthorized"})),
    )
}

fn internal(e: impl std::fmt::Display) -> AdminResponse {
    warn!(error = %e, "Admin request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": "internal error"})),
    )
}

fn ok(body: serde_json::Value) -> AdminResponse {
    (StatusCode::OK, Json(body))
}

/// Bearer-token check; an empty configured token disables the surface.
fn authorized(ctx: &IngressContext, headers: &HeaderMap) -> bool {
    if ctx.admin_token.is_empty() {
        return false;
    }
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    presented.len() == ctx.admin_token.len()
        && presented
            .as_bytes()
            .ct_eq(ctx.admin_token.as_bytes())
            .into()
}

#[derive(Debug, Deserialize)]
pub struct HandoffRequest {
    pub reason: String,
    #[serde(default)]
    pub opened_by: Option<String>,
    #[serde(default)]
    pub ttl_minutes: Option<i64>,
}

impl HandoffRequest {
    fn into_record(self, tenant_id: &str, phone: Option<String>) -> HandoffRecord {
        let now = Utc::now();
        HandoffRecord {
            tenant_id: tenant_id.to_string(),
            phone,
            enabled: true,
            reason: self.reason,
            opened_by: self.opened_by.unwrap_or_else(|| "admin".to_string()),
            expires_at: self.ttl_minutes.map(|m| now + ChronoDuration::minutes(m)),
            created_at: now,
        }
    }
}

/// PUT /admin/handoff/{tenant}/{phone}
pub async fn enable_handoff(
    State(ctx): State<IngressContext>,
    Path((tenant, phone)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<HandoffRequest>,
) -> AdminResponse {
    if !authorized(&ctx, &headers) {
        return unauthorized();
    }
    let record = request.into_record(&tenant, Some(phone.clone()));
    match ctx.handoffs.upsert_handoff(record).await {
        Ok(()) => {
            info!(tenant_id = %tenant, phone = %phone, "Handoff enabled");
            ok(serde_json::json!({"status": "enabled"}))
        }
        Err(e) => internal(e),
    }
}

/// DELETE /admin/handoff/{tenant}/{phone}
pub async fn disable_handoff(
    State(ctx): State<IngressContext>,
    Path((tenant, phone)): Path<(String, String)>,
    headers: HeaderMap,
) -> AdminResponse {
    if !authorized(&ctx, &headers) {
        return unauthorized();
    }
    match ctx.handoffs.clear_handoff(&tenant, Some(&phone)).await {
        Ok(removed) => ok(serde_json::json!({"removed": removed})),
        Err(e) => internal(e),
    }
}

/// PUT /admin/handoff/{tenant} — the tenant-global pause. A TTL is
/// required so a forgotten global pause cannot silence a tenant forever.
pub async fn enable_global_handoff(
    State(ctx): State<IngressContext>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    Json(request): Json<HandoffRequest>,
) -> AdminResponse {
    if !authorized(&ctx, &headers) {
        return unauthorized();
    }
    if request.ttl_minutes.is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "ttl_minutes is required for a global handoff"})),
        );
    }
    let record = request.into_record(&tenant, None);
    match ctx.handoffs.upsert_handoff(record).await {
        Ok(()) => {
            info!(tenant_id = %tenant, "Global handoff enabled");
            ok(serde_json::json!({"status": "enabled"}))
        }
        Err(e) => internal(e),
    }
}

/// DELETE /admin/handoff/{tenant}
pub async fn disable_global_handoff(
    State(ctx): State<IngressContext>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
) -> AdminResponse {
    if !authorized(&ctx, &headers) {
        return unauthorized();
    }
    match ctx.handoffs.clear_handoff(&tenant, None).await {
        Ok(removed) => ok(serde_json::json!({"removed": removed})),
        Err(e) => internal(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct HandoffListQuery {
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// GET /admin/handoffs?tenant_id=
pub async fn list_handoffs(
    State(ctx): State<IngressContext>,
    Query(query): Query<HandoffListQuery>,
    headers: HeaderMap,
) -> AdminResponse {
    if !authorized(&ctx, &headers) {
        return unauthorized();
    }
    match ctx
        .handoffs
        .list_active_handoffs(query.tenant_id.as_deref(), Utc::now())
        .await
    {
        Ok(records) => ok(serde_json::json!({"handoffs": records})),
        Err(e) => internal(e),
    }
}

/// POST /admin/audit/{tenant}/{date} — recompute one day's report. The
/// persisted report stays idempotent; the response always carries the
/// freshly computed divergences.
pub async fn rerun_audit(
    State(ctx): State<IngressContext>,
    Path((tenant_id, date)): Path<(String, String)>,
    headers: HeaderMap,
) -> AdminResponse {
    if !authorized(&ctx, &headers) {
        return unauthorized();
    }
    let Ok(date) = date.parse::<NaiveDate>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "date must be yyyy-mm-dd"})),
        );
    };
    let tenant = match ctx.tenants.get_tenant(&tenant_id).await {
        Ok(Some(tenant)) => tenant,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": "unknown tenant"})),
            )
        }
        Err(e) => return internal(e),
    };

    let today = Utc::now().date_naive();
    match ctx.audit.audit_day(&tenant, date, today).await {
        Ok(report) => {
            info!(tenant_id = %tenant_id, %date, divergences = report.divergences.len(), "Audit rerun");
            ok(serde_json::to_value(&report).unwrap_or_default())
        }
        Err(e) => internal(e),
    }
}

/// GET /admin/optouts/{tenant}/{phone}
pub async fn list_optouts(
    State(ctx): State<IngressContext>,
    Path((tenant, phone)): Path<(String, String)>,
    headers: HeaderMap,
) -> AdminResponse {
    if !authorized(&ctx, &headers) {
        return unauthorized();
    }
    match ctx.opt_outs.list_for_phone(&tenant, &phone).await {
        Ok(records) => ok(serde_json::json!({"opt_outs": records})),
        Err(e) => internal(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct OptOutRemoveQuery {
    #[serde(default)]
    pub kind: Option<String>,
}

/// DELETE /admin/optouts/{tenant}/{phone}?kind=
pub async fn remove_optout(
    State(ctx): State<IngressContext>,
    Path((tenant, phone)): Path<(String, String)>,
    Query(query): Query<OptOutRemoveQuery>,
    headers: HeaderMap,
) -> AdminResponse {
    if !authorized(&ctx, &headers) {
        return unauthorized();
    }
    let kind = match query.kind.as_deref() {
        None => OptOutKind::All,
        Some(raw) => match OptOutKind::parse(raw) {
            Some(kind) => kind,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": "unknown opt-out kind"})),
                )
            }
        },
    };
    match ctx.opt_outs.release(&tenant, &phone, kind).await {
        Ok(removed) => ok(serde_json::json!({"removed": removed})),
        Err(e) => internal(e),
    }
}
