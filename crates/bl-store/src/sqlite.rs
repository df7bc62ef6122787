//! SQLite store implementation.
//!
//! Used by the test suite and for local development. SQLite's single-writer
//! model makes the single-statement claim UPDATE atomic without row locks.

use async_trait::async_trait;
use bl_common::{
    HandoffRecord, JobKind, JobSpec, JobState, JobTransition, MessageJob, NotificationKind,
    NotificationRecord, OptOutKind, OptOutRecord,
};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::repository::{
    CatalogStore, EnqueueOutcome, HandoffStore, JobStore, NotificationLog, OptOutStore,
    RecordOutcome, Result, ServiceCatalogEntry, StoreError, Tenant, TenantStore,
};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                timezone TEXT NOT NULL,
                settings TEXT NOT NULL,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS message_jobs (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                phone TEXT NOT NULL,
                kind TEXT NOT NULL,
                run_at TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                last_error TEXT,
                booking_id TEXT NOT NULL,
                dedupe_key TEXT NOT NULL,
                claimed_by TEXT,
                lease_until TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_message_jobs_pending_natural
                ON message_jobs(tenant_id, booking_id, kind) WHERE state = 'pending';
            CREATE INDEX IF NOT EXISTS idx_message_jobs_claim
                ON message_jobs(state, run_at);
            CREATE INDEX IF NOT EXISTS idx_message_jobs_tenant
                ON message_jobs(tenant_id);

            CREATE TABLE IF NOT EXISTS notification_log (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                phone TEXT NOT NULL,
                dedupe_key TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                ref_date TEXT,
                sent_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_notification_log_dedupe
                ON notification_log(tenant_id, dedupe_key);
            CREATE INDEX IF NOT EXISTS idx_notification_log_ref_date
                ON notification_log(tenant_id, ref_date);

            CREATE TABLE IF NOT EXISTS opt_outs (
                tenant_id TEXT NOT NULL,
                phone TEXT NOT NULL,
                kind TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, phone, kind)
            );

            CREATE TABLE IF NOT EXISTS handoffs (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                phone TEXT,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                reason TEXT NOT NULL,
                opened_by TEXT NOT NULL,
                expires_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_handoffs_tenant ON handoffs(tenant_id);

            CREATE TABLE IF NOT EXISTS service_catalog (
                tenant_id TEXT NOT NULL,
                service_id TEXT NOT NULL,
                name TEXT NOT NULL,
                normalized_name TEXT NOT NULL,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                client_visible BOOLEAN NOT NULL DEFAULT TRUE,
                duration_min INTEGER NOT NULL DEFAULT 30,
                price_cents INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (tenant_id, service_id)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_service_catalog_name
                ON service_catalog(tenant_id, normalized_name);
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Initialized SQLite schema");
        Ok(())
    }

    fn parse_job_row(row: &sqlx::sqlite::SqliteRow) -> Result<MessageJob> {
        let kind_str: String = row.get("kind");
        let kind = JobKind::parse(&kind_str)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown job kind: {kind_str}")))?;
        let state_str: String = row.get("state");
        let state = JobState::parse(&state_str)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown job state: {state_str}")))?;
        let payload_str: String = row.get("payload");

        Ok(MessageJob {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            phone: row.get("phone"),
            kind,
            run_at: row.get("run_at"),
            payload: serde_json::from_str(&payload_str)?,
            state,
            attempts: row.get("attempts"),
            max_attempts: row.get("max_attempts"),
            last_error: row.get("last_error"),
            booking_id: row.get("booking_id"),
            dedupe_key: row.get("dedupe_key"),
            claimed_by: row.get("claimed_by"),
            lease_until: row.get("lease_until"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn parse_notification_row(row: &sqlx::sqlite::SqliteRow) -> Result<NotificationRecord> {
        let kind_str: String = row.get("kind");
        let kind = NotificationKind::parse(&kind_str)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown notification kind: {kind_str}")))?;
        let payload_str: String = row.get("payload");

        Ok(NotificationRecord {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            phone: row.get("phone"),
            dedupe_key: row.get("dedupe_key"),
            kind,
            payload: serde_json::from_str(&payload_str)?,
            sent_at: row.get("sent_at"),
        })
    }

    fn parse_handoff_row(row: &sqlx::sqlite::SqliteRow) -> HandoffRecord {
        HandoffRecord {
            tenant_id: row.get("tenant_id"),
            phone: row.get("phone"),
            enabled: row.get("enabled"),
            reason: row.get("reason"),
            opened_by: row.get("opened_by"),
            expires_at: row.get("expires_at"),
            created_at: row.get("created_at"),
        }
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn enqueue(&self, spec: JobSpec) -> Result<EnqueueOutcome> {
        let payload = serde_json::to_string(&spec.payload)?;
        let dedupe_key = spec.dedupe_key();
        let now = Utc::now();

        for _ in 0..2 {
            let id = Uuid::new_v4().to_string();
            let result = sqlx::query(
                r#"
                INSERT INTO message_jobs
                    (id, tenant_id, phone, kind, run_at, payload, state, attempts,
                     max_attempts, booking_id, dedupe_key, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, ?8, ?9, ?10, ?10)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&id)
            .bind(&spec.tenant_id)
            .bind(&spec.phone)
            .bind(spec.kind.as_str())
            .bind(spec.run_at)
            .bind(&payload)
            .bind(spec.max_attempts)
            .bind(&spec.booking_id)
            .bind(&dedupe_key)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                debug!(job_id = %id, kind = %spec.kind, "Enqueued message job");
                return Ok(EnqueueOutcome::Created(id));
            }

            let existing = sqlx::query(
                "SELECT id FROM message_jobs \
                 WHERE tenant_id = ?1 AND booking_id = ?2 AND kind = ?3 AND state = 'pending'",
            )
            .bind(&spec.tenant_id)
            .bind(&spec.booking_id)
            .bind(spec.kind.as_str())
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = existing {
                return Ok(EnqueueOutcome::Duplicate(row.get("id")));
            }
            // The conflicting row transitioned between insert and select;
            // one more insert attempt will succeed.
        }

        Err(StoreError::Corrupt(
            "enqueue raced with concurrent transitions twice".into(),
        ))
    }

    async fn claim_batch(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
        max: u32,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Vec<MessageJob>> {
        let lease_until =
            now + ChronoDuration::from_std(lease).unwrap_or_else(|_| ChronoDuration::minutes(10));

        let rows = sqlx::query(
            r#"
            UPDATE message_jobs
            SET claimed_by = ?3, lease_until = ?4, updated_at = ?1
            WHERE id IN (
                SELECT id FROM (
                    SELECT id, run_at,
                           ROW_NUMBER() OVER (
                               PARTITION BY phone ORDER BY run_at, id
                           ) AS rn
                    FROM message_jobs
                    WHERE tenant_id = ?5
                      AND state = 'pending'
                      AND run_at <= ?1
                      AND attempts < max_attempts
                      AND (lease_until IS NULL OR lease_until <= ?1)
                )
                WHERE rn = 1
                ORDER BY run_at, id
                LIMIT ?2
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(max as i64)
        .bind(worker_id)
        .bind(lease_until)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            jobs.push(Self::parse_job_row(row)?);
        }
        jobs.sort_by(|a, b| a.run_at.cmp(&b.run_at).then_with(|| a.id.cmp(&b.id)));

        debug!(tenant_id, count = jobs.len(), worker_id = %worker_id, "Claimed job batch");
        Ok(jobs)
    }

    async fn commit(&self, id: &str, transition: JobTransition) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT state, attempts, max_attempts, run_at FROM message_jobs WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(StoreError::JobNotFound(id.to_string()));
        };

        let state: String = row.get("state");
        if state != "pending" {
            // Terminal states are absorbing; a late commit is a no-op.
            tx.rollback().await?;
            return Ok(());
        }

        match transition {
            JobTransition::Sent => {
                sqlx::query(
                    "UPDATE message_jobs SET state = 'sent', claimed_by = NULL, \
                     lease_until = NULL, updated_at = ?2 WHERE id = ?1",
                )
                .bind(id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            JobTransition::Retry { error, next_run_at } => {
                let attempts: i32 = row.get("attempts");
                let max_attempts: i32 = row.get("max_attempts");
                let run_at: DateTime<Utc> = row.get("run_at");
                let new_attempts = attempts + 1;

                if new_attempts >= max_attempts {
                    sqlx::query(
                        "UPDATE message_jobs SET state = 'permanently_failed', attempts = ?2, \
                         last_error = ?3, claimed_by = NULL, lease_until = NULL, updated_at = ?4 \
                         WHERE id = ?1",
                    )
                    .bind(id)
                    .bind(new_attempts)
                    .bind(&error)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                } else {
                    // run_at only ever moves forward.
                    let next = next_run_at.max(run_at);
                    sqlx::query(
                        "UPDATE message_jobs SET attempts = ?2, last_error = ?3, run_at = ?4, \
                         claimed_by = NULL, lease_until = NULL, updated_at = ?5 WHERE id = ?1",
                    )
                    .bind(id)
                    .bind(new_attempts)
                    .bind(&error)
                    .bind(next)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            JobTransition::Fail { error } => {
                sqlx::query(
                    "UPDATE message_jobs SET state = 'failed', last_error = ?2, \
                     claimed_by = NULL, lease_until = NULL, updated_at = ?3 WHERE id = ?1",
                )
                .bind(id)
                .bind(&error)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            JobTransition::Cancel { reason } => {
                sqlx::query(
                    "UPDATE message_jobs SET state = 'canceled', last_error = ?2, \
                     claimed_by = NULL, lease_until = NULL, updated_at = ?3 WHERE id = ?1",
                )
                .bind(id)
                .bind(&reason)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            JobTransition::Skip { reason } => {
                sqlx::query(
                    "UPDATE message_jobs SET state = 'skipped', last_error = ?2, \
                     claimed_by = NULL, lease_until = NULL, updated_at = ?3 WHERE id = ?1",
                )
                .bind(id)
                .bind(&reason)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            JobTransition::Release { next_run_at } => {
                let run_at: DateTime<Utc> = row.get("run_at");
                let next = next_run_at.max(run_at);
                sqlx::query(
                    "UPDATE message_jobs SET run_at = ?2, claimed_by = NULL, \
                     lease_until = NULL, updated_at = ?3 WHERE id = ?1",
                )
                .bind(id)
                .bind(next)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE message_jobs SET claimed_by = NULL, lease_until = NULL, updated_at = ?1 \
             WHERE state = 'pending' AND lease_until IS NOT NULL AND lease_until <= ?1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM message_jobs WHERE state != 'pending' AND updated_at < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_job(&self, id: &str) -> Result<Option<MessageJob>> {
        let row = sqlx::query("SELECT * FROM message_jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::parse_job_row).transpose()
    }
}

#[async_trait]
impl NotificationLog for SqliteStore {
    async fn record_sent(
        &self,
        tenant_id: &str,
        dedupe_key: &str,
        kind: NotificationKind,
        phone: &str,
        payload: Value,
        ref_date: Option<NaiveDate>,
    ) -> Result<RecordOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO notification_log
                (id, tenant_id, phone, dedupe_key, kind, payload, ref_date, sent_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(tenant_id)
        .bind(phone)
        .bind(dedupe_key)
        .bind(kind.as_str())
        .bind(serde_json::to_string(&payload)?)
        .bind(ref_date)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(RecordOutcome::Inserted)
        } else {
            debug!(tenant_id, dedupe_key, "Notification already recorded");
            Ok(RecordOutcome::Duplicate)
        }
    }

    async fn has_sent(&self, tenant_id: &str, dedupe_key: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM notification_log WHERE tenant_id = ?1 AND dedupe_key = ?2 LIMIT 1",
        )
        .bind(tenant_id)
        .bind(dedupe_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn list_for_date(
        &self,
        tenant_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<NotificationRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM notification_log WHERE tenant_id = ?1 AND ref_date = ?2 \
             ORDER BY sent_at ASC",
        )
        .bind(tenant_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(Self::parse_notification_row(row)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl OptOutStore for SqliteStore {
    async fn register(&self, tenant_id: &str, phone: &str, kind: OptOutKind) -> Result<()> {
        sqlx::query(
            "INSERT INTO opt_outs (tenant_id, phone, kind, created_at) \
             VALUES (?1, ?2, ?3, ?4) ON CONFLICT DO NOTHING",
        )
        .bind(tenant_id)
        .bind(phone)
        .bind(kind.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_suppressed(&self, tenant_id: &str, phone: &str, kind: JobKind) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM opt_outs WHERE tenant_id = ?1 AND phone = ?2 \
             AND kind IN ('all', ?3) LIMIT 1",
        )
        .bind(tenant_id)
        .bind(phone)
        .bind(OptOutKind::from(kind).as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn release(&self, tenant_id: &str, phone: &str, kind: OptOutKind) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM opt_outs WHERE tenant_id = ?1 AND phone = ?2 AND kind = ?3",
        )
        .bind(tenant_id)
        .bind(phone)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_for_phone(&self, tenant_id: &str, phone: &str) -> Result<Vec<OptOutRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM opt_outs WHERE tenant_id = ?1 AND phone = ?2 ORDER BY kind",
        )
        .bind(tenant_id)
        .bind(phone)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let kind_str: String = row.get("kind");
            let kind = OptOutKind::parse(&kind_str)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown opt-out kind: {kind_str}")))?;
            records.push(OptOutRecord {
                tenant_id: row.get("tenant_id"),
                phone: row.get("phone"),
                kind,
                created_at: row.get("created_at"),
            });
        }
        Ok(records)
    }
}

#[async_trait]
impl HandoffStore for SqliteStore {
    async fn upsert_handoff(&self, record: HandoffRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM handoffs WHERE tenant_id = ?1 AND phone IS ?2")
            .bind(&record.tenant_id)
            .bind(&record.phone)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO handoffs \
             (id, tenant_id, phone, enabled, reason, opened_by, expires_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&record.tenant_id)
        .bind(&record.phone)
        .bind(record.enabled)
        .bind(&record.reason)
        .bind(&record.opened_by)
        .bind(record.expires_at)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn clear_handoff(&self, tenant_id: &str, phone: Option<&str>) -> Result<bool> {
        let result = sqlx::query("DELETE FROM handoffs WHERE tenant_id = ?1 AND phone IS ?2")
            .bind(tenant_id)
            .bind(phone)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_active(
        &self,
        tenant_id: &str,
        phone: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<HandoffRecord>> {
        // Recipient-specific records win over the tenant-global switch.
        let row = sqlx::query(
            "SELECT * FROM handoffs WHERE tenant_id = ?1 AND enabled \
             AND (phone = ?2 OR phone IS NULL) \
             AND (expires_at IS NULL OR expires_at > ?3) \
             ORDER BY phone IS NULL LIMIT 1",
        )
        .bind(tenant_id)
        .bind(phone)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::parse_handoff_row))
    }

    async fn list_active_handoffs(
        &self,
        tenant_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<HandoffRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM handoffs WHERE enabled \
             AND (?1 IS NULL OR tenant_id = ?1) \
             AND (expires_at IS NULL OR expires_at > ?2) \
             ORDER BY tenant_id, phone IS NULL, phone",
        )
        .bind(tenant_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::parse_handoff_row).collect())
    }
}

#[async_trait]
impl CatalogStore for SqliteStore {
    async fn upsert_service(&self, entry: ServiceCatalogEntry) -> Result<()> {
        let normalized = bl_common::text::normalize(&entry.name);
        sqlx::query(
            r#"
            INSERT INTO service_catalog
                (tenant_id, service_id, name, normalized_name, active,
                 client_visible, duration_min, price_cents)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (tenant_id, service_id) DO UPDATE SET
                name = excluded.name,
                normalized_name = excluded.normalized_name,
                active = excluded.active,
                client_visible = excluded.client_visible,
                duration_min = excluded.duration_min,
                price_cents = excluded.price_cents
            "#,
        )
        .bind(&entry.tenant_id)
        .bind(&entry.service_id)
        .bind(&entry.name)
        .bind(&normalized)
        .bind(entry.active)
        .bind(entry.client_visible)
        .bind(entry.duration_min)
        .bind(entry.price_cents)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_service_by_name(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Option<ServiceCatalogEntry>> {
        let normalized = bl_common::text::normalize(name);
        let row = sqlx::query(
            "SELECT * FROM service_catalog WHERE tenant_id = ?1 AND normalized_name = ?2",
        )
        .bind(tenant_id)
        .bind(&normalized)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| ServiceCatalogEntry {
            tenant_id: row.get("tenant_id"),
            service_id: row.get("service_id"),
            name: row.get("name"),
            normalized_name: row.get("normalized_name"),
            active: row.get("active"),
            client_visible: row.get("client_visible"),
            duration_min: row.get("duration_min"),
            price_cents: row.get("price_cents"),
        }))
    }

    async fn list_services(
        &self,
        tenant_id: &str,
        only_client_visible: bool,
    ) -> Result<Vec<ServiceCatalogEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM service_catalog WHERE tenant_id = ?1 AND active \
             AND (?2 = FALSE OR client_visible) ORDER BY normalized_name",
        )
        .bind(tenant_id)
        .bind(only_client_visible)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| ServiceCatalogEntry {
                tenant_id: row.get("tenant_id"),
                service_id: row.get("service_id"),
                name: row.get("name"),
                normalized_name: row.get("normalized_name"),
                active: row.get("active"),
                client_visible: row.get("client_visible"),
                duration_min: row.get("duration_min"),
                price_cents: row.get("price_cents"),
            })
            .collect())
    }
}

#[async_trait]
impl TenantStore for SqliteStore {
    async fn list_active_tenants(&self) -> Result<Vec<Tenant>> {
        let rows = sqlx::query("SELECT * FROM tenants WHERE active ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let mut tenants = Vec::with_capacity(rows.len());
        for row in rows {
            let settings_str: String = row.get("settings");
            tenants.push(Tenant {
                id: row.get("id"),
                name: row.get("name"),
                timezone: row.get("timezone"),
                settings: serde_json::from_str(&settings_str)?,
                active: row.get("active"),
                created_at: row.get("created_at"),
            });
        }
        Ok(tenants)
    }

    async fn get_tenant(&self, id: &str) -> Result<Option<Tenant>> {
        let row = sqlx::query("SELECT * FROM tenants WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let settings_str: String = row.get("settings");
                Ok(Some(Tenant {
                    id: row.get("id"),
                    name: row.get("name"),
                    timezone: row.get("timezone"),
                    settings: serde_json::from_str(&settings_str)?,
                    active: row.get("active"),
                    created_at: row.get("created_at"),
                }))
            }
            None => Ok(None),
        }
    }

    async fn find_by_instance(&self, instance: &str) -> Result<Option<Tenant>> {
        let row = sqlx::query(
            "SELECT * FROM tenants WHERE active \
             AND json_extract(settings, '$.instance') = ?1 LIMIT 1",
        )
        .bind(instance)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let settings_str: String = row.get("settings");
                Ok(Some(Tenant {
                    id: row.get("id"),
                    name: row.get("name"),
                    timezone: row.get("timezone"),
                    settings: serde_json::from_str(&settings_str)?,
                    active: row.get("active"),
                    created_at: row.get("created_at"),
                }))
            }
            None => Ok(None),
        }
    }

    async fn upsert_tenant(&self, tenant: Tenant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tenants (id, name, timezone, settings, active, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                timezone = excluded.timezone,
                settings = excluded.settings,
                active = excluded.active
            "#,
        )
        .bind(&tenant.id)
        .bind(&tenant.name)
        .bind(&tenant.timezone)
        .bind(serde_json::to_string(&tenant.settings)?)
        .bind(tenant.active)
        .bind(tenant.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
