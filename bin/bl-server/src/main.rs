//! Bookline server.
//!
//! One deployable wiring the whole core: SQL store (PostgreSQL or SQLite,
//! picked by URL scheme), Redis cache, chat gateway and calendar clients,
//! the delivery worker pool, claim recovery, the cron scheduler, and the
//! HTTP surface (webhook + admin + health + metrics).
//!
//! ## Environment variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `BOOKLINE_CONFIG` | - | Path to the TOML config file |
//! | `BOOKLINE_DATABASE_URL` | `sqlite::memory:` | `postgres://...` or `sqlite://...` |
//! | `BOOKLINE_REDIS_URL` | `redis://127.0.0.1:6379` | Cache backend |
//! | `BOOKLINE_GATEWAY_URL` / `BOOKLINE_GATEWAY_API_KEY` | - | Chat gateway |
//! | `BOOKLINE_CALENDAR_URL` / `BOOKLINE_CALENDAR_TOKEN` | - | Calendar API |
//! | `BOOKLINE_DIALOGUE_URL` | - | Dialogue collaborator (empty = disabled) |
//! | `BOOKLINE_ADMIN_TOKEN` | - | Admin bearer token (empty = disabled) |
//! | `BOOKLINE_SEED_FILE` | - | Optional tenants/catalog seed JSON |
//! | `RUST_LOG` / `LOG_FORMAT` | `info` / text | Logging |

mod seed;

use anyhow::Result;
use axum::routing::get;
use bl_cache::RedisCache;
use bl_clients::{
    CalendarClientConfig, GatewayClientConfig, HttpCalendarClient, HttpChatGateway,
};
use bl_config::{AppConfig, ConfigLoader};
use bl_ingress::{DialogueService, HttpDialogueService, IngressContext, NoopDialogue};
use bl_scheduler::{AuditReconciler, CronScheduler, ProducerContext};
use bl_store::{
    CatalogStore, HandoffStore, JobStore, NotificationLog, OptOutStore, TenantStore,
};
use bl_worker::{DeliveryWorker, DeliveryWorkerConfig, RecoveryConfig, RecoveryTask, WorkerContext};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;

/// Trait-object handles over whichever SQL backend the URL selects.
#[derive(Clone)]
struct Stores {
    jobs: Arc<dyn JobStore>,
    notifications: Arc<dyn NotificationLog>,
    opt_outs: Arc<dyn OptOutStore>,
    handoffs: Arc<dyn HandoffStore>,
    catalog: Arc<dyn CatalogStore>,
    tenants: Arc<dyn TenantStore>,
}

impl Stores {
    fn from_backend<S>(store: Arc<S>) -> Self
    where
        S: JobStore
            + NotificationLog
            + OptOutStore
            + HandoffStore
            + CatalogStore
            + TenantStore
            + 'static,
    {
        Self {
            jobs: store.clone(),
            notifications: store.clone(),
            opt_outs: store.clone(),
            handoffs: store.clone(),
            catalog: store.clone(),
            tenants: store,
        }
    }
}

async fn init_stores(config: &AppConfig) -> Result<Stores> {
    let url = &config.database.url;
    if url.starts_with("postgres") {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .acquire_timeout(config.database.timeout())
            .connect(url)
            .await?;
        let store = Arc::new(bl_store::postgres::PostgresStore::new(pool));
        store.init_schema().await?;
        info!("Using PostgreSQL store");
        Ok(Stores::from_backend(store))
    } else if url.starts_with("sqlite") {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(config.database.timeout())
            .connect(url)
            .await?;
        let store = Arc::new(bl_store::sqlite::SqliteStore::new(pool));
        store.init_schema().await?;
        info!(url = %url, "Using SQLite store");
        Ok(Stores::from_backend(store))
    } else {
        Err(anyhow::anyhow!(
            "Unsupported database URL scheme: {url}. Use postgres:// or sqlite://"
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    bl_common::logging::init_logging("bl-server");
    let config = ConfigLoader::new().load()?;
    info!("Starting bookline server");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Storage and cache.
    let stores = init_stores(&config).await?;
    let cache = Arc::new(RedisCache::connect(&config.redis.url, config.redis.timeout()).await?);
    info!(url = %config.redis.url, "Connected to Redis");

    if let Ok(path) = std::env::var("BOOKLINE_SEED_FILE") {
        seed::apply(&path, stores.tenants.clone(), stores.catalog.clone()).await?;
    }

    // Outbound clients.
    let gateway = Arc::new(HttpChatGateway::new(GatewayClientConfig {
        base_url: config.gateway.base_url.clone(),
        api_key: config.gateway.api_key.clone(),
        connect_timeout: Duration::from_secs(config.gateway.request_timeout_secs),
        request_timeout: Duration::from_secs(config.gateway.request_timeout_secs),
        send_delay_ms: config.gateway.send_delay_ms,
    })?);
    let calendar = Arc::new(HttpCalendarClient::new(CalendarClientConfig {
        base_url: config.calendar.base_url.clone(),
        api_token: config.calendar.api_token.clone(),
        connect_timeout: Duration::from_secs(config.calendar.request_timeout_secs),
        request_timeout: Duration::from_secs(config.calendar.request_timeout_secs),
        page_size: config.calendar.page_size,
    })?);
    let dialogue: Arc<dyn DialogueService> = if config.dialogue.url.is_empty() {
        Arc::new(NoopDialogue)
    } else {
        Arc::new(HttpDialogueService::new(
            config.dialogue.url.clone(),
            Duration::from_secs(config.dialogue.request_timeout_secs),
        )?)
    };

    // Metrics.
    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // Delivery worker pool.
    let worker = Arc::new(DeliveryWorker::new(
        WorkerContext {
            jobs: stores.jobs.clone(),
            notifications: stores.notifications.clone(),
            opt_outs: stores.opt_outs.clone(),
            handoffs: stores.handoffs.clone(),
            tenants: stores.tenants.clone(),
            pending_replies: cache.clone(),
            gateway: gateway.clone(),
        },
        DeliveryWorkerConfig {
            concurrency: config.worker.concurrency,
            tick: config.worker.tick(),
            inter_message_delay: config.worker.inter_message_delay(),
            gate_memo_ttl: Duration::from_secs(config.worker.gate_memo_secs),
            tenant_defaults: config.tenant_defaults.clone(),
        },
    ));
    let mut task_handles = worker.spawn(&shutdown_tx);

    // Claim recovery.
    let recovery = RecoveryTask::new(
        stores.jobs.clone(),
        RecoveryConfig {
            check_interval: Duration::from_secs(config.scheduler.recovery_interval_secs),
            enabled: true,
        },
    );
    let recovery_rx = shutdown_tx.subscribe();
    task_handles.push(tokio::spawn(async move {
        recovery.run(recovery_rx).await;
    }));

    // Cron producers.
    let producer_ctx = ProducerContext {
        jobs: stores.jobs.clone(),
        notifications: stores.notifications.clone(),
        opt_outs: stores.opt_outs.clone(),
        tenants: stores.tenants.clone(),
        calendar: calendar.clone(),
    };
    let scheduler = CronScheduler::new(
        producer_ctx.clone(),
        config.scheduler.clone(),
        config.tenant_defaults.clone(),
    );
    let scheduler_rx = shutdown_tx.subscribe();
    task_handles.push(tokio::spawn(async move {
        scheduler.run(scheduler_rx).await;
    }));

    // HTTP surface.
    let audit = Arc::new(AuditReconciler::new(
        producer_ctx,
        config.tenant_defaults.clone(),
    ));
    let ingress_ctx = IngressContext {
        tenants: stores.tenants.clone(),
        notifications: stores.notifications.clone(),
        opt_outs: stores.opt_outs.clone(),
        handoffs: stores.handoffs.clone(),
        pending_replies: cache.clone(),
        slot_offers: cache.clone(),
        idempotency: cache.clone(),
        inbound_dedupe: cache.clone(),
        gateway: gateway.clone(),
        calendar: calendar.clone(),
        dialogue,
        audit,
        tenant_defaults: config.tenant_defaults.clone(),
        admin_token: config.admin.token.clone(),
    };
    let app = bl_ingress::router(ingress_ctx)
        .route(
            "/metrics",
            get(move || {
                let handle = prometheus.clone();
                async move { handle.render() }
            }),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    let mut server_rx = shutdown_tx.subscribe();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_rx.recv().await;
            })
            .await
            .ok();
    });

    info!("Bookline server started");
    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        for handle in task_handles {
            let _ = handle.await;
        }
        let _ = server_handle.await;
    })
    .await;

    info!("Bookline server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
