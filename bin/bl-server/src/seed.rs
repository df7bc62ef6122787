//! Seed loader for local development and first deploys.
//!
//! Reads a JSON file with tenants and catalog entries and upserts them.
//! Re-running with the same file is a no-op thanks to the upsert semantics.

use anyhow::{Context, Result};
use bl_store::{CatalogStore, ServiceCatalogEntry, Tenant, TenantStore};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
struct SeedFile {
    #[serde(default)]
    tenants: Vec<SeedTenant>,
    #[serde(default)]
    services: Vec<SeedService>,
}

#[derive(Debug, Deserialize)]
struct SeedTenant {
    id: String,
    name: String,
    timezone: String,
    #[serde(default)]
    settings: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SeedService {
    tenant_id: String,
    service_id: String,
    name: String,
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    client_visible: Option<bool>,
    #[serde(default)]
    duration_min: Option<i32>,
    #[serde(default)]
    price_cents: Option<i64>,
}

pub async fn apply(
    path: &str,
    tenants: Arc<dyn TenantStore>,
    catalog: Arc<dyn CatalogStore>,
) -> Result<()> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading seed file {path}"))?;
    let seed: SeedFile =
        serde_json::from_str(&contents).with_context(|| format!("parsing seed file {path}"))?;

    for tenant in &seed.tenants {
        tenants
            .upsert_tenant(Tenant {
                id: tenant.id.clone(),
                name: tenant.name.clone(),
                timezone: tenant.timezone.clone(),
                settings: if tenant.settings.is_null() {
                    serde_json::json!({})
                } else {
                    tenant.settings.clone()
                },
                active: true,
                created_at: Utc::now(),
            })
            .await?;
    }

    for service in &seed.services {
        let mut entry =
            ServiceCatalogEntry::new(&service.tenant_id, &service.service_id, &service.name);
        if let Some(active) = service.active {
            entry.active = active;
        }
        if let Some(visible) = service.client_visible {
            entry.client_visible = visible;
        }
        if let Some(duration) = service.duration_min {
            entry.duration_min = duration;
        }
        if let Some(price) = service.price_cents {
            entry.price_cents = price;
        }
        catalog.upsert_service(entry).await?;
    }

    info!(
        tenants = seed.tenants.len(),
        services = seed.services.len(),
        "Seed applied"
    );
    Ok(())
}
