//! Calendar API client.
//!
//! Five operations: paged appointment listing, single-appointment fetch,
//! slot search, rebook and booking creation. Rebook and create always carry
//! an `Idempotency-Key` header so a crash-and-replay cannot double-book.

use async_trait::async_trait;
use bl_common::{Appointment, Slot};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CalendarError {
    #[error("calendar transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("calendar returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

pub type Result<T> = std::result::Result<T, CalendarError>;

#[derive(Debug, Clone)]
pub struct CalendarClientConfig {
    pub base_url: String,
    pub api_token: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub page_size: u32,
}

impl Default for CalendarClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8082".to_string(),
            api_token: String::new(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            page_size: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppointmentsPage {
    pub items: Vec<Appointment>,
    pub total_pages: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebookOutcome {
    Confirmed,
    /// The slot was taken (or the calendar refused the move).
    Conflict,
}

#[async_trait]
pub trait CalendarApi: Send + Sync {
    /// One page of appointments with start time in [date_from, date_to].
    /// Pages are 1-based.
    async fn list_appointments(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
        page: u32,
    ) -> Result<AppointmentsPage>;

    async fn get_appointment(&self, id: &str) -> Result<Option<Appointment>>;

    async fn search_slots(
        &self,
        service_id: &str,
        professional_id: Option<&str>,
        starting_at: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Slot>>;

    async fn rebook(
        &self,
        appointment_id: &str,
        new_start: DateTime<Utc>,
        service_id: &str,
        professional_id: Option<&str>,
        idempotency_key: &str,
    ) -> Result<RebookOutcome>;

    async fn create_booking(&self, payload: Value, idempotency_key: &str) -> Result<Value>;
}

/// Exhaustively page through the appointment list. A page failure aborts
/// the whole run; the caller's next scheduled run catches up because every
/// consumer of this listing is idempotent.
pub async fn list_all_appointments(
    api: &dyn CalendarApi,
    date_from: NaiveDate,
    date_to: NaiveDate,
) -> Result<Vec<Appointment>> {
    let mut all = Vec::new();
    let mut page = 1;
    loop {
        let result = api.list_appointments(date_from, date_to, page).await?;
        let total_pages = result.total_pages.max(1);
        all.extend(result.items);
        if page >= total_pages {
            break;
        }
        page += 1;
    }
    debug!(count = all.len(), %date_from, %date_to, "Fetched appointment window");
    Ok(all)
}

pub struct HttpCalendarClient {
    config: CalendarClientConfig,
    client: reqwest::Client,
}

impl HttpCalendarClient {
    pub fn new(config: CalendarClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.config.base_url, path))
            .bearer_auth(&self.config.api_token)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), "Calendar request failed");
        Err(CalendarError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl CalendarApi for HttpCalendarClient {
    async fn list_appointments(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
        page: u32,
    ) -> Result<AppointmentsPage> {
        let response = self
            .request(reqwest::Method::GET, "/appointments")
            .query(&[
                ("date_from", date_from.to_string()),
                ("date_to", date_to.to_string()),
                ("page", page.to_string()),
                ("per_page", self.config.page_size.to_string()),
            ])
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    async fn get_appointment(&self, id: &str) -> Result<Option<Appointment>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/appointments/{id}"))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response).await?;
        Ok(Some(response.json().await?))
    }

    async fn search_slots(
        &self,
        service_id: &str,
        professional_id: Option<&str>,
        starting_at: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Slot>> {
        let mut query = vec![
            ("service_id", service_id.to_string()),
            ("starting_at", starting_at.to_rfc3339()),
            ("limit", limit.to_string()),
        ];
        if let Some(professional) = professional_id {
            query.push(("professional_id", professional.to_string()));
        }

        let response = self
            .request(reqwest::Method::GET, "/slots")
            .query(&query)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    async fn rebook(
        &self,
        appointment_id: &str,
        new_start: DateTime<Utc>,
        service_id: &str,
        professional_id: Option<&str>,
        idempotency_key: &str,
    ) -> Result<RebookOutcome> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/appointments/{appointment_id}/rebook"),
            )
            .header("Idempotency-Key", idempotency_key)
            .json(&serde_json::json!({
                "new_start": new_start.to_rfc3339(),
                "service_id": service_id,
                "professional_id": professional_id,
            }))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::CONFLICT {
            return Ok(RebookOutcome::Conflict);
        }
        Self::check(response).await?;
        Ok(RebookOutcome::Confirmed)
    }

    async fn create_booking(&self, payload: Value, idempotency_key: &str) -> Result<Value> {
        let response = self
            .request(reqwest::Method::POST, "/bookings")
            .header("Idempotency-Key", idempotency_key)
            .json(&payload)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }
}
