//! Outbound HTTP clients.
//!
//! [`chat`] talks to the chat gateway that delivers messages to recipients;
//! [`calendar`] talks to the external scheduling system. Both classify
//! failures with the shared retry policy so the delivery worker and the
//! producers apply consistent backoff decisions.

pub mod calendar;
pub mod chat;

pub use calendar::{
    AppointmentsPage, CalendarApi, CalendarClientConfig, CalendarError, HttpCalendarClient,
    RebookOutcome,
};
pub use chat::{ChatGateway, GatewayClientConfig, HttpChatGateway, SendOutcome};
