//! No-show shield, phase 2: the reply state machine.
//!
//! Runs when an inbound text arrives while a `PendingReply` exists for the
//! sender. YES confirms, NO offers up to three alternative slots, a digit
//! picks one and triggers an idempotent rebook. Anything else asks again
//! without clearing state.

use bl_cache::{booking_key_hash, BeginOutcome, PendingReply};
use bl_clients::RebookOutcome;
use bl_common::text::normalize;
use bl_common::{dedupe, templates, NotificationKind};
use bl_config::TenantSettings;
use bl_store::Tenant;
use chrono::{Duration as ChronoDuration, NaiveDate};
use chrono_tz::Tz;
use tracing::{debug, warn};

use crate::{IngressContext, IngressError};

const MAX_OFFERED_SLOTS: u32 = 3;

const YES_WORDS: &[&str] = &[
    "sim", "s", "confirmo", "confirmado", "ok", "presente", "claro", "vou",
];
const NO_WORDS: &[&str] = &["nao", "n", "cancelar", "remarcar", "nao vou", "nao posso"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyToken {
    Yes,
    No,
    Digit(usize),
}

/// What the reply machine did with the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyAction {
    Confirmed,
    SlotsOffered,
    NoSlotsAvailable,
    Rebooked,
    RebookFailed,
    Disambiguated,
    /// A duplicate pick while the first rebook is still in flight; ignored.
    DuplicateInFlight,
}

/// Parse the reply vocabulary. Returns None for text the machine does not
/// recognize (which then falls through to opt-out keywords / dialogue).
pub fn parse_reply(text: &str) -> Option<ReplyToken> {
    let normalized = normalize(text);
    let trimmed = normalized.trim_matches(|c: char| !c.is_alphanumeric() && c != ' ');

    if YES_WORDS.contains(&trimmed) {
        return Some(ReplyToken::Yes);
    }
    if NO_WORDS.contains(&trimmed) {
        return Some(ReplyToken::No);
    }
    if trimmed.len() == 1 {
        if let Some(digit) = trimmed.chars().next().and_then(|c| c.to_digit(10)) {
            if digit >= 1 {
                return Some(ReplyToken::Digit(digit as usize));
            }
        }
    }
    None
}

pub async fn handle_reply(
    ctx: &IngressContext,
    tenant: &Tenant,
    settings: &TenantSettings,
    tz: Tz,
    phone: &str,
    token: ReplyToken,
    pending: PendingReply,
) -> Result<ReplyAction, IngressError> {
    match token {
        ReplyToken::Yes => confirm(ctx, tenant, settings, phone, &pending).await,
        ReplyToken::No => offer_slots(ctx, tenant, settings, tz, phone, &pending).await,
        ReplyToken::Digit(pick) => {
            rebook_pick(ctx, tenant, settings, tz, phone, &pending, pick).await
        }
    }
}

async fn confirm(
    ctx: &IngressContext,
    tenant: &Tenant,
    settings: &TenantSettings,
    phone: &str,
    pending: &PendingReply,
) -> Result<ReplyAction, IngressError> {
    ctx.notifications
        .record_sent(
            &tenant.id,
            &dedupe::noshow_yes(&pending.appointment_id, pending.appointment_date),
            NotificationKind::NoshowYes,
            phone,
            serde_json::json!({
                "appointment_id": pending.appointment_id,
                "appointment_date": pending.appointment_date,
            }),
            Some(pending.appointment_date),
        )
        .await?;

    send(ctx, settings, phone, &templates::noshow_confirmed_ack()).await;
    clear_pending(ctx, &tenant.id, phone).await;
    metrics::counter!("bookline.ingress.noshow_confirmed_total").increment(1);
    Ok(ReplyAction::Confirmed)
}

async fn offer_slots(
    ctx: &IngressContext,
    tenant: &Tenant,
    settings: &TenantSettings,
    tz: Tz,
    phone: &str,
    pending: &PendingReply,
) -> Result<ReplyAction, IngressError> {
    ctx.notifications
        .record_sent(
            &tenant.id,
            &dedupe::noshow_no(&pending.appointment_id, pending.appointment_date),
            NotificationKind::NoshowNo,
            phone,
            serde_json::json!({
                "appointment_id": pending.appointment_id,
                "appointment_date": pending.appointment_date,
            }),
            Some(pending.appointment_date),
        )
        .await?;

    // Alternatives begin the day after the appointment (D+2 counted from
    // the question's D-1 evening).
    let search_from_date = pending.appointment_date + ChronoDuration::days(1);
    let starting_at = local_midnight_utc(search_from_date, tz);

    let slots = match ctx
        .calendar
        .search_slots(
            &pending.service_id,
            pending.professional_id.as_deref(),
            starting_at,
            MAX_OFFERED_SLOTS,
        )
        .await
    {
        Ok(slots) => slots,
        Err(e) => {
            warn!(tenant_id = %tenant.id, error = %e, "Slot search failed");
            send(ctx, settings, phone, &templates::no_slots_available()).await;
            clear_pending(ctx, &tenant.id, phone).await;
            return Ok(ReplyAction::NoSlotsAvailable);
        }
    };

    if slots.is_empty() {
        send(ctx, settings, phone, &templates::no_slots_available()).await;
        clear_pending(ctx, &tenant.id, phone).await;
        return Ok(ReplyAction::NoSlotsAvailable);
    }

    if let Err(e) = ctx.slot_offers.put(&tenant.id, phone, &slots).await {
        warn!(tenant_id = %tenant.id, error = %e, "Failed to store slot offers");
    }

    let localized: Vec<(NaiveDate, String)> = slots
        .iter()
        .map(|slot| {
            let local = slot.start.with_timezone(&tz);
            (local.date_naive(), local.format("%H:%M").to_string())
        })
        .collect();
    send(ctx, settings, phone, &templates::slot_options(&localized)).await;

    // The pending reply survives; the digit pick consumes it.
    metrics::counter!("bookline.ingress.noshow_declined_total").increment(1);
    Ok(ReplyAction::SlotsOffered)
}

async fn rebook_pick(
    ctx: &IngressContext,
    tenant: &Tenant,
    settings: &TenantSettings,
    tz: Tz,
    phone: &str,
    pending: &PendingReply,
    pick: usize,
) -> Result<ReplyAction, IngressError> {
    let offers = match ctx.slot_offers.get(&tenant.id, phone).await {
        Ok(offers) => offers,
        Err(e) => {
            warn!(tenant_id = %tenant.id, error = %e, "Failed to read slot offers");
            None
        }
    };

    let Some(slots) = offers else {
        send(ctx, settings, phone, &templates::disambiguation()).await;
        return Ok(ReplyAction::Disambiguated);
    };
    if pick == 0 || pick > slots.len() {
        send(ctx, settings, phone, &templates::disambiguation()).await;
        return Ok(ReplyAction::Disambiguated);
    }

    let slot = &slots[pick - 1];
    let local = slot.start.with_timezone(&tz);
    let new_date = local.date_naive();
    let new_time = local.format("%H:%M").to_string();

    // Booking idempotency guards the crash-between-rebook-and-record window
    // on top of the calendar's own idempotency key.
    let key_hash = booking_key_hash(phone, &pending.service_id, new_date, &new_time);
    let begin = match ctx.idempotency.begin(&tenant.id, &key_hash).await {
        Ok(outcome) => outcome,
        Err(e) => {
            // Degraded cache: the booking must still be attempted; the
            // calendar-side idempotency key keeps it at-most-once.
            warn!(tenant_id = %tenant.id, error = %e, "Idempotency cache unavailable");
            BeginOutcome::Started
        }
    };

    match begin {
        BeginOutcome::Started => {
            let result = ctx
                .calendar
                .rebook(
                    &pending.appointment_id,
                    slot.start,
                    &pending.service_id,
                    pending.professional_id.as_deref(),
                    &key_hash,
                )
                .await;

            match result {
                Ok(RebookOutcome::Confirmed) => {
                    let _ = ctx
                        .idempotency
                        .complete(
                            &tenant.id,
                            &key_hash,
                            serde_json::json!({
                                "appointment_id": pending.appointment_id,
                                "new_date": new_date,
                                "new_time": new_time,
                            }),
                        )
                        .await;
                    ctx.notifications
                        .record_sent(
                            &tenant.id,
                            &dedupe::rebook(&pending.appointment_id, pending.appointment_date),
                            NotificationKind::Rebook,
                            phone,
                            serde_json::json!({
                                "appointment_id": pending.appointment_id,
                                "original_date": pending.appointment_date,
                                "new_date": new_date,
                                "new_time": new_time,
                            }),
                            Some(pending.appointment_date),
                        )
                        .await?;
                    send(ctx, settings, phone, &templates::rebook_ack(new_date, &new_time)).await;
                    clear_pending(ctx, &tenant.id, phone).await;
                    clear_offers(ctx, &tenant.id, phone).await;
                    metrics::counter!("bookline.ingress.rebooked_total").increment(1);
                    Ok(ReplyAction::Rebooked)
                }
                Ok(RebookOutcome::Conflict) => {
                    let _ = ctx.idempotency.fail(&tenant.id, &key_hash, "slot conflict").await;
                    send(ctx, settings, phone, &templates::rebook_failed_ack()).await;
                    clear_pending(ctx, &tenant.id, phone).await;
                    clear_offers(ctx, &tenant.id, phone).await;
                    Ok(ReplyAction::RebookFailed)
                }
                Err(e) => {
                    warn!(tenant_id = %tenant.id, error = %e, "Rebook call failed");
                    let _ = ctx.idempotency.fail(&tenant.id, &key_hash, &e.to_string()).await;
                    send(ctx, settings, phone, &templates::rebook_failed_ack()).await;
                    clear_pending(ctx, &tenant.id, phone).await;
                    clear_offers(ctx, &tenant.id, phone).await;
                    Ok(ReplyAction::RebookFailed)
                }
            }
        }
        BeginOutcome::InProgress => {
            debug!(tenant_id = %tenant.id, phone, "Duplicate pick while rebook in flight");
            Ok(ReplyAction::DuplicateInFlight)
        }
        BeginOutcome::Completed(_) => {
            // A previous attempt already rebooked this exact slot; just
            // repeat the acknowledgment.
            send(ctx, settings, phone, &templates::rebook_ack(new_date, &new_time)).await;
            clear_pending(ctx, &tenant.id, phone).await;
            clear_offers(ctx, &tenant.id, phone).await;
            Ok(ReplyAction::Rebooked)
        }
        BeginOutcome::Failed(_) => {
            send(ctx, settings, phone, &templates::rebook_failed_ack()).await;
            clear_pending(ctx, &tenant.id, phone).await;
            clear_offers(ctx, &tenant.id, phone).await;
            Ok(ReplyAction::RebookFailed)
        }
    }
}

fn local_midnight_utc(date: NaiveDate, tz: Tz) -> chrono::DateTime<chrono::Utc> {
    use chrono::TimeZone;
    let naive = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&chrono::Utc))
        .unwrap_or_else(|| chrono::Utc.from_utc_datetime(&naive))
}

async fn send(ctx: &IngressContext, settings: &TenantSettings, phone: &str, text: &str) {
    let outcome = ctx
        .gateway
        .send_text(&settings.instance, phone, text)
        .await;
    if !outcome.is_delivered() {
        warn!(phone, ?outcome, "Failed to deliver reply acknowledgment");
    }
}

async fn clear_pending(ctx: &IngressContext, tenant_id: &str, phone: &str) {
    if let Err(e) = ctx.pending_replies.clear(tenant_id, phone).await {
        warn!(tenant_id, error = %e, "Failed to clear pending reply");
    }
}

async fn clear_offers(ctx: &IngressContext, tenant_id: &str, phone: &str) {
    if let Err(e) = ctx.slot_offers.clear(tenant_id, phone).await {
        warn!(tenant_id, error = %e, "Failed to clear slot offers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yes_no_and_digit_vocabulary() {
        assert_eq!(parse_reply("sim"), Some(ReplyToken::Yes));
        assert_eq!(parse_reply("SIM!"), Some(ReplyToken::Yes));
        assert_eq!(parse_reply("Confirmo"), Some(ReplyToken::Yes));
        assert_eq!(parse_reply("não"), Some(ReplyToken::No));
        assert_eq!(parse_reply("remarcar"), Some(ReplyToken::No));
        assert_eq!(parse_reply("2"), Some(ReplyToken::Digit(2)));
        assert_eq!(parse_reply("0"), None);
        assert_eq!(parse_reply("quero outro dia"), None);
    }
}
