//! Plain-text message templates, pt-BR fixed locale.
//!
//! All output goes to the chat platform as-is; keep lines short and free of
//! markup.

use crate::JobPayload;
use chrono::NaiveDate;

fn format_date(date: NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}

/// Pre-visit reminder rendered from the job's payload snapshot.
pub fn previsit_reminder(payload: &JobPayload) -> String {
    let mut text = format!(
        "Olá! Lembrete do seu agendamento na {}: {} em {} às {}",
        payload.business_name,
        payload.service_name,
        format_date(payload.appointment_date),
        payload.appointment_time,
    );
    if let Some(professional) = &payload.professional_name {
        text.push_str(&format!(" com {professional}"));
    }
    text.push('.');
    if let Some(address) = &payload.business_address {
        text.push_str(&format!(" Endereço: {address}."));
    }
    text.push_str(" Até lá!");
    text
}

/// D-1 confirmation question; answers are handled by the reply machine.
pub fn noshow_question(payload: &JobPayload) -> String {
    format!(
        "Oi! Amanhã ({}) às {} você tem {} na {}. Podemos confirmar sua presença? \
         Responda SIM para confirmar ou NAO para remarcar.",
        format_date(payload.appointment_date),
        payload.appointment_time,
        payload.service_name,
        payload.business_name,
    )
}

pub fn noshow_confirmed_ack() -> String {
    "Presença confirmada! Até amanhã.".to_string()
}

/// Numbered list of rebook options. `slots` are already tenant-local
/// (date, time) pairs.
pub fn slot_options(slots: &[(NaiveDate, String)]) -> String {
    let mut text =
        String::from("Sem problemas! Tenho estes horários livres para remarcar:\n");
    for (i, (date, time)) in slots.iter().enumerate() {
        text.push_str(&format!("{}) {} às {}\n", i + 1, format_date(*date), time));
    }
    text.push_str("Responda com o número da opção desejada.");
    text
}

pub fn no_slots_available() -> String {
    "Poxa, não encontrei horários livres nos próximos dias. \
     A equipe vai entrar em contato para remarcar."
        .to_string()
}

pub fn rebook_ack(date: NaiveDate, time: &str) -> String {
    format!(
        "Prontinho! Seu horário foi remarcado para {} às {}.",
        format_date(date),
        time
    )
}

pub fn rebook_failed_ack() -> String {
    "Não consegui remarcar nesse horário. A equipe vai entrar em contato \
     para encontrar uma alternativa."
        .to_string()
}

pub fn optout_ack() -> String {
    "Tudo bem! Você não vai mais receber nossas mensagens automáticas. \
     Para voltar a receber, responda VOLTAR."
        .to_string()
}

pub fn optin_ack() -> String {
    "Pronto! Você voltou a receber nossas mensagens.".to_string()
}

pub fn disambiguation() -> String {
    "Desculpe, não entendi. Responda SIM para confirmar, NAO para remarcar, \
     ou o número de uma das opções enviadas."
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

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
            business_address: Some("Rua das Flores, 10".into()),
        }
    }

    #[test]
    fn previsit_contains_service_and_time() {
        let text = previsit_reminder(&payload());
        assert!(text.contains("Corte"));
        assert!(text.contains("14:00"));
        assert!(text.contains("10/02/2025"));
        assert!(text.contains("Ana"));
        assert!(text.contains("Rua das Flores"));
    }

    #[test]
    fn previsit_omits_missing_optionals() {
        let mut p = payload();
        p.professional_name = None;
        p.business_address = None;
        let text = previsit_reminder(&p);
        assert!(!text.contains("com "));
        assert!(!text.contains("Endereço"));
    }

    #[test]
    fn slot_list_is_numbered() {
        let date = NaiveDate::from_ymd_opt(2025, 2, 11).unwrap();
        let text = slot_options(&[
            (date, "10:00".to_string()),
            (date, "11:00".to_string()),
        ]);
        assert!(text.contains("1) 11/02/2025 às 10:00"));
        assert!(text.contains("2) 11/02/2025 às 11:00"));
    }
}
