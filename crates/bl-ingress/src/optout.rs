//! Opt-out keyword handling.
//!
//! A keyword match short-circuits the whole inbound pipeline: the registry
//! is mutated, an acknowledgment goes out through the gateway, and nothing
//! is forwarded to the dialogue collaborator.

use bl_common::text::normalize;

const OPT_OUT_KEYWORDS: &[&str] = &[
    "parar", "stop", "sair", "cancelar", "nao", "pare", "remover",
];
const OPT_IN_KEYWORDS: &[&str] = &["voltar", "reativar", "sim quero receber"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeywordAction {
    OptOut,
    OptIn,
}

/// Match inbound text against the stop/resume vocabulary. Normalization
/// strips accents, case and surrounding punctuation, so "PARAR!" and
/// "Não" both match.
pub fn parse_keyword(text: &str) -> Option<KeywordAction> {
    let normalized = normalize(text);
    let trimmed = normalized.trim_matches(|c: char| !c.is_alphanumeric() && c != ' ');
    if trimmed.is_empty() {
        return None;
    }

    if OPT_IN_KEYWORDS.contains(&trimmed) {
        return Some(KeywordAction::OptIn);
    }
    if OPT_OUT_KEYWORDS.contains(&trimmed) {
        return Some(KeywordAction::OptOut);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optout_keywords_match_with_noise() {
        for text in ["parar", "PARAR!", "  Pare  ", "Não", "nao", "STOP", "remover"] {
            assert_eq!(parse_keyword(text), Some(KeywordAction::OptOut), "{text}");
        }
    }

    #[test]
    fn optin_keywords_match() {
        assert_eq!(parse_keyword("VOLTAR"), Some(KeywordAction::OptIn));
        assert_eq!(parse_keyword("reativar"), Some(KeywordAction::OptIn));
        assert_eq!(
            parse_keyword("Sim, quero receber"),
            // The comma survives normalization inside the phrase, so this
            // variant intentionally does not match.
            None
        );
        assert_eq!(parse_keyword("sim quero receber"), Some(KeywordAction::OptIn));
    }

    #[test]
    fn ordinary_text_is_not_a_keyword() {
        assert_eq!(parse_keyword("quero marcar um corte"), None);
        assert_eq!(parse_keyword("sim"), None);
        assert_eq!(parse_keyword(""), None);
    }
}
