//! Text normalization shared by keyword matching and catalog lookup.

/// Normalize free text: trim, lowercase, strip Latin accents, collapse
/// internal whitespace runs to single spaces.
pub fn normalize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_space = true;

    for ch in input.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
            continue;
        }
        last_was_space = false;
        for lowered in ch.to_lowercase() {
            out.push(strip_accent(lowered));
        }
    }

    if out.ends_with(' ') {
        out.pop();
    }
    out
}

fn strip_accent(ch: char) -> char {
    match ch {
        'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ç' => 'c',
        'ñ' => 'n',
        other => other,
    }
}

/// Keep only ASCII digits; used to canonicalize phone numbers into
/// digits-only E.164.
pub fn digits_only(input: &str) -> String {
    input.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_accents_case_and_whitespace() {
        assert_eq!(normalize("  PARAR!  "), "parar!");
        assert_eq!(normalize("Não"), "nao");
        assert_eq!(normalize("  Corte   de Cabelo "), "corte de cabelo");
        assert_eq!(normalize("REATIVAÇÃO"), "reativacao");
    }

    #[test]
    fn digits_only_strips_formatting() {
        assert_eq!(digits_only("+55 (71) 90000-0001"), "5571900000001");
        assert_eq!(digits_only("5571900000001@s.whatsapp.net"), "5571900000001");
    }
}
