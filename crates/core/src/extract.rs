//! Entity extraction over raw chat text.
//!
//! Every function here is total and pure: a miss is `None`/`false`, never an
//! error, and calling twice with the same input yields the same answer.

use crate::domain::creditor::Creditor;

const DOCUMENT_LENGTHS: [usize; 2] = [11, 14];
const MAX_SELECTION_DIGITS: usize = 9;

const DESIRE_WORDS: &[&str] = &[
    "quero",
    "queria",
    "gostaria",
    "preciso",
    "precisava",
    "precisamos",
    "desejo",
    "desejava",
    "pretendo",
    "want",
    "wanna",
    "need",
];

const NEGOTIATION_VERBS: &[&str] = &[
    "negociar",
    "negociando",
    "negociacao",
    "negociacoes",
    "renegociar",
    "renegociacao",
    "quitar",
    "quitacao",
    "parcelar",
    "parcelamento",
    "pagar",
    "pagando",
    "pagamento",
    "acordo",
    "liquidar",
    "negotiate",
    "negotiating",
    "negotiation",
    "settle",
    "settling",
    "pay",
    "paying",
    "payment",
    "payoff",
];

const SELECTION_MARKERS: &[&str] =
    &["escolho", "opcao", "opção", "numero", "número", "plano", "option"];

/// Returns the first 11-digit (CPF) or 14-digit (CNPJ) number in the text,
/// digits only.
///
/// Runs are taken whole, so a 12- or 13-digit run never yields an 11-digit
/// match. A single `.`, `-` or `/` between two digits keeps the run going,
/// which accepts formatted documents like `123.456.789-01`.
pub fn extract_identification_number(text: &str) -> Option<String> {
    document_runs(text).into_iter().find(|run| DOCUMENT_LENGTHS.contains(&run.len()))
}

/// Returns a positive integer standing as its own token, e.g. the `2` in
/// `escolho 2`, `opção 2.` or `(2)`.
///
/// A number right after a marker word (`escolho`, `opção`, ...) wins;
/// otherwise the last number in the text is taken, so `tenho 3 dívidas,
/// quero a 1` selects 1.
pub fn extract_selection_number(text: &str) -> Option<u32> {
    let tokens = text.split_whitespace().collect::<Vec<_>>();

    let after_marker = tokens.windows(2).find_map(|pair| {
        let marker = pair[0].trim_end_matches(|ch: char| !ch.is_alphanumeric()).to_lowercase();
        if SELECTION_MARKERS.contains(&marker.as_str()) {
            selection_token(pair[1])
        } else {
            None
        }
    });

    after_marker.or_else(|| tokens.iter().rev().find_map(|token| selection_token(token)))
}

/// Returns the 0-based index of the first candidate whose external id appears
/// verbatim as a numeric token in the text.
pub fn extract_selection_by_external_id(text: &str, candidates: &[Creditor]) -> Option<usize> {
    let tokens = digit_runs(text);
    if tokens.is_empty() {
        return None;
    }

    candidates
        .iter()
        .position(|candidate| tokens.iter().any(|token| *token == candidate.external_id))
}

/// True when the text pairs a desire verb ("quero", "preciso", "want", ...)
/// with a negotiation verb ("negociar", "pagar", "settle", ...) in any order.
pub fn detect_negotiation_intent(text: &str) -> bool {
    let normalized = normalize_text(text);
    let tokens = tokenize(&normalized);

    let has_desire = tokens.iter().any(|token| DESIRE_WORDS.contains(&token.as_str()))
        || contains_phrase(&tokens, &["would", "like"])
        || contains_phrase(&tokens, &["d", "like"]);

    let has_negotiation = tokens
        .iter()
        .any(|token| NEGOTIATION_VERBS.contains(&token.as_str()))
        || contains_phrase(&tokens, &["limpar", "nome"])
        || contains_phrase(&tokens, &["limpar", "meu", "nome"])
        || contains_phrase(&tokens, &["clear", "debt"])
        || contains_phrase(&tokens, &["clear", "my", "debt"]);

    has_desire && has_negotiation
}

fn selection_token(token: &str) -> Option<u32> {
    let trimmed = token
        .trim_start_matches(|ch: char| matches!(ch, '(' | '[' | '#' | '"' | '\''))
        .trim_end_matches(|ch: char| {
            matches!(ch, '.' | ',' | ';' | ':' | '!' | '?' | ')' | ']' | '"' | '\'' | 'º' | 'ª' | '°')
        });

    if trimmed.is_empty()
        || trimmed.len() > MAX_SELECTION_DIGITS
        || !trimmed.bytes().all(|byte| byte.is_ascii_digit())
    {
        return None;
    }

    trimmed.parse::<u32>().ok().filter(|value| *value > 0)
}

fn document_runs(text: &str) -> Vec<String> {
    let chars = text.chars().collect::<Vec<_>>();
    let mut runs = Vec::new();
    let mut current = String::new();

    for (index, ch) in chars.iter().enumerate() {
        if ch.is_ascii_digit() {
            current.push(*ch);
            continue;
        }

        let joins_digits = matches!(ch, '.' | '-' | '/')
            && index > 0
            && chars[index - 1].is_ascii_digit()
            && chars.get(index + 1).is_some_and(|next| next.is_ascii_digit());
        if joins_digits {
            continue;
        }

        if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
    }

    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

fn digit_runs(text: &str) -> Vec<&str> {
    text.split(|ch: char| !ch.is_ascii_digit()).filter(|run| !run.is_empty()).collect()
}

fn normalize_text(text: &str) -> String {
    text.chars().map(fold_accent).collect::<String>().to_lowercase()
}

fn fold_accent(ch: char) -> char {
    match ch {
        'á' | 'à' | 'â' | 'ã' | 'ä' | 'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'a',
        'é' | 'è' | 'ê' | 'ë' | 'É' | 'È' | 'Ê' | 'Ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' | 'Í' | 'Ì' | 'Î' | 'Ï' => 'i',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' | 'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' | 'Ú' | 'Ù' | 'Û' | 'Ü' => 'u',
        'ç' | 'Ç' => 'c',
        other => other,
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn contains_phrase(tokens: &[String], phrase: &[&str]) -> bool {
    tokens.windows(phrase.len()).any(|window| {
        window.iter().zip(phrase).all(|(token, expected)| {
            token == expected || (expected.len() > 2 && token.starts_with(expected))
        })
    })
}
