//! Personally identifiable information detection
//!
//! A rule either has a self-evident shape (dashed SSN, email, card number
//! with a valid checksum and issuer prefix) or needs supporting keywords
//! within `CONTEXT_WINDOW` bytes of the match. Context-gated rules report only
//! when `base_confidence * context_factor` reaches `REPORT_THRESHOLD`.

use super::{ceil_boundary, floor_boundary, Category, Hit, RedactionAction, Severity};
use regex::Regex;
use std::sync::LazyLock;

const CONTEXT_WINDOW: usize = 50;
const REPORT_THRESHOLD: f32 = 0.5;

/// Extra check applied to a raw regex match
#[derive(Debug, Clone, Copy)]
enum Validator {
    None,
    Ssn,
    Luhn,
}

struct PiiRule {
    name: &'static str,
    pattern: Regex,
    severity: Severity,
    base_confidence: f32,
    keywords: &'static [&'static str],
    /// Reported without context keywords
    structured: bool,
    validator: Validator,
}

static RULES: LazyLock<Vec<PiiRule>> = LazyLock::new(|| {
    let rule = |name, pattern: &str, severity, base_confidence, keywords, structured, validator| {
        PiiRule {
            name,
            pattern: Regex::new(pattern).expect("pii pattern is valid"),
            severity,
            base_confidence,
            keywords,
            structured,
            validator,
        }
    };

    vec![
        rule(
            "email",
            r"(?i)\b[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}\b",
            Severity::Medium,
            0.95,
            &["email", "contact", "reach", "send", "mail"],
            true,
            Validator::None,
        ),
        rule(
            "ssn",
            r"\b\d{3}-\d{2}-\d{4}\b",
            Severity::High,
            0.98,
            &["ssn", "social", "security", "number", "id"],
            true,
            Validator::Ssn,
        ),
        rule(
            "ssn",
            r"\b\d{9}\b",
            Severity::High,
            0.98,
            &["ssn", "social", "security"],
            false,
            Validator::Ssn,
        ),
        rule(
            "credit_card",
            r"\b\d(?:[ -]?\d){12,18}\b",
            Severity::High,
            0.92,
            &["card", "credit", "payment", "visa", "mastercard", "amex"],
            true,
            Validator::Luhn,
        ),
        rule(
            "phone",
            r"(?:\+1[-. ]?)?(?:\(\d{3}\)\s?|\b\d{3}[-. ])\d{3}[-. ]\d{4}\b",
            Severity::Medium,
            0.90,
            &["phone", "call", "contact", "mobile", "cell", "text"],
            false,
            Validator::None,
        ),
        rule(
            "ip_address",
            r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b",
            Severity::Low,
            0.85,
            &["ip", "address", "network", "server", "host"],
            false,
            Validator::None,
        ),
        rule(
            "street_address",
            r"\b\d{1,5}\s+(?:[A-Z][a-z]+\s+){1,3}(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Lane|Ln|Drive|Dr)\b",
            Severity::Medium,
            0.75,
            &["address", "street", "live", "lives", "location", "residence"],
            false,
            Validator::None,
        ),
        rule(
            "date_of_birth",
            r"\b(?:0[1-9]|1[0-2])[/-](?:0[1-9]|[12]\d|3[01])[/-](?:19|20)\d{2}\b",
            Severity::Medium,
            0.80,
            &["birth", "born", "dob", "birthday", "age"],
            false,
            Validator::None,
        ),
        rule(
            "passport",
            r"\b[A-Z]{1,2}\d{6,9}\b",
            Severity::High,
            0.70,
            &["passport", "travel", "document", "nationality"],
            false,
            Validator::None,
        ),
    ]
});

/// Run every PII rule over `text`
pub(crate) fn detect(text: &str) -> Vec<Hit> {
    let mut hits = Vec::new();

    for rule in RULES.iter() {
        for m in rule.pattern.find_iter(text) {
            if !validate(rule.validator, m.as_str()) {
                continue;
            }

            let confidence = if rule.structured {
                rule.base_confidence
            } else {
                let factor = context_factor(text, m.start(), m.end(), rule.keywords);
                rule.base_confidence * factor
            };

            if confidence < REPORT_THRESHOLD {
                continue;
            }

            hits.push(Hit {
                category: Category::Pii,
                rule: rule.name,
                severity: rule.severity,
                start: m.start(),
                end: m.end(),
                action: RedactionAction::Mask,
                confidence,
            });
        }
    }

    hits
}

/// 0.3 with no supporting keyword nearby, 0.6 with one, 0.9 with two or more
fn context_factor(text: &str, start: usize, end: usize, keywords: &[&str]) -> f32 {
    let lo = floor_boundary(text, start.saturating_sub(CONTEXT_WINDOW));
    let hi = ceil_boundary(text, end + CONTEXT_WINDOW);
    let before = text[lo..start].to_lowercase();
    let after = text[end..hi].to_lowercase();

    let found = keywords
        .iter()
        .filter(|keyword| contains_word(&before, keyword) || contains_word(&after, keyword))
        .count();

    match found {
        0 => 0.3,
        1 => 0.6,
        _ => 0.9,
    }
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| token == word)
}

fn validate(validator: Validator, candidate: &str) -> bool {
    match validator {
        Validator::None => true,
        Validator::Ssn => valid_ssn(candidate),
        Validator::Luhn => valid_card(candidate),
    }
}

/// Area 000, 666 and 900-999, group 00 and serial 0000 are never issued
fn valid_ssn(candidate: &str) -> bool {
    let digits: String = candidate.chars().filter(char::is_ascii_digit).collect();
    if digits.len() != 9 {
        return false;
    }
    let (area, rest) = digits.split_at(3);
    let (group, serial) = rest.split_at(2);
    area != "000" && area != "666" && !area.starts_with('9') && group != "00" && serial != "0000"
}

/// Luhn checksum plus a known issuer prefix and length
fn valid_card(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();

    let issuer = match digits.as_slice() {
        [4, ..] => matches!(digits.len(), 13 | 16 | 19),
        [5, 1..=5, ..] => digits.len() == 16,
        [3, 4 | 7, ..] => digits.len() == 15,
        [6, 0, 1, 1, ..] | [6, 5, ..] => digits.len() == 16,
        _ => false,
    };
    if !issuer {
        return false;
    }

    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();

    sum % 10 == 0
}
