//! Content safety screening
//!
//! Every category has an independent detector:
//! - `pii`: identifiers such as SSNs, card numbers, emails and phone numbers,
//!   gated by surrounding context so bare digit groups are not flagged
//! - `toxicity`: violent, self-harm, hateful, harassing and sexual language
//! - `jailbreak`: instruction override and safety bypass attempts (input only)
//! - `bias`: stereotyping phrases
//!
//! Severity is fixed per category and sub-pattern. Scans are pure and
//! deterministic: the same text always yields the same findings in the same
//! order.

mod patterns;
mod pii;

use crate::config::SafetyConfig;
use crate::gateway::Message;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Placeholder prefix written over redacted spans
pub const REDACTION_PREFIX: &str = "[REDACTED:";

/// Shown to callers in place of model output that failed the output screen
pub const WITHHELD_NOTICE: &str = "[CONTENT WITHHELD: the model response failed the output safety screen]";

/// Finding category
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Pii,
    Toxicity,
    Jailbreak,
    Bias,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Pii => "pii",
            Category::Toxicity => "toxicity",
            Category::Jailbreak => "jailbreak",
            Category::Bias => "bias",
        }
    }

    /// Placeholder written over a redacted span of this category
    pub fn placeholder(&self) -> String {
        format!("{}{}]", REDACTION_PREFIX, self.as_str())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finding severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        })
    }
}

/// Which side of the provider call is being screened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Input => "input",
            Direction::Output => "output",
        })
    }
}

/// What redaction does with a finding's span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedactionAction {
    /// Replace the span with a category placeholder
    Mask,
    /// Record only; text is left as is
    Flag,
}

/// Byte range within the scanned text
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// One detector hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub category: Category,
    /// Sub-pattern that matched, e.g. `ssn` or `violence`
    pub rule: String,
    pub severity: Severity,
    pub direction: Direction,
    /// Index of the message the span refers to; `None` for free text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_index: Option<usize>,
    pub span: Span,
    pub action: RedactionAction,
    pub confidence: f32,
}

impl Finding {
    fn sort_key(&self) -> (Option<usize>, Span, Category, &str) {
        (self.message_index, self.span, self.category, self.rule.as_str())
    }
}

/// Raw detector output before direction and message index are attached
#[derive(Debug, Clone)]
pub(crate) struct Hit {
    pub category: Category,
    pub rule: &'static str,
    pub severity: Severity,
    pub start: usize,
    pub end: usize,
    pub action: RedactionAction,
    pub confidence: f32,
}

/// Summary over a set of findings
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub findings: Vec<Finding>,
}

impl ScanReport {
    pub fn new(findings: Vec<Finding>) -> Self {
        Self { findings }
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }

    /// Any critical finding blocks the request
    pub fn is_blocking(&self) -> bool {
        self.max_severity() == Some(Severity::Critical)
    }

    /// True when some finding is strictly above `severity`
    pub fn has_above(&self, severity: Severity) -> bool {
        self.findings.iter().any(|f| f.severity > severity)
    }

    pub fn count(&self, category: Category) -> usize {
        self.findings
            .iter()
            .filter(|f| f.category == category)
            .count()
    }

    /// Short human-readable reason naming the blocking rules
    pub fn blocking_reason(&self) -> String {
        let mut rules: Vec<String> = self
            .findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .map(|f| format!("{}/{}", f.category, f.rule))
            .collect();
        rules.dedup();
        if rules.is_empty() {
            "no critical findings".to_string()
        } else {
            format!("critical content detected ({})", rules.join(", "))
        }
    }
}

/// Pattern and heuristic screener
#[derive(Debug, Clone, Default)]
pub struct SafetyScreener {
    config: SafetyConfig,
}

impl SafetyScreener {
    pub fn new(config: SafetyConfig) -> Self {
        Self { config }
    }

    /// Scan a single text
    pub fn scan(&self, text: &str, direction: Direction) -> Vec<Finding> {
        if !self.config.enabled || text.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<Hit> = Vec::new();
        if self.config.pii {
            hits.extend(pii::detect(text));
        }
        if self.config.toxicity {
            hits.extend(patterns::detect_toxicity(text));
        }
        if self.config.jailbreak && direction == Direction::Input {
            hits.extend(patterns::detect_jailbreak(text));
        }
        if self.config.bias {
            hits.extend(patterns::detect_bias(text));
        }

        let mut findings: Vec<Finding> = hits
            .into_iter()
            .filter(|hit| !inside_placeholder(text, hit.start, hit.end))
            .map(|hit| Finding {
                category: hit.category,
                rule: hit.rule.to_string(),
                severity: hit.severity,
                direction,
                message_index: None,
                span: Span {
                    start: hit.start,
                    end: hit.end,
                },
                action: hit.action,
                confidence: hit.confidence,
            })
            .collect();

        findings.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        findings.dedup_by(|a, b| a.sort_key() == b.sort_key());
        findings
    }

    /// Scan every message, tagging findings with the message index
    pub fn scan_messages(&self, messages: &[Message], direction: Direction) -> Vec<Finding> {
        messages
            .iter()
            .enumerate()
            .flat_map(|(index, message)| {
                self.scan(&message.content, direction)
                    .into_iter()
                    .map(move |mut finding| {
                        finding.message_index = Some(index);
                        finding
                    })
            })
            .collect()
    }

    /// Redact until no maskable finding remains
    ///
    /// Placeholders can shift context windows and expose new context-gated
    /// matches, so a single pass is not always a fixed point.
    pub fn sanitize(&self, text: &str, direction: Direction) -> String {
        self.redact_text(text, direction).0
    }

    /// Redact every message to a fixed point
    ///
    /// Returns the redacted messages and the findings from every pass,
    /// tagged with their message index. Findings from later passes carry
    /// spans into the partially redacted text.
    pub fn redact_messages(
        &self,
        messages: &[Message],
        direction: Direction,
    ) -> (Vec<Message>, Vec<Finding>) {
        let mut all = Vec::new();
        let redacted = messages
            .iter()
            .enumerate()
            .map(|(index, message)| {
                let (content, findings) = self.redact_text(&message.content, direction);
                all.extend(findings.into_iter().map(|mut finding| {
                    finding.message_index = Some(index);
                    finding
                }));
                Message {
                    role: message.role.clone(),
                    content,
                }
            })
            .collect();
        (redacted, all)
    }

    /// [`sanitize`](Self::sanitize) that also returns the findings of every pass
    pub fn redact_text(&self, text: &str, direction: Direction) -> (String, Vec<Finding>) {
        let mut current = text.to_string();
        let mut seen = Vec::new();
        for pass in 0..MAX_SANITIZE_PASSES {
            let findings = self.scan(&current, direction);
            let masked = findings.iter().any(|f| f.action == RedactionAction::Mask);
            if masked {
                current = redact(&current, &findings);
            }
            // Flag-only findings repeat on every pass; keep the first sighting
            seen.extend(
                findings
                    .into_iter()
                    .filter(|f| pass == 0 || f.action == RedactionAction::Mask),
            );
            if !masked {
                break;
            }
        }
        (current, seen)
    }
}

const MAX_SANITIZE_PASSES: usize = 8;

/// Replace masked spans with `[REDACTED:<category>]`
///
/// Overlapping spans collapse into a single placeholder named after the most
/// severe finding among them. Spans that are out of range, not on character
/// boundaries, or already inside a placeholder are ignored, so redacting
/// redacted text is a no-op.
pub fn redact(text: &str, findings: &[Finding]) -> String {
    let mut spans: Vec<(Span, Severity, Category)> = findings
        .iter()
        .filter(|f| f.action == RedactionAction::Mask)
        .filter(|f| {
            f.span.start < f.span.end
                && f.span.end <= text.len()
                && text.is_char_boundary(f.span.start)
                && text.is_char_boundary(f.span.end)
                && !inside_placeholder(text, f.span.start, f.span.end)
        })
        .map(|f| (f.span, f.severity, f.category))
        .collect();

    if spans.is_empty() {
        return text.to_string();
    }

    spans.sort_by_key(|(span, _, _)| *span);

    let mut merged: Vec<(Span, Severity, Category)> = Vec::with_capacity(spans.len());
    for (span, severity, category) in spans {
        match merged.last_mut() {
            Some((last, last_severity, last_category)) if span.start < last.end => {
                last.end = last.end.max(span.end);
                if severity > *last_severity {
                    *last_severity = severity;
                    *last_category = category;
                }
            }
            _ => merged.push((span, severity, category)),
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (span, _, category) in merged {
        out.push_str(&text[cursor..span.start]);
        out.push_str(&category.placeholder());
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// True when `[start, end)` overlaps an existing placeholder
fn inside_placeholder(text: &str, start: usize, end: usize) -> bool {
    text.match_indices(REDACTION_PREFIX).any(|(open, _)| {
        let close = text[open..].find(']').map_or(text.len(), |i| open + i + 1);
        open < end && start < close
    })
}

/// Clamp a byte offset down to the nearest character boundary
pub(crate) fn floor_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Clamp a byte offset up to the nearest character boundary
pub(crate) fn ceil_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index += 1;
    }
    index
}
