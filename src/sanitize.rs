use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::PipelineError;

/// Every key the shared channel may carry. Anything else blocks the write.
pub const SHARED_FIELDS: &[&str] = &[
    "event",
    "timestamp",
    "run_id",
    "item_id",
    "pipeline_run_id",
    "instance_index",
    "stage",
    "stage_index",
    "temperature",
    "prompt_tokens",
    "completion_tokens",
    "total_tokens",
    "cost",
    "prompt_hash",
    "response_hash",
    "input_chars",
    "output_chars",
    "attempt",
    "attempt_count",
    "error_class",
    "delay_ms",
    "error",
    "status",
    "is_correct",
    "answer_hash",
    "decision",
    "instances",
    "consensus_votes",
    "alert_level",
    "budget_used_pct",
    "cumulative_tokens",
    "cumulative_cost",
    "projected_total_cost",
    "processed_items",
    "total_items",
    "items_over_cap",
    "reason",
];

/// Free text in the shared channel is cut to the length of a hex SHA-256
/// digest.
pub const MAX_SHARED_TEXT_CHARS: usize = 64;

/// Shared-channel projection of an event. Raw prompt and response text has
/// no field here; it is represented by hashes and character counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SharedRecord {
    pub event: String,
    pub timestamp: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_chars: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_chars: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_correct: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus_votes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_used_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cumulative_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cumulative_cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projected_total_cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_items: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_items: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_over_cap: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct Sanitizer {
    allowed_fields: &'static [&'static str],
    redactions: Vec<(&'static str, Regex)>,
}

impl Sanitizer {
    pub fn new() -> Result<Self> {
        Self::with_allowed_fields(SHARED_FIELDS)
    }

    pub fn with_allowed_fields(allowed_fields: &'static [&'static str]) -> Result<Self> {
        // Card numbers go first so the phone pattern cannot split them.
        let patterns = [
            ("CREDIT_CARD", r"\b(?:\d{4}[- ]?){3}\d{4}\b"),
            ("EMAIL", r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}"),
            ("PHONE", r"(?:\+?\d{1,3}[- ]?)?\(?\d{2,3}\)?[- ]?\d{3,4}[- ]?\d{4}"),
            ("IP_ADDRESS", r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b"),
        ];

        let mut redactions = Vec::with_capacity(patterns.len());
        for (name, pattern) in patterns {
            let regex = Regex::new(pattern)
                .with_context(|| format!("failed to compile {name} redaction regex"))?;
            redactions.push((name, regex));
        }

        Ok(Self {
            allowed_fields,
            redactions,
        })
    }

    pub fn redact(&self, text: &str) -> String {
        let mut redacted = text.to_string();
        for (name, regex) in &self.redactions {
            if regex.is_match(&redacted) {
                redacted = regex
                    .replace_all(&redacted, format!("[REDACTED_{name}]").as_str())
                    .into_owned();
            }
        }
        redacted
    }

    /// Redacts and truncates a free-text value bound for the shared channel.
    pub fn shared_text(&self, text: &str) -> String {
        self.redact(text).chars().take(MAX_SHARED_TEXT_CHARS).collect()
    }

    /// Serializes the record and checks it against the whitelist. Fails
    /// closed: any unknown key or oversized string is a violation.
    pub fn project(&self, record: &SharedRecord) -> Result<Map<String, Value>, PipelineError> {
        let map = match serde_json::to_value(record)? {
            Value::Object(map) => map,
            other => {
                return Err(PipelineError::SanitizationViolation(format!(
                    "shared record is not an object: {}",
                    json_kind(&other)
                )));
            }
        };
        self.verify(&map)?;
        Ok(map)
    }

    pub fn verify(&self, map: &Map<String, Value>) -> Result<(), PipelineError> {
        for (key, value) in map {
            if !self.allowed_fields.contains(&key.as_str()) {
                return Err(PipelineError::SanitizationViolation(format!(
                    "field `{key}` is not permitted in the shared channel"
                )));
            }
            match value {
                Value::String(text) if text.chars().count() > MAX_SHARED_TEXT_CHARS => {
                    return Err(PipelineError::SanitizationViolation(format!(
                        "field `{key}` carries {} chars of text",
                        text.chars().count()
                    )));
                }
                Value::Array(_) | Value::Object(_) => {
                    return Err(PipelineError::SanitizationViolation(format!(
                        "field `{key}` is a nested {}",
                        json_kind(value)
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
