use anyhow::{Context, Result};
use regex::Regex;

/// Pulls the final numeric answer out of a completion or a GSM8K-style
/// reference answer.
pub struct NumericNormalizer {
    number: Regex,
    final_marker: Regex,
}

impl NumericNormalizer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            number: Regex::new(r"-?\d[\d,]*(?:\.\d*)?")
                .context("failed to compile numeric answer regex")?,
            final_marker: Regex::new(r"(?i)final(?:\s+answer)?\s*:")
                .context("failed to compile final-answer marker regex")?,
        })
    }

    /// Text after the last `####`, else after the last `Final:`, else the
    /// last number anywhere.
    pub fn extract(&self, raw: &str) -> Option<String> {
        if let Some((_, tail)) = raw.rsplit_once("####") {
            if let Some(found) = self.number.find(tail) {
                return Some(clean_number(found.as_str()));
            }
        }

        if let Some(marker) = self.final_marker.find_iter(raw).last() {
            let tail = &raw[marker.end()..];
            if let Some(found) = self.number.find(tail) {
                return Some(clean_number(found.as_str()));
            }
        }

        self.number
            .find_iter(raw)
            .last()
            .map(|found| clean_number(found.as_str()))
            .filter(|value| !value.is_empty())
    }
}

fn clean_number(raw: &str) -> String {
    let mut cleaned: String = raw.chars().filter(|c| *c != ',' && !c.is_whitespace()).collect();
    if cleaned.ends_with('.') {
        cleaned.pop();
    }
    if cleaned.matches('.').count() > 1 {
        cleaned.retain(|c| c != '.');
    }
    canonical_number(&cleaned)
}

/// "72.0", "072" and "72" all become "72" so equal values vote together.
fn canonical_number(cleaned: &str) -> String {
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, cleaned),
    };
    let (integer, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    let integer = integer.trim_start_matches('0');
    let fraction = fraction.trim_end_matches('0');

    let mut canonical = String::with_capacity(cleaned.len());
    if integer.is_empty() {
        canonical.push('0');
    } else {
        canonical.push_str(integer);
    }
    if !fraction.is_empty() {
        canonical.push('.');
        canonical.push_str(fraction);
    }
    if negative && canonical != "0" {
        canonical.insert(0, '-');
    }
    canonical
}

/// Exact-match normalization for free-text answers.
pub fn normalize_text(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let trimmed = collapsed.trim_end_matches('.').to_string();
    (!trimmed.is_empty()).then_some(trimmed)
}

pub fn numeric_equal(expected: &str, predicted: &str) -> bool {
    if expected == predicted {
        return true;
    }
    match (expected.parse::<f64>(), predicted.parse::<f64>()) {
        (Ok(a), Ok(b)) => (a - b).abs() < 1e-9,
        _ => false,
    }
}
