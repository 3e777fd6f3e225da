//! Usage accounting over opaque Gateway snapshots.
//!
//! The relay never interprets model names or token math beyond this: it
//! stores the raw before/after `sessions.usage` snapshots and reports the
//! element-wise non-negative difference of their totals.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical token totals extracted from a snapshot's `totals` map. The
/// field set of the map is not pinned by the Gateway, so extraction accepts
/// the well-known camelCase and snake_case aliases.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub total_tokens: u64,
}

/// Per-message consumption reported to the backend.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageDelta {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

pub fn extract_totals(snapshot: &Value) -> UsageTotals {
    let Some(totals) = snapshot.get("totals").and_then(Value::as_object) else {
        return UsageTotals::default();
    };
    let read = |aliases: &[&str]| -> u64 {
        for alias in aliases {
            if let Some(value) = totals.get(*alias) {
                if let Some(number) = value.as_u64() {
                    return number;
                }
                if let Some(number) = value.as_f64() {
                    if number > 0.0 {
                        return number as u64;
                    }
                }
            }
        }
        0
    };
    UsageTotals {
        input_tokens: read(&["input", "inputTokens", "input_tokens"]),
        output_tokens: read(&["output", "outputTokens", "output_tokens"]),
        cache_read_tokens: read(&[
            "cacheRead",
            "cache_read",
            "cacheReadTokens",
            "cache_read_tokens",
        ]),
        total_tokens: read(&["totalTokens", "total_tokens", "total"]),
    }
}

/// Element-wise `max(0, outgoing - incoming)` plus the model derived from
/// the outgoing snapshot's first `aggregates.byModel` row.
pub fn usage_delta(incoming: &Value, outgoing: &Value) -> UsageDelta {
    let before = extract_totals(incoming);
    let after = extract_totals(outgoing);
    UsageDelta {
        input_tokens: after.input_tokens.saturating_sub(before.input_tokens),
        output_tokens: after.output_tokens.saturating_sub(before.output_tokens),
        cache_read_tokens: after
            .cache_read_tokens
            .saturating_sub(before.cache_read_tokens),
        total_tokens: after.total_tokens.saturating_sub(before.total_tokens),
        model: derive_model(outgoing),
    }
}

fn derive_model(snapshot: &Value) -> Option<String> {
    let row = snapshot.pointer("/aggregates/byModel/0")?;
    let model = row.get("model").and_then(Value::as_str)?;
    match row.get("provider").and_then(Value::as_str) {
        Some(provider) if !provider.is_empty() => Some(format!("{provider}/{model}")),
        _ => Some(model.to_string()),
    }
}
