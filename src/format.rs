//! Converts runtime payloads into tool result content.
//!
//! A successful call produces, in order:
//!
//! 1. a Markdown summary: a titled `Statistic | Value` table built from the
//!    flattened payload, followed by a significance sentence when the payload
//!    carries a `p_value`
//! 2. the runtime's own formatted text, when it printed any
//! 3. the payload as pretty JSON
//!
//! The payload is also returned unchanged as `structuredContent`.

use std::fmt::Write as _;

use serde_json::Value;

use crate::bridge::ScriptOutput;
use crate::mcp::types::{ContentBlock, ToolCallResult};

/// Significance level used when the payload does not state one.
const DEFAULT_ALPHA: f64 = 0.05;

/// Arrays longer than this are summarised by length.
const MAX_INLINE_VALUES: usize = 8;

/// Words rendered verbatim (or with fixed casing) in statistic names.
const FIXED_WORDS: &[(&str, &str)] = &[
    ("ci", "CI"),
    ("df", "df"),
    ("n", "n"),
    ("p", "p"),
    ("r", "r"),
    ("sd", "SD"),
    ("se", "SE"),
];

/// Builds the result of a successful tool call.
#[must_use]
pub fn format_success(tool: &str, output: &ScriptOutput) -> ToolCallResult {
    let mut content = vec![ContentBlock::text(summary(tool, &output.payload))];

    if let Some(text) = output.formatted.as_deref().map(str::trim) {
        if !text.is_empty() {
            content.push(ContentBlock::text(text));
        }
    }

    let json = serde_json::to_string_pretty(&output.payload)
        .unwrap_or_else(|_| output.payload.to_string());
    content.push(ContentBlock::text(format!("```json\n{json}\n```")));

    ToolCallResult {
        content,
        structured_content: Some(output.payload.clone()),
        is_error: false,
    }
}

/// The Markdown table plus significance sentence.
#[must_use]
pub fn summary(tool: &str, payload: &Value) -> String {
    let mut rows = Vec::new();
    flatten("", payload, &mut rows);

    let mut out = format!("## {}\n\n| Statistic | Value |\n|---|---|\n", title(tool));
    for (key, value) in &rows {
        let _ = writeln!(out, "| {} | {} |", escape(key), escape(value));
    }
    if rows.is_empty() {
        out.push_str("| (no statistics) | |\n");
    }

    if let Some(sentence) = significance(payload) {
        out.push('\n');
        out.push_str(&sentence);
        out.push('\n');
    }
    out
}

/// Describes the `p_value` against `alpha` (default 0.05).
#[must_use]
pub fn significance(payload: &Value) -> Option<String> {
    let p = payload.get("p_value").and_then(Value::as_f64)?;
    let alpha = payload
        .get("alpha")
        .and_then(Value::as_f64)
        .filter(|a| *a > 0.0 && *a < 1.0)
        .unwrap_or(DEFAULT_ALPHA);

    let level = compact_number(alpha * 100.0);
    let p_text = format_p(p);
    Some(if p < alpha {
        format!("The result is statistically significant at the {level}% level ({p_text}).")
    } else {
        format!("The result is not statistically significant at the {level}% level ({p_text}).")
    })
}

fn format_p(p: f64) -> String {
    if p < 0.001 {
        "p < 0.001".to_string()
    } else {
        format!("p = {}", compact_number(p))
    }
}

fn flatten(prefix: &str, value: &Value, rows: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let name = humanise(key);
                let label = if prefix.is_empty() {
                    name
                } else {
                    format!("{prefix} / {name}")
                };
                flatten(&label, child, rows);
            }
        }
        Value::Array(items) if items.iter().any(Value::is_object) => {
            for (i, child) in items.iter().enumerate() {
                flatten(&format!("{prefix} [{}]", i + 1), child, rows);
            }
        }
        Value::Array(items) if items.len() > MAX_INLINE_VALUES => {
            rows.push((prefix.to_string(), format!("{} values", items.len())));
        }
        Value::Array(items) => {
            let joined = items.iter().map(scalar).collect::<Vec<_>>().join(", ");
            rows.push((prefix.to_string(), joined));
        }
        other => rows.push((prefix.to_string(), scalar(other))),
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::Null => "NA".to_string(),
        Value::Bool(b) => (if *b { "yes" } else { "no" }).to_string(),
        Value::Number(n) => n
            .as_i64()
            .map(|i| i.to_string())
            .or_else(|| n.as_f64().map(compact_number))
            .unwrap_or_else(|| n.to_string()),
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Formats a number with at most four decimals, switching to scientific
/// notation for very small or very large magnitudes.
#[must_use]
pub fn compact_number(x: f64) -> String {
    if !x.is_finite() {
        return x.to_string();
    }
    if x == 0.0 {
        return "0".to_string();
    }
    let magnitude = x.abs();
    if !(1e-4..1e9).contains(&magnitude) {
        return format!("{x:.3e}");
    }
    let fixed = format!("{x:.4}");
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    if trimmed == "-0" || trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `r_squared` → `r squared`, `ci_lower` → `CI lower`, `mean` → `Mean`.
#[must_use]
pub fn humanise(key: &str) -> String {
    key.split(['_', '.'])
        .filter(|w| !w.is_empty())
        .enumerate()
        .map(|(i, word)| {
            let lower = word.to_ascii_lowercase();
            if let Some((_, fixed)) = FIXED_WORDS.iter().find(|(w, _)| *w == lower) {
                return (*fixed).to_string();
            }
            if i == 0 {
                let mut chars = lower.chars();
                chars.next().map_or_else(String::new, |first| {
                    first.to_ascii_uppercase().to_string() + chars.as_str()
                })
            } else {
                lower
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn title(tool: &str) -> String {
    tool.split('_')
        .filter(|w| !w.is_empty())
        .map(|word| {
            if word.len() == 1 {
                return word.to_ascii_lowercase();
            }
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_ascii_uppercase().to_string() + chars.as_str()
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn escape(cell: &str) -> String {
    cell.replace('|', "\\|").replace('\n', " ")
}
