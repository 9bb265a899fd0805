//! Extraction of R error diagnostics from standard error.
//!
//! R reports a failed top-level call as
//!
//! ```text
//! Error in cor(x, y) : incompatible dimensions
//! Calls: main -> cor
//! Execution halted
//! ```
//!
//! with variants for `stop()` at top level (`Error: message`), long calls
//! (message on the following line) and rlang-style conditions
//! (`Error in `f()`:` followed by `! message`). Only the error line and its
//! continuation are kept; call traces are dropped.

use std::sync::OnceLock;

use regex::Regex;

/// A parsed runtime diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// One-line error message.
    pub message: String,
    /// The error block without trace lines.
    pub text: String,
}

fn error_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Error(?: in (?P<call>.+?))?\s?:(?:\s+(?P<message>.*))?$")
            .unwrap_or_else(|e| unreachable!("static regex is valid: {e}"))
    })
}

/// Lines that end the diagnostic block.
fn is_trace_marker(line: &str) -> bool {
    const MARKERS: [&str; 6] = [
        "Calls:",
        "Execution halted",
        "In addition:",
        "Backtrace:",
        "Traceback",
        "Warning message",
    ];
    let trimmed = line.trim_start();
    MARKERS.iter().any(|m| trimmed.starts_with(m))
}

/// Finds the first R error in `stderr`.
///
/// Returns `None` when no line looks like an R error, which the bridge treats
/// as an unexplained process failure.
#[must_use]
pub fn parse(stderr: &str) -> Option<Diagnostic> {
    let lines: Vec<&str> = stderr.lines().collect();
    let (index, captures) = lines
        .iter()
        .enumerate()
        .find_map(|(i, line)| error_line().captures(line.trim_end()).map(|c| (i, c)))?;

    let continuation: Vec<&str> = lines[index + 1..]
        .iter()
        .take_while(|line| !is_trace_marker(line))
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .collect();

    let inline = captures
        .name("message")
        .map(|m| m.as_str().trim())
        .filter(|m| !m.is_empty());
    let message = inline
        .map(str::to_string)
        .or_else(|| {
            continuation
                .first()
                .map(|line| line.trim_start_matches("! ").to_string())
        })
        .or_else(|| {
            captures
                .name("call")
                .map(|call| format!("error in {}", call.as_str()))
        })
        .unwrap_or_else(|| "script error".to_string());

    let mut text = lines[index].trim_end().to_string();
    for line in &continuation {
        text.push('\n');
        text.push_str(line);
    }

    Some(Diagnostic { message, text })
}

/// Keeps at most `max_chars` characters from the end of `text`.
#[must_use]
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - max_chars).collect();
    format!("…{tail}")
}
