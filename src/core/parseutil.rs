//! Coercions for dynamically-typed configuration values.
//!
//! Driver options arrive as JSON-like values: strings, numbers, or bools.
//! Each function here accepts any of the shapes an operator might write and
//! returns a typed value or an error naming what was wrong.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use std::time::Duration;

/// Parse failure with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ParseError(String);

impl ParseError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

type ParseResult<T> = Result<T, ParseError>;

/// Parse an integer from a number or numeric string.
pub fn parse_int(value: &Value) -> ParseResult<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or_else(|| ParseError::new(format!("{} is not an integer", n))),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| ParseError::new(format!("{:?} is not an integer", s))),
        other => Err(ParseError::new(format!(
            "expected integer, got {}",
            type_name(other)
        ))),
    }
}

/// Parse a non-negative integer that fits in `usize`.
pub fn parse_usize(value: &Value) -> ParseResult<usize> {
    let n = parse_int(value)?;
    usize::try_from(n).map_err(|_| ParseError::new(format!("{} must not be negative", n)))
}

/// Parse a bool from a bool, a number (0/1) or a string.
pub fn parse_bool(value: &Value) -> ParseResult<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(ParseError::new(format!("{} is not a boolean", n))),
        },
        Value::String(s) => parse_bool_str(s),
        other => Err(ParseError::new(format!(
            "expected boolean, got {}",
            type_name(other)
        ))),
    }
}

fn parse_bool_str(s: &str) -> ParseResult<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Ok(true),
        "0" | "f" | "false" | "no" | "off" => Ok(false),
        _ => Err(ParseError::new(format!("{:?} is not a boolean", s))),
    }
}

/// Parse a duration. Bare numbers are seconds; strings accept
/// `"9876"`, `"9876s"`, `"150ms"`, `"1h"`, `"1h30m"` and so on.
pub fn parse_duration(value: &Value) -> ParseResult<Duration> {
    match value {
        Value::Number(n) => {
            if let Some(secs) = n.as_u64() {
                Ok(Duration::from_secs(secs))
            } else if let Some(secs) = n.as_f64().filter(|f| *f >= 0.0 && f.is_finite()) {
                Ok(Duration::from_secs_f64(secs))
            } else {
                Err(ParseError::new(format!("{} is not a valid duration", n)))
            }
        }
        Value::String(s) => parse_duration_str(s),
        other => Err(ParseError::new(format!(
            "expected duration, got {}",
            type_name(other)
        ))),
    }
}

/// Parse a duration string; a bare integer means seconds.
pub fn parse_duration_str(input: &str) -> ParseResult<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ParseError::new("empty duration"));
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| ParseError::new(format!("missing unit in duration {:?}", input)))?;
        if num_len == 0 {
            return Err(ParseError::new(format!("invalid duration {:?}", input)));
        }
        let number: f64 = rest[..num_len]
            .parse()
            .map_err(|_| ParseError::new(format!("invalid duration {:?}", input)))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let scale = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "d" => 86_400.0,
            _ => {
                return Err(ParseError::new(format!(
                    "unknown unit {:?} in duration {:?}",
                    unit, input
                )))
            }
        };
        total += Duration::from_secs_f64(number * scale);
    }
    Ok(total)
}

/// Parse a string. Numbers and bools are rendered to their textual form.
pub fn parse_string(value: &Value) -> ParseResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ParseError::new(format!(
            "expected string, got {}",
            type_name(other)
        ))),
    }
}

/// Parse a comma-separated list or an array of strings. Blank items are dropped.
pub fn parse_comma_strings(value: &Value) -> ParseResult<Vec<String>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(parse_string)
            .map(|r| r.map(|s| s.trim().to_string()))
            .filter(|r| r.as_ref().map(|s| !s.is_empty()).unwrap_or(true))
            .collect(),
        Value::String(s) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()),
        other => Err(ParseError::new(format!(
            "expected comma-separated string, got {}",
            type_name(other)
        ))),
    }
}

/// Parse opaque bytes: `base64:`-prefixed and plain base64 strings are decoded,
/// anything that is not valid base64 is taken as raw UTF-8.
pub fn parse_bytes(value: &Value) -> ParseResult<Vec<u8>> {
    let s = parse_string(value)?;
    if let Some(encoded) = s.strip_prefix("base64:") {
        return STANDARD
            .decode(encoded.trim())
            .map_err(|e| ParseError::new(format!("invalid base64: {}", e)));
    }
    Ok(STANDARD
        .decode(s.trim())
        .unwrap_or_else(|_| s.into_bytes()))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
