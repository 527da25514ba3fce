//! Pump reply parsing.
//!
//! A raw reply is reduced in four steps:
//! 1. strip STX/ETX framing and line terminators,
//! 2. strip a two-digit address echo if present,
//! 3. reject anything starting with `?` (or a prompt followed by `?`),
//! 4. split the remaining payload into prompt, numeric value and unit.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use super::units::PumpStatus;
use super::{ETX, STX};

/// `40.00MM`, `21.10ML`, `2000UM`, `26.59`
static VALUE_UNIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([-+]?\d*\.?\d+)\s*([A-Za-z]{2})?$").expect("static regex is valid")
});

/// Failure to interpret a reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Nothing but framing (or nothing at all) arrived.
    #[error("empty response")]
    Empty,
    /// Bytes arrived but do not follow the reply grammar.
    #[error("malformed response {0:?}")]
    Malformed(String),
    /// The pump answered with an error indicator; carries the raw text.
    #[error("{0}")]
    Rejected(String),
}

/// A successfully parsed reply.
#[derive(Debug, Clone, PartialEq)]
pub struct PumpResponse {
    /// Address echoed by the pump, if any.
    pub address: Option<u8>,
    /// Raw prompt character.
    pub prompt: char,
    /// Motor state decoded from the prompt.
    pub status: PumpStatus,
    /// Everything after the prompt, trimmed (`INF`, `2000UM`, ...).
    pub payload: String,
    /// Numeric part of the payload, if it has one.
    pub value: Option<f64>,
    /// Two-letter unit following the value (`ML`, `UM`, ...).
    pub unit: Option<String>,
}

/// Remove STX/ETX framing, CR/LF and NULs, then trim whitespace.
pub fn strip_framing(raw: &[u8]) -> String {
    let cleaned: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|b| !matches!(*b, STX | ETX | b'\r' | b'\n' | 0))
        .collect();
    String::from_utf8_lossy(&cleaned).trim().to_string()
}

/// Split off a leading two-digit address echo.  Only strips when a prompt
/// or error marker follows, so a bare numeric payload is left alone.
fn split_address(text: &str) -> (Option<u8>, &str) {
    let bytes = text.as_bytes();
    if bytes.len() > 2
        && bytes[0].is_ascii_digit()
        && bytes[1].is_ascii_digit()
        && (bytes[2].is_ascii_alphabetic() || bytes[2] == b'?')
    {
        let address = (bytes[0] - b'0') * 10 + (bytes[1] - b'0');
        (Some(address), &text[2..])
    } else {
        (None, text)
    }
}

/// Parse one framed reply.
pub fn parse_response(raw: &[u8]) -> Result<PumpResponse, CodecError> {
    let text = strip_framing(raw);
    if text.is_empty() {
        return Err(CodecError::Empty);
    }

    let (address, body) = split_address(&text);
    if body.starts_with('?') {
        return Err(CodecError::Rejected(text.clone()));
    }

    let mut chars = body.chars();
    let prompt = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => c,
        _ => return Err(CodecError::Malformed(text.clone())),
    };
    let rest = chars.as_str().trim();
    if rest.starts_with('?') {
        return Err(CodecError::Rejected(text.clone()));
    }

    let (value, unit) = match VALUE_UNIT_RE.captures(rest) {
        Some(caps) => (
            caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()),
            caps.get(2).map(|m| m.as_str().to_ascii_uppercase()),
        ),
        None => (None, None),
    };

    Ok(PumpResponse {
        address,
        prompt,
        status: PumpStatus::from_prompt(prompt),
        payload: rest.to_string(),
        value,
        unit,
    })
}
