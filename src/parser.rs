use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::RawEventRecord;

static THINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<think>.*?</think>").expect("valid think regex"));
static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)```[a-z]*[ \t]*\r?\n?").expect("valid fence regex"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("invalid JSON: {0}")]
    JsonSyntax(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("record is not an object")]
    NotAnObject,
    #[error("missing or empty field `{0}`")]
    MissingField(&'static str),
    #[error("unexpected shape: {0}")]
    Shape(String),
}

const REQUIRED_FIELDS: [(&str, &[&str]); 7] = [
    ("name", &["name"]),
    ("date", &["date"]),
    ("time.start", &["time", "start"]),
    ("address.venue", &["address", "venue"]),
    ("address.street", &["address", "street"]),
    ("address.city", &["address", "city"]),
    ("address.state", &["address", "state"]),
];

pub fn parse_events(raw: &str) -> Result<Vec<RawEventRecord>, ParseError> {
    let without_thoughts = THINK_RE.replace_all(raw, "");
    let cleaned = FENCE_RE.replace_all(&without_thoughts, "");
    let payload = isolate_payload(&cleaned)?;

    let parsed: Value =
        serde_json::from_str(payload).map_err(|err| ParseError::JsonSyntax(err.to_string()))?;

    let candidates = match parsed {
        Value::Object(mut map) if matches!(map.get("cards"), Some(Value::Array(_))) => {
            match map.remove("cards") {
                Some(Value::Array(cards)) => cards,
                _ => Vec::new(),
            }
        }
        Value::Array(items) => items,
        other => vec![other],
    };

    let total = candidates.len();
    let records: Vec<RawEventRecord> = candidates
        .into_iter()
        .enumerate()
        .filter_map(|(index, candidate)| match validate_record(candidate) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(index, "dropping event record: {err}");
                None
            }
        })
        .collect();

    debug!(total, kept = records.len(), "parsed event payload");
    Ok(records)
}

pub fn validate_record(candidate: Value) -> Result<RawEventRecord, ValidationError> {
    if !candidate.is_object() {
        return Err(ValidationError::NotAnObject);
    }
    for (label, path) in REQUIRED_FIELDS {
        let present = path
            .iter()
            .try_fold(&candidate, |node, key| node.get(*key))
            .and_then(Value::as_str)
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        if !present {
            return Err(ValidationError::MissingField(label));
        }
    }
    serde_json::from_value(candidate).map_err(|err| ValidationError::Shape(err.to_string()))
}

/// Slice out the first balanced JSON array or object, ignoring surrounding prose.
fn isolate_payload(text: &str) -> Result<&str, ParseError> {
    let start = text
        .find(['[', '{'])
        .ok_or_else(|| ParseError::MalformedPayload("no JSON array or object found".to_string()))?;

    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, byte) in text.as_bytes()[start..].iter().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'[' => stack.push(b']'),
            b'{' => stack.push(b'}'),
            b']' | b'}' => {
                if stack.pop() != Some(*byte) {
                    return Err(ParseError::MalformedPayload(
                        "mismatched closing bracket".to_string(),
                    ));
                }
                if stack.is_empty() {
                    let end = start + offset + 1;
                    return Ok(&text[start..end]);
                }
            }
            _ => {}
        }
    }

    Err(ParseError::MalformedPayload(
        "no matching closing bracket".to_string(),
    ))
}
