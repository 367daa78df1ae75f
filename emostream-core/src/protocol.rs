//! Wire protocol for the inference stream.
//!
//! The client sends raw binary JPEG frames. The server answers with text JSON
//! frames of three known shapes:
//! - `{"status": "connected", "session_id": "..."}`: handshake, first message
//! - `{"emotion": "...", "confidence": 0.93, "timestamp": ...}`: one result
//! - `{"error": "..."}`: per-frame failure (e.g. no face), connection stays up
//!
//! Anything else parses to [`ServerMessage::Unknown`] so callers can log and drop it.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::models::{EmotionLabel, InferenceResult};

/// Longest raw payload echoed back in `Unknown`.
const RAW_PREVIEW_LEN: usize = 120;

/// Epoch values above this are taken as milliseconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Connected { session_id: String },
    Result(InferenceResult),
    Error { message: String },
    Unknown { reason: String, raw: String },
}

#[derive(Debug, Deserialize, Default)]
struct RawServerMessage {
    status: Option<String>,
    session_id: Option<Value>,
    emotion: Option<String>,
    confidence: Option<f64>,
    timestamp: Option<Value>,
    error: Option<String>,
}

impl ServerMessage {
    pub fn parse(text: &str) -> ServerMessage {
        let raw: RawServerMessage = match serde_json::from_str(text) {
            Ok(raw) => raw,
            Err(e) => return unknown(text, format!("not a JSON object: {e}")),
        };

        if let Some(message) = raw.error {
            return ServerMessage::Error { message };
        }

        if raw.status.as_deref() == Some("connected") {
            return match raw.session_id.as_ref().and_then(id_to_string) {
                Some(session_id) => ServerMessage::Connected { session_id },
                None => unknown(text, "handshake without session_id".to_string()),
            };
        }

        if let Some(emotion) = raw.emotion {
            let confidence = match raw.confidence {
                Some(c) if c.is_finite() && (0.0..=1.0).contains(&c) => c as f32,
                Some(c) => return unknown(text, format!("confidence {c} outside [0, 1]")),
                None => return unknown(text, "result without confidence".to_string()),
            };
            let timestamp = match raw.timestamp {
                None | Some(Value::Null) => Utc::now(),
                Some(value) => match parse_timestamp(&value) {
                    Some(ts) => ts,
                    None => return unknown(text, format!("unreadable timestamp {value}")),
                },
            };
            return ServerMessage::Result(InferenceResult {
                emotion: EmotionLabel::from(emotion),
                confidence,
                timestamp,
            });
        }

        unknown(text, "unrecognized message shape".to_string())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::Result(_) => "result",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Unknown { .. } => "unknown",
        }
    }
}

fn unknown(text: &str, reason: String) -> ServerMessage {
    let raw = match text.char_indices().nth(RAW_PREVIEW_LEN) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    };
    ServerMessage::Unknown { reason, raw }
}

fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// RFC 3339 strings, or epoch seconds / milliseconds as numbers.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let mut secs = n.as_f64()?;
            if secs > EPOCH_MILLIS_THRESHOLD {
                secs /= 1000.0;
            }
            let whole = secs.trunc() as i64;
            let nanos = ((secs - secs.trunc()) * 1e9).round() as u32;
            Utc.timestamp_opt(whole, nanos.min(999_999_999)).single()
        }
        _ => None,
    }
}
