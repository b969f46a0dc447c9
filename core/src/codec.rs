//! Total decoder for inbound frames.
//!
//! Producers speak a loosely-structured line protocol: well-formed JSON
//! envelopes, level-prefixed text lines from the bundler, or arbitrary
//! text. Decoding never fails outward; every malformed input degrades to
//! a best-effort `js-log` envelope.

use serde_json::{json, Value};

use crate::protocol::{
    Envelope, ErrorData, LogEvent, LogLevel, RequestData, ResponseData, SystemEvent,
};

/// Audience a frame should be relayed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Every connected peer, sender included.
    All,
    /// Every connected peer except the sender.
    Others,
}

/// Routing decision for the hub. Log lines are not echoed back to their
/// producer; network traffic and anything unrecognized goes to everyone
/// so a combined producer+viewer sees its own requests reflected.
pub fn classify(frame: &str) -> Route {
    match decode(frame) {
        Envelope::JsLog(_) => Route::Others,
        _ => Route::All,
    }
}

/// Decode a text frame into an [`Envelope`]. Total: the worst case is a
/// `log`-level entry wrapping the raw payload as its message.
pub fn decode(frame: &str) -> Envelope {
    match serde_json::from_str::<Value>(frame) {
        Ok(value) => decode_value(value),
        Err(_) => decode_text(frame),
    }
}

/// Decode a possibly-binary frame, converting to text lossily first.
pub fn decode_frame(bytes: &[u8]) -> Envelope {
    decode(&String::from_utf8_lossy(bytes))
}

fn decode_value(value: Value) -> Envelope {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_owned);

    match kind.as_deref() {
        Some("system") => match serde_json::from_value::<SystemEvent>(value.clone()) {
            Ok(sys) => Envelope::System(sys),
            Err(_) => Envelope::JsLog(decode_untyped(value)),
        },
        Some("js-log") => Envelope::JsLog(decode_js_log(&value)),
        Some("network-request") => {
            match serde_json::from_value::<RequestPayload>(value.clone()) {
                Ok(payload) => Envelope::NetworkRequest(payload.data),
                Err(_) => Envelope::JsLog(decode_untyped(value)),
            }
        }
        Some("network-response") => {
            match serde_json::from_value::<ResponsePayload>(value.clone()) {
                Ok(payload) => Envelope::NetworkResponse(payload.data),
                Err(_) => Envelope::JsLog(decode_untyped(value)),
            }
        }
        Some("network-error") => match serde_json::from_value::<ErrorPayload>(value.clone()) {
            Ok(payload) => Envelope::NetworkError(payload.data),
            Err(_) => Envelope::JsLog(decode_untyped(value)),
        },
        Some(other) => Envelope::Unknown {
            kind: other.to_string(),
            raw: value,
        },
        None => Envelope::JsLog(decode_untyped(value)),
    }
}

#[derive(Debug, Default, serde::Deserialize)]
struct RequestPayload {
    #[serde(default)]
    data: RequestData,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ResponsePayload {
    #[serde(default)]
    data: ResponseData,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    data: ErrorData,
}

/// A `js-log` envelope: `{type, level, message, context?}`.
fn decode_js_log(value: &Value) -> LogEvent {
    let level = value
        .get("level")
        .and_then(Value::as_str)
        .map(LogLevel::parse)
        .unwrap_or(LogLevel::Unknown);

    let mut message = match value.get("message") {
        Some(Value::String(text)) => {
            let mut text = text.clone();
            if let Some(context) = value.get("context") {
                if !context.is_null() {
                    text.push('\n');
                    text.push_str(&render_value(context));
                }
            }
            text
        }
        Some(Value::Null) | None => String::new(),
        Some(other) => render_value(other),
    };

    if message.is_empty() {
        if let Some(Value::Array(items)) = value.get("data") {
            message = join_data_array(items);
        }
    }
    if message.trim().is_empty() {
        message = render_value(value);
    }

    LogEvent {
        level,
        message,
        raw: Some(value.clone()),
    }
}

/// JSON without a recognized `type`: bundler control messages, bare
/// `{level, message}` objects, or arbitrary JSON scalars.
fn decode_untyped(value: Value) -> LogEvent {
    let Value::Object(map) = &value else {
        let message = render_value(&value);
        return LogEvent {
            level: LogLevel::Log,
            message,
            raw: Some(value),
        };
    };

    if map.contains_key("method") || map.contains_key("version") {
        let method = map
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let message = format!("[control] {}: {}", method, render_value(&value));
        return LogEvent {
            level: LogLevel::Debug,
            message,
            raw: Some(value),
        };
    }

    let level = map
        .get("level")
        .and_then(Value::as_str)
        .map(LogLevel::parse)
        .unwrap_or(LogLevel::Log);

    let mut message = match map.get("data") {
        Some(Value::Array(items)) => join_data_array(items),
        _ => match map.get("message") {
            Some(Value::Null) | None => String::new(),
            Some(Value::String(text)) => text.clone(),
            Some(other) => render_value(other),
        },
    };
    if message.trim().is_empty() {
        message = render_value(&value);
    }

    LogEvent {
        level,
        message,
        raw: Some(value),
    }
}

/// Non-JSON text, possibly prefixed by a bare level token the bundler
/// emits (`LOG`, `WARN`, ...).
fn decode_text(frame: &str) -> Envelope {
    let trimmed = frame.trim();
    if trimmed.is_empty() {
        return Envelope::JsLog(LogEvent {
            level: LogLevel::Log,
            message: "(no message)".to_string(),
            raw: None,
        });
    }

    if let Some((level, rest)) = split_level_prefix(trimmed) {
        if rest.is_empty() {
            return Envelope::JsLog(LogEvent {
                level,
                message: "(no message)".to_string(),
                raw: None,
            });
        }
        if rest.starts_with('{') || rest.starts_with('[') {
            if let Ok(parsed) = serde_json::from_str::<Value>(rest) {
                let message = render_value(&parsed);
                let raw = json!({
                    "level": level.as_str(),
                    "data": parsed,
                    "original": frame,
                });
                return Envelope::JsLog(LogEvent {
                    level,
                    message,
                    raw: Some(raw),
                });
            }
        }
        return Envelope::JsLog(LogEvent {
            level,
            message: rest.to_string(),
            raw: None,
        });
    }

    Envelope::JsLog(LogEvent {
        level: LogLevel::Log,
        message: trimmed.to_string(),
        raw: None,
    })
}

/// Split a leading level token followed by whitespace (or end of input).
fn split_level_prefix(text: &str) -> Option<(LogLevel, &str)> {
    let token_end = text
        .find(|c: char| c.is_whitespace())
        .unwrap_or(text.len());
    let (token, rest) = text.split_at(token_end);
    let level = match token.to_ascii_uppercase().as_str() {
        "LOG" => LogLevel::Log,
        "INFO" => LogLevel::Info,
        "WARN" => LogLevel::Warn,
        "ERROR" => LogLevel::Error,
        "DEBUG" => LogLevel::Debug,
        "TRACE" => LogLevel::Trace,
        _ => return None,
    };
    Some((level, rest.trim()))
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

fn join_data_array(items: &[Value]) -> String {
    items
        .iter()
        .map(render_value)
        .collect::<Vec<_>>()
        .join("\n")
}
