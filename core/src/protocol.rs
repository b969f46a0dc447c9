use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version of the logscope protocol
pub const LOGSCOPE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default port the relay hub listens on
pub const DEFAULT_PORT: u16 = 8082;

/// WebSocket path producers and viewers attach to
pub const DEFAULT_WS_PATH: &str = "/logs";

/// Severity attached to a log line. Producers send free-form level
/// strings; anything outside the known set maps to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
    Trace,
    Unknown,
}

impl LogLevel {
    /// Parse a producer-supplied level token, case-insensitively.
    pub fn parse(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "log" => LogLevel::Log,
            "info" => LogLevel::Info,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Log => "log",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
            LogLevel::Unknown => "unknown",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded wire frame. Unknown types keep their raw payload so the hub
/// can forward them unchanged.
#[derive(Debug, Clone)]
pub enum Envelope {
    System(SystemEvent),
    JsLog(LogEvent),
    NetworkRequest(RequestData),
    NetworkResponse(ResponseData),
    NetworkError(ErrorData),
    Unknown { kind: String, raw: Value },
}

/// Hub-originated frame: the welcome message and any future service
/// announcements.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemEvent {
    pub message: String,
    pub timestamp: Option<String>,
    #[serde(rename = "clientIp")]
    pub client_ip: Option<String>,
}

/// A log line after decoding: level plus a rendered, display-ready
/// message. `raw` preserves the original payload when it was structured.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    pub raw: Option<Value>,
}

/// Payload of a `network-request` frame. Everything is optional because
/// producers are not strictly protocol-conformant; an event without an
/// `id` can never be correlated and is dropped downstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestData {
    pub id: Option<String>,
    pub method: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "baseURL")]
    pub base_url: Option<String>,
    pub original_url: Option<String>,
    pub headers: Option<Value>,
    pub params: Option<Value>,
    pub body: Option<Value>,
    pub data: Option<Value>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub start_time: Option<f64>,
    pub request_size: Option<f64>,
}

/// Payload of a `network-response` frame. The response body arrives as
/// either `body` or `data` depending on the producer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResponseData {
    pub id: Option<String>,
    pub status: Option<u16>,
    pub status_text: Option<String>,
    pub headers: Option<Value>,
    #[serde(alias = "data")]
    pub body: Option<Value>,
    pub end_time: Option<f64>,
    pub size: Option<f64>,
}

/// Payload of a `network-error` frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorData {
    pub id: Option<String>,
    pub error: Option<String>,
    pub end_time: Option<f64>,
}

/// Current unix timestamp in milliseconds
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
