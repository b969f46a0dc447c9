//! Request/response correlation over the network event stream.

use std::collections::VecDeque;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use logscope_core::{ErrorData, RequestData, ResponseData};

/// Default capacity of the call table.
pub const DEFAULT_MAX_REQUESTS: usize = 500;

/// Lifecycle of a correlated call. A call that never receives a
/// terminal event stays `Pending` for the whole session; that is
/// expected, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Pending,
    Completed,
    Errored,
}

/// One HTTP/XHR call reconstructed from `network-request` and its
/// matching terminal event.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkCall {
    /// Producer-assigned correlation key.
    pub id: String,
    pub method: Option<String>,
    pub url: Option<String>,
    pub base_url: Option<String>,
    pub original_url: Option<String>,
    /// Producer-side transport kind (`xhr`, `fetch`, ...).
    pub kind: Option<String>,
    pub request_headers: Option<Value>,
    pub request_body: Option<Value>,
    pub params: Option<Value>,
    pub start_time: Option<f64>,
    pub request_size: Option<f64>,
    pub state: CallState,
    pub status: Option<u16>,
    pub status_text: Option<String>,
    pub response_headers: Option<Value>,
    pub response_body: Option<Value>,
    pub end_time: Option<f64>,
    pub duration: Option<f64>,
    pub size: Option<f64>,
    pub error: Option<String>,
}

impl NetworkCall {
    fn pending(id: String, data: RequestData) -> Self {
        NetworkCall {
            id,
            method: data.method,
            url: data.url,
            base_url: data.base_url,
            original_url: data.original_url,
            kind: data.kind,
            request_headers: data.headers,
            request_body: data.body.or(data.data),
            params: data.params,
            start_time: data.start_time,
            request_size: data.request_size,
            state: CallState::Pending,
            status: None,
            status_text: None,
            response_headers: None,
            response_body: None,
            end_time: None,
            duration: None,
            size: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state != CallState::Pending
    }

    fn derive_duration(&self, end_time: Option<f64>) -> Option<f64> {
        match (end_time, self.start_time) {
            (Some(end), Some(start)) => Some(end - start),
            _ => None,
        }
    }
}

/// Identifier-indexed table of in-flight and completed calls, bounded
/// and insertion-ordered.
#[derive(Debug)]
pub struct NetworkTable {
    calls: VecDeque<NetworkCall>,
    capacity: usize,
    /// Id of the call a collaborator currently inspects.
    pub selected: Option<String>,
    /// When false, inbound network events are dropped upstream.
    pub is_recording: bool,
}

impl NetworkTable {
    pub fn new(capacity: usize) -> Self {
        NetworkTable {
            calls: VecDeque::with_capacity(capacity.min(DEFAULT_MAX_REQUESTS)),
            capacity: capacity.max(1),
            selected: None,
            is_recording: true,
        }
    }

    /// Insert a pending call, evicting the oldest entry (pending or
    /// terminal alike) when at capacity. Events without an id can never
    /// be correlated and are dropped.
    pub fn on_request(&mut self, data: RequestData) {
        let Some(id) = data.id.clone() else {
            debug!("Dropping network-request without an id");
            return;
        };
        if self.calls.len() >= self.capacity {
            if let Some(evicted) = self.calls.pop_front() {
                if self.selected.as_deref() == Some(evicted.id.as_str()) {
                    self.selected = None;
                }
            }
        }
        self.calls.push_back(NetworkCall::pending(id, data));
    }

    /// Apply a response to its pending call. Absent id: the call was
    /// evicted or never seen; dropped silently. Already terminal: the
    /// first terminal event won; dropped.
    pub fn on_response(&mut self, data: ResponseData) {
        let Some(id) = data.id.as_deref() else {
            return;
        };
        let Some(call) = self.calls.iter_mut().find(|call| call.id == id) else {
            return;
        };
        if call.is_terminal() {
            return;
        }
        call.duration = call.derive_duration(data.end_time);
        call.state = CallState::Completed;
        call.status = data.status;
        call.status_text = data.status_text;
        call.response_headers = data.headers;
        call.response_body = data.body;
        call.end_time = data.end_time;
        call.size = data.size;
    }

    /// Apply an error to its pending call, with the same miss and
    /// idempotence rules as [`NetworkTable::on_response`].
    pub fn on_error(&mut self, data: ErrorData) {
        let Some(id) = data.id.as_deref() else {
            return;
        };
        let Some(call) = self.calls.iter_mut().find(|call| call.id == id) else {
            return;
        };
        if call.is_terminal() {
            return;
        }
        call.duration = call.derive_duration(data.end_time);
        call.state = CallState::Errored;
        call.error = data.error;
        call.end_time = data.end_time;
    }

    pub fn clear(&mut self) {
        self.calls.clear();
        self.selected = None;
    }

    pub fn select(&mut self, id: Option<String>) {
        self.selected = id;
    }

    pub fn selected_call(&self) -> Option<&NetworkCall> {
        let id = self.selected.as_deref()?;
        self.calls.iter().find(|call| call.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&NetworkCall> {
        self.calls.iter().find(|call| call.id == id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// All calls in insertion order.
    pub fn calls(&self) -> impl Iterator<Item = &NetworkCall> {
        self.calls.iter()
    }

    /// The collaborator-facing list; currently an unfiltered projection.
    pub fn filtered(&self) -> Vec<NetworkCall> {
        self.calls.iter().cloned().collect()
    }
}

impl Default for NetworkTable {
    fn default() -> Self {
        NetworkTable::new(DEFAULT_MAX_REQUESTS)
    }
}
