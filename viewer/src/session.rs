//! Client session: owns at most one transport connection to the relay
//! hub, demultiplexes inbound frames into the log buffer and the call
//! table, and drives the reconnect policy.
//!
//! All state transitions and buffer mutations happen on one actor task
//! fed by a mailbox of commands and transport events, so collaborators
//! never observe a half-applied transition. Commands are fire-and-forget;
//! state is read back through snapshots or the status watch channel.

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{sleep_until, Duration, Instant},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use logscope_core::{codec, Envelope, LogEvent, LogLevel, DEFAULT_PORT, DEFAULT_WS_PATH};

use crate::logs::{LevelFilter, LogBuffer, LogEntry, DEFAULT_MAX_LOGS};
use crate::network::{NetworkCall, NetworkTable, DEFAULT_MAX_REQUESTS};

/// Fixed delay before an automatic reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Observed connection state, distinct from the connect intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Session configuration; the URL is derived from host, port and path
/// and recomputed for every attempt.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub ws_path: String,
    pub reconnect_delay: Duration,
    pub max_logs: usize,
    pub max_requests: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            ws_path: DEFAULT_WS_PATH.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_logs: DEFAULT_MAX_LOGS,
            max_requests: DEFAULT_MAX_REQUESTS,
        }
    }
}

/// Snapshot published on the status watch channel.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub port: u16,
    /// Transport attempt counter; stale async completions carry an
    /// older generation and are ignored.
    pub generation: u64,
}

impl SessionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnectionState::Connecting
    }
}

/// Collaborator-facing view of the log stream.
#[derive(Debug, Clone, Serialize)]
pub struct LogsState {
    pub port: u16,
    pub is_connecting: bool,
    pub is_connected: bool,
    pub logs: Vec<LogEntry>,
    pub level_filter: LevelFilter,
    pub search_text: String,
    pub filtered_logs: Vec<LogEntry>,
}

/// Collaborator-facing view of the network stream.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkState {
    pub port: u16,
    pub is_connecting: bool,
    pub is_connected: bool,
    pub requests: Vec<NetworkCall>,
    pub selected_request: Option<NetworkCall>,
    pub is_recording: bool,
    pub filtered_requests: Vec<NetworkCall>,
}

enum Command {
    Connect,
    Disconnect,
    SetPort(u16),
    SetLevelFilter(LevelFilter),
    SetSearchText(String),
    ClearLogs,
    SetRecording(bool),
    SelectRequest(Option<String>),
    ClearRequests,
    Shutdown,
}

enum TransportEvent {
    Opened {
        generation: u64,
        close: oneshot::Sender<()>,
    },
    Frame {
        generation: u64,
        text: String,
    },
    Closed {
        generation: u64,
        reason: Option<String>,
    },
    Failed {
        generation: u64,
        error: String,
    },
}

/// Handle to a running session actor. Clones share the same session,
/// so the log and network facades can be driven independently;
/// dropping the last handle shuts the actor down.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<SessionStatus>,
    logs: Arc<Mutex<LogBuffer>>,
    network: Arc<Mutex<NetworkTable>>,
}

impl Session {
    /// Spawn the session actor. Must be called from within a tokio
    /// runtime.
    pub fn spawn(config: SessionConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            state: ConnectionState::Disconnected,
            port: config.port,
            generation: 0,
        });
        let logs = Arc::new(Mutex::new(LogBuffer::new(config.max_logs)));
        let network = Arc::new(Mutex::new(NetworkTable::new(config.max_requests)));

        let actor = SessionActor {
            config,
            state: ConnectionState::Disconnected,
            should_connect: false,
            generation: 0,
            reconnect_at: None,
            reopen_after_close: false,
            close_current: None,
            logs: logs.clone(),
            network: network.clone(),
            status_tx,
            events_tx,
        };
        tokio::spawn(actor.run(command_rx, event_rx));

        Session {
            commands,
            status_rx,
            logs,
            network,
        }
    }

    /// Request a connection. No-op while already connecting; while
    /// connected, cleanly closes the current transport and reopens.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Drop the connect intent and close the transport. No automatic
    /// reconnect follows.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    pub fn set_port(&self, port: u16) {
        let _ = self.commands.send(Command::SetPort(port));
    }

    pub fn set_level_filter(&self, filter: LevelFilter) {
        let _ = self.commands.send(Command::SetLevelFilter(filter));
    }

    pub fn set_search_text(&self, search: impl Into<String>) {
        let _ = self.commands.send(Command::SetSearchText(search.into()));
    }

    pub fn clear_logs(&self) {
        let _ = self.commands.send(Command::ClearLogs);
    }

    pub fn set_recording(&self, recording: bool) {
        let _ = self.commands.send(Command::SetRecording(recording));
    }

    pub fn select_request(&self, id: Option<String>) {
        let _ = self.commands.send(Command::SelectRequest(id));
    }

    pub fn clear_requests(&self) {
        let _ = self.commands.send(Command::ClearRequests);
    }

    /// Stop the actor and close any open transport.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch channel for push-style collaborators.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    pub fn logs_state(&self) -> LogsState {
        let status = self.status();
        let (logs, level_filter, search_text, filtered_logs) = match self.logs.lock() {
            Ok(guard) => (
                guard.entries().cloned().collect(),
                guard.level_filter,
                guard.search_text.clone(),
                guard.filtered(),
            ),
            Err(_) => (Vec::new(), LevelFilter::default(), String::new(), Vec::new()),
        };
        LogsState {
            port: status.port,
            is_connecting: status.is_connecting(),
            is_connected: status.is_connected(),
            logs,
            level_filter,
            search_text,
            filtered_logs,
        }
    }

    pub fn network_state(&self) -> NetworkState {
        let status = self.status();
        let (requests, selected_request, is_recording, filtered_requests) =
            match self.network.lock() {
                Ok(guard) => (
                    guard.calls().cloned().collect(),
                    guard.selected_call().cloned(),
                    guard.is_recording,
                    guard.filtered(),
                ),
                Err(_) => (Vec::new(), None, true, Vec::new()),
            };
        NetworkState {
            port: status.port,
            is_connecting: status.is_connecting(),
            is_connected: status.is_connected(),
            requests,
            selected_request,
            is_recording,
            filtered_requests,
        }
    }
}

struct SessionActor {
    config: SessionConfig,
    state: ConnectionState,
    /// Connect intent, independent of the observed state.
    should_connect: bool,
    generation: u64,
    reconnect_at: Option<Instant>,
    /// Set while a manual reconnect waits for the old transport to
    /// close before opening the new one.
    reopen_after_close: bool,
    close_current: Option<oneshot::Sender<()>>,
    logs: Arc<Mutex<LogBuffer>>,
    network: Arc<Mutex<NetworkTable>>,
    status_tx: watch::Sender<SessionStatus>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            let deadline = self.reconnect_at;
            let reconnect_timer = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = reconnect_timer => self.reconnect_due(),
            }
        }
        self.request_close();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                self.should_connect = true;
                self.reconnect_at = None;
                match self.state {
                    ConnectionState::Disconnected => self.start_attempt(),
                    ConnectionState::Connected => {
                        // Manual reconnect: never hold two live sockets.
                        // Close first, reopen when the close is observed.
                        self.reopen_after_close = true;
                        self.set_state(ConnectionState::Connecting);
                        self.request_close();
                    }
                    ConnectionState::Connecting => {}
                }
            }
            Command::Disconnect => {
                self.should_connect = false;
                self.reconnect_at = None;
                self.reopen_after_close = false;
                if self.close_current.is_some() {
                    self.request_close();
                    self.with_logs(|logs| {
                        logs.append_session(
                            LogLevel::Info,
                            "disconnected",
                            "Connection closed".to_string(),
                        );
                    });
                } else if self.state == ConnectionState::Connecting {
                    // Abandon the in-flight attempt; whatever it reports
                    // later carries a stale generation.
                    self.generation += 1;
                    self.set_state(ConnectionState::Disconnected);
                }
            }
            Command::SetPort(port) => {
                self.config.port = port;
                self.publish_status();
            }
            Command::SetLevelFilter(filter) => {
                self.with_logs(|logs| logs.level_filter = filter);
            }
            Command::SetSearchText(search) => {
                self.with_logs(|logs| logs.search_text = search);
            }
            Command::ClearLogs => {
                self.with_logs(|logs| logs.clear());
            }
            Command::SetRecording(recording) => {
                self.with_network(|network| network.is_recording = recording);
            }
            Command::SelectRequest(id) => {
                self.with_network(|network| network.select(id));
            }
            Command::ClearRequests => {
                self.with_network(|network| network.clear());
            }
            Command::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened { generation, close } => {
                if generation != self.generation {
                    // A socket the session already abandoned finished its
                    // handshake; close it right away.
                    let _ = close.send(());
                    return;
                }
                self.close_current = Some(close);
                self.reconnect_at = None;
                self.set_state(ConnectionState::Connected);
                let url = self.url();
                self.with_logs(|logs| {
                    logs.append_session(
                        LogLevel::Info,
                        "connected",
                        format!("Connected to log relay: {}", url),
                    );
                });
            }
            TransportEvent::Frame { generation, text } => {
                if generation != self.generation {
                    return;
                }
                self.dispatch(&text);
            }
            TransportEvent::Closed { generation, reason } => {
                if generation != self.generation {
                    return;
                }
                self.close_current = None;
                self.set_state(ConnectionState::Disconnected);
                let message = match reason {
                    Some(reason) => format!("Disconnected from log relay: {}", reason),
                    None => "Disconnected from log relay".to_string(),
                };
                self.with_logs(|logs| logs.append_session(LogLevel::Warn, "closed", message));
                self.after_transport_down();
            }
            TransportEvent::Failed { generation, error } => {
                if generation != self.generation {
                    return;
                }
                self.close_current = None;
                self.set_state(ConnectionState::Disconnected);
                self.with_logs(|logs| {
                    logs.append_session(
                        LogLevel::Error,
                        "error",
                        format!("Log relay connection error: {}", error),
                    );
                });
                self.after_transport_down();
            }
        }
    }

    /// The transport just went down with the current generation.
    fn after_transport_down(&mut self) {
        if self.reopen_after_close {
            self.reopen_after_close = false;
            self.start_attempt();
        } else if self.should_connect && self.reconnect_at.is_none() {
            debug!("Scheduling reconnect in {:?}", self.config.reconnect_delay);
            self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
        }
    }

    fn reconnect_due(&mut self) {
        self.reconnect_at = None;
        if self.should_connect && self.state == ConnectionState::Disconnected {
            self.start_attempt();
        }
    }

    fn start_attempt(&mut self) {
        self.generation += 1;
        self.set_state(ConnectionState::Connecting);
        let url = self.url();
        debug!("Opening transport to {} (attempt {})", url, self.generation);
        tokio::spawn(run_transport(url, self.generation, self.events_tx.clone()));
    }

    fn request_close(&mut self) {
        if let Some(close) = self.close_current.take() {
            let _ = close.send(());
        }
    }

    fn dispatch(&mut self, frame: &str) {
        match codec::decode(frame) {
            Envelope::JsLog(event) => {
                self.with_logs(|logs| logs.append(event));
            }
            Envelope::System(system) => {
                self.with_logs(|logs| {
                    logs.append(LogEvent {
                        level: LogLevel::Info,
                        message: system.message,
                        raw: None,
                    });
                });
            }
            Envelope::NetworkRequest(data) => {
                self.with_network(|network| {
                    if network.is_recording {
                        network.on_request(data);
                    }
                });
            }
            Envelope::NetworkResponse(data) => {
                self.with_network(|network| {
                    if network.is_recording {
                        network.on_response(data);
                    }
                });
            }
            Envelope::NetworkError(data) => {
                self.with_network(|network| {
                    if network.is_recording {
                        network.on_error(data);
                    }
                });
            }
            Envelope::Unknown { kind, .. } => {
                debug!("Ignoring frame of unknown type {}", kind);
            }
        }
    }

    fn url(&self) -> String {
        format!(
            "ws://{}:{}{}",
            self.config.host, self.config.port, self.config.ws_path
        )
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(SessionStatus {
            state: self.state,
            port: self.config.port,
            generation: self.generation,
        });
    }

    fn with_logs(&self, apply: impl FnOnce(&mut LogBuffer)) {
        if let Ok(mut guard) = self.logs.lock() {
            apply(&mut guard);
        }
    }

    fn with_network(&self, apply: impl FnOnce(&mut NetworkTable)) {
        if let Ok(mut guard) = self.network.lock() {
            apply(&mut guard);
        }
    }
}

/// One transport attempt: handshake, then pump frames into the actor's
/// mailbox until the socket closes or the actor asks to close.
async fn run_transport(
    url: String,
    generation: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let (ws, _) = match connect_async(url.as_str()).await {
        Ok(connected) => connected,
        Err(e) => {
            let _ = events.send(TransportEvent::Failed {
                generation,
                error: e.to_string(),
            });
            return;
        }
    };

    let (close_tx, mut close_rx) = oneshot::channel::<()>();
    if events
        .send(TransportEvent::Opened {
            generation,
            close: close_tx,
        })
        .is_err()
    {
        return;
    }

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            _ = &mut close_rx => {
                let _ = sink.close().await;
                let _ = events.send(TransportEvent::Closed { generation, reason: None });
                return;
            }
            item = stream.next() => match item {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Frame {
                        generation,
                        text: text.to_string(),
                    });
                }
                Some(Ok(Message::Binary(data))) => {
                    let _ = events.send(TransportEvent::Frame {
                        generation,
                        text: String::from_utf8_lossy(&data).into_owned(),
                    });
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|reason| !reason.is_empty());
                    let _ = events.send(TransportEvent::Closed { generation, reason });
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(TransportEvent::Failed {
                        generation,
                        error: e.to_string(),
                    });
                    return;
                }
                None => {
                    let _ = events.send(TransportEvent::Closed { generation, reason: None });
                    return;
                }
            }
        }
    }
}
