use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
        Message,
    },
};
use tracing::{debug, error, info, warn};

use logscope_core::{classify, current_timestamp, Route, DEFAULT_PORT, DEFAULT_WS_PATH};

/// Errors surfaced by the hub lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hub configuration. `port: 0` binds an ephemeral port, resolved via
/// [`RelayHub::local_addr`].
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    pub ws_path: String,
    /// Port for the HTTP status endpoint; `None` disables it.
    pub http_port: Option<u16>,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            ws_path: DEFAULT_WS_PATH.to_string(),
            http_port: None,
        }
    }
}

/// Information about a connected peer, as exposed by the status endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PeerInfo {
    pub id: u64,
    pub ip: String,
    pub connected_at_ms: u64,
}

/// A live peer: its identity plus the outbound frame queue drained by a
/// dedicated writer task, so one slow peer never stalls a broadcast.
pub(crate) struct Peer {
    pub(crate) info: PeerInfo,
    pub(crate) outbound: mpsc::UnboundedSender<Message>,
}

pub(crate) type PeerMap = Arc<RwLock<HashMap<u64, Peer>>>;

/// WebSocket relay hub. Accepts producer and viewer connections on a
/// single endpoint and fans each decoded frame out to its audience.
pub struct RelayHub {
    config: HubConfig,
    peers: PeerMap,
    next_peer_id: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    started_at_ms: Arc<AtomicU64>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayHub {
    pub fn new(config: HubConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        RelayHub {
            config,
            peers: Arc::new(RwLock::new(HashMap::new())),
            next_peer_id: Arc::new(AtomicU64::new(1)),
            running: Arc::new(AtomicBool::new(false)),
            started_at_ms: Arc::new(AtomicU64::new(0)),
            local_addr: Arc::new(Mutex::new(None)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bind the listeners and start accepting connections. No-op when
    /// already running; fails without retrying when the port is taken so
    /// a misconfiguration is never masked.
    pub async fn start(&self) -> Result<(), HubError> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Relay hub already running");
            return Ok(());
        }

        let listener = match TcpListener::bind((self.config.host.as_str(), self.config.port)).await
        {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                if e.kind() == ErrorKind::AddrInUse {
                    return Err(HubError::PortInUse {
                        port: self.config.port,
                    });
                }
                return Err(e.into());
            }
        };
        let local = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local);
        self.started_at_ms
            .store(current_timestamp(), Ordering::SeqCst);
        let _ = self.shutdown.send_replace(false);

        info!("Relay hub listening on ws://{}{}", local, self.config.ws_path);

        let mut tasks = self.tasks.lock().await;

        // Accept loop for WebSocket peers
        let peers = self.peers.clone();
        let next_peer_id = self.next_peer_id.clone();
        let ws_path = self.config.ws_path.clone();
        let peer_shutdown = self.shutdown.subscribe();
        let mut shutdown_rx = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((socket, addr)) => {
                            debug!("Incoming connection from {}", addr);
                            let peers = peers.clone();
                            let next_peer_id = next_peer_id.clone();
                            let ws_path = ws_path.clone();
                            let shutdown_rx = peer_shutdown.clone();
                            tokio::spawn(async move {
                                handle_connection(socket, addr, peers, next_peer_id, ws_path, shutdown_rx)
                                    .await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }));

        // HTTP status endpoint
        if let Some(http_port) = self.config.http_port {
            let http_listener =
                match TcpListener::bind((self.config.host.as_str(), http_port)).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        self.running.store(false, Ordering::SeqCst);
                        for task in tasks.drain(..) {
                            task.abort();
                            let _ = task.await;
                        }
                        *self.local_addr.lock().await = None;
                        if e.kind() == ErrorKind::AddrInUse {
                            return Err(HubError::PortInUse { port: http_port });
                        }
                        return Err(e.into());
                    }
                };
            info!(
                "Status endpoint listening on http://{}:{}/status",
                self.config.host, http_port
            );

            let peers = self.peers.clone();
            let started_at_ms = self.started_at_ms.clone();
            tasks.push(tokio::spawn(async move {
                crate::web::serve_status(http_listener, peers, started_at_ms).await;
            }));
        }

        Ok(())
    }

    /// Close every peer connection, stop the listeners and clear the
    /// registry. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        {
            let mut peers = self.peers.write().await;
            for peer in peers.values() {
                let _ = peer.outbound.send(Message::Close(None));
            }
            peers.clear();
        }

        let _ = self.shutdown.send_replace(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
            // Wait for cancellation so the listener socket is released
            // before stop() returns; a restart may rebind the port.
            let _ = task.await;
        }
        *self.local_addr.lock().await = None;

        info!("Relay hub stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of currently connected peers.
    pub async fn connection_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// The bound WebSocket address, once running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    pub async fn peer_infos(&self) -> Vec<PeerInfo> {
        self.peers
            .read()
            .await
            .values()
            .map(|peer| peer.info.clone())
            .collect()
    }
}

/// Upgrade one accepted socket, register the peer and pump its frames
/// until it disconnects or the hub shuts down.
async fn handle_connection(
    socket: TcpStream,
    addr: SocketAddr,
    peers: PeerMap,
    next_peer_id: Arc<AtomicU64>,
    ws_path: String,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut client_ip = addr.ip().to_string();
    let callback = |request: &Request, response: Response| {
        if request.uri().path() != ws_path {
            warn!(
                "Rejecting connection from {} to unknown path {}",
                addr,
                request.uri().path()
            );
            let mut rejection = ErrorResponse::new(Some("not found".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            return Err(rejection);
        }
        if let Some(ip) = forwarded_ip(request) {
            client_ip = ip;
        }
        Ok(response)
    };

    let ws = match accept_hdr_async(socket, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Handshake failed from {}: {}", addr, e);
            return;
        }
    };

    let id = next_peer_id.fetch_add(1, Ordering::SeqCst);
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let (mut sink, mut stream) = ws.split();

    // Writer task: drains the peer's queue. A send failure only ends
    // this peer's delivery; broadcasts to other peers are unaffected.
    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = sink.send(message).await {
                warn!("Failed to send to peer {}: {}", id, e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let peer_count = {
        let mut guard = peers.write().await;
        guard.insert(
            id,
            Peer {
                info: PeerInfo {
                    id,
                    ip: client_ip.clone(),
                    connected_at_ms: current_timestamp(),
                },
                outbound: outbound.clone(),
            },
        );
        guard.len()
    };
    info!(
        "Peer {} connected from {} ({} connected)",
        id, client_ip, peer_count
    );

    let welcome = json!({
        "type": "system",
        "message": format!("Connected to log relay (client IP: {})", client_ip),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "clientIp": client_ip,
    })
    .to_string();
    let _ = outbound.send(Message::Text(welcome.into()));

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            item = stream.next() => match item {
                Some(Ok(Message::Text(text))) => {
                    route_frame(&peers, id, text.as_str()).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    // Producers occasionally send binary frames; relay
                    // them as lossily-decoded text.
                    let text = String::from_utf8_lossy(&data).into_owned();
                    route_frame(&peers, id, &text).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Read error from peer {}: {}", id, e);
                    break;
                }
            }
        }
    }

    let remaining = {
        let mut guard = peers.write().await;
        guard.remove(&id);
        guard.len()
    };
    info!("Peer {} disconnected ({} remaining)", id, remaining);
}

/// Fan a frame out to its audience. The frame is forwarded verbatim;
/// classification only inspects the envelope type.
async fn route_frame(peers: &PeerMap, sender: u64, frame: &str) {
    let route = classify(frame);
    let guard = peers.read().await;
    for (&id, peer) in guard.iter() {
        if route == Route::Others && id == sender {
            continue;
        }
        if peer.outbound.send(Message::Text(frame.to_string().into())).is_err() {
            debug!("Dropping frame for peer {}: writer gone", id);
        }
    }
}

/// Resolve the peer's address, preferring proxy-forwarded headers over
/// the raw socket address.
fn forwarded_ip(request: &Request) -> Option<String> {
    let headers = request.headers();
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}
