use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, error};

use logscope_core::{current_timestamp, LOGSCOPE_VERSION};

use crate::hub::PeerMap;

/// Accept loop for the status endpoint.
pub(crate) async fn serve_status(
    listener: TcpListener,
    peers: PeerMap,
    started_at_ms: Arc<AtomicU64>,
) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                debug!("HTTP connection from {}", addr);
                let peers = peers.clone();
                let started_at_ms = started_at_ms.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(socket);
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(
                            io,
                            service_fn(move |req| {
                                handle_http_request(
                                    req,
                                    peers.clone(),
                                    started_at_ms.load(Ordering::SeqCst),
                                )
                            }),
                        )
                        .await
                    {
                        debug!("HTTP connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept HTTP connection: {}", e);
            }
        }
    }
}

/// Handle HTTP requests for the status interface.
async fn handle_http_request(
    req: Request<hyper::body::Incoming>,
    peers: PeerMap,
    started_at_ms: u64,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/status") => {
            let peers_read = peers.read().await;
            let status = json!({
                "status": "online",
                "version": LOGSCOPE_VERSION,
                "connected_peers": peers_read.len(),
                "uptime_secs": current_timestamp().saturating_sub(started_at_ms) / 1000,
                "peers": peers_read.values().map(|peer| {
                    json!({
                        "id": peer.info.id,
                        "ip": peer.info.ip,
                        "connected_at_ms": peer.info.connected_at_ms,
                    })
                }).collect::<Vec<_>>(),
            });

            Ok(json_response(StatusCode::OK, status.to_string()))
        }
        _ => Ok(text_response(StatusCode::NOT_FOUND, "404 Not Found")),
    }
}

fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}
