//! End-to-end routing tests: a real hub on an ephemeral port, driven by
//! plain tungstenite clients.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use logscope_relay::{HubConfig, HubError, RelayHub};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const SILENCE_TIMEOUT: Duration = Duration::from_millis(250);

async fn start_hub() -> (RelayHub, String) {
    let hub = RelayHub::new(HubConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ws_path: "/logs".to_string(),
        http_port: None,
    });
    hub.start().await.expect("hub start");
    let addr = hub.local_addr().await.expect("hub bound");
    (hub, format!("ws://{}/logs", addr))
}

async fn connect(url: &str) -> Client {
    let (ws, _) = connect_async(url).await.expect("ws connect");
    ws
}

async fn recv_text(client: &mut Client) -> String {
    loop {
        let msg = timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read error");
        match msg {
            Message::Text(text) => return text.to_string(),
            Message::Close(_) => panic!("connection closed while expecting a frame"),
            _ => continue,
        }
    }
}

async fn expect_silence(client: &mut Client) {
    if let Ok(item) = timeout(SILENCE_TIMEOUT, client.next()).await {
        if let Some(Ok(Message::Text(text))) = item {
            panic!("expected no frame, got {}", text);
        }
    }
}

/// Connect and consume the welcome frame.
async fn connect_ready(url: &str) -> Client {
    let mut client = connect(url).await;
    let welcome = recv_text(&mut client).await;
    let parsed: Value = serde_json::from_str(&welcome).expect("welcome is JSON");
    assert_eq!(parsed["type"], "system");
    client
}

#[tokio::test]
async fn welcome_frame_carries_client_ip() {
    let (hub, url) = start_hub().await;
    let mut client = connect(&url).await;

    let welcome = recv_text(&mut client).await;
    let parsed: Value = serde_json::from_str(&welcome).expect("welcome is JSON");
    assert_eq!(parsed["type"], "system");
    assert_eq!(parsed["clientIp"], "127.0.0.1");
    assert!(parsed["message"]
        .as_str()
        .expect("message is a string")
        .contains("127.0.0.1"));
    assert!(parsed["timestamp"].is_string());

    assert_eq!(hub.connection_count().await, 1);
    let infos = hub.peer_infos().await;
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].ip, "127.0.0.1");
    hub.stop().await;
}

#[tokio::test]
async fn js_log_is_not_echoed_to_sender() {
    let (hub, url) = start_hub().await;
    let mut producer = connect_ready(&url).await;
    let mut viewer = connect_ready(&url).await;

    let frame = r#"{"type":"js-log","level":"info","message":"hello"}"#;
    producer
        .send(Message::Text(frame.into()))
        .await
        .expect("send");

    let received = recv_text(&mut viewer).await;
    assert_eq!(received, frame);
    expect_silence(&mut producer).await;

    hub.stop().await;
}

#[tokio::test]
async fn network_request_is_echoed_to_everyone() {
    let (hub, url) = start_hub().await;
    let mut producer = connect_ready(&url).await;
    let mut viewer = connect_ready(&url).await;

    let frame = r#"{"type":"network-request","data":{"id":"r1","method":"GET","url":"/x","startTime":1000}}"#;
    producer
        .send(Message::Text(frame.into()))
        .await
        .expect("send");

    assert_eq!(recv_text(&mut viewer).await, frame);
    assert_eq!(recv_text(&mut producer).await, frame);

    hub.stop().await;
}

#[tokio::test]
async fn unknown_type_is_forwarded_unchanged() {
    let (hub, url) = start_hub().await;
    let mut producer = connect_ready(&url).await;
    let mut viewer = connect_ready(&url).await;

    let frame = r#"{"type":"heartbeat","seq":1,"nested":{"keep":"me"}}"#;
    producer
        .send(Message::Text(frame.into()))
        .await
        .expect("send");

    assert_eq!(recv_text(&mut viewer).await, frame);
    assert_eq!(recv_text(&mut producer).await, frame);

    hub.stop().await;
}

#[tokio::test]
async fn bundler_text_lines_are_relayed_as_logs() {
    let (hub, url) = start_hub().await;
    let mut producer = connect_ready(&url).await;
    let mut viewer = connect_ready(&url).await;

    producer
        .send(Message::Text("WARN something failed".into()))
        .await
        .expect("send");

    assert_eq!(recv_text(&mut viewer).await, "WARN something failed");
    expect_silence(&mut producer).await;

    hub.stop().await;
}

#[tokio::test]
async fn binary_frames_are_relayed_as_text() {
    let (hub, url) = start_hub().await;
    let mut producer = connect_ready(&url).await;
    let mut viewer = connect_ready(&url).await;

    let frame = r#"{"type":"network-error","data":{"id":"r9","error":"reset"}}"#;
    producer
        .send(Message::Binary(frame.as_bytes().to_vec().into()))
        .await
        .expect("send");

    assert_eq!(recv_text(&mut viewer).await, frame);

    hub.stop().await;
}

#[tokio::test]
async fn wrong_path_is_rejected() {
    let (hub, url) = start_hub().await;
    let bad_url = url.replace("/logs", "/nope");

    assert!(connect_async(bad_url).await.is_err());
    assert_eq!(hub.connection_count().await, 0);

    hub.stop().await;
}

#[tokio::test]
async fn disconnect_deregisters_peer_without_disturbing_others() {
    let (hub, url) = start_hub().await;
    let mut leaver = connect_ready(&url).await;
    let mut stayer = connect_ready(&url).await;
    let mut producer = connect_ready(&url).await;

    leaver.close(None).await.expect("close");
    // Wait until the hub noticed the departure.
    for _ in 0..100 {
        if hub.connection_count().await == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(hub.connection_count().await, 2);

    let frame = r#"{"type":"js-log","level":"log","message":"still here"}"#;
    producer
        .send(Message::Text(frame.into()))
        .await
        .expect("send");
    assert_eq!(recv_text(&mut stayer).await, frame);

    hub.stop().await;
}

#[tokio::test]
async fn start_is_idempotent() {
    let (hub, url) = start_hub().await;
    hub.start().await.expect("second start is a no-op");

    let mut client = connect_ready(&url).await;
    assert_eq!(hub.connection_count().await, 1);
    client.close(None).await.expect("close");

    hub.stop().await;
}

#[tokio::test]
async fn occupied_port_fails_without_retry() {
    let blocker = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind blocker");
    let port = blocker.local_addr().expect("blocker addr").port();

    let hub = RelayHub::new(HubConfig {
        host: "127.0.0.1".to_string(),
        port,
        ws_path: "/logs".to_string(),
        http_port: None,
    });
    match hub.start().await {
        Err(HubError::PortInUse { port: reported }) => assert_eq!(reported, port),
        other => panic!("expected PortInUse, got {:?}", other),
    }
    assert!(!hub.is_running());
}

#[tokio::test]
async fn stop_closes_peers_and_clears_registry() {
    let (hub, url) = start_hub().await;
    let mut client = connect_ready(&url).await;

    hub.stop().await;
    assert!(!hub.is_running());
    assert_eq!(hub.connection_count().await, 0);

    // The client observes the close (or the dropped connection).
    let outcome = timeout(RECV_TIMEOUT, client.next()).await.expect("signal");
    match outcome {
        None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
        Some(Ok(other)) => panic!("expected close, got {:?}", other),
    }

    // New connections are refused once stopped.
    let refused = timeout(RECV_TIMEOUT, connect_async(url.as_str())).await;
    assert!(matches!(refused, Ok(Err(_))));
}

#[tokio::test]
async fn slow_or_dead_peer_does_not_block_broadcast() {
    let (hub, url) = start_hub().await;
    let dead = connect_ready(&url).await;
    let mut viewer = connect_ready(&url).await;
    let mut producer = connect_ready(&url).await;

    // Drop the socket without a close handshake.
    drop(dead);

    let frame = r#"{"type":"js-log","level":"log","message":"after drop"}"#;
    producer
        .send(Message::Text(frame.into()))
        .await
        .expect("send");
    assert_eq!(recv_text(&mut viewer).await, frame);

    hub.stop().await;
}
