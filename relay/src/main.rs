use anyhow::Result;
use clap::Parser;
use tracing::info;

use logscope_relay::{HubConfig, RelayHub};

/// Logscope relay hub for live log and network capture streams
#[derive(Parser)]
#[command(name = "logscope-relay")]
#[command(about = "A WebSocket relay hub for logscope telemetry streams")]
struct Args {
    /// IP address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on for WebSocket connections
    #[arg(short, long, default_value_t = logscope_core::DEFAULT_PORT)]
    port: u16,

    /// Path producers and viewers connect to
    #[arg(long, default_value = logscope_core::DEFAULT_WS_PATH)]
    ws_path: String,

    /// Port for the HTTP status endpoint
    #[arg(long, default_value_t = 8083)]
    http_port: u16,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    info!("Starting logscope relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "WebSocket endpoint: ws://{}:{}{}",
        args.host, args.port, args.ws_path
    );
    info!("Status endpoint: http://{}:{}/status", args.host, args.http_port);

    let hub = RelayHub::new(HubConfig {
        host: args.host,
        port: args.port,
        ws_path: args.ws_path,
        http_port: Some(args.http_port),
    });
    hub.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");
    hub.stop().await;

    info!("Relay hub stopped");
    Ok(())
}
