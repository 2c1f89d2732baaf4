//! relay-tunnel-node binary entry point.
//!
//! Usage:
//! ```bash
//! relay-tunnel-node --config node.toml
//! RUST_LOG=tunnel_node=debug relay-tunnel-node
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tunnel_node::{
    Config, Controller, Router, ServiceListener, Uplink, UplinkState, WebSocketUplink,
    WebSocketUplinkOptions,
};

/// Request/event queue depth between router, controller and adapters.
const CONTROL_QUEUE_SIZE: usize = 256;

/// Relay tunnel node.
#[derive(Parser, Debug)]
#[command(name = "relay-tunnel-node")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, short, default_value = "node.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        device = %config.device.id,
        relay = %config.uplink.url,
        "Starting relay tunnel node"
    );

    let mut options = WebSocketUplinkOptions::new(&config.uplink.url, &config.uplink.api_token);
    options.policy = config.uplink.reconnect_policy();
    options.receive_queue_size = config.uplink.receive_queue_size;
    options.write_timeout = config.uplink.write_timeout();
    let websocket = Arc::new(WebSocketUplink::new(options));
    let mut uplink_events = websocket.events();
    let uplink: Arc<dyn Uplink> = websocket;
    let inbound = uplink
        .connect()
        .await
        .context("Failed to connect to the relay")?;

    let (requests_tx, requests_rx) = mpsc::channel(CONTROL_QUEUE_SIZE);
    let (events_tx, events_rx) = mpsc::channel(CONTROL_QUEUE_SIZE);
    let router = Arc::new(Router::new(Arc::clone(&uplink), requests_tx));
    let controller = Arc::new(Controller::new(
        config.device.id,
        Arc::clone(&uplink),
        Arc::clone(&router),
        config.connection_settings(),
        events_tx,
    ));

    let mut tasks = vec![
        tokio::spawn(Arc::clone(&router).run(inbound)),
        tokio::spawn(Arc::clone(&controller).run(requests_rx, events_rx)),
    ];
    for service in &config.services {
        let listener = ServiceListener::bind(service.clone())
            .await
            .with_context(|| format!("Failed to bind service {} on {}", service.name, service.listen))?;
        tasks.push(tokio::spawn(listener.run(Arc::clone(&controller))));
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Shutting down");
        }
        _ = watch_uplink(&mut uplink_events) => {
            error!("Relay unreachable, shutting down");
        }
    }

    controller.shutdown().await;
    for task in &tasks {
        task.abort();
    }
    if let Err(e) = uplink.close().await {
        warn!(error = %e, "Uplink close failed");
    }
    info!("Stopped");
    Ok(())
}

/// Log uplink state changes; returns once the uplink gave up reconnecting.
async fn watch_uplink(events: &mut broadcast::Receiver<tunnel_node::UplinkEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match event.state {
                UplinkState::Connected => info!(detail = %event.detail, "Uplink connected"),
                UplinkState::Disconnected => warn!(detail = %event.detail, "Uplink disconnected"),
                UplinkState::GaveUp => {
                    error!(detail = %event.detail, "Uplink gave up reconnecting");
                    return;
                }
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Uplink events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
