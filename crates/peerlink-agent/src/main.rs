//! `peerlink` Agent
//!
//! Opens every paired link, answers peers that reach out over the relay
//! and logs the messages they send.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use peerlink_connect::engine::webrtc::WebRtcEngineFactory;
use peerlink_connect::{InboundMessage, JsonFilePairingStore, LinkRegistry, WebSocketConnector};

#[derive(Parser, Debug)]
#[command(name = "peerlink-agent")]
#[command(version, about = "peerlink agent - keeps paired links open")]
struct Args {
    /// Config file layered over the global settings
    #[arg(long, env = "PEERLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Pairing records file (JSON array of link descriptors).
    /// Overrides `pairing.links_path` from the config.
    #[arg(long, env = "PEERLINK_LINKS")]
    links: Option<PathBuf>,

    /// Send every received message back to its sender.
    #[arg(long, env = "PEERLINK_ECHO")]
    echo: bool,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "PEERLINK_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    peerlink_core::tracing_init::init_tracing(
        "peerlink_agent=info,peerlink_connect=info",
        args.log_json,
    );

    let config = peerlink_core::config::load_config(args.config.as_deref())?;
    let links_path = match args.links.or_else(|| config.pairing.links_path.clone()) {
        Some(path) => path,
        None => default_links_path()?,
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        relay = %config.signaling.base_url,
        links = %links_path.display(),
        echo = args.echo,
        "Starting peerlink-agent"
    );

    let registry = Arc::new(LinkRegistry::from_config(
        Arc::new(WebSocketConnector::new(config.signaling.base_url.clone())),
        Arc::new(WebRtcEngineFactory::from_config(&config.negotiation)),
        &config,
    ));

    let inbound = registry
        .inbound_messages()
        .ok_or_else(|| anyhow::anyhow!("inbound feed already taken"))?;
    let inbound_handle = tokio::spawn(handle_inbound(
        Arc::clone(&registry),
        inbound,
        args.echo,
    ));

    let store = JsonFilePairingStore::new(links_path);
    registry.follow(&store).await?;
    info!(links = registry.len().await, "Links opened");

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");

    registry.shutdown().await;
    inbound_handle.abort();
    info!("peerlink-agent stopped");
    Ok(())
}

async fn handle_inbound(
    registry: Arc<LinkRegistry>,
    mut inbound: impl tokio_stream::Stream<Item = InboundMessage> + Unpin,
    echo: bool,
) {
    while let Some(message) = inbound.next().await {
        let InboundMessage {
            link_id,
            peer_id,
            result,
        } = message;
        match result {
            Ok(bytes) => {
                info!(%link_id, %peer_id, len = bytes.len(), "Message received");
                if echo
                    && let Err(e) = registry.send(&link_id, &peer_id, &bytes).await
                {
                    warn!(%link_id, %peer_id, error = %e, "Echo failed");
                }
            }
            Err(e) => error!(%link_id, %peer_id, error = %e, "Message dropped"),
        }
    }
}

fn default_links_path() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("peerlink").join("links.json"))
        .ok_or_else(|| anyhow::anyhow!("cannot determine config directory for pairing records"))
}
