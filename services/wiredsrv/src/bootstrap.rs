//! Service bootstrap
//!
//! Command line arguments, binding configured peers to their device
//! descriptions and routing unsolicited bus messages to peers.

use clap::Parser;
use device_model::DescriptionRegistry;
use futures::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WiredsrvConfig;
use crate::core::bus::WiredBus;
use crate::core::peer::WiredPeer;
use crate::core::transport::MockBus;
use crate::storage::PeerRepository;

/// Command-line arguments for wiredsrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "wiredsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Wired bus device configuration service",
    long_about = None
)]
pub struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short = 'c', long, env = "WIREDSRV_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Directory of device description XML files
    #[arg(long)]
    pub descriptors: Option<PathBuf>,

    /// SQLite database path
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Validation mode - load everything, then exit without starting the bus
    #[arg(long)]
    pub validate: bool,
}

impl Args {
    /// Command line values win over file and environment
    pub fn apply(&self, config: &mut WiredsrvConfig) {
        if let Some(level) = &self.log_level {
            config.service.log.level = level.clone();
        }
        if let Some(dir) = &self.descriptors {
            config.descriptors_dir = dir.clone();
        }
        if let Some(path) = &self.db_path {
            config.database_path = path.clone();
        }
    }
}

/// In-process bus with one simulated device per configured peer
pub fn simulated_bus(config: &WiredsrvConfig, registry: &DescriptionRegistry) -> Arc<MockBus> {
    let bus = Arc::new(MockBus::new());
    for peer in &config.peers {
        let eep_size = registry
            .resolve(peer.type_code, peer.firmware_version, peer.channel_count)
            .map(|d| d.eep_size as usize)
            .unwrap_or(0);
        bus.add_device(peer.address, eep_size);
    }
    bus
}

/// Bind every configured peer whose type code resolves to a description
pub fn bind_peers(
    config: &WiredsrvConfig,
    registry: &DescriptionRegistry,
    bus: &Arc<WiredBus>,
) -> Vec<Arc<WiredPeer>> {
    let mut peers = Vec::with_capacity(config.peers.len());
    for peer in &config.peers {
        let Some(description) =
            registry.resolve(peer.type_code, peer.firmware_version, peer.channel_count)
        else {
            warn!(
                "Peer {} (0x{:08X}): pairing rejected, no description for type 0x{:04X} firmware 0x{:04X}",
                peer.id, peer.address, peer.type_code, peer.firmware_version
            );
            continue;
        };
        info!(
            "Peer {} (0x{:08X}, {}) bound to {}",
            peer.id, peer.address, peer.serial_number, description.file
        );
        peers.push(Arc::new(WiredPeer::new(
            peer.id,
            peer.address,
            peer.serial_number.clone(),
            description,
            Arc::clone(bus),
        )));
    }
    peers
}

/// Feed unsolicited messages to the peer that sent them
pub fn spawn_event_router(
    bus: &WiredBus,
    peers: &[Arc<WiredPeer>],
    token: CancellationToken,
) -> JoinHandle<()> {
    let mut events = bus.subscribe();
    let by_address: HashMap<u32, Arc<WiredPeer>> = peers
        .iter()
        .map(|peer| (peer.address, Arc::clone(peer)))
        .collect();

    tokio::spawn(async move {
        loop {
            let packet = tokio::select! {
                _ = token.cancelled() => break,
                received = events.recv() => match received {
                    Ok(packet) => packet,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event router lagged, {} messages dropped", skipped);
                        continue;
                    },
                    Err(RecvError::Closed) => break,
                },
            };

            let Some(peer) = by_address.get(&packet.sender) else {
                debug!("Message from unknown sender 0x{:08X}", packet.sender);
                continue;
            };
            match peer.handle_event(&packet).await {
                Ok(updates) => {
                    for (channel, id, value) in updates {
                        info!("Peer {}: {} on channel {} = {}", peer.id, id, channel, value);
                    }
                },
                Err(e) => debug!("Peer {}: message not handled: {}", peer.id, e),
            }
        }
        debug!("Event router stopped");
    })
}

/// Write pending configuration to the devices, then persist every peer.
/// Blocks that cannot be written are saved dirty and go out after the next
/// start. Returns the number of peers saved.
pub async fn persist_peers(repository: &PeerRepository, peers: &[Arc<WiredPeer>]) -> usize {
    for peer in peers {
        if let Err(e) = peer.flush().await {
            errors::log_error!(e, "Peer {}: configuration left pending", peer.id);
        }
    }

    let results = join_all(peers.iter().map(|peer| repository.save_peer(peer))).await;
    let mut saved = 0;
    for (peer, result) in peers.iter().zip(results) {
        match result {
            Ok(()) => saved += 1,
            Err(e) => errors::log_error!(e, "Peer {}: save failed", peer.id),
        }
    }
    saved
}
