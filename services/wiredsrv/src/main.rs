//! Wired bus service (`wiredsrv`)

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use device_model::DescriptionRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use wiredsrv::bootstrap::{bind_peers, persist_peers, simulated_bus, spawn_event_router, Args};
use wiredsrv::{PeerRepository, WiredBus, WiredsrvConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = WiredsrvConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    // Keep the guard alive for the whole run, the file sink stops when it drops
    let _log_guard = common::logging::init_logging(&config.service.log)?;
    info!("Starting {}", config.service.name);

    let registry = DescriptionRegistry::load_all(&config.descriptors_dir).with_context(|| {
        format!(
            "loading device descriptions from {}",
            config.descriptors_dir.display()
        )
    })?;
    let repository = PeerRepository::new(&config.database_path).await?;

    // ============ Bus and peers ============
    let transport = simulated_bus(&config, &registry);
    let bus = Arc::new(WiredBus::new(
        transport,
        config.bus.central_address,
        config.bus.timings.clone(),
    ));
    let peers = bind_peers(&config, &registry, &bus);

    let mut restored_blocks = 0;
    let mut restored_slots = 0;
    for peer in &peers {
        match repository.restore_peer(peer).await {
            Ok((blocks, slots)) => {
                restored_blocks += blocks;
                restored_slots += slots;
            },
            Err(e) => errors::log_error!(e, "Peer {}: restore failed", peer.id),
        }
    }
    info!(
        "{} of {} configured peers bound, {} blocks and {} slots restored",
        peers.len(),
        config.peers.len(),
        restored_blocks,
        restored_slots
    );

    if args.validate {
        info!("Validation completed successfully");
        return Ok(());
    }

    // ============ Run ============
    bus.start();
    let token = CancellationToken::new();
    let router = spawn_event_router(&bus, &peers, token.clone());

    common::shutdown::wait_for_shutdown().await;
    info!("Shutdown requested");

    token.cancel();
    if let Err(e) = router.await {
        warn!("Event router ended abnormally: {}", e);
    }

    persist_peers(&repository, &peers).await;
    for peer in &peers {
        peer.dispose();
    }
    bus.dispose().await;

    info!("{} stopped", config.service.name);
    Ok(())
}
