//! StarFS node
//!
//! Serves registered files to clients that pay in proof-of-work, links with
//! peer nodes and settles the incentive ledger every epoch.

mod config;
mod peer;
mod server;

use anyhow::{Context, Result};
use clap::Parser;
use config::NodeArgs;
use peer::PeerHub;
use server::AppState;
use starfs_core::{EpochScheduler, FileRegistry, Ledger, RequestHandler, Signalling};
use starfs_types::{LedgerEvent, PeerMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let args = NodeArgs::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let config = Arc::new(args.to_config());
    tracing::info!("Node address {}", config.address);

    let registry = if args.no_demo {
        FileRegistry::new()
    } else {
        FileRegistry::with_demo_file()
    };
    for (hash, path) in &args.files {
        let size = registry
            .load(hash, path)
            .await
            .with_context(|| format!("failed to load {}", path.display()))?;
        tracing::info!("Serving {} ({} chars) from {}", hash, size, path.display());
    }

    let ledger = Ledger::new(&config);
    let hub = Arc::new(PeerHub::new(config.address.clone()));
    let handler = RequestHandler::new(&config, ledger.clone(), registry.clone(), hub.clone());

    tokio::spawn(log_ledger_events(ledger.clone(), hub.clone()));

    let scheduler = EpochScheduler::new(
        ledger.clone(),
        config.address.clone(),
        Duration::from_millis(config.epoch_interval_ms),
    );
    scheduler.start().await;

    for url in &args.peers {
        tokio::spawn(peer::dial(hub.clone(), ledger.clone(), url.clone()));
    }

    let state = AppState {
        config: config.clone(),
        handler,
        ledger,
        registry,
        hub,
    };
    let addr = SocketAddr::new(args.bind, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    server::serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutting down");
    })
    .await?;

    scheduler.stop().await;
    Ok(())
}

/// Log ledger events and rebroadcast our snapshot after every settlement,
/// which keeps this node scored by its peers.
async fn log_ledger_events(ledger: Ledger, hub: Arc<PeerHub>) {
    let mut events = ledger.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Ledger event log skipped {} events", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match &event {
            LedgerEvent::Redeemed { address, amount, seed } => {
                tracing::debug!("Redeemed {} for {} (seed {})", amount, address.short(), seed)
            }
            LedgerEvent::PeerDropped { peer } => tracing::info!("Peer {} dropped", peer.short()),
            LedgerEvent::Desync { net_reputation } => {
                tracing::warn!("Peers disagree with us (net reputation {})", net_reputation)
            }
            LedgerEvent::StateAdopted { accounts } => {
                tracing::info!("Ledger replaced by peer state ({} accounts)", accounts)
            }
            LedgerEvent::EpochSettled {
                rewarded,
                slashed,
                block_yield,
                ..
            } => {
                tracing::info!(
                    "Epoch settled: {} rewarded, {} slashed, yield {:.6}",
                    rewarded,
                    slashed,
                    block_yield
                );
                let heartbeat = PeerMessage::State {
                    snapshot: ledger.snapshot(),
                };
                if let Err(e) = hub.send_message(heartbeat) {
                    tracing::warn!("Failed to broadcast ledger state: {}", e);
                }
            }
            LedgerEvent::Minted { .. } | LedgerEvent::Burned { .. } => {
                tracing::trace!("{:?}", event)
            }
        }
    }
}
