//! Epoch scheduler - settles the ledger on a fixed period
//!
//! Runs a background task that calls [`Ledger::on_epoch`] once per epoch.
//! The first settlement happens one full period after start.

use crate::ledger::Ledger;
use starfs_types::Address;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Drives epoch settlement for one node
pub struct EpochScheduler {
    ledger: Ledger,
    /// Address that collects this node's own epoch reward
    local: Address,
    period: Duration,
    running: Arc<RwLock<bool>>,
}

impl EpochScheduler {
    pub fn new(ledger: Ledger, local: Address, period: Duration) -> Self {
        Self {
            ledger,
            local,
            period,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Start the settlement task. Returns `None` if it is already running.
    pub async fn start(&self) -> Option<JoinHandle<()>> {
        let mut is_running = self.running.write().await;
        if *is_running {
            info!("Epoch scheduler already running");
            return None;
        }
        *is_running = true;
        drop(is_running);

        let running = self.running.clone();
        let ledger = self.ledger.clone();
        let local = self.local.clone();
        let period = self.period;

        info!("Starting epoch scheduler (every {:?})", period);

        Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if !*running.read().await {
                    info!("Epoch scheduler stopped");
                    break;
                }

                let report = ledger.on_epoch(period, &local);
                if let Some(peer) = &report.dropped {
                    warn!(
                        "Epoch cut short: {} had no reputation and was dropped",
                        peer.short()
                    );
                } else {
                    debug!(
                        "Epoch settled: yield {:.6}, {} rewarded, {} slashed",
                        report.block_yield,
                        report.rewarded.len(),
                        report.slashed.len()
                    );
                }
            }
        }))
    }

    /// Stop after the current period
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("Stopping epoch scheduler");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starfs_types::{LedgerEvent, NodeConfig};

    #[tokio::test]
    async fn test_scheduler_settles_epochs() {
        let config = NodeConfig::default();
        let ledger = Ledger::new(&config);
        let mut events = ledger.subscribe();
        let local = Address::from("0xlocal");

        let scheduler = EpochScheduler::new(ledger.clone(), local.clone(), Duration::from_millis(20));
        let handle = scheduler.start().await.unwrap();
        assert!(scheduler.start().await.is_none());

        let settled = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(LedgerEvent::EpochSettled { .. }) = events.recv().await {
                    break;
                }
            }
        })
        .await;
        assert!(settled.is_ok());
        // minimum reward of one unit even from an empty balance
        assert!(ledger.balance(&local).unwrap_or(0) >= 1);

        scheduler.stop().await;
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!scheduler.is_running().await);
    }
}
