//! Incentive ledger
//!
//! Owns every balance, the per-peer reputation table and the redemption
//! mempool behind a single lock. Proof-of-work enters the ledger only through
//! [`Ledger::redeem`]; everything the network asks for goes through
//! [`Ledger::call`] or [`Ledger::apply_remote`], which dedupe by seed in the
//! same critical section that applies the call.

use crate::error::StarfsError;
use crate::pow;
use crate::signalling::Signalling;
use parking_lot::Mutex;
use starfs_types::{
    Address, Amount, LedgerCall, LedgerEvent, LedgerSnapshot, NodeConfig, PeerMessage, PowToken,
    Seed,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

const YEAR_MS: f64 = 365.0 * 24.0 * 60.0 * 60.0 * 1000.0;

/// Share of a misbehaving peer's balance burned at settlement
const SLASH_RATIO: f64 = 0.9;

/// What the ledger knows about one peer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerState {
    /// Most recent snapshot the peer broadcast
    pub last_receive: Option<LedgerSnapshot>,
    /// Score for the current epoch; `None` until the scorer has seen the peer
    pub reputation: Option<i64>,
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: BTreeMap<Address, Amount>,
    peers: BTreeMap<Address, PeerState>,
    mempool: HashSet<Seed>,
}

/// Result of a deduplicated call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Applied,
    /// The seed was already redeemed this epoch; nothing changed
    Duplicate,
}

/// Summary of one settlement pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochReport {
    pub block_yield: f64,
    pub rewarded: Vec<Address>,
    pub slashed: Vec<Address>,
    /// Peer with no reputation yet; settlement stopped when it was found
    pub dropped: Option<Address>,
    pub net_reputation: i64,
    pub desync: bool,
}

impl EpochReport {
    pub fn settled(&self) -> bool {
        self.dropped.is_none()
    }
}

/// Result of peer convergence after a new connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence {
    Adopted { accounts: usize, votes: usize },
    TimedOut,
}

/// Shared handle to the ledger
#[derive(Clone)]
pub struct Ledger {
    state: Arc<Mutex<LedgerState>>,
    /// Bumped whenever a peer snapshot arrives
    snapshots: Arc<watch::Sender<u64>>,
    event_tx: broadcast::Sender<LedgerEvent>,
    freshness_ms: i64,
    nominal_yield: f64,
    convergence_timeout: Duration,
}

impl Ledger {
    pub fn new(config: &NodeConfig) -> Self {
        let (event_tx, _) = broadcast::channel(1000);
        let (snapshots, _) = watch::channel(0u64);
        Self {
            state: Arc::new(Mutex::new(LedgerState::default())),
            snapshots: Arc::new(snapshots),
            event_tx,
            freshness_ms: config.freshness_ms,
            nominal_yield: config.nominal_yield,
            convergence_timeout: Duration::from_millis(config.convergence_timeout_ms),
        }
    }

    /// Subscribe to ledger events
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: LedgerEvent) {
        let _ = self.event_tx.send(event);
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn balance(&self, address: &Address) -> Option<Amount> {
        self.state.lock().balances.get(address).copied()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot(self.state.lock().balances.clone())
    }

    pub fn peer_state(&self, peer: &Address) -> Option<PeerState> {
        self.state.lock().peers.get(peer).cloned()
    }

    pub fn peers(&self) -> Vec<Address> {
        self.state.lock().peers.keys().cloned().collect()
    }

    pub fn has_redeemed(&self, seed: Seed) -> bool {
        self.state.lock().mempool.contains(&seed)
    }

    // ========================================================================
    // Methods
    // ========================================================================

    pub fn mint(&self, to: &Address, amount: Amount) {
        mint_locked(&mut self.state.lock(), to, amount);
        self.emit(LedgerEvent::Minted {
            to: to.clone(),
            amount,
        });
    }

    /// Returns the amount actually removed
    pub fn burn(&self, to: &Address, amount: Amount) -> Result<Amount, StarfsError> {
        let burned = burn_locked(&mut self.state.lock(), to, amount)?;
        self.emit(LedgerEvent::Burned {
            to: to.clone(),
            amount: burned,
        });
        Ok(burned)
    }

    /// Convert a proof-of-work token into credit for `token.address`
    pub fn redeem(&self, token: &PowToken) -> Result<(), StarfsError> {
        let now = chrono::Utc::now().timestamp_millis();
        self.check_token(token, now)?;
        mint_locked(&mut self.state.lock(), &token.address, token.difficulty as Amount);
        self.emit_redeemed(token);
        Ok(())
    }

    fn check_token(&self, token: &PowToken, now: i64) -> Result<(), StarfsError> {
        if !pow::verify_token(token) {
            return Err(StarfsError::InsufficientWork);
        }
        if token.time.saturating_add(self.freshness_ms) < now {
            return Err(StarfsError::StaleToken);
        }
        Ok(())
    }

    fn emit_redeemed(&self, token: &PowToken) {
        debug!(
            "Redeemed {} units for {} (seed {})",
            token.difficulty,
            token.address.short(),
            token.seed
        );
        self.emit(LedgerEvent::Redeemed {
            address: token.address.clone(),
            amount: token.difficulty as Amount,
            seed: token.seed,
        });
    }

    /// Network entry point: dedupe, apply locally, then broadcast to peers.
    ///
    /// A redemption's seed is recorded even when the redemption itself fails,
    /// so a rejected token cannot be retried within the epoch.
    pub fn call(
        &self,
        call: LedgerCall,
        signalling: &dyn Signalling,
    ) -> Result<CallOutcome, StarfsError> {
        let outcome = self.apply_deduped(&call)?;
        if outcome == CallOutcome::Applied {
            signalling.send_message(PeerMessage::Call { call })?;
        }
        Ok(outcome)
    }

    /// Apply a call broadcast by a peer. Same dedupe as [`Ledger::call`], no rebroadcast.
    pub fn apply_remote(&self, call: LedgerCall) -> Result<CallOutcome, StarfsError> {
        self.apply_deduped(&call)
    }

    fn apply_deduped(&self, call: &LedgerCall) -> Result<CallOutcome, StarfsError> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut state = self.state.lock();

        if let Some(seed) = call.seed() {
            // check and record in one step
            if !state.mempool.insert(seed) {
                debug!("Skipping {} for seed {}: already in mempool", call.method(), seed);
                return Ok(CallOutcome::Duplicate);
            }
        }

        let event = match call {
            LedgerCall::Redeem(token) => {
                self.check_token(token, now)?;
                mint_locked(&mut state, &token.address, token.difficulty as Amount);
                LedgerEvent::Redeemed {
                    address: token.address.clone(),
                    amount: token.difficulty as Amount,
                    seed: token.seed,
                }
            }
            LedgerCall::Mint { to, amount } => {
                mint_locked(&mut state, to, *amount);
                LedgerEvent::Minted {
                    to: to.clone(),
                    amount: *amount,
                }
            }
            LedgerCall::Burn { to, amount } => {
                let burned = burn_locked(&mut state, to, *amount)?;
                LedgerEvent::Burned {
                    to: to.clone(),
                    amount: burned,
                }
            }
        };
        drop(state);

        self.emit(event);
        Ok(CallOutcome::Applied)
    }

    // ========================================================================
    // Peer Bookkeeping
    // ========================================================================

    /// Start tracking a peer with no snapshot and no reputation
    pub fn track_peer(&self, peer: &Address) {
        self.state.lock().peers.entry(peer.clone()).or_default();
    }

    /// Set by the reputation scorer between epochs
    pub fn set_reputation(&self, peer: &Address, reputation: i64) {
        self.state
            .lock()
            .peers
            .entry(peer.clone())
            .or_default()
            .reputation = Some(reputation);
    }

    /// Record the snapshot a peer broadcast and wake convergence waiters
    pub fn receive_state(&self, peer: &Address, snapshot: LedgerSnapshot) {
        self.state
            .lock()
            .peers
            .entry(peer.clone())
            .or_default()
            .last_receive = Some(snapshot);
        self.snapshots.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Route a frame received from `from`
    pub fn handle_peer_message(
        &self,
        from: &Address,
        message: PeerMessage,
    ) -> Result<(), StarfsError> {
        match message {
            // `from` is the address bound to the link
            PeerMessage::Hello { .. } => self.track_peer(from),
            PeerMessage::State { snapshot } => self.receive_state(from, snapshot),
            PeerMessage::Call { call } => {
                self.apply_remote(call)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Epoch Settlement
    // ========================================================================

    /// Per-epoch return derived from how much of the supply tracked peers hold
    pub fn block_yield(&self, epoch_time: Duration) -> f64 {
        block_yield_locked(&self.state.lock(), epoch_time, self.nominal_yield)
    }

    /// Reward or slash every tracked peer by reputation, pay this node its
    /// share and reset the mempool.
    ///
    /// A peer still without reputation is dropped and the pass stops there;
    /// peers already visited keep their settlement.
    pub fn on_epoch(&self, epoch_time: Duration, local: &Address) -> EpochReport {
        let mut events = Vec::new();
        let mut state = self.state.lock();
        let block_yield = block_yield_locked(&state, epoch_time, self.nominal_yield);
        let mut report = EpochReport {
            block_yield,
            ..EpochReport::default()
        };

        let peers: Vec<Address> = state.peers.keys().cloned().collect();
        for peer in peers {
            let reputation = state.peers.get(&peer).and_then(|p| p.reputation);
            let Some(reputation) = reputation else {
                state.peers.remove(&peer);
                drop(state);
                info!("Dropping unresponsive peer {}...", peer.short());
                self.emit_all(events);
                self.emit(LedgerEvent::PeerDropped { peer: peer.clone() });
                report.dropped = Some(peer);
                return report;
            };

            report.net_reputation = report.net_reputation.saturating_add(reputation);
            let balance = state.balances.get(&peer).copied();

            if reputation > 0 {
                info!("Rewarding {}...", peer.short());
                let amount = epoch_reward(balance.unwrap_or(0), block_yield);
                mint_locked(&mut state, &peer, amount);
                events.push(LedgerEvent::Minted {
                    to: peer.clone(),
                    amount,
                });
                report.rewarded.push(peer.clone());
            } else if reputation < 0 {
                if let Some(balance) = balance {
                    info!("Slashing {}...", peer.short());
                    let amount = (balance as f64 * SLASH_RATIO).floor() as Amount;
                    let burned = burn_locked(&mut state, &peer, amount).unwrap_or(0);
                    events.push(LedgerEvent::Burned {
                        to: peer.clone(),
                        amount: burned,
                    });
                    report.slashed.push(peer.clone());
                }
            }

            if let Some(peer_state) = state.peers.get_mut(&peer) {
                peer_state.reputation = None;
            }
        }

        let own = epoch_reward(state.balances.get(local).copied().unwrap_or(0), block_yield);
        mint_locked(&mut state, local, own);
        events.push(LedgerEvent::Minted {
            to: local.clone(),
            amount: own,
        });

        state.mempool.clear();
        drop(state);

        if report.net_reputation < 0 {
            report.desync = true;
            warn!("{}, this node may be out of sync", StarfsError::Desync(report.net_reputation));
        }

        self.emit_all(events);
        if report.desync {
            self.emit(LedgerEvent::Desync {
                net_reputation: report.net_reputation,
            });
        }
        self.emit(LedgerEvent::EpochSettled {
            rewarded: report.rewarded.len(),
            slashed: report.slashed.len(),
            net_reputation: report.net_reputation,
            block_yield,
        });
        report
    }

    fn emit_all(&self, events: Vec<LedgerEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    // ========================================================================
    // Convergence
    // ========================================================================

    /// Broadcast our snapshot, wait for peer snapshots and adopt the most
    /// common one.
    ///
    /// Waiting is driven by snapshot arrivals and bounded by the configured
    /// convergence timeout; on timeout the local state is kept.
    pub async fn on_connect(&self, signalling: &dyn Signalling) -> Result<Convergence, StarfsError> {
        signalling.send_message(PeerMessage::State {
            snapshot: self.snapshot(),
        })?;

        // subscribe before the first check so no arrival is missed
        let mut arrivals = self.snapshots.subscribe();
        let deadline = tokio::time::Instant::now() + self.convergence_timeout;

        loop {
            let leader = plurality_snapshot(&self.state.lock().peers);
            if let Some((winner, votes)) = leader {
                let accounts = winner.len();
                self.state.lock().balances = winner.0.clone();
                info!(
                    "Adopted peer ledger state ({} accounts, {} votes)",
                    accounts, votes
                );
                signalling.send_message(PeerMessage::State { snapshot: winner })?;
                self.emit(LedgerEvent::StateAdopted { accounts });
                return Ok(Convergence::Adopted { accounts, votes });
            }

            match tokio::time::timeout_at(deadline, arrivals.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(StarfsError::Transport(
                        "snapshot notifier closed".to_string(),
                    ))
                }
                Err(_) => {
                    warn!(
                        "No peer ledger state within {:?}, keeping local state",
                        self.convergence_timeout
                    );
                    return Ok(Convergence::TimedOut);
                }
            }
        }
    }
}

fn mint_locked(state: &mut LedgerState, to: &Address, amount: Amount) {
    let balance = state.balances.entry(to.clone()).or_insert(0);
    *balance = balance.saturating_add(amount);
}

fn burn_locked(state: &mut LedgerState, to: &Address, amount: Amount) -> Result<Amount, StarfsError> {
    let balance = state
        .balances
        .get_mut(to)
        .ok_or(StarfsError::AccountNotFound)?;
    let burned = amount.min(*balance);
    *balance -= burned;
    Ok(burned)
}

fn block_yield_locked(state: &LedgerState, epoch_time: Duration, nominal_yield: f64) -> f64 {
    let supply: f64 = state.balances.values().map(|b| *b as f64).sum();
    let staked: f64 = state
        .peers
        .keys()
        .filter_map(|peer| state.balances.get(peer))
        .map(|b| *b as f64)
        .sum();

    let staking_rate = if staked == 0.0 || supply == 0.0 {
        1.0
    } else {
        staked / supply
    };
    // expressed in percent before annualizing
    let staking_yield = nominal_yield * (1.0 - staking_rate * 0.5) / staking_rate * 100.0;
    let epochs_per_year = YEAR_MS / (epoch_time.as_millis().max(1) as f64);
    (staking_yield.powf(1.0 / epochs_per_year) - 1.0).max(0.0)
}

/// Reward for one epoch: the balance grown by the block yield, at least one unit
fn epoch_reward(balance: Amount, block_yield: f64) -> Amount {
    ((balance as f64 * block_yield).floor() as Amount).max(1)
}

/// Most frequently observed peer snapshot and its vote count.
///
/// Ties go to the candidate seen last in address order.
fn plurality_snapshot(peers: &BTreeMap<Address, PeerState>) -> Option<(LedgerSnapshot, usize)> {
    let candidates: Vec<&LedgerSnapshot> = peers
        .values()
        .filter_map(|p| p.last_receive.as_ref())
        .collect();

    let mut best: Option<(&LedgerSnapshot, usize)> = None;
    for candidate in &candidates {
        let votes = candidates.iter().filter(|other| **other == *candidate).count();
        if best.map_or(true, |(_, top)| votes >= top) {
            best = Some((candidate, votes));
        }
    }
    best.map(|(snapshot, votes)| (snapshot.clone(), votes))
}
