//! Peer links
//!
//! Every link, inbound (`GET /peer`) or outbound (`--peer`), is registered
//! with the [`PeerHub`], which is what the ledger broadcasts through. A link
//! opens with `hello`, then carries `state` and `call` frames.

use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::RwLock;
use starfs_core::{Ledger, Signalling, StarfsError};
use starfs_types::{Address, PeerMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};
use url::Url;

/// Wait between outbound reconnect attempts
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

struct PeerLink {
    /// Ledger address announced in the peer's `hello`
    peer: Option<Address>,
    tx: mpsc::UnboundedSender<String>,
}

/// Fan-out over every live peer link
pub struct PeerHub {
    address: Address,
    links: RwLock<HashMap<u64, PeerLink>>,
    next_link: AtomicU64,
}

impl PeerHub {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            links: RwLock::new(HashMap::new()),
            next_link: AtomicU64::new(1),
        }
    }

    /// Number of links that have completed the hello exchange
    pub fn peer_count(&self) -> usize {
        self.links
            .read()
            .values()
            .filter(|link| link.peer.is_some())
            .count()
    }

    fn register(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let id = self.next_link.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.links.write().insert(id, PeerLink { peer: None, tx });
        (id, rx)
    }

    fn identify(&self, id: u64, peer: Address) {
        if let Some(link) = self.links.write().get_mut(&id) {
            link.peer = Some(peer);
        }
    }

    fn unregister(&self, id: u64) {
        self.links.write().remove(&id);
    }

    fn send_on(&self, id: u64, message: &PeerMessage) -> Result<(), StarfsError> {
        let text = serde_json::to_string(message)?;
        if let Some(link) = self.links.read().get(&id) {
            let _ = link.tx.send(text);
        }
        Ok(())
    }
}

impl Signalling for PeerHub {
    fn address(&self) -> &Address {
        &self.address
    }

    fn send_message(&self, message: PeerMessage) -> Result<(), StarfsError> {
        let text = serde_json::to_string(&message)?;
        for link in self.links.read().values() {
            // A closed link is cleaned up by its own task
            let _ = link.tx.send(text.clone());
        }
        Ok(())
    }
}

/// Score a peer for the current epoch. A bad frame sticks until settlement.
fn score(ledger: &Ledger, peer: &Address, well_formed: bool) {
    if !well_formed {
        ledger.set_reputation(peer, -1);
        return;
    }
    let scored = ledger
        .peer_state(peer)
        .and_then(|state| state.reputation)
        .is_some();
    if !scored {
        ledger.set_reputation(peer, 1);
    }
}

/// Drive one peer link until either side closes it.
///
/// `incoming` yields text frames; `outgoing` accepts them. Transport framing
/// is adapted by the caller.
pub async fn run_link<I, O>(hub: Arc<PeerHub>, ledger: Ledger, mut incoming: I, mut outgoing: O)
where
    I: Stream<Item = String> + Unpin,
    O: Sink<String> + Unpin + Send + 'static,
{
    let (link_id, mut rx) = hub.register();

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if outgoing.send(text).await.is_err() {
                break;
            }
        }
    });

    if let Err(e) = hub.send_on(
        link_id,
        &PeerMessage::Hello {
            address: hub.address().clone(),
        },
    ) {
        warn!("Failed to greet peer link {}: {}", link_id, e);
    }

    let mut peer: Option<Address> = None;
    while let Some(text) = incoming.next().await {
        let message = match serde_json::from_str::<PeerMessage>(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed frame on peer link {}: {}", link_id, e);
                if let Some(from) = &peer {
                    score(&ledger, from, false);
                }
                continue;
            }
        };

        let hello = match (&peer, &message) {
            (None, PeerMessage::Hello { address }) => Some(address.clone()),
            _ => None,
        };
        if let Some(address) = hello {
            info!("Peer link {} is {}", link_id, address);
            hub.identify(link_id, address.clone());
            peer = Some(address);

            let (ledger, hub) = (ledger.clone(), hub.clone());
            tokio::spawn(async move {
                match ledger.on_connect(hub.as_ref()).await {
                    Ok(outcome) => debug!("Convergence finished: {:?}", outcome),
                    Err(e) => warn!("Convergence failed: {}", e),
                }
            });
        }

        let Some(from) = peer.clone() else {
            warn!("Dropping frame before hello on peer link {}", link_id);
            continue;
        };

        match ledger.handle_peer_message(&from, message) {
            Ok(()) => score(&ledger, &from, true),
            Err(e) => {
                warn!("Rejected frame from {}: {}", from.short(), e);
                score(&ledger, &from, false);
            }
        }
    }

    info!("Peer link {} closed", link_id);
    hub.unregister(link_id);
    writer.abort();
}

/// Keep an outbound link to `url` open, reconnecting after failures
pub async fn dial(hub: Arc<PeerHub>, ledger: Ledger, url: Url) {
    loop {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                info!("Connected to peer {}", url);
                let (sink, stream) = socket.split();
                let outgoing = sink.with(|text: String| {
                    futures::future::ready(Ok::<_, tungstenite::Error>(Message::Text(text)))
                });
                let incoming = stream
                    .take_while(|frame| futures::future::ready(matches!(frame, Ok(m) if !m.is_close())))
                    .filter_map(|frame| {
                        futures::future::ready(match frame {
                            Ok(Message::Text(text)) => Some(text),
                            _ => None,
                        })
                    });
                run_link(hub.clone(), ledger.clone(), Box::pin(incoming), Box::pin(outgoing)).await;
            }
            Err(e) => warn!("Failed to connect to peer {}: {}", url, e),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
