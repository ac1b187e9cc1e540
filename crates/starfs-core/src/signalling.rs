//! Peer signalling seam
//!
//! The ledger never talks to a transport directly. It is handed something that
//! knows this node's address and can fan a frame out to every connected peer.
//! The node implements this over WebSocket links; [`LocalMesh`] implements it
//! in-process.

use crate::error::StarfsError;
use starfs_types::{Address, PeerMessage};
use tokio::sync::broadcast;

/// Outbound side of the peer substrate
pub trait Signalling: Send + Sync {
    /// This node's ledger identity
    fn address(&self) -> &Address;

    /// Queue a frame for every connected peer. Must not block.
    fn send_message(&self, message: PeerMessage) -> Result<(), StarfsError>;
}

/// A frame as seen by mesh subscribers
#[derive(Debug, Clone)]
pub struct MeshFrame {
    pub from: Address,
    pub message: PeerMessage,
}

/// In-process broadcast mesh: every member sees every other member's frames
#[derive(Clone)]
pub struct LocalMesh {
    tx: broadcast::Sender<MeshFrame>,
}

impl LocalMesh {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1000);
        Self { tx }
    }

    /// Join the mesh as `address`
    pub fn join(&self, address: Address) -> MeshLink {
        MeshLink {
            address,
            tx: self.tx.clone(),
        }
    }
}

impl Default for LocalMesh {
    fn default() -> Self {
        Self::new()
    }
}

/// One member's handle on a [`LocalMesh`]
#[derive(Clone)]
pub struct MeshLink {
    address: Address,
    tx: broadcast::Sender<MeshFrame>,
}

impl MeshLink {
    /// Receive frames sent by the other members
    pub fn subscribe(&self) -> broadcast::Receiver<MeshFrame> {
        self.tx.subscribe()
    }
}

impl Signalling for MeshLink {
    fn address(&self) -> &Address {
        &self.address
    }

    fn send_message(&self, message: PeerMessage) -> Result<(), StarfsError> {
        // No subscribers just means no peers yet
        let _ = self.tx.send(MeshFrame {
            from: self.address.clone(),
            message,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starfs_types::LedgerSnapshot;

    #[tokio::test]
    async fn test_mesh_delivers_with_sender() {
        let mesh = LocalMesh::new();
        let a = mesh.join(Address::from("0xa"));
        let b = mesh.join(Address::from("0xb"));
        let mut rx = b.subscribe();

        a.send_message(PeerMessage::State {
            snapshot: LedgerSnapshot::default(),
        })
        .unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.from, Address::from("0xa"));
        assert!(matches!(frame.message, PeerMessage::State { .. }));
    }

    #[test]
    fn test_send_without_peers_is_ok() {
        let mesh = LocalMesh::new();
        let a = mesh.join(Address::from("0xa"));
        assert!(a
            .send_message(PeerMessage::Hello {
                address: Address::from("0xa")
            })
            .is_ok());
    }
}
