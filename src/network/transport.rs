//! Transport boundary.
//!
//! The manager sends raw envelope bytes through [`Transport`] and consumes
//! inbound bytes from an mpsc receiver; everything underneath is swappable.
//! The in-memory hub connects many nodes inside one process for the
//! simulation mode and the integration tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::errors::{P2pError, Result};
use crate::identity::NodeId;

/// Delivers one already-encoded envelope to one peer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, peer: &NodeId, bytes: Vec<u8>) -> Result<()>;
}

type Mailboxes = Arc<RwLock<HashMap<NodeId, mpsc::UnboundedSender<Vec<u8>>>>>;

/// In-process message hub: a mailbox per registered node.
#[derive(Clone, Default)]
pub struct InMemoryHub {
    mailboxes: Mailboxes,
}

impl InMemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and get its transport handle plus inbound stream.
    pub async fn register(
        &self,
        node_id: NodeId,
    ) -> (InMemoryTransport, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes.write().await.insert(node_id, tx);
        (
            InMemoryTransport {
                mailboxes: Arc::clone(&self.mailboxes),
            },
            rx,
        )
    }

    /// Drop a node's mailbox; subsequent sends to it fail.
    pub async fn disconnect(&self, node_id: &NodeId) {
        self.mailboxes.write().await.remove(node_id);
    }
}

/// Sender half handed to each registered node.
#[derive(Clone)]
pub struct InMemoryTransport {
    mailboxes: Mailboxes,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, peer: &NodeId, bytes: Vec<u8>) -> Result<()> {
        let mailboxes = self.mailboxes.read().await;
        let tx = mailboxes
            .get(peer)
            .ok_or_else(|| P2pError::Transport(format!("peer {peer} not reachable")))?;
        tx.send(bytes)
            .map_err(|_| P2pError::Transport(format!("peer {peer} closed its mailbox")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivery_between_registered_nodes() {
        let hub = InMemoryHub::new();
        let (a_tx, _a_rx) = hub.register(NodeId::new("a")).await;
        let (_b_tx, mut b_rx) = hub.register(NodeId::new("b")).await;

        a_tx.send(&NodeId::new("b"), vec![1, 2, 3]).await.unwrap();
        assert_eq!(b_rx.recv().await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let hub = InMemoryHub::new();
        let (a_tx, _a_rx) = hub.register(NodeId::new("a")).await;

        let err = a_tx.send(&NodeId::new("ghost"), vec![1]).await.unwrap_err();
        assert!(err.to_string().contains("not reachable"));
    }

    #[tokio::test]
    async fn test_disconnect_breaks_delivery() {
        let hub = InMemoryHub::new();
        let (a_tx, _a_rx) = hub.register(NodeId::new("a")).await;
        let (_b_tx, _b_rx) = hub.register(NodeId::new("b")).await;

        hub.disconnect(&NodeId::new("b")).await;
        assert!(a_tx.send(&NodeId::new("b"), vec![1]).await.is_err());
    }
}
