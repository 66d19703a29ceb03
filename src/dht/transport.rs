//! The RPC-sender collaborator.
//!
//! The DHT never opens a socket itself. It hands a [`DhtMessage`] to an
//! `RpcSender` implementation and awaits success or failure; the sender
//! owns serialization and endpoint selection. Real transports (WebRTC,
//! Bluetooth, local signaling) live outside this crate — this module only
//! defines the trait plus an in-process loopback implementation used by
//! tests and as a reference for host integrations.

use crate::types::contact::Contact;
use crate::types::message::DhtMessage;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Delivers a message to a contact. Implementations are responsible for
/// picking among the contact's endpoints and for serializing the message
/// onto the wire; the wire format itself is owned by the host.
#[async_trait]
pub trait RpcSender: Send + Sync {
    async fn send(&self, contact: &Contact, message: DhtMessage) -> Result<()>;
}

/// An in-process transport that wires routing tables together via
/// `tokio::sync::mpsc` channels, keyed by `peer_id`. Not a production
/// transport: no real network I/O, no endpoint negotiation.
pub struct LoopbackTransport {
    peers: Mutex<HashMap<String, mpsc::UnboundedSender<DhtMessage>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `peer_id` as a deliverable destination and returns the
    /// receiving half the host should poll to feed incoming RPCs into its
    /// routing table's handlers.
    pub fn register(&self, peer_id: impl Into<String>) -> mpsc::UnboundedReceiver<DhtMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().expect("loopback transport mutex poisoned").insert(peer_id.into(), tx);
        rx
    }

    pub fn unregister(&self, peer_id: &str) {
        self.peers.lock().expect("loopback transport mutex poisoned").remove(peer_id);
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RpcSender for LoopbackTransport {
    async fn send(&self, contact: &Contact, message: DhtMessage) -> Result<()> {
        let sender = {
            let peers = self.peers.lock().expect("loopback transport mutex poisoned");
            peers.get(&contact.peer_id).cloned()
        };
        match sender {
            Some(tx) => tx
                .send(message)
                .map_err(|_| anyhow::anyhow!("peer {} is no longer registered", contact.peer_id)),
            None => Err(anyhow::anyhow!("unknown peer id {}", contact.peer_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::message::{new_message_id, MessageHeader};
    use crate::types::node_id::NodeId;

    #[tokio::test]
    async fn delivers_to_registered_peer() {
        let transport = LoopbackTransport::new();
        let mut rx = transport.register("peer-a");
        let contact = Contact::new(NodeId::generate(), "peer-a", 0);

        let msg = DhtMessage::Ping {
            header: MessageHeader {
                sender_id: NodeId::generate(),
                message_id: new_message_id(),
                timestamp_ms: 0,
            },
        };
        transport.send(&contact, msg).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind_name(), "PING");
    }

    #[tokio::test]
    async fn unknown_peer_fails() {
        let transport = LoopbackTransport::new();
        let contact = Contact::new(NodeId::generate(), "ghost", 0);
        let msg = DhtMessage::Ping {
            header: MessageHeader {
                sender_id: NodeId::generate(),
                message_id: new_message_id(),
                timestamp_ms: 0,
            },
        };
        assert!(transport.send(&contact, msg).await.is_err());
    }
}
