//! Pending RPC table.
//!
//! Each dispatched RPC gets an entry keyed by `messageId`, holding a
//! one-shot resolver and the time it was sent. The entry is removed on
//! response, timeout, or shutdown — whichever happens first — so a response
//! is delivered to the caller exactly once.

use crate::types::message::DhtMessage;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::{trace, warn};

/// What a pending RPC's resolver delivers: a real response, or a sentinel
/// meaning the table was shut down out from under it. Distinguishing the two
/// lets the waiting `round_trip` return `DhtError::Shutdown` instead of a
/// generic transport error.
pub enum PendingOutcome {
    Response(DhtMessage),
    ShuttingDown,
}

struct PendingEntry {
    resolver: oneshot::Sender<PendingOutcome>,
    sent_at_ms: i64,
}

/// Map from `messageId` to its pending resolver. Owned exclusively by the
/// routing table; never shared beyond it.
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new pending RPC and returns the receiving half of its
    /// resolver. The timeout itself is armed by the caller via
    /// `tokio::time::timeout` around the returned receiver.
    pub fn register(&self, message_id: String, sent_at_ms: i64) -> oneshot::Receiver<PendingOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock().expect("pending table mutex poisoned");
        entries.insert(
            message_id,
            PendingEntry {
                resolver: tx,
                sent_at_ms,
            },
        );
        rx
    }

    /// Resolves the pending entry matching `message.message_id()`, if any.
    /// Returns the RTT in milliseconds when a matching entry was found.
    pub fn resolve(&self, message: DhtMessage, now_ms: i64) -> Option<u64> {
        let entry = {
            let mut entries = self.entries.lock().expect("pending table mutex poisoned");
            entries.remove(message.message_id())
        };
        match entry {
            Some(entry) => {
                let rtt = (now_ms - entry.sent_at_ms).max(0) as u64;
                if entry.resolver.send(PendingOutcome::Response(message)).is_err() {
                    trace!("pending resolver dropped before response arrived");
                }
                Some(rtt)
            }
            None => {
                warn!(message_id = %message.message_id(), "no pending entry for response");
                None
            }
        }
    }

    /// Removes a pending entry without resolving it (used on timeout).
    pub fn remove(&self, message_id: &str) {
        let mut entries = self.entries.lock().expect("pending table mutex poisoned");
        entries.remove(message_id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("pending table mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains every pending entry, sending each resolver a shutdown sentinel
    /// so a `round_trip` parked on its receiver can return `DhtError::Shutdown`
    /// rather than a generic transport error.
    pub fn clear(&self) {
        let drained: Vec<PendingEntry> = {
            let mut entries = self.entries.lock().expect("pending table mutex poisoned");
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            let _ = entry.resolver.send(PendingOutcome::ShuttingDown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::message::{new_message_id, MessageHeader};
    use crate::types::node_id::NodeId;

    fn pong(message_id: String) -> DhtMessage {
        DhtMessage::Pong {
            header: MessageHeader {
                sender_id: NodeId::generate(),
                message_id,
                timestamp_ms: 0,
            },
        }
    }

    #[tokio::test]
    async fn response_resolves_exactly_once() {
        let table = PendingTable::new();
        let id = new_message_id();
        let rx = table.register(id.clone(), 0);

        assert_eq!(table.resolve(pong(id.clone()), 50), Some(50));
        assert!(table.is_empty());

        match rx.await.unwrap() {
            PendingOutcome::Response(received) => assert_eq!(received.message_id(), id),
            PendingOutcome::ShuttingDown => panic!("expected a response, not a shutdown sentinel"),
        }
    }

    #[test]
    fn unknown_message_id_resolves_to_none() {
        let table = PendingTable::new();
        assert_eq!(table.resolve(pong(new_message_id()), 0), None);
    }

    #[tokio::test]
    async fn clear_sends_shutdown_sentinel_to_all_resolvers() {
        let table = PendingTable::new();
        let rx = table.register(new_message_id(), 0);
        assert_eq!(table.len(), 1);
        table.clear();
        assert!(table.is_empty());
        match rx.await.unwrap() {
            PendingOutcome::ShuttingDown => {}
            PendingOutcome::Response(_) => panic!("expected a shutdown sentinel"),
        }
    }
}
