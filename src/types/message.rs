//! The RPC envelope exchanged between DHT nodes.
//!
//! Nine message variants sharing a common header, represented as a sealed
//! sum type so dispatch on the receiving end is exhaustive rather than
//! relying on open inheritance.

use super::contact::Contact;
use super::node_id::NodeId;
use super::value::Value;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a fresh message id. Backed by `uuid` v4, which makes collisions
/// within the pending-RPC table practically impossible.
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    pub sender_id: NodeId,
    pub message_id: String,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DhtMessage {
    FindNode {
        header: MessageHeader,
        target_id: NodeId,
    },
    FindNodeResponse {
        header: MessageHeader,
        contacts: Vec<Contact>,
    },
    FindValue {
        header: MessageHeader,
        key: NodeId,
    },
    /// A value hit for the requested key.
    FindValueResponse {
        header: MessageHeader,
        value: Value,
    },
    /// A miss: closer contacts for the requester to continue with.
    FindValueNodes {
        header: MessageHeader,
        contacts: Vec<Contact>,
    },
    Store {
        header: MessageHeader,
        key: NodeId,
        value: Value,
    },
    StoreResponse {
        header: MessageHeader,
        success: bool,
    },
    Ping {
        header: MessageHeader,
    },
    Pong {
        header: MessageHeader,
    },
}

impl DhtMessage {
    pub fn header(&self) -> &MessageHeader {
        match self {
            DhtMessage::FindNode { header, .. }
            | DhtMessage::FindNodeResponse { header, .. }
            | DhtMessage::FindValue { header, .. }
            | DhtMessage::FindValueResponse { header, .. }
            | DhtMessage::FindValueNodes { header, .. }
            | DhtMessage::Store { header, .. }
            | DhtMessage::StoreResponse { header, .. }
            | DhtMessage::Ping { header }
            | DhtMessage::Pong { header } => header,
        }
    }

    pub fn sender_id(&self) -> &NodeId {
        &self.header().sender_id
    }

    pub fn message_id(&self) -> &str {
        &self.header().message_id
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            DhtMessage::FindNodeResponse { .. }
                | DhtMessage::FindValueResponse { .. }
                | DhtMessage::FindValueNodes { .. }
                | DhtMessage::StoreResponse { .. }
                | DhtMessage::Pong { .. }
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            DhtMessage::FindNode { .. } => "FIND_NODE",
            DhtMessage::FindNodeResponse { .. } => "FIND_NODE_RESPONSE",
            DhtMessage::FindValue { .. } => "FIND_VALUE",
            DhtMessage::FindValueResponse { .. } => "FIND_VALUE_RESPONSE",
            DhtMessage::FindValueNodes { .. } => "FIND_VALUE_NODES",
            DhtMessage::Store { .. } => "STORE",
            DhtMessage::StoreResponse { .. } => "STORE_RESPONSE",
            DhtMessage::Ping { .. } => "PING",
            DhtMessage::Pong { .. } => "PONG",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> MessageHeader {
        MessageHeader {
            sender_id: NodeId::generate(),
            message_id: new_message_id(),
            timestamp_ms: 0,
        }
    }

    #[test]
    fn response_classification_is_exhaustive() {
        assert!(!DhtMessage::Ping { header: header() }.is_response());
        assert!(DhtMessage::Pong { header: header() }.is_response());
        assert!(DhtMessage::FindValueNodes {
            header: header(),
            contacts: vec![],
        }
        .is_response());
    }

    #[test]
    fn message_ids_are_unique() {
        let a = new_message_id();
        let b = new_message_id();
        assert_ne!(a, b);
    }

    #[test]
    fn serde_round_trip_via_bincode() {
        let msg = DhtMessage::FindNode {
            header: header(),
            target_id: NodeId::generate(),
        };
        let bytes = bincode::serialize(&msg).unwrap();
        let decoded: DhtMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.kind_name(), "FIND_NODE");
    }
}
