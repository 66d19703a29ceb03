//! Remote peer descriptors and the transport-agnostic endpoint set.

use super::node_id::NodeId;
use serde::{Deserialize, Serialize};

/// Transport kind tagging an [`Endpoint`]. Closed set: the DHT never
/// interprets the address string, only the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Webrtc,
    Bluetooth,
    Local,
    Manual,
}

/// An opaque routing hint owned by the transport. The DHT stores and
/// forwards these but never inspects the address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub kind: EndpointKind,
    pub address: Option<String>,
}

impl Endpoint {
    pub fn new(kind: EndpointKind, address: Option<String>) -> Self {
        Self { kind, address }
    }
}

/// A known remote node.
///
/// **Invariant:** a `Contact` whose `node_id` equals the local node id must
/// never be admitted into a routing table; enforced by
/// [`crate::dht::bucket::BucketManager::add_contact`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub node_id: NodeId,
    pub peer_id: String,
    pub last_seen: i64,
    pub failure_count: u32,
    pub rtt_ms: Option<u64>,
    pub endpoints: Vec<Endpoint>,
}

impl Contact {
    pub fn new(node_id: NodeId, peer_id: impl Into<String>, now_ms: i64) -> Self {
        Self {
            node_id,
            peer_id: peer_id.into(),
            last_seen: now_ms,
            failure_count: 0,
            rtt_ms: None,
            endpoints: Vec::new(),
        }
    }

    pub fn with_endpoints(mut self, endpoints: Vec<Endpoint>) -> Self {
        self.endpoints = endpoints;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_endpoints() {
        let c = Contact::new(NodeId::generate(), "peer-1", 0)
            .with_endpoints(vec![Endpoint::new(EndpointKind::Local, None)]);
        assert_eq!(c.endpoints.len(), 1);
        assert_eq!(c.failure_count, 0);
    }
}
