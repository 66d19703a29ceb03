//! Wire and domain types shared across the DHT: identifiers, contacts,
//! stored values, the RPC envelope, and diagnostics snapshots.

pub mod contact;
pub mod message;
pub mod node_id;
pub mod stats;
pub mod value;

pub use contact::{Contact, Endpoint, EndpointKind};
pub use message::{new_message_id, DhtMessage, MessageHeader};
pub use node_id::NodeId;
pub use stats::{BucketDistribution, LastBootstrap, NetworkHealth, RoutingStats};
pub use value::Value;
