//! A 160-bit XOR-metric Kademlia DHT core: routing table, concurrent
//! iterative lookups, k-bucket management, and bootstrap orchestration.
//!
//! The crate owns no network I/O. Hosts supply a local [`types::NodeId`]
//! and an implementation of [`dht::transport::RpcSender`]; everything else
//! — bucket maintenance, pending-RPC tracking, iterative `findNode`/
//! `findValue`, bootstrap — is driven from here.

pub mod clock;
pub mod config;
pub mod dht;
pub mod error;
pub mod types;

pub use config::DhtConfig;
pub use dht::bootstrap::{BootstrapCoordinator, BootstrapPhase, BootstrapReport, ProgressCallback, SeedDescriptor};
pub use dht::lookup::{NodeLookupResult, ValueLookupResult};
pub use dht::routing_table::RoutingTable;
pub use dht::transport::{LoopbackTransport, RpcSender};
pub use dht::Dht;
pub use error::{DhtError, Result};
pub use types::{
    BucketDistribution, Contact, DhtMessage, Endpoint, EndpointKind, LastBootstrap, MessageHeader,
    NetworkHealth, NodeId, RoutingStats, Value,
};
