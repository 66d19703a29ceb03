//! Error taxonomy for the DHT core.
//!
//! Variants distinguish *kinds* the host is expected to branch on, not
//! free-form messages. Internal plumbing that has no taxonomy-relevant
//! meaning (serialization, lock acquisition) is carried as `anyhow::Error`
//! and converted to [`DhtError::ProgrammerError`] at the public boundary.

use crate::types::node_id::NodeId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    /// Misuse of the API: length mismatches, invalid bucket indices, and
    /// similar caller bugs. Not recoverable.
    #[error("programmer error: {0}")]
    ProgrammerError(String),

    /// An RPC send failed or the response was malformed. Recovered locally
    /// by the caller; never propagated out of an iterative lookup.
    #[error("transport error talking to {peer}: {message}")]
    TransportError { peer: NodeId, message: String },

    /// An RPC exceeded its deadline.
    #[error("rpc to {peer} timed out after {elapsed_ms}ms")]
    Timeout { peer: NodeId, elapsed_ms: u64 },

    /// `findNode`/`findValue` was called while `maxConcurrentLookups` were
    /// already active.
    #[error("routing table overloaded: {active}/{limit} concurrent lookups active")]
    Overloaded { active: usize, limit: usize },

    /// A second bootstrap was attempted while one was already running.
    #[error("bootstrap already in progress")]
    BootstrapInProgress,

    /// The connect phase did not reach the configured minimum of
    /// responsive seeds.
    #[error("bootstrap saw only {responded}/{required} required responsive seeds")]
    BootstrapInsufficientSeeds { responded: usize, required: usize },

    /// A host-initiated `cancel()` interrupted an in-flight bootstrap.
    #[error("bootstrap cancelled")]
    BootstrapCancelled,

    /// The routing table has been stopped; no further RPCs are served.
    #[error("routing table is shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, DhtError>;
