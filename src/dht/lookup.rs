//! Iterative `findNode`/`findValue` results.

use crate::types::contact::Contact;
use crate::types::node_id::NodeId;
use crate::types::value::Value;

/// Result of an iterative `findNode`.
#[derive(Debug, Clone)]
pub struct NodeLookupResult {
    /// The k closest contacts found, sorted ascending by distance to the
    /// target.
    pub closest: Vec<Contact>,
    pub queries_issued: usize,
    pub duration_ms: u64,
    /// True iff one of `closest` equals the target id.
    pub found: bool,
}

/// Result of an iterative `findValue`.
#[derive(Debug, Clone)]
pub struct ValueLookupResult {
    pub found: bool,
    pub value: Option<Value>,
    pub queried_nodes: Vec<NodeId>,
    pub closest: Vec<Contact>,
    pub duration_ms: u64,
}
