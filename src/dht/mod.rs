//! The Kademlia engine: bucket layer, routing table, iterative lookups,
//! pending-RPC tracking, and bootstrap orchestration.

pub mod bootstrap;
pub mod bucket;
pub mod lookup;
pub mod pending;
pub mod routing_table;
pub mod transport;

use self::bootstrap::{BootstrapCoordinator, BootstrapReport, ProgressCallback, SeedDescriptor};
use self::routing_table::RoutingTable;
use self::transport::RpcSender;
use crate::config::DhtConfig;
use crate::error::Result;
use crate::types::message::DhtMessage;
use crate::types::node_id::NodeId;
use crate::types::stats::{LastBootstrap, NetworkHealth};
use std::sync::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Top-level handle a host constructs once per local node: owns the routing
/// table, the bootstrap coordinator, and the periodic maintenance tasks.
pub struct Dht {
    table: Arc<RoutingTable>,
    bootstrap: BootstrapCoordinator,
    last_bootstrap: Mutex<Option<LastBootstrap>>,
}

impl Dht {
    pub fn new(local_id: NodeId, config: DhtConfig, sender: Arc<dyn RpcSender>) -> Arc<Self> {
        let table = Arc::new(RoutingTable::new(local_id, config, sender));
        Arc::new(Self {
            bootstrap: BootstrapCoordinator::new(Arc::clone(&table)),
            table,
            last_bootstrap: Mutex::new(None),
        })
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    /// Runs bootstrap against `seeds`, recording the outcome for
    /// [`Dht::health`] regardless of success or failure.
    pub async fn bootstrap(&self, seeds: Vec<SeedDescriptor>, progress: Option<ProgressCallback>) -> Result<BootstrapReport> {
        let result = self.bootstrap.run(seeds, progress).await;
        let record = match &result {
            Ok(report) => LastBootstrap {
                succeeded: true,
                responded_seeds: report.responded_seeds,
                failed_seeds: report.failed_seeds,
                discovered_nodes: report.discovered_nodes,
                duration_ms: report.duration_ms,
            },
            Err(_) => LastBootstrap {
                succeeded: false,
                responded_seeds: 0,
                failed_seeds: 0,
                discovered_nodes: 0,
                duration_ms: 0,
            },
        };
        *self.last_bootstrap.lock().expect("last-bootstrap mutex poisoned") = Some(record);
        result
    }

    /// Requests that an in-flight [`Dht::bootstrap`] stop at its next phase
    /// boundary. A no-op if no bootstrap is running.
    pub fn cancel_bootstrap(&self) {
        self.bootstrap.cancel();
    }

    /// Spawns the periodic bucket-refresh and value-republish loops. The
    /// returned handles are detached; call [`RoutingTable::stop`] via
    /// [`Dht::routing_table`] to let the next maintenance tick observe
    /// shutdown and return.
    pub fn spawn_maintenance(&self) {
        let refresh_table = Arc::clone(&self.table);
        let refresh_interval = refresh_table.config().refresh_interval_ms;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_millis(refresh_interval));
            loop {
                tick.tick().await;
                Arc::clone(&refresh_table).refresh_buckets().await;
            }
        });

        let republish_table = Arc::clone(&self.table);
        let republish_interval = republish_table.config().republish_interval_ms;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_millis(republish_interval));
            loop {
                tick.tick().await;
                Arc::clone(&republish_table).republish_values().await;
            }
        });
    }

    /// Drives the synchronous request/response handlers against an incoming
    /// message stream (as produced by a transport's receive side, e.g.
    /// [`transport::LoopbackTransport::register`]). Runs until the channel
    /// closes; intended to be spawned as its own task per peer or per
    /// listener.
    pub async fn run_dispatch_loop(self: Arc<Self>, mut incoming: mpsc::UnboundedReceiver<DhtMessage>, sender_peer_id: String) {
        while let Some(msg) = incoming.recv().await {
            if msg.is_response() {
                self.table.handle_response(msg);
                continue;
            }
            let response = match &msg {
                DhtMessage::FindNode { .. } => Arc::clone(&self.table).handle_find_node(&msg, &sender_peer_id),
                DhtMessage::FindValue { .. } => Arc::clone(&self.table).handle_find_value(&msg, &sender_peer_id),
                DhtMessage::Store { .. } => Arc::clone(&self.table).handle_store(&msg, &sender_peer_id),
                DhtMessage::Ping { .. } => Arc::clone(&self.table).handle_ping(&msg, &sender_peer_id),
                other => {
                    warn!(kind = other.kind_name(), "unexpected request-side message in dispatch loop");
                    continue;
                }
            };
            if let Some(contact) = self.table.get_contact(msg.sender_id()) {
                if let Err(e) = self.reply(&contact, response).await {
                    warn!(peer = %sender_peer_id, error = %e, "failed to deliver RPC response");
                }
            }
        }
    }

    async fn reply(&self, contact: &crate::types::contact::Contact, response: DhtMessage) -> anyhow::Result<()> {
        self.table.sender().send(contact, response).await
    }

    /// Read-only occupancy/bootstrap/pending-RPC summary for a host UI or
    /// ops dashboard.
    pub fn health(&self) -> NetworkHealth {
        NetworkHealth {
            routing: self.table.get_stats(),
            distribution: self.table.get_bucket_distribution(),
            last_bootstrap: self.last_bootstrap.lock().expect("last-bootstrap mutex poisoned").clone(),
        }
    }
}
