//! Bootstrap coordinator: joins a fresh routing table to an existing network.

use super::routing_table::RoutingTable;
use crate::clock::now_ms;
use crate::error::{DhtError, Result};
use crate::types::contact::{Contact, Endpoint};
use crate::types::node_id::NodeId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A seed peer supplied by the host to join the network.
#[derive(Debug, Clone)]
pub struct SeedDescriptor {
    pub node_id: NodeId,
    pub peer_id: String,
    pub endpoints: Vec<Endpoint>,
    pub trusted: bool,
}

impl SeedDescriptor {
    pub fn new(node_id: NodeId, peer_id: impl Into<String>, trusted: bool) -> Self {
        Self {
            node_id,
            peer_id: peer_id.into(),
            endpoints: Vec::new(),
            trusted,
        }
    }
}

/// Phase transitions reported to a host-supplied progress observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapPhase {
    Connecting,
    Discovering,
    Populating,
    Complete,
    Failed,
}

/// Callback invoked on every phase transition with a 0..100 progress
/// estimate and a human-readable message.
pub type ProgressCallback = Arc<dyn Fn(BootstrapPhase, u8, &str) + Send + Sync>;

/// Outcome of a bootstrap attempt.
#[derive(Debug, Clone)]
pub struct BootstrapReport {
    pub responded_seeds: usize,
    pub failed_seeds: usize,
    pub discovered_nodes: usize,
    pub duration_ms: u64,
}

/// Bucket indices sampled for the coverage-lookup phase: every tenth index
/// plus the farthest bucket.
fn coverage_bucket_indices() -> Vec<usize> {
    let mut indices: Vec<usize> = (0..crate::types::node_id::NUM_BUCKETS).step_by(10).collect();
    let last = crate::types::node_id::NUM_BUCKETS - 1;
    if !indices.contains(&last) {
        indices.push(last);
    }
    indices
}

/// Joins `table` to the network described by `seeds`. At most one bootstrap
/// runs at a time per routing table; a concurrent second call fails fast.
pub struct BootstrapCoordinator {
    table: Arc<RoutingTable>,
    running: AtomicBool,
    cancelled: AtomicBool,
}

impl BootstrapCoordinator {
    pub fn new(table: Arc<RoutingTable>) -> Self {
        Self {
            table,
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Runs the full connect → self-lookup → coverage-lookup protocol.
    /// `progress` is optional; when present it is notified of every phase
    /// transition.
    pub async fn run(&self, mut seeds: Vec<SeedDescriptor>, progress: Option<ProgressCallback>) -> Result<BootstrapReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(DhtError::BootstrapInProgress);
        }
        self.cancelled.store(false, Ordering::SeqCst);
        let result = self.run_inner(&mut seeds, progress.as_ref()).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Requests that an in-flight bootstrap stop at its next phase boundary.
    /// A no-op if no bootstrap is currently running.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(DhtError::BootstrapCancelled)
        } else {
            Ok(())
        }
    }

    async fn run_inner(&self, seeds: &mut Vec<SeedDescriptor>, progress: Option<&ProgressCallback>) -> Result<BootstrapReport> {
        let start = now_ms();
        let config = self.table.config().clone();

        notify(progress, BootstrapPhase::Connecting, 0, "probing seeds");
        seeds.sort_by_key(|s| !s.trusted);

        let mut responded = 0usize;
        let mut failed = 0usize;
        for batch in seeds.chunks(config.parallel_bootstraps.max(1)) {
            if let Err(e) = self.check_cancelled() {
                notify(progress, BootstrapPhase::Failed, 0, "cancelled during connect phase");
                return Err(e);
            }
            let mut handles = Vec::with_capacity(batch.len());
            for seed in batch {
                let table = Arc::clone(&self.table);
                let timeout_ms = config.bootstrap_timeout_ms;
                let contact = Contact::new(seed.node_id, seed.peer_id.clone(), now_ms())
                    .with_endpoints(seed.endpoints.clone());
                handles.push(tokio::spawn(async move {
                    let alive = table.ping_with_timeout(&contact, timeout_ms).await;
                    (contact, alive)
                }));
            }
            for handle in handles {
                match handle.await {
                    Ok((contact, true)) => {
                        responded += 1;
                        debug!(peer = %contact.peer_id, "seed responded");
                    }
                    Ok((contact, false)) => {
                        failed += 1;
                        debug!(peer = %contact.peer_id, "seed unreachable");
                    }
                    Err(e) => {
                        failed += 1;
                        warn!(error = %e, "seed ping task panicked");
                    }
                }
            }
            if responded >= config.min_bootstrap_nodes {
                break;
            }
        }

        if responded < config.min_bootstrap_nodes {
            notify(progress, BootstrapPhase::Failed, 0, "insufficient responsive seeds");
            return Err(DhtError::BootstrapInsufficientSeeds {
                responded,
                required: config.min_bootstrap_nodes,
            });
        }

        if let Err(e) = self.check_cancelled() {
            notify(progress, BootstrapPhase::Failed, 40, "cancelled before self-lookup");
            return Err(e);
        }

        notify(progress, BootstrapPhase::Discovering, 40, "running self-lookup");
        let self_lookup = Arc::clone(&self.table).find_node(*self.table.local_id()).await?;
        let mut discovered = self_lookup.closest.len();

        notify(progress, BootstrapPhase::Populating, 70, "running coverage lookups");
        let local_id = *self.table.local_id();
        let per_bucket_counts = self.table.get_bucket_distribution().per_bucket_counts;
        for bucket_idx in coverage_bucket_indices() {
            if let Err(e) = self.check_cancelled() {
                notify(progress, BootstrapPhase::Failed, 70, "cancelled during coverage lookups");
                return Err(e);
            }
            if per_bucket_counts.get(bucket_idx).copied().unwrap_or(0) > 0 {
                continue;
            }
            let target = NodeId::generate_id_in_bucket(&local_id, bucket_idx);
            match Arc::clone(&self.table).find_node(target).await {
                Ok(result) => discovered += result.closest.len(),
                Err(e) => debug!(bucket = bucket_idx, error = %e, "coverage lookup failed, swallowed"),
            }
        }

        notify(progress, BootstrapPhase::Complete, 100, "bootstrap complete");
        info!(responded, failed, discovered, "bootstrap finished");
        Ok(BootstrapReport {
            responded_seeds: responded,
            failed_seeds: failed,
            discovered_nodes: discovered,
            duration_ms: (now_ms() - start).max(0) as u64,
        })
    }
}

fn notify(progress: Option<&ProgressCallback>, phase: BootstrapPhase, percent: u8, message: &str) {
    if let Some(cb) = progress {
        cb(phase, percent, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DhtConfig;
    use crate::dht::transport::LoopbackTransport;
    use std::sync::Mutex as StdMutex;

    fn table_pair() -> (Arc<RoutingTable>, Arc<RoutingTable>, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new());
        let local = NodeId::generate();
        let remote = NodeId::generate();
        let local_table = Arc::new(RoutingTable::new(local, DhtConfig::default(), transport.clone()));
        let remote_table = Arc::new(RoutingTable::new(remote, DhtConfig::default(), transport.clone()));
        (local_table, remote_table, transport)
    }

    #[tokio::test]
    async fn insufficient_seeds_fails_without_running_later_phases() {
        let (local, _remote, _transport) = table_pair();
        let coordinator = BootstrapCoordinator::new(local);
        let seeds = vec![SeedDescriptor::new(NodeId::generate(), "ghost", false)];
        let err = coordinator.run(seeds, None).await.unwrap_err();
        assert!(matches!(err, DhtError::BootstrapInsufficientSeeds { responded: 0, .. }));
    }

    #[tokio::test]
    async fn second_concurrent_bootstrap_fails_fast() {
        let (local, _remote, _transport) = table_pair();
        let coordinator = Arc::new(BootstrapCoordinator::new(local));
        coordinator.running.store(true, Ordering::SeqCst);
        let err = coordinator.run(Vec::new(), None).await.unwrap_err();
        assert!(matches!(err, DhtError::BootstrapInProgress));
    }

    #[tokio::test]
    async fn cancelled_flag_stops_connect_phase_before_any_ping() {
        let (local, remote, _transport) = table_pair();
        let coordinator = BootstrapCoordinator::new(local);
        coordinator.cancelled.store(true, Ordering::SeqCst);

        let mut seeds = vec![SeedDescriptor::new(*remote.local_id(), "remote", true)];
        let err = coordinator.run_inner(&mut seeds, None).await.unwrap_err();
        assert!(matches!(err, DhtError::BootstrapCancelled));
    }

    #[tokio::test]
    async fn cancel_is_a_no_op_when_nothing_is_running() {
        let (local, _remote, _transport) = table_pair();
        let coordinator = BootstrapCoordinator::new(local);
        coordinator.cancel();
        assert!(!coordinator.is_running());
    }

    #[tokio::test]
    async fn run_resets_cancellation_state_at_the_start_of_a_fresh_run() {
        let (local, _remote, _transport) = table_pair();
        let coordinator = BootstrapCoordinator::new(local);
        coordinator.cancelled.store(true, Ordering::SeqCst);

        let seeds = vec![SeedDescriptor::new(NodeId::generate(), "ghost", false)];
        let err = coordinator.run(seeds, None).await.unwrap_err();
        assert!(matches!(err, DhtError::BootstrapInsufficientSeeds { .. }));
    }

    #[tokio::test]
    async fn failed_connect_phase_reports_connecting_then_failed() {
        let (local, _remote, _transport) = table_pair();
        let phases: Arc<StdMutex<Vec<BootstrapPhase>>> = Arc::new(StdMutex::new(Vec::new()));
        let phases_clone = Arc::clone(&phases);
        let progress: ProgressCallback = Arc::new(move |phase, _pct, _msg| {
            phases_clone.lock().unwrap().push(phase);
        });

        let coordinator = BootstrapCoordinator::new(local);
        let seed = SeedDescriptor::new(NodeId::generate(), "ghost", true);
        let _ = coordinator.run(vec![seed], Some(progress)).await;

        let recorded = phases.lock().unwrap().clone();
        assert_eq!(recorded, vec![BootstrapPhase::Connecting, BootstrapPhase::Failed]);
    }
}
