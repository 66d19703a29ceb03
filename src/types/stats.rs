//! Read-only diagnostics: routing-table occupancy and network-health summaries.

use serde::{Deserialize, Serialize};

/// Snapshot of routing-table occupancy, returned by `RoutingTable::get_stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingStats {
    pub total_nodes: usize,
    pub non_empty_buckets: usize,
    pub total_buckets: usize,
    pub full_buckets: usize,
    pub k_value: usize,
    pub pending_rpcs: usize,
    pub average_bucket_fill: f64,
}

/// Per-bucket contact counts plus a rough network-size estimate, returned by
/// `RoutingTable::get_bucket_distribution`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketDistribution {
    pub per_bucket_counts: Vec<usize>,
    pub estimated_network_size: u128,
}

/// Outcome of the most recently completed bootstrap attempt, embedded in
/// [`NetworkHealth`]. `None` before any bootstrap has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastBootstrap {
    pub succeeded: bool,
    pub responded_seeds: usize,
    pub failed_seeds: usize,
    pub discovered_nodes: usize,
    pub duration_ms: u64,
}

/// Read-only summary a host can poll without reaching into routing-table
/// internals: occupancy, the last bootstrap outcome, and pending-RPC load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkHealth {
    pub routing: RoutingStats,
    pub distribution: BucketDistribution,
    pub last_bootstrap: Option<LastBootstrap>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_health_serializes_with_absent_bootstrap() {
        let health = NetworkHealth {
            routing: RoutingStats {
                total_nodes: 0,
                non_empty_buckets: 0,
                total_buckets: 160,
                full_buckets: 0,
                k_value: 20,
                pending_rpcs: 0,
                average_bucket_fill: 0.0,
            },
            distribution: BucketDistribution {
                per_bucket_counts: vec![0; 160],
                estimated_network_size: 0,
            },
            last_bootstrap: None,
        };
        let json = serde_json::to_string(&health).unwrap();
        let back: NetworkHealth = serde_json::from_str(&json).unwrap();
        assert_eq!(back, health);
    }
}
