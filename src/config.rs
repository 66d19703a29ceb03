//! Tunable configuration surface for the routing table and bootstrap.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Bucket capacity; replication factor for `store`; default `n` for
    /// closest-contacts queries.
    pub k: usize,
    /// Parallelism of iterative lookups.
    pub alpha: usize,
    /// RPC deadline, in milliseconds.
    pub ping_timeout_ms: u64,
    /// Bucket refresh cadence, in milliseconds.
    pub refresh_interval_ms: u64,
    /// Value republish cadence, in milliseconds.
    pub republish_interval_ms: u64,
    /// Caller-visible overload threshold.
    pub max_concurrent_lookups: usize,
    /// Per-seed ping deadline during bootstrap, in milliseconds.
    pub bootstrap_timeout_ms: u64,
    /// Minimum responsive seeds required to proceed past the connect phase.
    pub min_bootstrap_nodes: usize,
    /// Batch size for seed probing during bootstrap.
    pub parallel_bootstraps: usize,
    /// Opportunistic caching of values at the nearest miss-node during
    /// `findValue`. Off by default.
    pub cache_on_lookup_miss: bool,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            ping_timeout_ms: 5_000,
            refresh_interval_ms: 3_600_000,
            republish_interval_ms: 3_600_000,
            max_concurrent_lookups: 10,
            bootstrap_timeout_ms: 30_000,
            min_bootstrap_nodes: 1,
            parallel_bootstraps: 3,
            cache_on_lookup_miss: false,
        }
    }
}

impl DhtConfig {
    pub fn replacement_cache_capacity(&self) -> usize {
        self.k.div_ceil(2)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("failed to parse DhtConfig from JSON")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize DhtConfig to JSON")
    }

    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {path:?}"))?;
        Self::from_json(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_configuration_surface() {
        let cfg = DhtConfig::default();
        assert_eq!(cfg.k, 20);
        assert_eq!(cfg.alpha, 3);
        assert_eq!(cfg.max_concurrent_lookups, 10);
        assert_eq!(cfg.replacement_cache_capacity(), 10);
    }

    #[test]
    fn json_round_trip() {
        let cfg = DhtConfig {
            alpha: 5,
            ..Default::default()
        };
        let json = cfg.to_json().unwrap();
        let decoded = DhtConfig::from_json(&json).unwrap();
        assert_eq!(decoded.alpha, 5);
    }
}
