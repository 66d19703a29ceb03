//! The Kademlia engine: owns the bucket manager, the local value store, and
//! the pending-RPC table; serves incoming RPCs; drives iterative lookups.

use super::bucket::{AddOutcome, BucketManager};
use super::lookup::{NodeLookupResult, ValueLookupResult};
use super::pending::{PendingOutcome, PendingTable};
use super::transport::RpcSender;
use crate::clock::now_ms;
use crate::config::DhtConfig;
use crate::error::{DhtError, Result};
use crate::types::contact::Contact;
use crate::types::message::{new_message_id, DhtMessage, MessageHeader};
use crate::types::node_id::NodeId;
use crate::types::stats::{BucketDistribution, RoutingStats};
use crate::types::value::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Bucket indices beyond this are folded together by the network-size
/// estimator to avoid the `2^index` overflow the source estimator suffers
/// from; see [`RoutingTable::get_bucket_distribution`].
const ESTIMATOR_CAP_INDEX: u32 = 48;

/// Decrements the active-lookup counter on every exit path, including
/// early returns and panics.
struct LookupGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for LookupGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct RoutingTable {
    local_id: NodeId,
    config: DhtConfig,
    buckets: Mutex<BucketManager>,
    value_store: Mutex<HashMap<String, Value>>,
    pending: PendingTable,
    active_lookups: AtomicUsize,
    sender: Arc<dyn RpcSender>,
    shutdown: AtomicBool,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, config: DhtConfig, sender: Arc<dyn RpcSender>) -> Self {
        let cache_capacity = config.replacement_cache_capacity();
        let k = config.k;
        Self {
            local_id,
            config,
            buckets: Mutex::new(BucketManager::new(local_id, k, cache_capacity)),
            value_store: Mutex::new(HashMap::new()),
            pending: PendingTable::new(),
            active_lookups: AtomicUsize::new(0),
            sender,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn sender(&self) -> &Arc<dyn RpcSender> {
        &self.sender
    }

    fn buckets(&self) -> std::sync::MutexGuard<'_, BucketManager> {
        self.buckets.lock().expect("bucket manager mutex poisoned")
    }

    fn values(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.value_store.lock().expect("value store mutex poisoned")
    }

    // ---- table mutation / inspection -------------------------------------

    pub fn add_contact(&self, c: Contact) -> AddOutcome {
        self.buckets().add_contact(c)
    }

    pub fn remove_contact(&self, id: &NodeId) -> Option<Contact> {
        self.buckets().remove_contact(id)
    }

    pub fn get_contact(&self, id: &NodeId) -> Option<Contact> {
        self.buckets().get_contact(id).cloned()
    }

    pub fn get_all_contacts(&self) -> Vec<Contact> {
        self.buckets().all_contacts()
    }

    pub fn get_closest_contacts(&self, target: &NodeId, n: Option<usize>) -> Vec<Contact> {
        self.buckets().closest_contacts(target, n.unwrap_or(self.config.k))
    }

    pub fn store_local(&self, key: NodeId, value: Value) {
        self.values().insert(key.to_hex(), value);
    }

    pub fn get_local(&self, key: &NodeId) -> Option<Value> {
        self.values().get(&key.to_hex()).cloned()
    }

    pub fn clear(&self) {
        self.buckets().clear();
        self.values().clear();
    }

    pub fn get_stats(&self) -> RoutingStats {
        let buckets = self.buckets();
        let total_buckets = crate::types::node_id::NUM_BUCKETS;
        let non_empty = buckets.non_empty_bucket_count();
        let full = buckets.full_bucket_count();
        let total_nodes = buckets.total_contacts();
        RoutingStats {
            total_nodes,
            non_empty_buckets: non_empty,
            total_buckets,
            full_buckets: full,
            k_value: self.config.k,
            pending_rpcs: self.pending.len(),
            average_bucket_fill: if non_empty == 0 {
                0.0
            } else {
                total_nodes as f64 / non_empty as f64
            },
        }
    }

    /// Per-bucket contact counts plus a network-size estimate. Bucket
    /// weight is capped at [`ESTIMATOR_CAP_INDEX`] so `2^index` cannot
    /// overflow for high bucket indices (see SPEC_FULL.md §9).
    pub fn get_bucket_distribution(&self) -> BucketDistribution {
        let buckets = self.buckets();
        let mut per_bucket_counts = Vec::with_capacity(crate::types::node_id::NUM_BUCKETS);
        let mut estimated_network_size: u128 = 0;
        for (idx, bucket) in buckets.buckets().enumerate() {
            let count = bucket.len();
            per_bucket_counts.push(count);
            let weight = (idx as u32).min(ESTIMATOR_CAP_INDEX);
            estimated_network_size += (count as u128) << weight;
        }
        BucketDistribution {
            per_bucket_counts,
            estimated_network_size,
        }
    }

    // ---- synchronous RPC handlers -----------------------------------------

    /// Records a contact observed on an incoming RPC. If its bucket is full,
    /// the displaced tail contact is ping-checked in the background per the
    /// bucket's eviction policy: evicted and replaced by the waiting contact
    /// on failure, left in place on success.
    fn observe_sender(self: Arc<Self>, sender_id: NodeId, peer_id: &str) {
        if sender_id == self.local_id {
            return;
        }
        let contact = Contact::new(sender_id, peer_id.to_string(), now_ms());
        if let AddOutcome::NeedsPing(stale) = self.buckets().add_contact(contact) {
            let table = Arc::clone(&self);
            tokio::spawn(async move {
                if !table.ping(&stale).await {
                    table.buckets().remove_contact(&stale.node_id);
                    debug!(peer = %stale.peer_id, "evicted unresponsive bucket tail");
                }
            });
        }
    }

    fn header(&self) -> MessageHeader {
        MessageHeader {
            sender_id: self.local_id,
            message_id: new_message_id(),
            timestamp_ms: now_ms(),
        }
    }

    /// Deterministic response to an incoming FIND_NODE. Never suspends.
    pub fn handle_find_node(self: Arc<Self>, msg: &DhtMessage, sender_peer_id: &str) -> DhtMessage {
        let DhtMessage::FindNode { header, target_id } = msg else {
            panic!("handle_find_node called with non-FIND_NODE message");
        };
        Arc::clone(&self).observe_sender(header.sender_id, sender_peer_id);
        let contacts = self.get_closest_contacts(target_id, None);
        DhtMessage::FindNodeResponse {
            header: self.header(),
            contacts,
        }
    }

    /// Deterministic response to an incoming FIND_VALUE: a value hit or the
    /// closest known nodes.
    pub fn handle_find_value(self: Arc<Self>, msg: &DhtMessage, sender_peer_id: &str) -> DhtMessage {
        let DhtMessage::FindValue { header, key } = msg else {
            panic!("handle_find_value called with non-FIND_VALUE message");
        };
        Arc::clone(&self).observe_sender(header.sender_id, sender_peer_id);
        match self.get_local(key) {
            Some(value) => DhtMessage::FindValueResponse {
                header: self.header(),
                value,
            },
            None => DhtMessage::FindValueNodes {
                header: self.header(),
                contacts: self.get_closest_contacts(key, None),
            },
        }
    }

    /// Deterministic response to an incoming STORE.
    pub fn handle_store(self: Arc<Self>, msg: &DhtMessage, sender_peer_id: &str) -> DhtMessage {
        let DhtMessage::Store { header, key, value } = msg else {
            panic!("handle_store called with non-STORE message");
        };
        Arc::clone(&self).observe_sender(header.sender_id, sender_peer_id);
        self.store_local(*key, value.clone());
        DhtMessage::StoreResponse {
            header: self.header(),
            success: true,
        }
    }

    /// Deterministic response to an incoming PING.
    pub fn handle_ping(self: Arc<Self>, msg: &DhtMessage, sender_peer_id: &str) -> DhtMessage {
        let DhtMessage::Ping { header } = msg else {
            panic!("handle_ping called with non-PING message");
        };
        Arc::clone(&self).observe_sender(header.sender_id, sender_peer_id);
        DhtMessage::Pong { header: self.header() }
    }

    /// Resolves the pending RPC matching `msg`'s message id, updates RTT and
    /// the sender's LRU position.
    pub fn handle_response(&self, msg: DhtMessage) {
        let sender_id = *msg.sender_id();
        let now = now_ms();
        if let Some(rtt) = self.pending.resolve(msg, now) {
            let mut buckets = self.buckets();
            if let Some(existing) = buckets.get_contact(&sender_id).cloned() {
                let mut refreshed = existing;
                refreshed.rtt_ms = Some(rtt);
                refreshed.last_seen = now;
                buckets.add_contact(refreshed);
            }
        }
    }

    // ---- RPC dispatch with timeout -----------------------------------------

    async fn round_trip(&self, contact: &Contact, message: DhtMessage) -> Result<DhtMessage> {
        self.round_trip_with_timeout(contact, message, self.config.ping_timeout_ms).await
    }

    /// Same as [`RoutingTable::round_trip`] but with an explicit deadline,
    /// for callers (bootstrap's seed probing) that use a different timeout
    /// than the steady-state per-RPC one.
    async fn round_trip_with_timeout(&self, contact: &Contact, message: DhtMessage, timeout_ms: u64) -> Result<DhtMessage> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(DhtError::Shutdown);
        }
        let message_id = message.message_id().to_string();
        let sent_at = now_ms();
        let rx = self.pending.register(message_id.clone(), sent_at);

        if let Err(e) = self.sender.send(contact, message).await {
            self.pending.remove(&message_id);
            self.buckets().record_failure(&contact.node_id);
            return Err(DhtError::TransportError {
                peer: contact.node_id,
                message: e.to_string(),
            });
        }

        let timeout = std::time::Duration::from_millis(timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(PendingOutcome::Response(response))) => {
                self.buckets().reset_failures(&contact.node_id);
                Ok(response)
            }
            Ok(Ok(PendingOutcome::ShuttingDown)) => Err(DhtError::Shutdown),
            Ok(Err(_)) => {
                self.buckets().record_failure(&contact.node_id);
                Err(DhtError::TransportError {
                    peer: contact.node_id,
                    message: "pending resolver dropped".to_string(),
                })
            }
            Err(_) => {
                self.pending.remove(&message_id);
                self.buckets().record_failure(&contact.node_id);
                Err(DhtError::Timeout {
                    peer: contact.node_id,
                    elapsed_ms: timeout_ms,
                })
            }
        }
    }

    pub async fn ping(&self, contact: &Contact) -> bool {
        self.ping_with_timeout(contact, self.config.ping_timeout_ms).await
    }

    /// Pings `contact` with an explicit deadline instead of the configured
    /// `pingTimeoutMs` (used by bootstrap's seed probing, which has its own
    /// `bootstrapTimeoutMs`).
    pub async fn ping_with_timeout(&self, contact: &Contact, timeout_ms: u64) -> bool {
        let msg = DhtMessage::Ping { header: self.header() };
        match self.round_trip_with_timeout(contact, msg, timeout_ms).await {
            Ok(DhtMessage::Pong { .. }) => {
                let mut refreshed = contact.clone();
                refreshed.last_seen = now_ms();
                self.buckets().add_contact(refreshed);
                true
            }
            _ => false,
        }
    }

    fn enter_lookup(&self) -> Result<LookupGuard<'_>> {
        let prev = self.active_lookups.fetch_add(1, Ordering::SeqCst);
        if prev >= self.config.max_concurrent_lookups {
            self.active_lookups.fetch_sub(1, Ordering::SeqCst);
            return Err(DhtError::Overloaded {
                active: prev,
                limit: self.config.max_concurrent_lookups,
            });
        }
        Ok(LookupGuard {
            counter: &self.active_lookups,
        })
    }

    /// Spawns `round_trip` calls for `batch` concurrently and collects their
    /// results in order. Spawning (rather than a sequential loop) is what
    /// gives iterative lookups their alpha-parallel fan-out.
    async fn dispatch_batch(self: Arc<Self>, batch: &[Contact], build: impl Fn(&Self) -> DhtMessage) -> Vec<Result<DhtMessage>> {
        let mut handles = Vec::with_capacity(batch.len());
        for contact in batch {
            let table = Arc::clone(&self);
            let contact = contact.clone();
            let message = build(&self);
            handles.push(tokio::spawn(async move { table.round_trip(&contact, message).await }));
        }
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_err) => results.push(Err(DhtError::TransportError {
                    peer: NodeId::default(),
                    message: format!("lookup task panicked: {join_err}"),
                })),
            }
        }
        results
    }

    // ---- iterative lookups --------------------------------------------------

    pub async fn find_node(self: Arc<Self>, target: NodeId) -> Result<NodeLookupResult> {
        let _guard = self.enter_lookup()?;
        let start = now_ms();
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut queries_issued = 0usize;

        let mut working_set = self.get_closest_contacts(&target, None);
        NodeId::sort_by_distance(&mut working_set, &target, |c| c.node_id);

        loop {
            let batch: Vec<Contact> = working_set
                .iter()
                .filter(|c| !queried.contains(&c.node_id))
                .take(self.config.alpha)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }
            for c in &batch {
                queried.insert(c.node_id);
            }
            queries_issued += batch.len();

            let closest_before = working_set.first().map(|c| c.node_id);

            let results = Arc::clone(&self).dispatch_batch(&batch, |table| DhtMessage::FindNode {
                header: table.header(),
                target_id: target,
            }).await;

            let mut discovered = Vec::new();
            for result in results {
                if let Ok(DhtMessage::FindNodeResponse { contacts, .. }) = result {
                    discovered.extend(contacts);
                }
            }
            for contact in discovered {
                self.buckets().add_contact(contact.clone());
                if !working_set.iter().any(|c| c.node_id == contact.node_id) {
                    working_set.push(contact);
                }
            }

            NodeId::sort_by_distance(&mut working_set, &target, |c| c.node_id);
            working_set.truncate(self.config.k);

            if !closer_than(closest_before, working_set.first().map(|c| c.node_id), &target) {
                break;
            }
        }

        let found = working_set.iter().any(|c| c.node_id == target);
        Ok(NodeLookupResult {
            closest: working_set,
            queries_issued,
            duration_ms: (now_ms() - start).max(0) as u64,
            found,
        })
    }

    pub async fn find_value(self: Arc<Self>, key: NodeId) -> Result<ValueLookupResult> {
        if let Some(value) = self.get_local(&key) {
            return Ok(ValueLookupResult {
                found: true,
                value: Some(value),
                queried_nodes: Vec::new(),
                closest: Vec::new(),
                duration_ms: 0,
            });
        }

        let _guard = self.enter_lookup()?;
        let start = now_ms();
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut working_set = self.get_closest_contacts(&key, None);
        NodeId::sort_by_distance(&mut working_set, &key, |c| c.node_id);

        loop {
            let batch: Vec<Contact> = working_set
                .iter()
                .filter(|c| !queried.contains(&c.node_id))
                .take(self.config.alpha)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }
            for c in &batch {
                queried.insert(c.node_id);
            }

            let closest_before = working_set.first().map(|c| c.node_id);

            let results = Arc::clone(&self).dispatch_batch(&batch, |table| DhtMessage::FindValue {
                header: table.header(),
                key,
            }).await;

            let mut discovered = Vec::new();
            for result in results {
                match result {
                    Ok(DhtMessage::FindValueResponse { value, .. }) => {
                        if self.config.cache_on_lookup_miss {
                            if let Some(miss_node) = working_set.first() {
                                let _ = self
                                    .round_trip(
                                        miss_node,
                                        DhtMessage::Store {
                                            header: self.header(),
                                            key,
                                            value: value.clone(),
                                        },
                                    )
                                    .await;
                            }
                        }
                        return Ok(ValueLookupResult {
                            found: true,
                            value: Some(value),
                            queried_nodes: queried.into_iter().collect(),
                            closest: working_set,
                            duration_ms: (now_ms() - start).max(0) as u64,
                        });
                    }
                    Ok(DhtMessage::FindValueNodes { contacts, .. }) => discovered.extend(contacts),
                    _ => {}
                }
            }
            for contact in discovered {
                self.buckets().add_contact(contact.clone());
                if !working_set.iter().any(|c| c.node_id == contact.node_id) {
                    working_set.push(contact);
                }
            }

            NodeId::sort_by_distance(&mut working_set, &key, |c| c.node_id);
            working_set.truncate(self.config.k);

            if !closer_than(closest_before, working_set.first().map(|c| c.node_id), &key) {
                break;
            }
        }

        Ok(ValueLookupResult {
            found: false,
            value: None,
            queried_nodes: queried.into_iter().collect(),
            closest: working_set,
            duration_ms: (now_ms() - start).max(0) as u64,
        })
    }

    pub async fn store(self: Arc<Self>, key: NodeId, value: Value) -> Result<usize> {
        let lookup = Arc::clone(&self).find_node(key).await?;
        let mut accepted = 0usize;

        for contact in &lookup.closest {
            let msg = DhtMessage::Store {
                header: self.header(),
                key,
                value: value.clone(),
            };
            if let Ok(DhtMessage::StoreResponse { success, .. }) = self.round_trip(contact, msg).await {
                if success {
                    accepted += 1;
                }
            }
        }

        let should_store_locally = lookup.closest.len() < self.config.k
            || lookup
                .closest
                .last()
                .map(|farthest| {
                    NodeId::compare_distance(&self.local_id.xor(&key), &farthest.node_id.xor(&key)) < 0
                })
                .unwrap_or(true);

        if should_store_locally {
            self.store_local(key, value);
            accepted += 1;
        }

        Ok(accepted)
    }

    // ---- maintenance --------------------------------------------------------

    pub async fn refresh_buckets(self: Arc<Self>) {
        let stale = {
            let buckets = self.buckets();
            buckets.buckets_needing_refresh(self.config.refresh_interval_ms.try_into().unwrap(), now_ms())
        };
        for bucket_idx in stale {
            let target = NodeId::generate_id_in_bucket(&self.local_id, bucket_idx);
            match Arc::clone(&self).find_node(target).await {
                Ok(_) => {
                    self.buckets().bucket_mut(bucket_idx).mark_refreshed(now_ms());
                    debug!(bucket = bucket_idx, "bucket refreshed");
                }
                Err(e) => warn!(bucket = bucket_idx, error = %e, "bucket refresh lookup failed"),
            }
        }
    }

    pub async fn republish_values(self: Arc<Self>) {
        let now = now_ms();
        let republishable: Vec<(String, Value)> = {
            let mut values = self.values();
            let expired: Vec<String> = values
                .iter()
                .filter(|(_, v)| v.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &expired {
                values.remove(key);
            }
            values
                .iter()
                .filter(|(_, v)| v.publisher_id == self.local_id.to_hex())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        for (hex_key, value) in republishable {
            if let Ok(key_bytes) = NodeId::from_hex(&hex_key) {
                if let Err(e) = Arc::clone(&self).store(key_bytes, value).await {
                    warn!(key = %hex_key, error = %e, "republish failed");
                }
            }
        }
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.pending.clear();
        info!("routing table stopped, pending rpcs rejected");
    }
}

/// True iff `after` is strictly closer to `target` than `before` (or
/// `before` is absent and `after` exists).
fn closer_than(before: Option<NodeId>, after: Option<NodeId>, target: &NodeId) -> bool {
    match (before, after) {
        (Some(before), Some(after)) => {
            before != after && NodeId::compare_distance(&after.xor(target), &before.xor(target)) < 0
        }
        (None, Some(_)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::transport::LoopbackTransport;

    fn sender() -> Arc<dyn RpcSender> {
        Arc::new(LoopbackTransport::new())
    }

    #[tokio::test]
    async fn find_value_short_circuits_without_rpc() {
        let local = NodeId::generate();
        let table = Arc::new(RoutingTable::new(local, DhtConfig::default(), sender()));
        let key = NodeId::hash_key(b"abc");
        let value = Value::new(b"hello".to_vec(), now_ms(), 60_000, local.to_hex());
        table.store_local(key, value.clone());

        let result = table.find_value(key).await.unwrap();
        assert!(result.found);
        assert_eq!(result.value, Some(value));
        assert!(result.queried_nodes.is_empty());
    }

    #[test]
    fn local_value_round_trip_and_ttl_expiry() {
        let local = NodeId::generate();
        let table = RoutingTable::new(local, DhtConfig::default(), sender());
        let key = NodeId::hash_key(b"abc");
        let value = Value::new(b"hello".to_vec(), 0, 100, local.to_hex());
        table.store_local(key, value.clone());
        assert_eq!(table.get_local(&key), Some(value));
    }

    #[tokio::test]
    async fn find_node_with_empty_table_returns_empty_result() {
        let local = NodeId::generate();
        let table = Arc::new(RoutingTable::new(local, DhtConfig::default(), sender()));
        let result = table.find_node(NodeId::generate()).await.unwrap();
        assert!(result.closest.is_empty());
        assert_eq!(result.queries_issued, 0);
        assert!(!result.found);
    }

    #[tokio::test]
    async fn ping_against_unknown_peer_fails_without_panicking() {
        let local = NodeId::generate();
        let table = RoutingTable::new(local, DhtConfig::default(), sender());
        let contact = Contact::new(NodeId::generate(), "ghost", now_ms());
        assert!(!table.ping(&contact).await);
        assert_eq!(table.get_contact(&contact.node_id).map(|c| c.failure_count), Some(1));
    }

    #[tokio::test]
    async fn full_bucket_tail_ping_evicts_on_failure_and_promotes_waiting_contact() {
        use crate::types::node_id::NODE_ID_BYTES;

        let local = NodeId::from_bytes([0u8; NODE_ID_BYTES]);
        let mut config = DhtConfig::default();
        config.k = 1;
        config.ping_timeout_ms = 20;
        let table = Arc::new(RoutingTable::new(local, config, sender()));

        let stale_id = NodeId::from_bytes([1u8; NODE_ID_BYTES]);
        let waiting_id = NodeId::from_bytes([3u8; NODE_ID_BYTES]);
        table.add_contact(Contact::new(stale_id, "stale", now_ms()));

        let ping = DhtMessage::Ping {
            header: MessageHeader {
                sender_id: waiting_id,
                message_id: new_message_id(),
                timestamp_ms: now_ms(),
            },
        };
        let _ = Arc::clone(&table).handle_ping(&ping, "waiting");

        // The bucket-full path spawns a detached tail ping; give it a chance
        // to time out (ping_timeout_ms above is set tiny for this) and evict.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        assert!(table.get_contact(&stale_id).is_none());
        assert!(table.get_contact(&waiting_id).is_some());
    }

    #[tokio::test]
    async fn stop_rejects_pending_rpcs() {
        let local = NodeId::generate();
        let table = Arc::new(RoutingTable::new(local, DhtConfig::default(), sender()));
        table.stop();
        let contact = Contact::new(NodeId::generate(), "ghost", now_ms());
        assert!(!table.ping(&contact).await);
    }
}
