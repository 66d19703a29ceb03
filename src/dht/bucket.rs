//! K-buckets and the 160-bucket manager.
//!
//! A bucket holds up to `k` contacts in most-recently-seen-first order plus
//! a bounded replacement cache. The bucket manager routes a contact to the
//! correct bucket by XOR-prefix length against the local id.

use crate::types::contact::Contact;
use crate::types::node_id::{NodeId, NUM_BUCKETS};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Outcome of [`Bucket::add_contact`] / [`BucketManager::add_contact`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// `c` was not previously present and the bucket had room.
    Added,
    /// `c` was already present; its fields were refreshed and it moved to
    /// the front.
    Updated,
    /// The bucket is full; `c` was queued in the replacement cache and the
    /// caller should ping the returned least-recently-seen contact.
    NeedsPing(Contact),
    /// `c.node_id` equals the local node id and was refused.
    RejectedSelf,
}

/// A single k-bucket: up to `k` contacts plus a bounded replacement cache.
#[derive(Debug, Clone)]
pub struct Bucket {
    capacity: usize,
    cache_capacity: usize,
    /// Front = most recently seen, back = least recently seen.
    contacts: VecDeque<Contact>,
    /// Front = most recently queued, back = oldest queued.
    replacement_cache: VecDeque<Contact>,
    last_refreshed: i64,
}

impl Bucket {
    pub fn new(capacity: usize, cache_capacity: usize) -> Self {
        Self {
            capacity,
            cache_capacity,
            contacts: VecDeque::new(),
            replacement_cache: VecDeque::new(),
            last_refreshed: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= self.capacity
    }

    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    pub fn get(&self, id: &NodeId) -> Option<&Contact> {
        self.contacts.iter().find(|c| &c.node_id == id)
    }

    pub fn replacement_cache(&self) -> impl Iterator<Item = &Contact> {
        self.replacement_cache.iter()
    }

    pub fn last_refreshed(&self) -> i64 {
        self.last_refreshed
    }

    pub fn mark_refreshed(&mut self, now_ms: i64) {
        self.last_refreshed = now_ms;
    }

    pub fn needs_refresh(&self, interval_ms: i64, now_ms: i64) -> bool {
        now_ms - self.last_refreshed > interval_ms
    }

    /// Insertion policy per the data model: update-and-bump, insert, or
    /// queue-for-replacement when full.
    pub fn add_contact(&mut self, mut c: Contact) -> AddOutcome {
        if let Some(pos) = self.contacts.iter().position(|existing| existing.node_id == c.node_id) {
            self.contacts.remove(pos);
            self.contacts.push_front(c);
            return AddOutcome::Updated;
        }

        if self.contacts.len() < self.capacity {
            self.contacts.push_front(c);
            return AddOutcome::Added;
        }

        let least_recent = self
            .contacts
            .back()
            .cloned()
            .expect("full bucket has at least one contact");

        self.push_to_replacement_cache(&mut c);
        AddOutcome::NeedsPing(least_recent)
    }

    fn push_to_replacement_cache(&mut self, c: &mut Contact) {
        if let Some(pos) = self.replacement_cache.iter().position(|e| e.node_id == c.node_id) {
            self.replacement_cache.remove(pos);
        }
        self.replacement_cache.push_front(c.clone());
        while self.replacement_cache.len() > self.cache_capacity {
            self.replacement_cache.pop_back();
        }
    }

    /// Removes `id`; if the replacement cache is non-empty, its head is
    /// promoted to the bucket's tail (least-recently-seen position).
    pub fn remove_contact(&mut self, id: &NodeId) -> Option<Contact> {
        let pos = self.contacts.iter().position(|c| &c.node_id == id)?;
        let removed = self.contacts.remove(pos);
        if let Some(promoted) = self.replacement_cache.pop_front() {
            self.contacts.push_back(promoted);
        }
        removed
    }

    /// Alias matching the spec's vocabulary for forcing eviction-and-promote.
    pub fn replace_stale_contact(&mut self, id: &NodeId) -> Option<Contact> {
        self.remove_contact(id)
    }

    pub fn record_failure(&mut self, id: &NodeId) {
        if let Some(c) = self.contacts.iter_mut().find(|c| &c.node_id == id) {
            c.failure_count += 1;
        }
    }

    pub fn reset_failures(&mut self, id: &NodeId) {
        if let Some(c) = self.contacts.iter_mut().find(|c| &c.node_id == id) {
            c.failure_count = 0;
        }
    }

    pub fn update_rtt(&mut self, id: &NodeId, rtt_ms: u64) {
        if let Some(c) = self.contacts.iter_mut().find(|c| &c.node_id == id) {
            c.rtt_ms = Some(rtt_ms);
        }
    }
}

/// Exactly [`NUM_BUCKETS`] buckets indexed by XOR-prefix length against the
/// local id. Grows monotonically through discovery; shrinks only via
/// explicit removal.
#[derive(Debug)]
pub struct BucketManager {
    local_id: NodeId,
    buckets: Vec<Bucket>,
}

impl BucketManager {
    pub fn new(local_id: NodeId, k: usize, cache_capacity: usize) -> Self {
        Self {
            local_id,
            buckets: (0..NUM_BUCKETS).map(|_| Bucket::new(k, cache_capacity)).collect(),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn bucket(&self, index: usize) -> &Bucket {
        &self.buckets[index]
    }

    pub fn bucket_mut(&mut self, index: usize) -> &mut Bucket {
        &mut self.buckets[index]
    }

    pub fn buckets(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.iter()
    }

    /// Routes `c` to its bucket; refuses self-contacts outright.
    pub fn add_contact(&mut self, c: Contact) -> AddOutcome {
        if c.node_id == self.local_id {
            return AddOutcome::RejectedSelf;
        }
        let index = NodeId::bucket_index(&self.local_id, &c.node_id);
        debug_assert!(index >= 0, "non-self contact must land in a real bucket");
        let index = index as usize;
        let outcome = self.buckets[index].add_contact(c);
        trace!(bucket = index, ?outcome, "bucket insert");
        outcome
    }

    pub fn remove_contact(&mut self, id: &NodeId) -> Option<Contact> {
        let index = NodeId::bucket_index(&self.local_id, id);
        if index < 0 {
            return None;
        }
        self.buckets[index as usize].remove_contact(id)
    }

    pub fn record_failure(&mut self, id: &NodeId) {
        let index = NodeId::bucket_index(&self.local_id, id);
        if index < 0 {
            return;
        }
        self.buckets[index as usize].record_failure(id);
    }

    pub fn reset_failures(&mut self, id: &NodeId) {
        let index = NodeId::bucket_index(&self.local_id, id);
        if index < 0 {
            return;
        }
        self.buckets[index as usize].reset_failures(id);
    }

    pub fn get_contact(&self, id: &NodeId) -> Option<&Contact> {
        let index = NodeId::bucket_index(&self.local_id, id);
        if index < 0 {
            return None;
        }
        self.buckets[index as usize].get(id)
    }

    pub fn all_contacts(&self) -> Vec<Contact> {
        self.buckets.iter().flat_map(|b| b.contacts().cloned()).collect()
    }

    /// The `n` contacts closest to `target` across all buckets.
    pub fn closest_contacts(&self, target: &NodeId, n: usize) -> Vec<Contact> {
        let mut all = self.all_contacts();
        NodeId::sort_by_distance(&mut all, target, |c| c.node_id);
        all.truncate(n);
        all
    }

    pub fn total_contacts(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    pub fn non_empty_bucket_count(&self) -> usize {
        self.buckets.iter().filter(|b| !b.is_empty()).count()
    }

    pub fn full_bucket_count(&self) -> usize {
        self.buckets.iter().filter(|b| b.is_full()).count()
    }

    pub fn buckets_needing_refresh(&self, interval_ms: i64, now_ms: i64) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty() && b.needs_refresh(interval_ms, now_ms))
            .map(|(idx, _)| idx)
            .inspect(|idx| debug!(bucket = idx, "bucket needs refresh"))
            .collect()
    }

    pub fn clear(&mut self) {
        self.buckets = (0..NUM_BUCKETS)
            .map(|_| Bucket::new(self.buckets[0].capacity, self.buckets[0].cache_capacity))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::node_id::NODE_ID_BYTES;

    fn repeat(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; NODE_ID_BYTES])
    }

    fn contact(id: NodeId) -> Contact {
        Contact::new(id, format!("peer-{}", id.to_hex()), 0)
    }

    #[test]
    fn self_exclusion() {
        let local = repeat(0x00);
        let mut mgr = BucketManager::new(local, 20, 10);
        let outcome = mgr.add_contact(contact(local));
        assert_eq!(outcome, AddOutcome::RejectedSelf);
        assert!(mgr.all_contacts().is_empty());
    }

    #[test]
    fn lru_bump_reorders_front() {
        let local = repeat(0x00);
        let mut mgr = BucketManager::new(local, 20, 10);
        let c1 = contact(repeat(0x01));
        let c2 = contact(repeat(0x02));
        mgr.add_contact(c1.clone());
        mgr.add_contact(c2.clone());
        mgr.add_contact(c1.clone());

        let index = NodeId::bucket_index(&local, &c1.node_id) as usize;
        let ordered: Vec<_> = mgr.bucket(index).contacts().map(|c| c.node_id).collect();
        assert_eq!(ordered, vec![c1.node_id, c2.node_id]);
    }

    #[test]
    fn eviction_triage_matches_scenario() {
        let local = repeat(0x00);
        let mut mgr = BucketManager::new(local, 2, 1);
        let c1 = contact(repeat(0x01));
        let c2 = contact(repeat(0x02));
        let c3 = contact(repeat(0x03));

        mgr.add_contact(c1.clone());
        mgr.add_contact(c2.clone());

        let index = NodeId::bucket_index(&local, &c1.node_id) as usize;
        assert_eq!(index, NodeId::bucket_index(&local, &c3.node_id) as usize);

        let outcome = mgr.add_contact(c3.clone());
        assert_eq!(outcome, AddOutcome::NeedsPing(c1.clone()));
        assert_eq!(mgr.bucket(index).len(), 2);
        assert_eq!(mgr.bucket(index).replacement_cache().count(), 1);

        mgr.remove_contact(&c1.node_id);
        let ordered: Vec<_> = mgr.bucket(index).contacts().map(|c| c.node_id).collect();
        assert_eq!(ordered, vec![c2.node_id, c3.node_id]);
    }

    #[test]
    fn closest_k_matches_scenario() {
        let local = repeat(0x00);
        let mut mgr = BucketManager::new(local, 20, 10);
        for i in 1..=10u8 {
            mgr.add_contact(contact(repeat(i)));
        }
        let target = repeat(0x03);
        let closest = mgr.closest_contacts(&target, 3);
        let ids: Vec<_> = closest.iter().map(|c| c.node_id).collect();
        assert_eq!(ids, vec![repeat(0x03), repeat(0x02), repeat(0x01)]);
    }

    #[test]
    fn add_contact_idempotent_in_membership() {
        let local = repeat(0x00);
        let mut mgr = BucketManager::new(local, 20, 10);
        let c1 = contact(repeat(0x01));
        mgr.add_contact(c1.clone());
        let before = mgr.get_contact(&c1.node_id).cloned();
        mgr.add_contact(c1.clone());
        let after = mgr.get_contact(&c1.node_id).cloned();
        assert_eq!(before.map(|c| c.node_id), after.map(|c| c.node_id));
        assert_eq!(mgr.total_contacts(), 1);
    }

    #[test]
    fn replacement_cache_never_holds_a_bucket_member() {
        let local = repeat(0x00);
        let mut mgr = BucketManager::new(local, 1, 10);
        let c1 = contact(repeat(0x01));
        let c2 = contact(repeat(0x02));
        mgr.add_contact(c1.clone());
        mgr.add_contact(c2.clone());

        let index = NodeId::bucket_index(&local, &c1.node_id) as usize;
        let bucket = mgr.bucket(index);
        for cached in bucket.replacement_cache() {
            assert!(bucket.get(&cached.node_id).is_none());
        }
    }
}
