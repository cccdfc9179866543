//! # Kademlia Routing Table
//!
//! 256 k-buckets indexed by the log2 XOR distance from the local node id.
//! Each bucket orders its entries so that disconnected entries come first
//! (oldest to newest) followed by connected entries (least to most recently
//! connected).
//!
//! ## Admission
//!
//! | Bucket state | Candidate | Outcome |
//! |--------------|-----------|---------|
//! | has room | any | inserted |
//! | full | disconnected | [`InsertResult::Full`] |
//! | full, all connected | connected | [`InsertResult::Full`] |
//! | full, some disconnected | connected | [`InsertResult::Pending`] |
//!
//! A pending entry is resolved in two explicit steps: the table hands out a
//! [`PendingHandle`] and the caller, after probing the oldest disconnected
//! entry, calls [`RoutingTable::resolve_pending`]. A bucket holds at most one
//! pending entry; proposing a new one invalidates the previous handle.
//!
//! Per-peer auxiliary state (advertised radius, content keys the peer is known
//! to hold) lives alongside the table and is dropped whenever the peer leaves.

use std::collections::{BinaryHeap, HashMap};
use std::num::NonZeroUsize;

use lru::LruCache;
use rand::Rng;

use crate::identity::{distance_cmp, NodeId, NodeRecord};

/// Number of buckets, one per possible non-zero log2 distance.
pub const NUM_BUCKETS: usize = 256;

/// Default bucket capacity.
pub const DEFAULT_BUCKET_SIZE: usize = 16;

/// Content keys remembered per peer for gossip de-duplication.
const MAX_CONTENT_KEYS_PER_PEER: usize = 256;

pub type ContentKey = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    node_id: NodeId,
    pub record: NodeRecord,
    pub status: EntryStatus,
}

impl Entry {
    fn new(record: NodeRecord, status: EntryStatus) -> Self {
        Self {
            node_id: record.node_id(),
            record,
            status,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_connected(&self) -> bool {
        self.status == EntryStatus::Connected
    }
}

/// Identifies one pending replacement. Stale handles resolve to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingHandle {
    bucket: usize,
    generation: u64,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    entry: Entry,
    /// The disconnected entry that must re-prove liveness to keep its slot.
    target: NodeId,
    generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    /// The node was already present; its record and status were refreshed.
    Updated,
    /// The node is the bucket's pending entry; the pending copy was refreshed.
    UpdatedPending,
    /// The bucket is full and the candidate is waiting on `disconnected`.
    Pending {
        handle: PendingHandle,
        disconnected: NodeRecord,
    },
    /// The bucket is full; the candidate was not admitted.
    Full,
    /// The candidate is the local node.
    SelfInsert,
}

/// Outcome of resolving a pending entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingResolution {
    /// The pending entry replaced an unresponsive disconnected entry.
    Promoted {
        inserted: NodeRecord,
        evicted: Option<NodeRecord>,
    },
    /// The probed entry proved alive; the pending entry was dropped.
    Discarded(NodeRecord),
}

// ============================================================================
// Bucket
// ============================================================================

#[derive(Debug, Clone, Default)]
struct Bucket {
    entries: Vec<Entry>,
    /// Index of the first connected entry; `entries.len()` when none.
    first_connected: usize,
    pending: Option<PendingEntry>,
}

impl Bucket {
    fn position(&self, id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|e| e.node_id == *id)
    }

    fn get(&self, id: &NodeId) -> Option<&Entry> {
        self.entries.iter().find(|e| e.node_id == *id)
    }

    fn has_disconnected(&self) -> bool {
        self.first_connected > 0
    }

    /// Place an entry according to its status.
    fn place(&mut self, entry: Entry) {
        match entry.status {
            EntryStatus::Connected => self.entries.push(entry),
            EntryStatus::Disconnected => {
                self.entries.insert(self.first_connected, entry);
                self.first_connected += 1;
            }
        }
    }

    fn take(&mut self, pos: usize) -> Entry {
        if pos < self.first_connected {
            self.first_connected -= 1;
        }
        self.entries.remove(pos)
    }

    fn remove(&mut self, id: &NodeId) -> Option<Entry> {
        let pos = self.position(id)?;
        Some(self.take(pos))
    }

    /// Refresh an existing entry, moving it to the end of its status section.
    fn update(&mut self, pos: usize, record: NodeRecord, status: EntryStatus) {
        let mut entry = self.take(pos);
        if record.seq >= entry.record.seq {
            entry.record = record;
        }
        entry.status = status;
        self.place(entry);
    }
}

// ============================================================================
// Routing Table
// ============================================================================

#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    buckets: Vec<Bucket>,
    next_generation: u64,
    radius: HashMap<NodeId, [u8; 32]>,
    content_keys: HashMap<NodeId, LruCache<ContentKey, ()>>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        Self {
            local_id,
            k: k.max(1),
            buckets: vec![Bucket::default(); NUM_BUCKETS],
            next_generation: 0,
            radius: HashMap::new(),
            content_keys: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Bucket index for `id`, or `None` for the local node.
    fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        match self.local_id.log2_distance(id) {
            0 => None,
            d => Some(d as usize - 1),
        }
    }

    pub fn insert_or_update(&mut self, record: NodeRecord, status: EntryStatus) -> InsertResult {
        let id = record.node_id();
        let Some(idx) = self.bucket_index(&id) else {
            return InsertResult::SelfInsert;
        };
        let k = self.k;
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.position(&id) {
            bucket.update(pos, record, status);
            return InsertResult::Updated;
        }

        if let Some(pending) = bucket.pending.as_mut()
            && pending.entry.node_id == id
        {
            if record.seq >= pending.entry.record.seq {
                pending.entry.record = record;
            }
            pending.entry.status = status;
            return InsertResult::UpdatedPending;
        }

        if bucket.entries.len() < k {
            bucket.place(Entry::new(record, status));
            return InsertResult::Inserted;
        }

        if status == EntryStatus::Disconnected || !bucket.has_disconnected() {
            return InsertResult::Full;
        }

        match self.propose_replacement(idx, Entry::new(record, status)) {
            Some((handle, disconnected)) => InsertResult::Pending { handle, disconnected },
            None => InsertResult::Full,
        }
    }

    /// Stage `candidate` as the pending entry of bucket `idx`, targeting the
    /// oldest disconnected entry. Any previous pending entry is replaced.
    fn propose_replacement(&mut self, idx: usize, candidate: Entry) -> Option<(PendingHandle, NodeRecord)> {
        let generation = self.next_generation;
        let bucket = &mut self.buckets[idx];
        let oldest = bucket.entries.first().filter(|e| !e.is_connected())?;
        let disconnected = oldest.record.clone();
        bucket.pending = Some(PendingEntry {
            entry: candidate,
            target: oldest.node_id,
            generation,
        });
        self.next_generation += 1;
        Some((
            PendingHandle {
                bucket: idx,
                generation,
            },
            disconnected,
        ))
    }

    /// Settle a pending entry once its probe window has elapsed.
    ///
    /// If the targeted entry is still disconnected it is evicted and the
    /// pending entry takes its place; if it reconnected the pending entry is
    /// discarded. Stale or superseded handles return `None`.
    pub fn resolve_pending(&mut self, handle: PendingHandle) -> Option<PendingResolution> {
        let bucket = self.buckets.get_mut(handle.bucket)?;
        if bucket.pending.as_ref()?.generation != handle.generation {
            return None;
        }
        let pending = bucket.pending.take()?;

        let target_alive = bucket.get(&pending.target).map(Entry::is_connected);
        let resolution = match target_alive {
            Some(true) => return Some(PendingResolution::Discarded(pending.entry.record)),
            Some(false) => {
                let evicted = bucket.remove(&pending.target).map(|e| e.record);
                let inserted = pending.entry.record.clone();
                bucket.place(pending.entry);
                PendingResolution::Promoted { inserted, evicted }
            }
            None if bucket.entries.len() < self.k => {
                let inserted = pending.entry.record.clone();
                bucket.place(pending.entry);
                PendingResolution::Promoted {
                    inserted,
                    evicted: None,
                }
            }
            None => return Some(PendingResolution::Discarded(pending.entry.record)),
        };

        if let PendingResolution::Promoted {
            evicted: Some(evicted),
            ..
        } = &resolution
        {
            let id = evicted.node_id();
            self.clear_peer_state(&id);
        }
        Some(resolution)
    }

    /// Set the status of a present entry. Returns false if it is absent.
    pub fn update_status(&mut self, id: &NodeId, status: EntryStatus) -> bool {
        let Some(idx) = self.bucket_index(id) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        match bucket.position(id) {
            Some(pos) => {
                let record = bucket.entries[pos].record.clone();
                bucket.update(pos, record, status);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<&Entry> {
        let idx = self.bucket_index(id)?;
        self.buckets[idx].get(id)
    }

    pub fn record(&self, id: &NodeId) -> Option<NodeRecord> {
        self.get(id).map(|e| e.record.clone())
    }

    /// Look up `id` among a bucket's entries or its pending slot.
    pub fn get_with_pending(&self, id: &NodeId) -> Option<&Entry> {
        let idx = self.bucket_index(id)?;
        let bucket = &self.buckets[idx];
        bucket.get(id).or_else(|| {
            bucket
                .pending
                .as_ref()
                .filter(|p| p.entry.node_id == *id)
                .map(|p| &p.entry)
        })
    }

    /// Remove a node and every piece of per-peer state. Idempotent.
    pub fn evict_node(&mut self, id: &NodeId) -> Option<NodeRecord> {
        self.clear_peer_state(id);
        let idx = self.bucket_index(id)?;
        let bucket = &mut self.buckets[idx];
        if bucket.pending.as_ref().is_some_and(|p| p.entry.node_id == *id) {
            bucket.pending = None;
        }
        bucket.remove(id).map(|e| e.record)
    }

    /// Remove a node's entry, as [`RoutingTable::evict_node`].
    pub fn remove(&mut self, record: &NodeRecord) -> bool {
        self.evict_node(&record.node_id()).is_some()
    }

    /// The `limit` records closest to `target`, nearest first.
    pub fn nearest(&self, target: &NodeId, limit: usize) -> Vec<NodeRecord> {
        if limit == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct Candidate<'a> {
            dist: [u8; 32],
            entry: &'a Entry,
        }

        impl Ord for Candidate<'_> {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for Candidate<'_> {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<Candidate<'_>> = BinaryHeap::with_capacity(limit + 1);
        for entry in self.iter() {
            let dist = entry.node_id.xor_distance(target);
            if heap.len() < limit {
                heap.push(Candidate { dist, entry });
            } else if let Some(max_entry) = heap.peek()
                && distance_cmp(&dist, &max_entry.dist) == std::cmp::Ordering::Less
            {
                heap.push(Candidate { dist, entry });
                heap.pop();
            }
        }

        heap.into_sorted_vec()
            .into_iter()
            .map(|c| c.entry.record.clone())
            .collect()
    }

    /// Records at exactly `distance` from the local node. Distance 0 is the
    /// local node itself, which the table never stores.
    pub fn values_of_distance(&self, distance: u16) -> Vec<NodeRecord> {
        if distance == 0 || distance as usize > NUM_BUCKETS {
            return Vec::new();
        }
        self.buckets[distance as usize - 1]
            .entries
            .iter()
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn random(&self) -> Option<NodeRecord> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        let pick = rand::thread_rng().gen_range(0..len);
        self.iter().nth(pick).map(|e| e.record.clone())
    }

    /// Every stored entry in bucket order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.buckets.iter().flat_map(|b| b.entries.iter())
    }

    pub fn connected(&self) -> Vec<NodeRecord> {
        self.iter()
            .filter(|e| e.is_connected())
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.entries.is_empty())
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            *bucket = Bucket::default();
        }
        self.radius.clear();
        self.content_keys.clear();
    }

    // ------------------------------------------------------------------------
    // Per-peer auxiliary state
    // ------------------------------------------------------------------------

    fn clear_peer_state(&mut self, id: &NodeId) {
        self.radius.remove(id);
        self.content_keys.remove(id);
    }

    pub fn set_radius(&mut self, id: NodeId, radius: [u8; 32]) {
        if self.get(&id).is_some() {
            self.radius.insert(id, radius);
        }
    }

    pub fn radius(&self, id: &NodeId) -> Option<[u8; 32]> {
        self.radius.get(id).copied()
    }

    /// Remember that `id` holds `key`. Ignored for nodes not in the table.
    pub fn mark_content_key_known(&mut self, id: NodeId, key: ContentKey) {
        if self.get(&id).is_none() {
            return;
        }
        self.content_keys
            .entry(id)
            .or_insert_with(|| {
                LruCache::new(NonZeroUsize::new(MAX_CONTENT_KEYS_PER_PEER).unwrap_or(NonZeroUsize::MIN))
            })
            .put(key, ());
    }

    pub fn content_key_known_to_peer(&self, id: &NodeId, key: &ContentKey) -> bool {
        self.content_keys
            .get(id)
            .is_some_and(|keys| keys.contains(key))
    }

    #[cfg(test)]
    fn bucket_len(&self, distance: u16) -> usize {
        self.buckets[distance as usize - 1].entries.len()
    }

    #[cfg(test)]
    fn pending_count(&self, distance: u16) -> usize {
        usize::from(self.buckets[distance as usize - 1].pending.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn local() -> NodeId {
        NodeId::from_bytes([0u8; 32])
    }

    /// Generate records until `count` of them land at `distance` from the zero id.
    fn records_at_distance(distance: u16, count: usize) -> Vec<NodeRecord> {
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            let record = Keypair::generate().create_record(1, Some("127.0.0.1:9000".parse().unwrap()));
            if local().log2_distance(&record.node_id()) == distance {
                out.push(record);
            }
        }
        out
    }

    fn full_bucket(k: usize, disconnected: usize) -> (RoutingTable, Vec<NodeRecord>) {
        let mut table = RoutingTable::new(local(), k);
        let records = records_at_distance(256, k + 1);
        for (i, record) in records.iter().take(k).enumerate() {
            let status = if i < disconnected {
                EntryStatus::Disconnected
            } else {
                EntryStatus::Connected
            };
            assert_eq!(table.insert_or_update(record.clone(), status), InsertResult::Inserted);
        }
        (table, records)
    }

    #[test]
    fn local_node_is_never_inserted() {
        let keypair = Keypair::generate();
        let mut table = RoutingTable::new(keypair.node_id(), 16);
        assert_eq!(
            table.insert_or_update(keypair.create_record(1, None), EntryStatus::Connected),
            InsertResult::SelfInsert
        );
        assert!(table.is_empty());
    }

    #[test]
    fn insert_then_update_refreshes_record() {
        let mut table = RoutingTable::new(local(), 16);
        let keypair = Keypair::generate();
        let v1 = keypair.create_record(1, None);
        let v2 = keypair.create_record(2, None);
        assert_eq!(table.insert_or_update(v1, EntryStatus::Disconnected), InsertResult::Inserted);
        assert_eq!(table.insert_or_update(v2.clone(), EntryStatus::Connected), InsertResult::Updated);
        let entry = table.get(&keypair.node_id()).unwrap();
        assert_eq!(entry.record, v2);
        assert_eq!(entry.status, EntryStatus::Connected);

        // An older record does not overwrite a newer one.
        let v0 = keypair.create_record(0, None);
        table.insert_or_update(v0, EntryStatus::Connected);
        assert_eq!(table.get(&keypair.node_id()).unwrap().record.seq, 2);
    }

    #[test]
    fn connected_entries_move_to_the_end() {
        let mut table = RoutingTable::new(local(), 16);
        let records = records_at_distance(256, 3);
        for record in &records {
            table.insert_or_update(record.clone(), EntryStatus::Connected);
        }
        table.insert_or_update(records[0].clone(), EntryStatus::Connected);
        let order: Vec<NodeId> = table.iter().map(Entry::node_id).collect();
        assert_eq!(
            order,
            vec![records[1].node_id(), records[2].node_id(), records[0].node_id()]
        );

        // Disconnected entries sort ahead of every connected entry.
        table.update_status(&records[2].node_id(), EntryStatus::Disconnected);
        let order: Vec<NodeId> = table.iter().map(Entry::node_id).collect();
        assert_eq!(order[0], records[2].node_id());
    }

    #[test]
    fn full_bucket_rejects_disconnected_and_all_connected() {
        let (mut table, records) = full_bucket(4, 0);
        let extra = records[4].clone();
        assert_eq!(table.insert_or_update(extra.clone(), EntryStatus::Disconnected), InsertResult::Full);
        assert_eq!(table.insert_or_update(extra, EntryStatus::Connected), InsertResult::Full);
        assert_eq!(table.bucket_len(256), 4);
        assert_eq!(table.pending_count(256), 0);
    }

    #[test]
    fn pending_entry_promoted_when_target_stays_disconnected() {
        let (mut table, records) = full_bucket(4, 2);
        let candidate = records[4].clone();
        let handle = match table.insert_or_update(candidate.clone(), EntryStatus::Connected) {
            InsertResult::Pending { handle, disconnected } => {
                assert_eq!(disconnected, records[0]);
                handle
            }
            other => panic!("expected pending, got {:?}", other),
        };
        assert_eq!(table.pending_count(256), 1);
        assert!(table.get(&candidate.node_id()).is_none());
        assert!(table.get_with_pending(&candidate.node_id()).is_some());

        let resolution = table.resolve_pending(handle).unwrap();
        assert_eq!(
            resolution,
            PendingResolution::Promoted {
                inserted: candidate.clone(),
                evicted: Some(records[0].clone()),
            }
        );
        assert!(table.get(&records[0].node_id()).is_none());
        assert!(table.get(&candidate.node_id()).unwrap().is_connected());
        assert_eq!(table.bucket_len(256), 4);
        assert_eq!(table.pending_count(256), 0);

        // A handle resolves once.
        assert!(table.resolve_pending(handle).is_none());
    }

    #[test]
    fn pending_entry_discarded_when_target_responds() {
        let (mut table, records) = full_bucket(4, 1);
        let before: Vec<NodeId> = table.iter().map(Entry::node_id).collect();
        let InsertResult::Pending { handle, .. } =
            table.insert_or_update(records[4].clone(), EntryStatus::Connected)
        else {
            panic!("expected pending");
        };

        // Probe answered.
        table.insert_or_update(records[0].clone(), EntryStatus::Connected);

        assert_eq!(
            table.resolve_pending(handle),
            Some(PendingResolution::Discarded(records[4].clone()))
        );
        let mut after: Vec<NodeId> = table.iter().map(Entry::node_id).collect();
        let mut expected = before.clone();
        after.sort();
        expected.sort();
        assert_eq!(after, expected);
        assert!(table.get(&records[4].node_id()).is_none());
    }

    #[test]
    fn newer_pending_entry_supersedes_older_handle() {
        let (mut table, mut records) = full_bucket(4, 2);
        records.extend(records_at_distance(256, 1));
        let InsertResult::Pending { handle: first, .. } =
            table.insert_or_update(records[4].clone(), EntryStatus::Connected)
        else {
            panic!("expected pending");
        };
        let InsertResult::Pending { handle: second, .. } =
            table.insert_or_update(records[5].clone(), EntryStatus::Connected)
        else {
            panic!("expected pending");
        };
        assert_ne!(first, second);
        assert_eq!(table.pending_count(256), 1);
        assert!(table.resolve_pending(first).is_none());
        assert!(matches!(
            table.resolve_pending(second),
            Some(PendingResolution::Promoted { .. })
        ));
    }

    #[test]
    fn capacity_invariant_holds_under_churn() {
        let k = 3;
        let mut table = RoutingTable::new(local(), k);
        let mut handles = Vec::new();
        let pool: Vec<NodeRecord> = (0..40)
            .map(|_| Keypair::generate().create_record(1, None))
            .collect();
        let mut rng = rand::thread_rng();
        for step in 0..400 {
            let record = pool[rng.gen_range(0..pool.len())].clone();
            match rng.gen_range(0..4) {
                0 => {
                    table.remove(&record);
                }
                1 => {
                    table.insert_or_update(record, EntryStatus::Disconnected);
                }
                _ => {
                    if let InsertResult::Pending { handle, .. } =
                        table.insert_or_update(record, EntryStatus::Connected)
                    {
                        handles.push(handle);
                    }
                }
            }
            if step % 7 == 0
                && let Some(handle) = handles.pop()
            {
                table.resolve_pending(handle);
            }
            for bucket in &table.buckets {
                assert!(bucket.entries.len() <= k);
                assert!(bucket.first_connected <= bucket.entries.len());
                assert!(bucket.entries[..bucket.first_connected].iter().all(|e| !e.is_connected()));
                assert!(bucket.entries[bucket.first_connected..].iter().all(Entry::is_connected));
            }
        }
    }

    #[test]
    fn nearest_returns_sorted_prefix() {
        let mut table = RoutingTable::new(local(), 16);
        let records: Vec<NodeRecord> = (0..30)
            .map(|_| Keypair::generate().create_record(1, None))
            .collect();
        for record in &records {
            table.insert_or_update(record.clone(), EntryStatus::Connected);
        }
        let target = NodeId::random();
        let nearest = table.nearest(&target, 5);
        assert_eq!(nearest.len(), 5.min(table.len()));

        let mut all: Vec<NodeRecord> = table.iter().map(|e| e.record.clone()).collect();
        all.sort_by(|a, b| {
            distance_cmp(&a.node_id().xor_distance(&target), &b.node_id().xor_distance(&target))
        });
        assert_eq!(nearest, all[..nearest.len()].to_vec());
        assert!(table.nearest(&target, 0).is_empty());
    }

    #[test]
    fn values_of_distance_matches_bucket() {
        let mut table = RoutingTable::new(local(), 16);
        let far = records_at_distance(256, 2);
        let near = records_at_distance(255, 1);
        for record in far.iter().chain(near.iter()) {
            table.insert_or_update(record.clone(), EntryStatus::Connected);
        }
        assert_eq!(table.values_of_distance(256).len(), 2);
        assert_eq!(table.values_of_distance(255), near);
        assert!(table.values_of_distance(0).is_empty());
        assert!(table.values_of_distance(257).is_empty());
        assert!(table.random().is_some());
    }

    #[test]
    fn eviction_clears_peer_state_and_is_idempotent() {
        let mut table = RoutingTable::new(local(), 16);
        let record = records_at_distance(256, 1).remove(0);
        let id = record.node_id();
        table.insert_or_update(record.clone(), EntryStatus::Connected);
        table.set_radius(id, [0xFF; 32]);
        table.mark_content_key_known(id, [1u8; 32]);
        assert_eq!(table.radius(&id), Some([0xFF; 32]));
        assert!(table.content_key_known_to_peer(&id, &[1u8; 32]));
        assert!(!table.content_key_known_to_peer(&id, &[2u8; 32]));

        assert_eq!(table.evict_node(&id), Some(record));
        assert_eq!(table.evict_node(&id), None);
        assert_eq!(table.radius(&id), None);
        assert!(!table.content_key_known_to_peer(&id, &[1u8; 32]));

        // State is only kept for nodes in the table.
        table.set_radius(id, [1; 32]);
        table.mark_content_key_known(id, [1u8; 32]);
        assert_eq!(table.radius(&id), None);
        assert!(!table.content_key_known_to_peer(&id, &[1u8; 32]));
    }

    #[test]
    fn clear_empties_everything() {
        let mut table = RoutingTable::new(local(), 16);
        for record in records_at_distance(256, 3) {
            table.insert_or_update(record, EntryStatus::Connected);
        }
        assert_eq!(table.len(), 3);
        assert_eq!(table.connected().len(), 3);
        table.clear();
        assert!(table.is_empty());
        assert!(table.random().is_none());
    }
}
