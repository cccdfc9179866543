//! # Iterative Node Lookup
//!
//! A lookup walks the network toward a target id by repeatedly asking the
//! closest known peers for nodes near the target. This module holds only the
//! state machine; the service drives it by calling [`Lookup::next_peer`] until
//! it stops yielding peers, sending one FINDNODE per yielded peer, and feeding
//! outcomes back through [`Lookup::on_success`] and [`Lookup::on_failure`].
//!
//! ## States
//!
//! | State | Parallel requests | Leaves when |
//! |-------|-------------------|-------------|
//! | `Iterating` | up to `parallelism` | `parallelism` responses in a row make no progress |
//! | `Stalled` | up to `num_results` | a response makes progress, or the lookup finishes |
//! | `Finished` | none | terminal |
//!
//! A lookup finishes once the `num_results` closest responsive peers have all
//! answered, or once no peer is left to contact and none is outstanding.
//!
//! [`run`] drives a [`Lookup`] against any [`DiscoveryRpc`], with queries in a
//! `JoinSet` and the whole lookup bounded by a deadline.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::anyhow;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::identity::{NodeId, NodeRecord};
use crate::protocols::DiscoveryRpc;

/// Parameters of a single lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupConfig {
    /// Requests in flight while iterating (α).
    pub parallelism: usize,
    /// Peers to collect (k).
    pub num_results: usize,
    /// Times a peer may be queried, each with shifted distances.
    pub max_iterations_per_peer: usize,
    /// Distances requested per FINDNODE.
    pub request_limit: usize,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            parallelism: 3,
            num_results: 16,
            max_iterations_per_peer: 1,
            request_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupState {
    Iterating,
    Stalled,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    NotContacted,
    Waiting,
    /// Answered, and will be queried again with shifted distances.
    PendingIteration,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
struct LookupPeer {
    node_id: NodeId,
    state: PeerState,
    /// Queries sent to this peer so far.
    iteration: usize,
    peers_returned: usize,
}

impl LookupPeer {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            state: PeerState::NotContacted,
            iteration: 0,
            peers_returned: 0,
        }
    }
}

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupPoll {
    /// Query this peer. `iteration` starts at 1.
    Peer { node_id: NodeId, iteration: usize },
    /// Wait for outstanding responses.
    Waiting,
    Finished,
}

#[derive(Debug)]
pub struct Lookup {
    target: NodeId,
    config: LookupConfig,
    state: LookupState,
    /// Consecutive responses that brought no progress.
    no_progress: usize,
    num_peers_waiting: usize,
    /// Every peer ever admitted, keyed by XOR distance to the target.
    /// Failed peers stay so a later report cannot re-admit them.
    closest_peers: BTreeMap<[u8; 32], LookupPeer>,
}

impl Lookup {
    pub fn new(target: NodeId, config: LookupConfig, seeds: impl IntoIterator<Item = NodeId>) -> Self {
        let config = LookupConfig {
            parallelism: config.parallelism.max(1),
            num_results: config.num_results.max(1),
            max_iterations_per_peer: config.max_iterations_per_peer.max(1),
            request_limit: config.request_limit.max(1),
        };
        let mut lookup = Self {
            target,
            config,
            state: LookupState::Iterating,
            no_progress: 0,
            num_peers_waiting: 0,
            closest_peers: BTreeMap::new(),
        };
        for node_id in seeds {
            lookup.admit(node_id);
        }
        lookup
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn state(&self) -> LookupState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == LookupState::Finished
    }

    pub fn num_peers_waiting(&self) -> usize {
        self.num_peers_waiting
    }

    pub fn peer_state(&self, node_id: &NodeId) -> Option<PeerState> {
        self.closest_peers
            .get(&node_id.xor_distance(&self.target))
            .map(|p| p.state)
    }

    /// Add a newly reported peer. Returns false if it was already known.
    fn admit(&mut self, node_id: NodeId) -> bool {
        match self.closest_peers.entry(node_id.xor_distance(&self.target)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(LookupPeer::new(node_id));
                true
            }
        }
    }

    /// Peers still eligible to count as results, nearest first.
    fn live_peers(&self) -> impl Iterator<Item = (&[u8; 32], &LookupPeer)> {
        self.closest_peers
            .iter()
            .filter(|(_, peer)| peer.state != PeerState::Failed)
    }

    /// Whether as many requests are outstanding as the state allows.
    pub fn at_capacity(&self) -> bool {
        match self.state {
            LookupState::Iterating => self.num_peers_waiting >= self.config.parallelism,
            LookupState::Stalled => self.num_peers_waiting >= self.config.num_results,
            LookupState::Finished => true,
        }
    }

    /// Pick the next peer to query, or report why there is none.
    pub fn next_peer(&mut self) -> LookupPoll {
        if self.state == LookupState::Finished {
            return LookupPoll::Finished;
        }

        let at_capacity = self.at_capacity();
        let mut result_counter = Some(0usize);

        for peer in self.closest_peers.values_mut() {
            match peer.state {
                PeerState::NotContacted | PeerState::PendingIteration => {
                    if at_capacity {
                        return LookupPoll::Waiting;
                    }
                    peer.state = PeerState::Waiting;
                    peer.iteration += 1;
                    self.num_peers_waiting += 1;
                    return LookupPoll::Peer {
                        node_id: peer.node_id,
                        iteration: peer.iteration,
                    };
                }
                PeerState::Waiting => {
                    if at_capacity {
                        return LookupPoll::Waiting;
                    }
                    // An outstanding closer peer keeps the lookup open.
                    result_counter = None;
                }
                PeerState::Succeeded => {
                    if let Some(count) = result_counter.as_mut() {
                        *count += 1;
                        if *count >= self.config.num_results {
                            self.state = LookupState::Finished;
                            return LookupPoll::Finished;
                        }
                    }
                }
                PeerState::Failed => {}
            }
        }

        if self.num_peers_waiting == 0 {
            self.state = LookupState::Finished;
            LookupPoll::Finished
        } else {
            LookupPoll::Waiting
        }
    }

    /// Record a response from `node_id` reporting `closer_peers`.
    pub fn on_success(&mut self, node_id: &NodeId, closer_peers: &[NodeId]) {
        if self.state == LookupState::Finished {
            return;
        }
        let key = node_id.xor_distance(&self.target);
        let max_iterations = self.config.max_iterations_per_peer;
        match self.closest_peers.get_mut(&key) {
            Some(peer) if peer.state == PeerState::Waiting => {
                self.num_peers_waiting -= 1;
                peer.peers_returned += closer_peers.len();
                peer.state = if peer.iteration < max_iterations {
                    PeerState::PendingIteration
                } else {
                    PeerState::Succeeded
                };
            }
            _ => return,
        }

        let known_before = self.live_peers().count();
        let mut closest_dist = self.live_peers().map(|(dist, _)| *dist).next();
        let mut progress = false;
        for peer in closer_peers {
            let dist = peer.xor_distance(&self.target);
            if !self.admit(*peer) {
                continue;
            }
            if closest_dist.is_none_or(|best| dist < best) {
                closest_dist = Some(dist);
                progress = true;
            }
            if known_before < self.config.num_results {
                progress = true;
            }
        }

        match self.state {
            LookupState::Iterating => {
                self.no_progress = if progress { 0 } else { self.no_progress + 1 };
                if self.no_progress >= self.config.parallelism {
                    self.state = LookupState::Stalled;
                }
            }
            LookupState::Stalled => {
                if progress {
                    self.state = LookupState::Iterating;
                    self.no_progress = 0;
                }
            }
            LookupState::Finished => {}
        }
    }

    /// Record that the request to `node_id` failed or timed out.
    pub fn on_failure(&mut self, node_id: &NodeId) {
        if self.state == LookupState::Finished {
            return;
        }
        let key = node_id.xor_distance(&self.target);
        if let Some(peer) = self.closest_peers.get_mut(&key)
            && peer.state == PeerState::Waiting
        {
            self.num_peers_waiting -= 1;
            peer.state = PeerState::Failed;
        }
    }

    /// End the lookup early, keeping what it has found.
    pub fn finish(&mut self) {
        self.state = LookupState::Finished;
    }

    /// Responsive peers, nearest first, at most `num_results`.
    pub fn closest_nodes(&self) -> Vec<NodeId> {
        self.closest_peers
            .values()
            .filter(|p| matches!(p.state, PeerState::Succeeded | PeerState::PendingIteration))
            .map(|p| p.node_id)
            .take(self.config.num_results)
            .collect()
    }

    /// Distances to request from `peer` on its `iteration`-th query.
    pub fn distances_for(&self, peer: &NodeId, iteration: usize) -> Vec<u16> {
        find_node_log2_distances(&self.target, peer, iteration, self.config.request_limit)
    }
}

/// Log2 distances to ask `peer` for when looking up `target`.
///
/// The exact distance between the two always comes first. The remaining
/// `limit - 1` slots alternate above and below it, and each further iteration
/// moves that window outward so repeated queries reach different buckets.
/// Values stay within `1..=256`; a peer equal to the target yields `[0]`.
pub fn find_node_log2_distances(target: &NodeId, peer: &NodeId, iteration: usize, limit: usize) -> Vec<u16> {
    let exact = target.log2_distance(peer);
    if exact == 0 || limit <= 1 {
        return vec![exact];
    }

    let ring = (limit - 1).div_ceil(2);
    let mut offset = (iteration.max(1) - 1) * ring + 1;
    let exact = exact as usize;
    let mut out = vec![exact as u16];
    while out.len() < limit {
        let up = exact + offset;
        let down = exact.checked_sub(offset).filter(|d| *d > 0);
        if up > 256 && down.is_none() {
            break;
        }
        if up <= 256 {
            out.push(up as u16);
        }
        if out.len() < limit
            && let Some(down) = down
        {
            out.push(down as u16);
        }
        offset += 1;
    }
    out
}

// ============================================================================
// Driver
// ============================================================================

/// Result of a driven lookup.
#[derive(Debug, Default)]
pub struct LookupOutcome {
    /// Peers that answered, nearest to the target first.
    pub closest: Vec<NodeRecord>,
    /// Every record learned along the way, seeds included.
    pub discovered: HashMap<NodeId, NodeRecord>,
}

/// Run a lookup for `target` starting from `seeds`.
///
/// Each query is bounded by `per_peer_timeout` when given, and the lookup as a
/// whole by `lookup_timeout`, after which the peers found so far are returned.
pub async fn run<R>(
    rpc: R,
    target: NodeId,
    config: LookupConfig,
    seeds: Vec<NodeRecord>,
    per_peer_timeout: Option<Duration>,
    lookup_timeout: Duration,
) -> LookupOutcome
where
    R: DiscoveryRpc + Clone,
{
    let deadline = Instant::now() + lookup_timeout;
    let mut discovered: HashMap<NodeId, NodeRecord> =
        seeds.into_iter().map(|r| (r.node_id(), r)).collect();
    let mut lookup = Lookup::new(target, config, discovered.keys().copied());
    let mut queries = JoinSet::new();
    let mut in_flight = HashMap::new();

    loop {
        while let LookupPoll::Peer { node_id, iteration } = lookup.next_peer() {
            let Some(record) = discovered.get(&node_id).cloned() else {
                lookup.on_failure(&node_id);
                continue;
            };
            let distances = lookup.distances_for(&node_id, iteration);
            trace!(peer = %node_id.short(), iteration, ?distances, "lookup query");
            let rpc = rpc.clone();
            let handle = queries.spawn(async move {
                let query = rpc.find_node(&record, distances);
                let result = match per_peer_timeout {
                    Some(limit) => tokio::time::timeout(limit, query)
                        .await
                        .unwrap_or_else(|_| Err(anyhow!("query timeout"))),
                    None => query.await,
                };
                (node_id, result)
            });
            in_flight.insert(handle.id(), node_id);
        }

        if lookup.is_finished() || queries.is_empty() {
            break;
        }

        match tokio::time::timeout_at(deadline, queries.join_next_with_id()).await {
            Err(_) => {
                debug!(
                    target = ?hex::encode(&target.as_bytes()[..8]),
                    found = lookup.closest_nodes().len(),
                    "lookup timeout, returning current results"
                );
                lookup.finish();
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok((task, (peer, Ok(records)))))) => {
                in_flight.remove(&task);
                let mut reported = Vec::with_capacity(records.len());
                for record in records {
                    let id = record.node_id();
                    reported.push(id);
                    discovered
                        .entry(id)
                        .and_modify(|known| {
                            if record.seq > known.seq {
                                *known = record.clone();
                            }
                        })
                        .or_insert(record);
                }
                lookup.on_success(&peer, &reported);
            }
            Ok(Some(Ok((task, (peer, Err(e)))))) => {
                in_flight.remove(&task);
                trace!(peer = %peer.short(), error = %e, "lookup query failed");
                lookup.on_failure(&peer);
            }
            Ok(Some(Err(e))) => {
                if let Some(peer) = in_flight.remove(&e.id()) {
                    debug!(peer = %peer.short(), error = %e, "lookup query aborted");
                    lookup.on_failure(&peer);
                }
            }
        }
    }
    queries.abort_all();

    let closest = lookup
        .closest_nodes()
        .iter()
        .filter_map(|id| discovered.get(id).cloned())
        .collect();
    LookupOutcome { closest, discovered }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;

    use crate::identity::{Keypair, distance_cmp};

    fn id_with_byte(index: usize, value: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[index] = value;
        NodeId::from_bytes(bytes)
    }

    fn sorted_by_distance(target: &NodeId, mut ids: Vec<NodeId>) -> Vec<NodeId> {
        ids.sort_by(|a, b| distance_cmp(&a.xor_distance(target), &b.xor_distance(target)));
        ids
    }

    /// Drain every peer the lookup is currently willing to query.
    fn poll_all(lookup: &mut Lookup) -> Vec<NodeId> {
        let mut out = Vec::new();
        while let LookupPoll::Peer { node_id, .. } = lookup.next_peer() {
            out.push(node_id);
        }
        out
    }

    #[test]
    fn terminates_when_seeded_peers_report_nothing() {
        let target = NodeId::random();
        let seeds: Vec<NodeId> = (0..16).map(|_| NodeId::random()).collect();
        let config = LookupConfig::default();
        let mut lookup = Lookup::new(target, config, seeds.clone());

        let mut rounds = 0;
        while !lookup.is_finished() {
            rounds += 1;
            let batch = poll_all(&mut lookup);
            assert!(!batch.is_empty() || lookup.is_finished());
            for peer in batch {
                lookup.on_success(&peer, &[]);
            }
            assert!(rounds <= config.parallelism, "lookup took {} rounds", rounds);
        }

        assert_eq!(lookup.closest_nodes(), sorted_by_distance(&target, seeds));
    }

    #[test]
    fn respects_parallelism_while_iterating() {
        let target = NodeId::random();
        let seeds: Vec<NodeId> = (0..10).map(|_| NodeId::random()).collect();
        let mut lookup = Lookup::new(target, LookupConfig::default(), seeds.clone());
        let first = poll_all(&mut lookup);
        assert_eq!(first.len(), 3);
        assert_eq!(lookup.num_peers_waiting(), 3);
        assert_eq!(first, sorted_by_distance(&target, seeds)[..3].to_vec());
        assert_eq!(lookup.next_peer(), LookupPoll::Waiting);
    }

    #[test]
    fn stalls_after_parallelism_unproductive_responses() {
        let target = NodeId::random();
        let seeds: Vec<NodeId> = (0..16).map(|_| NodeId::random()).collect();
        let mut lookup = Lookup::new(target, LookupConfig::default(), seeds);
        let first = poll_all(&mut lookup);
        for peer in &first[..2] {
            lookup.on_success(peer, &[]);
            assert_eq!(lookup.state(), LookupState::Iterating);
        }
        lookup.on_success(&first[2], &[]);
        assert_eq!(lookup.state(), LookupState::Stalled);

        // Stalled lookups may query up to num_results peers at once.
        let second = poll_all(&mut lookup);
        assert_eq!(second.len(), 13);
    }

    #[test]
    fn closer_peer_counts_as_progress() {
        let target = NodeId::from_bytes([0u8; 32]);
        let far: Vec<NodeId> = (1..=16u8).map(|i| id_with_byte(0, i)).collect();
        let mut lookup = Lookup::new(target, LookupConfig::default(), far.clone());
        let first = poll_all(&mut lookup);
        lookup.on_success(&first[0], &[]);
        lookup.on_success(&first[1], &[]);

        let closer = id_with_byte(31, 1);
        lookup.on_success(&first[2], &[closer]);
        assert_eq!(lookup.state(), LookupState::Iterating);
        assert_eq!(lookup.peer_state(&closer), Some(PeerState::NotContacted));
        assert_eq!(poll_all(&mut lookup)[0], closer);

        // Farther candidates are kept in reserve, not dropped.
        assert_eq!(lookup.peer_state(&far[15]), Some(PeerState::NotContacted));
    }

    #[test]
    fn new_peers_are_progress_until_enough_are_known() {
        let target = NodeId::from_bytes([0u8; 32]);
        let seed = id_with_byte(31, 1);
        let mut lookup = Lookup::new(target, LookupConfig::default(), [seed]);
        let LookupPoll::Peer { node_id, .. } = lookup.next_peer() else {
            panic!("expected a peer");
        };
        // Farther than the seed, but the lookup still has room.
        lookup.on_success(&node_id, &[id_with_byte(0, 1), id_with_byte(0, 2)]);
        assert_eq!(lookup.state(), LookupState::Iterating);
        assert_eq!(lookup.no_progress, 0);
    }

    #[test]
    fn failed_peers_never_return() {
        let target = NodeId::random();
        let seeds: Vec<NodeId> = (0..2).map(|_| NodeId::random()).collect();
        let mut lookup = Lookup::new(target, LookupConfig::default(), seeds.clone());
        let batch = poll_all(&mut lookup);
        lookup.on_failure(&batch[0]);
        lookup.on_success(&batch[1], &[batch[0]]);
        assert_eq!(lookup.peer_state(&batch[0]), Some(PeerState::Failed));
        assert_eq!(lookup.next_peer(), LookupPoll::Finished);
        assert_eq!(lookup.closest_nodes(), vec![batch[1]]);
    }

    #[test]
    fn failed_close_peers_leave_room_for_farther_ones() {
        let target = NodeId::from_bytes([0u8; 32]);
        let seed = id_with_byte(0, 1);
        let close: Vec<NodeId> = (1..=16u8).map(|i| id_with_byte(31, i)).collect();
        let far: Vec<NodeId> = (1..=8u8).map(|i| id_with_byte(1, i)).collect();
        let mut lookup = Lookup::new(target, LookupConfig::default(), [seed]);

        let first = poll_all(&mut lookup);
        assert_eq!(first, vec![seed]);
        let reported: Vec<NodeId> = close.iter().chain(&far).copied().collect();
        lookup.on_success(&seed, &reported);

        let mut rounds = 0;
        while !lookup.is_finished() {
            rounds += 1;
            assert!(rounds <= 64, "lookup did not finish");
            for peer in poll_all(&mut lookup) {
                if close.contains(&peer) {
                    lookup.on_failure(&peer);
                } else {
                    lookup.on_success(&peer, &[]);
                }
            }
        }

        let mut expected = far.clone();
        expected.push(seed);
        assert_eq!(lookup.closest_nodes(), sorted_by_distance(&target, expected));
    }

    #[test]
    fn all_failures_finish_with_empty_result() {
        let target = NodeId::random();
        let mut lookup = Lookup::new(target, LookupConfig::default(), (0..3).map(|_| NodeId::random()));
        for peer in poll_all(&mut lookup) {
            lookup.on_failure(&peer);
        }
        assert_eq!(lookup.next_peer(), LookupPoll::Finished);
        assert!(lookup.closest_nodes().is_empty());
    }

    #[test]
    fn empty_lookup_finishes_immediately() {
        let mut lookup = Lookup::new(NodeId::random(), LookupConfig::default(), []);
        assert_eq!(lookup.next_peer(), LookupPoll::Finished);
    }

    #[test]
    fn peers_are_requeried_up_to_iteration_cap() {
        let target = NodeId::random();
        let seed = NodeId::random();
        let config = LookupConfig {
            max_iterations_per_peer: 2,
            ..LookupConfig::default()
        };
        let mut lookup = Lookup::new(target, config, [seed]);
        assert_eq!(lookup.next_peer(), LookupPoll::Peer { node_id: seed, iteration: 1 });
        lookup.on_success(&seed, &[]);
        assert_eq!(lookup.peer_state(&seed), Some(PeerState::PendingIteration));
        assert_eq!(lookup.next_peer(), LookupPoll::Peer { node_id: seed, iteration: 2 });
        lookup.on_success(&seed, &[]);
        assert_eq!(lookup.peer_state(&seed), Some(PeerState::Succeeded));
        assert_eq!(lookup.next_peer(), LookupPoll::Finished);
    }

    #[test]
    fn late_results_after_finish_are_ignored() {
        let target = NodeId::random();
        let seed = NodeId::random();
        let mut lookup = Lookup::new(target, LookupConfig::default(), [seed]);
        let _ = lookup.next_peer();
        lookup.finish();
        lookup.on_success(&seed, &[NodeId::random()]);
        assert!(lookup.is_finished());
        assert!(lookup.closest_nodes().is_empty());
    }

    #[test]
    fn distances_include_exact_first() {
        let target = NodeId::from_bytes([0u8; 32]);
        let peer = id_with_byte(30, 1); // log2 distance 9
        assert_eq!(find_node_log2_distances(&target, &peer, 1, 3), vec![9, 10, 8]);
        assert_eq!(find_node_log2_distances(&target, &peer, 2, 3), vec![9, 11, 7]);
        assert_eq!(find_node_log2_distances(&target, &peer, 1, 1), vec![9]);
        assert_eq!(find_node_log2_distances(&target, &target, 1, 3), vec![0]);
    }

    #[test]
    fn distances_stay_in_range() {
        let target = NodeId::from_bytes([0u8; 32]);
        let top = id_with_byte(0, 0x80); // distance 256
        assert_eq!(find_node_log2_distances(&target, &top, 1, 3), vec![256, 255, 254]);
        let bottom = id_with_byte(31, 1); // distance 1
        assert_eq!(find_node_log2_distances(&target, &bottom, 1, 3), vec![1, 2, 3]);
        for iteration in 1..200 {
            let distances = find_node_log2_distances(&target, &top, iteration, 5);
            assert!(distances.iter().all(|d| (1..=256).contains(d)));
            let unique: HashSet<u16> = distances.iter().copied().collect();
            assert_eq!(unique.len(), distances.len());
        }
    }

    // ------------------------------------------------------------------------
    // Driver against a simulated network
    // ------------------------------------------------------------------------

    #[derive(Clone, Default)]
    struct SimNetwork {
        tables: Arc<HashMap<NodeId, Vec<NodeRecord>>>,
        dead: Arc<HashSet<NodeId>>,
        hung: Arc<HashSet<NodeId>>,
        crashing: Arc<HashSet<NodeId>>,
    }

    #[async_trait]
    impl DiscoveryRpc for SimNetwork {
        async fn ping(&self, to: &NodeRecord) -> Result<u64> {
            Ok(to.seq)
        }

        async fn find_node(&self, to: &NodeRecord, distances: Vec<u16>) -> Result<Vec<NodeRecord>> {
            let id = to.node_id();
            if self.hung.contains(&id) {
                std::future::pending::<()>().await;
            }
            if self.crashing.contains(&id) {
                panic!("find_node handler crashed");
            }
            if self.dead.contains(&id) {
                return Err(anyhow!("unreachable"));
            }
            let known = self.tables.get(&id).ok_or_else(|| anyhow!("unknown peer"))?;
            Ok(known
                .iter()
                .filter(|r| distances.contains(&id.log2_distance(&r.node_id())))
                .take(16)
                .cloned()
                .collect())
        }

        async fn talk_req(&self, _to: &NodeRecord, _protocol: Vec<u8>, _payload: Vec<u8>) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn records(n: usize) -> Vec<NodeRecord> {
        (0..n)
            .map(|i| {
                let addr = SocketAddr::from(([127, 0, 0, 1], 9000 + i as u16));
                Keypair::generate().create_record(1, Some(addr))
            })
            .collect()
    }

    /// Every node knows every other node.
    fn full_mesh(records: &[NodeRecord]) -> HashMap<NodeId, Vec<NodeRecord>> {
        records
            .iter()
            .map(|r| {
                let others = records.iter().filter(|o| o.node_id() != r.node_id()).cloned().collect();
                (r.node_id(), others)
            })
            .collect()
    }

    fn assert_sorted(target: &NodeId, found: &[NodeRecord]) {
        for pair in found.windows(2) {
            assert!(pair[0].node_id().xor_distance(target) < pair[1].node_id().xor_distance(target));
        }
    }

    #[tokio::test]
    async fn driven_lookup_finds_the_target() {
        let nodes = records(12);
        let target = nodes[0].node_id();
        let network = SimNetwork {
            tables: Arc::new(full_mesh(&nodes)),
            ..SimNetwork::default()
        };

        let outcome = run(
            network,
            target,
            LookupConfig::default(),
            nodes[1..4].to_vec(),
            None,
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(outcome.closest[0].node_id(), target);
        assert_sorted(&target, &outcome.closest);
        assert!(outcome.discovered.contains_key(&target));
    }

    #[tokio::test]
    async fn driven_lookup_skips_dead_peers() {
        let nodes = records(12);
        let target = nodes[0].node_id();
        let dead: HashSet<NodeId> = nodes[8..].iter().map(|r| r.node_id()).collect();
        let network = SimNetwork {
            tables: Arc::new(full_mesh(&nodes)),
            dead: Arc::new(dead.clone()),
            ..SimNetwork::default()
        };

        let outcome = run(
            network,
            target,
            LookupConfig::default(),
            nodes[1..].to_vec(),
            None,
            Duration::from_secs(5),
        )
        .await;

        assert!(outcome.closest.iter().all(|r| !dead.contains(&r.node_id())));
        assert_eq!(outcome.closest.len(), 8);
        assert_sorted(&target, &outcome.closest);
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_timeout_returns_partial_results() {
        let nodes = records(5);
        let hung: HashSet<NodeId> = nodes[..2].iter().map(|r| r.node_id()).collect();
        let tables = nodes.iter().map(|r| (r.node_id(), Vec::new())).collect();
        let network = SimNetwork {
            tables: Arc::new(tables),
            hung: Arc::new(hung.clone()),
            ..SimNetwork::default()
        };
        let target = NodeId::random();

        let started = Instant::now();
        let outcome = run(
            network.clone(),
            target,
            LookupConfig::default(),
            nodes.clone(),
            None,
            Duration::from_secs(10),
        )
        .await;
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(outcome.closest.len(), 3);
        assert!(outcome.closest.iter().all(|r| !hung.contains(&r.node_id())));

        // A per-peer bound turns hung peers into failures long before the
        // lookup deadline.
        let started = Instant::now();
        let outcome = run(
            network,
            target,
            LookupConfig::default(),
            nodes,
            Some(Duration::from_secs(1)),
            Duration::from_secs(10),
        )
        .await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.closest.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_query_fails_its_peer_without_waiting_for_the_deadline() {
        let nodes = records(6);
        let crashing: HashSet<NodeId> = [nodes[0].node_id()].into();
        let tables = nodes.iter().map(|r| (r.node_id(), Vec::new())).collect();
        let network = SimNetwork {
            tables: Arc::new(tables),
            crashing: Arc::new(crashing),
            ..SimNetwork::default()
        };

        let started = Instant::now();
        let outcome = run(
            network,
            NodeId::random(),
            LookupConfig::default(),
            nodes.clone(),
            None,
            Duration::from_secs(60),
        )
        .await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(outcome.closest.len(), 5);
        assert!(outcome.closest.iter().all(|r| r.node_id() != nodes[0].node_id()));
    }
}
