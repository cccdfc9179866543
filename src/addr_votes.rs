//! External address voting.
//!
//! Every PONG reports the address the remote saw us at. Each voter holds one
//! live vote (its latest), the voter set is bounded, and once an address
//! collects enough votes the caller updates the local record and clears the
//! tally.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::identity::NodeId;

/// Most voters remembered at once; the least recent voter is forgotten first.
pub const MAX_VOTERS: usize = 200;

#[derive(Debug)]
pub struct AddrVotes {
    votes: LruCache<NodeId, SocketAddr>,
    tallies: HashMap<SocketAddr, usize>,
    threshold: usize,
}

impl AddrVotes {
    pub fn new(threshold: usize) -> Self {
        let cap = NonZeroUsize::new(MAX_VOTERS).unwrap_or(NonZeroUsize::MIN);
        Self {
            votes: LruCache::new(cap),
            tallies: HashMap::new(),
            threshold: threshold.max(1),
        }
    }

    /// Record `voter`'s observation of our address. Returns true once
    /// `addr` has reached the threshold.
    pub fn add_vote(&mut self, voter: NodeId, addr: SocketAddr) -> bool {
        if let Some((_, dropped)) = self.votes.push(voter, addr) {
            self.decrement(dropped);
        }
        let count = self.tallies.entry(addr).or_insert(0);
        *count += 1;
        *count >= self.threshold
    }

    fn decrement(&mut self, addr: SocketAddr) {
        if let Some(count) = self.tallies.get_mut(&addr) {
            *count -= 1;
            if *count == 0 {
                self.tallies.remove(&addr);
            }
        }
    }

    pub fn votes_for(&self, addr: &SocketAddr) -> usize {
        self.tallies.get(addr).copied().unwrap_or(0)
    }

    /// Address with the most votes.
    pub fn best(&self) -> Option<(SocketAddr, usize)> {
        self.tallies
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(addr, count)| (*addr, *count))
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    pub fn clear(&mut self) {
        self.votes.clear();
        self.tallies.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([203, 0, 113, 7], port))
    }

    #[test]
    fn reaches_threshold_with_distinct_voters() {
        let mut votes = AddrVotes::new(3);
        assert!(!votes.add_vote(NodeId::random(), addr(1)));
        assert!(!votes.add_vote(NodeId::random(), addr(1)));
        assert!(votes.add_vote(NodeId::random(), addr(1)));
    }

    #[test]
    fn latest_vote_replaces_earlier_one() {
        let mut votes = AddrVotes::new(2);
        let voter = NodeId::random();
        assert!(!votes.add_vote(voter, addr(1)));
        assert!(!votes.add_vote(voter, addr(1)));
        assert_eq!(votes.votes_for(&addr(1)), 1);

        assert!(!votes.add_vote(voter, addr(2)));
        assert_eq!(votes.votes_for(&addr(1)), 0);
        assert_eq!(votes.votes_for(&addr(2)), 1);
        assert_eq!(votes.best(), Some((addr(2), 1)));
    }

    #[test]
    fn voter_set_is_bounded() {
        let mut votes = AddrVotes::new(MAX_VOTERS + 1);
        for i in 0..(MAX_VOTERS + 50) {
            votes.add_vote(NodeId::random(), addr(i as u16 % 3));
        }
        assert_eq!(votes.len(), MAX_VOTERS);
        let total: usize = (0..3).map(|p| votes.votes_for(&addr(p))).sum();
        assert_eq!(total, MAX_VOTERS);
    }

    #[test]
    fn clear_resets_tally() {
        let mut votes = AddrVotes::new(1);
        assert!(votes.add_vote(NodeId::random(), addr(9)));
        votes.clear();
        assert!(votes.is_empty());
        assert_eq!(votes.best(), None);
    }
}
