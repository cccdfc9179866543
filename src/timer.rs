//! Keyed deadlines for the service actor.
//!
//! Each key has at most one deadline. Scheduling a key again replaces its
//! deadline and removing it cancels it, so there are no captured callbacks to
//! invalidate. The actor sleeps until [`TimerTasks::next_deadline`] and then
//! drains [`TimerTasks::poll_expired`].

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;

use tokio::time::Instant;

#[derive(Debug)]
pub struct TimerTasks<K> {
    /// Live deadline and sequence number per key.
    deadlines: HashMap<K, (Instant, u64)>,
    /// Heap of `(deadline, seq)`; entries whose seq no longer matches are stale.
    queue: BinaryHeap<Reverse<(Instant, u64)>>,
    keys: HashMap<u64, K>,
    next_seq: u64,
}

impl<K: Eq + Hash + Clone> Default for TimerTasks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> TimerTasks<K> {
    pub fn new() -> Self {
        Self {
            deadlines: HashMap::new(),
            queue: BinaryHeap::new(),
            keys: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Schedule `key` at `deadline`, replacing any earlier schedule.
    pub fn insert(&mut self, key: K, deadline: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some((_, old_seq)) = self.deadlines.insert(key.clone(), (deadline, seq)) {
            self.keys.remove(&old_seq);
        }
        self.keys.insert(seq, key);
        self.queue.push(Reverse((deadline, seq)));
    }

    /// Cancel `key`. Returns its deadline if it was scheduled.
    pub fn remove(&mut self, key: &K) -> Option<Instant> {
        let (deadline, seq) = self.deadlines.remove(key)?;
        self.keys.remove(&seq);
        Some(deadline)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.deadlines.contains_key(key)
    }

    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.deadlines.get(key).map(|(deadline, _)| *deadline)
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.drop_stale();
        self.queue.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Remove and return every key whose deadline is at or before `now`,
    /// earliest first.
    pub fn poll_expired(&mut self, now: Instant) -> Vec<K> {
        let mut expired = Vec::new();
        loop {
            self.drop_stale();
            match self.queue.peek() {
                Some(Reverse((deadline, _))) if *deadline <= now => {}
                _ => break,
            }
            if let Some(Reverse((_, seq))) = self.queue.pop()
                && let Some(key) = self.keys.remove(&seq)
            {
                self.deadlines.remove(&key);
                expired.push(key);
            }
        }
        expired
    }

    fn drop_stale(&mut self) {
        while let Some(Reverse((_, seq))) = self.queue.peek() {
            if self.keys.contains_key(seq) {
                break;
            }
            self.queue.pop();
        }
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
        self.queue.clear();
        self.keys.clear();
    }
}
