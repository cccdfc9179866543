//! Service configuration.
//!
//! | Setting | Default |
//! |---------|---------|
//! | `request_timeout` | 1 s |
//! | `session_timeout` | 24 h |
//! | `session_cache_capacity` | 1000 |
//! | `challenge_timeout` | 2 × `request_timeout` |
//! | `pending_eviction_timeout` | `request_timeout` |
//! | `lookup_parallelism` | 3 |
//! | `lookup_num_results` | 16 |
//! | `lookup_request_limit` | 3 |
//! | `lookup_max_iterations_per_peer` | 1 |
//! | `lookup_timeout` | 60 s |
//! | `ping_interval` | 300 s |
//! | `enr_update` | true |
//! | `addr_votes_to_update_enr` | 10 |
//! | `bucket_size` | 16 |
//! | `max_nodes_response` | 16 |

use std::time::Duration;

use crate::lookup::LookupConfig;
use crate::routing::DEFAULT_BUCKET_SIZE;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(86_400);
pub const DEFAULT_SESSION_CACHE_CAPACITY: usize = 1_000;
pub const DEFAULT_LOOKUP_PARALLELISM: usize = 3;
pub const DEFAULT_LOOKUP_NUM_RESULTS: usize = 16;
pub const DEFAULT_LOOKUP_REQUEST_LIMIT: usize = 3;
pub const DEFAULT_LOOKUP_MAX_ITERATIONS_PER_PEER: usize = 1;
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_ADDR_VOTES_TO_UPDATE_ENR: usize = 10;
/// Records returned per FINDNODE, across all pages.
pub const DEFAULT_MAX_NODES_RESPONSE: usize = 16;

#[derive(Debug, Clone)]
pub struct Config {
    pub request_timeout: Duration,
    pub session_timeout: Duration,
    pub session_cache_capacity: usize,
    /// How long a sent challenge waits for the handshake.
    pub challenge_timeout: Duration,
    /// How long a Disconnected entry has to answer before a pending entry
    /// replaces it.
    pub pending_eviction_timeout: Duration,
    pub lookup_parallelism: usize,
    pub lookup_num_results: usize,
    pub lookup_request_limit: usize,
    pub lookup_max_iterations_per_peer: usize,
    pub lookup_timeout: Duration,
    pub ping_interval: Duration,
    /// Update the local record address from PONG votes.
    pub enr_update: bool,
    pub addr_votes_to_update_enr: usize,
    pub bucket_size: usize,
    pub max_nodes_response: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_request_timeout(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl Config {
    /// Defaults, with the timeouts derived from `request_timeout` scaled
    /// accordingly.
    pub fn with_request_timeout(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            session_cache_capacity: DEFAULT_SESSION_CACHE_CAPACITY,
            challenge_timeout: request_timeout * 2,
            pending_eviction_timeout: request_timeout,
            lookup_parallelism: DEFAULT_LOOKUP_PARALLELISM,
            lookup_num_results: DEFAULT_LOOKUP_NUM_RESULTS,
            lookup_request_limit: DEFAULT_LOOKUP_REQUEST_LIMIT,
            lookup_max_iterations_per_peer: DEFAULT_LOOKUP_MAX_ITERATIONS_PER_PEER,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            enr_update: true,
            addr_votes_to_update_enr: DEFAULT_ADDR_VOTES_TO_UPDATE_ENR,
            bucket_size: DEFAULT_BUCKET_SIZE,
            max_nodes_response: DEFAULT_MAX_NODES_RESPONSE,
        }
    }

    pub fn lookup_config(&self) -> LookupConfig {
        LookupConfig {
            parallelism: self.lookup_parallelism,
            num_results: self.lookup_num_results,
            max_iterations_per_peer: self.lookup_max_iterations_per_peer,
            request_limit: self.lookup_request_limit,
        }
    }
}

/// Settings of the parallel node lookup used by networks layered on top of
/// discovery, which probe every discovered peer before admitting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLookupConfig {
    pub parallelism: usize,
    pub per_peer_timeout: Duration,
    pub max_peers: usize,
}

impl Default for NodeLookupConfig {
    fn default() -> Self {
        Self {
            parallelism: 3,
            per_peer_timeout: Duration::from_secs(3),
            max_peers: 16,
        }
    }
}

impl NodeLookupConfig {
    pub fn lookup_config(&self) -> LookupConfig {
        LookupConfig {
            parallelism: self.parallelism,
            num_results: self.max_peers,
            max_iterations_per_peer: 1,
            request_limit: DEFAULT_LOOKUP_REQUEST_LIMIT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_timeouts_follow_request_timeout() {
        let config = Config::with_request_timeout(Duration::from_millis(300));
        assert_eq!(config.challenge_timeout, Duration::from_millis(600));
        assert_eq!(config.pending_eviction_timeout, Duration::from_millis(300));

        let defaults = Config::default();
        assert_eq!(defaults.challenge_timeout, Duration::from_secs(2));
        assert_eq!(defaults.lookup_config(), LookupConfig::default());
    }
}
