use std::{net::SocketAddrV4, time::Duration};

use crate::common::{Id, DEFAULT_K};

use super::DEFAULT_REQUEST_TIMEOUT;

/// Default number of threads handling incoming requests.
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// This node's Id.
    ///
    /// Defaults to None, where a random Id is generated.
    pub id: Option<Id>,
    /// Address to bind the UDP socket to.
    ///
    /// Defaults to `0.0.0.0:0`
    pub address: SocketAddrV4,
    /// Bucket capacity, and the number of closest nodes returned in responses.
    ///
    /// Defaults to [DEFAULT_K]
    pub k: usize,
    /// UDP socket request timeout duration.
    ///
    /// The shorter this duration is, the faster unreachable nodes are skipped,
    /// at the cost of missing responses from busy nodes.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Number of threads handling incoming requests in parallel.
    ///
    /// Defaults to [DEFAULT_WORKERS]
    pub workers: usize,
    /// How [crate::Dht::get] picks the next node to query.
    ///
    /// Defaults to [LookupStrategy::Nearest]
    pub lookup: LookupStrategy,
    /// Nodes to join when the node starts.
    ///
    /// Defaults to an empty list, where the node starts as the first node of a network.
    pub bootstrap: Vec<SocketAddrV4>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: None,
            address: SocketAddrV4::new([0, 0, 0, 0].into(), 0),
            k: DEFAULT_K,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            workers: DEFAULT_WORKERS,
            lookup: LookupStrategy::default(),
            bootstrap: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Candidate selection policy of the iterative lookup in [crate::Dht::get].
pub enum LookupStrategy {
    /// After every response, query the closest unvisited node known to the routing table,
    /// ranked by distance to the key over the whole table.
    ///
    /// Keeps going until every known node was visited, so newly learned nodes are
    /// always considered.
    #[default]
    Nearest,
    /// Only ever query the first `k` nodes of the routing table,
    /// scanning buckets from the closest to this node, without ranking by distance to the key.
    ///
    /// Cheap, but can stop early in networks larger than a few buckets.
    Cached,
}
