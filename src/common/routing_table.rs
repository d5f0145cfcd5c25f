//! Kademlia routing table with one lock per bucket

use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};

use parking_lot::Mutex;
use tracing::trace;

use crate::common::{ClosestNodes, Id, Node, ID_BITS};

/// K = the default maximum size of a k-bucket, and the number of
/// closest nodes returned in lookups.
pub const DEFAULT_K: usize = 2;

#[derive(Debug)]
/// Kademlia routing table.
///
/// Holds exactly [ID_BITS] buckets, where the bucket at index `i` contains nodes whose
/// XOR distance to this node has its most significant set bit at position `i`.
///
/// Every bucket is guarded by its own lock, which is only ever held for a single scan
/// or mutation of that bucket, so it is safe to share this table between threads
/// handling incoming requests and threads running outgoing queries.
pub struct RoutingTable {
    id: Id,
    k: usize,
    buckets: Box<[Mutex<KBucket>]>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id and bucket capacity `k`.
    pub fn new(id: Id, k: usize) -> Self {
        let buckets = (0..ID_BITS).map(|_| Mutex::new(KBucket::new(k))).collect();

        RoutingTable { id, k, buckets }
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Returns the maximum size of each bucket.
    pub fn k(&self) -> usize {
        self.k
    }

    // === Public Methods ===

    /// Mark a node as the most recently seen node of its bucket.
    ///
    /// If the node is already known, it is moved to the front of its bucket (and its
    /// address updated), otherwise it is inserted at the front and the least recently
    /// seen node is evicted if the bucket is over capacity.
    ///
    /// Refreshing this node's own id is a no-op.
    pub fn refresh(&self, node: Node) {
        let Some(index) = self.id.bucket_index(&node.id) else {
            return;
        };

        let evicted = self.buckets[index].lock().refresh(node);

        if let Some(evicted) = evicted {
            trace!(?evicted, bucket = index, "Evicted least recently seen node");
        }
    }

    /// Remove a node from this routing table, returns `true` if it was present.
    pub fn remove(&self, node_id: &Id) -> bool {
        match self.id.bucket_index(node_id) {
            Some(index) => self.buckets[index].lock().remove(node_id),
            None => false,
        }
    }

    /// Returns `true` if a node with this id is in the routing table.
    pub fn contains(&self, node_id: &Id) -> bool {
        match self.id.bucket_index(node_id) {
            Some(index) => self.buckets[index].lock().contains(node_id),
            None => false,
        }
    }

    /// Return up to `limit` known nodes, sorted by ascending distance to the `target`.
    pub fn k_closest_known(&self, target: &Id, limit: usize) -> Vec<Node> {
        let mut closest = ClosestNodes::new(*target);

        for bucket in self.buckets.iter() {
            closest.extend(bucket.lock().iter().copied());
        }

        closest.take(limit)
    }

    /// Return up to `limit` known nodes scanning buckets from the closest to this node,
    /// without sorting them by distance to any target.
    pub fn some_known(&self, limit: usize) -> Vec<Node> {
        let mut nodes = Vec::with_capacity(limit);

        for bucket in self.buckets.iter() {
            if nodes.len() >= limit {
                break;
            }

            let bucket = bucket.lock();
            nodes.extend(bucket.iter().take(limit - nodes.len()).copied());
        }

        nodes
    }

    /// All known nodes and this node itself (with the given address),
    /// sorted by ascending distance to the `target`.
    pub fn closest_including_self(&self, target: &Id, local: Node) -> Vec<Node> {
        let mut closest = ClosestNodes::new(*target);

        closest.add(local);

        for bucket in self.buckets.iter() {
            closest.extend(bucket.lock().iter().copied());
        }

        closest.take(usize::MAX)
    }

    /// Copy of a single bucket's nodes, most recently seen first.
    pub fn bucket(&self, index: usize) -> Vec<Node> {
        self.buckets
            .get(index)
            .map(|bucket| bucket.lock().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Copy every bucket's nodes, taking and releasing one bucket lock at a time.
    pub fn snapshot(&self) -> Vec<Vec<Node>> {
        self.buckets
            .iter()
            .map(|bucket| bucket.lock().iter().copied().collect())
            .collect()
    }

    /// Export an owned vector of all nodes in this routing table.
    pub fn to_owned_nodes(&self) -> Vec<Node> {
        self.snapshot().into_iter().flatten().collect()
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.lock().is_empty())
    }

    /// Return the number of nodes in this routing table.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.lock().len()).sum()
    }
}

impl Display for RoutingTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "=========================================")?;
        for (index, bucket) in self.snapshot().iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }

            write!(f, "{index} ")?;
            for node in bucket {
                write!(f, "{}:{}, ", node.id, node.address)?;
            }
            writeln!(f)?;
        }
        write!(f, "=========================================")
    }
}

/// A k-bucket keeps the `k` most recently seen nodes at a given distance range,
/// most recently seen first.
#[derive(Debug, Clone)]
pub struct KBucket {
    k: usize,
    nodes: VecDeque<Node>,
}

impl KBucket {
    pub fn new(k: usize) -> Self {
        KBucket {
            k,
            nodes: VecDeque::with_capacity(k + 1),
        }
    }

    // === Public Methods ===

    /// Move or insert `incoming` at the front, returns the evicted node if any.
    pub fn refresh(&mut self, incoming: Node) -> Option<Node> {
        self.remove(&incoming.id);
        self.nodes.push_front(incoming);

        let mut evicted = None;
        while self.nodes.len() > self.k {
            evicted = self.nodes.pop_back();
        }
        evicted
    }

    pub fn remove(&mut self, node_id: &Id) -> bool {
        match self.nodes.iter().position(|node| &node.id == node_id) {
            Some(index) => {
                self.nodes.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, node_id: &Id) -> bool {
        self.nodes.iter().any(|node| &node.id == node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
