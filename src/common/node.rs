//! Struct and implementation of the Node entry in the Kademlia routing table
use std::{
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
    net::SocketAddrV4,
};

use crate::common::Id;

#[derive(Debug, Clone, Copy)]
/// Node entry in Kademlia routing table.
///
/// Two nodes are equal if they have the same [Id], regardless of their address.
pub struct Node {
    pub id: Id,
    pub address: SocketAddrV4,
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddrV4) -> Node {
        Node { id, address }
    }

    /// Creates a node with random Id for testing purposes.
    pub fn random() -> Node {
        Node {
            id: Id::random(),
            address: SocketAddrV4::new(0.into(), 0),
        }
    }

    /// Creates a node with a given Id and a loopback address for testing purposes.
    #[cfg(test)]
    pub(crate) fn with_id(id: u64) -> Node {
        Node {
            id: Id(id),
            address: SocketAddrV4::new([127, 0, 0, 1].into(), 6900_u16.wrapping_add(id as u16)),
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn equality_by_id() {
        let a = Node::new(Id(7), "127.0.0.1:1".parse().unwrap());
        let b = Node::new(Id(7), "127.0.0.1:2".parse().unwrap());

        assert_eq!(a, b);

        let set: HashSet<Node> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn display() {
        let node = Node::new(Id(3), "127.0.0.1:6901".parse().unwrap());

        assert_eq!(node.to_string(), "3@127.0.0.1:6901");
    }
}
