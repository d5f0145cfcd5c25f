use std::net::SocketAddrV4;

use crate::Id;

use super::Rpc;

/// Information and statistics about this node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addr: SocketAddrV4,
    k: usize,
    routing_table_size: usize,
    stored_values: usize,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }
    /// Local UDP Ipv4 socket address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }
    /// Bucket capacity of this node's routing table.
    pub fn k(&self) -> usize {
        self.k
    }
    /// Number of nodes currently in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }
    /// Number of values this node is responsible for.
    pub fn stored_values(&self) -> usize {
        self.stored_values
    }
}

impl From<&Rpc> for Info {
    fn from(rpc: &Rpc) -> Self {
        Self {
            id: *rpc.id(),
            local_addr: rpc.local_addr(),
            k: rpc.routing_table().k(),
            routing_table_size: rpc.routing_table().size(),
            stored_values: rpc.store().len(),
        }
    }
}
