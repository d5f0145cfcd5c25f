use crate::common::{Id, Node};

#[derive(Debug, Clone)]
/// Nodes sorted by ascending XOR distance to a target, without duplicate ids.
pub struct ClosestNodes {
    target: Id,
    nodes: Vec<Node>,
}

impl ClosestNodes {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            nodes: Vec::new(),
        }
    }

    // === Getters ===

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // === Public Methods ===

    /// Insert a node at its position by distance, ignoring it if its id is already present.
    ///
    /// Nodes at equal distance keep their insertion order.
    pub fn add(&mut self, node: Node) {
        if self.nodes.iter().any(|n| n.id == node.id) {
            return;
        }

        let seek = node.id.xor(&self.target);
        let pos = self
            .nodes
            .partition_point(|probe| probe.id.xor(&self.target) <= seek);

        self.nodes.insert(pos, node);
    }

    /// Consume and return the first `limit` nodes.
    pub fn take(mut self, limit: usize) -> Vec<Node> {
        self.nodes.truncate(limit);
        self.nodes
    }
}

impl Extend<Node> for ClosestNodes {
    fn extend<T: IntoIterator<Item = Node>>(&mut self, iter: T) {
        for node in iter {
            self.add(node)
        }
    }
}
