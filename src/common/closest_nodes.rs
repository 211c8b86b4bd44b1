use std::vec::IntoIter;

use crate::common::{Id, NodeRef, N_CONTACTS};

/// Bounded list of the contacts closest to a target, sorted by ascending XOR distance.
///
/// This is the only ranking mechanism: routing table scans and lookup shortlists both
/// fold contacts in through [ClosestNodes::add].
#[derive(Debug, Clone)]
pub struct ClosestNodes {
    target: Id,
    nodes: Vec<NodeRef>,
}

impl ClosestNodes {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            nodes: Vec::with_capacity(N_CONTACTS),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn nodes(&self) -> &[NodeRef] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.nodes.iter().any(|node| &node.id == id)
    }

    // === Public Methods ===

    /// Insertion-sort `node` by distance to the target, unless its id is already present.
    ///
    /// Entries pushed past [N_CONTACTS] are dropped.
    pub fn add(&mut self, node: NodeRef) {
        if self.contains(&node.id) {
            return;
        }

        let seek = node.id.distance(&self.target);

        match self
            .nodes
            .iter()
            .position(|probe| seek.less(&probe.id.distance(&self.target)))
        {
            Some(index) => {
                self.nodes.insert(index, node);
                self.nodes.truncate(N_CONTACTS);
            }
            None if self.nodes.len() < N_CONTACTS => self.nodes.push(node),
            None => {}
        }
    }

    /// Merge every entry of `src` with [Self::add].
    pub fn merge<I: IntoIterator<Item = NodeRef>>(&mut self, src: I) {
        for node in src {
            self.add(node);
        }
    }
}

impl IntoIterator for ClosestNodes {
    type Item = NodeRef;
    type IntoIter = IntoIter<NodeRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClosestNodes {
    type Item = &'a NodeRef;
    type IntoIter = std::slice::Iter<'a, NodeRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}
