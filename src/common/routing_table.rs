//! Self-splitting binary trie of k-buckets.
//!
//! Every leaf owns one [Bucket] covering the half-open range `[min, max)` of the id space.
//! Leaves are split at the exact midpoint of their range when they fill up while covering
//! this node's own id; full leaves away from our id rotate their contacts instead.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use crate::common::{
    ClosestNodes, Contact, ContactHandle, ContactRegistry, Id, NodeRef, MAX_CONTACTS,
};
use crate::rpc::Link;
use crate::Result;

/// K = the maximum size of a bucket.
pub const N_CONTACTS: usize = 5;

#[derive(Debug, Clone)]
/// Simplified Kademlia routing table
pub struct RoutingTable {
    id: Id,
    /// Trie arena, the root lives at index 0 once the first contact arrives.
    nodes: Vec<TreeNode>,
    registry: ContactRegistry,
}

#[derive(Debug, Clone)]
struct TreeNode {
    min: Id,
    max: Id,
    branch: Branch,
}

#[derive(Debug, Clone)]
enum Branch {
    Leaf(Bucket),
    /// Indices of the `[min, mid)` and `[mid, max)` children.
    Split([usize; 2]),
}

/// A leaf of the routing table, as returned by [RoutingTable::leaves].
#[derive(Debug, Clone)]
pub struct Leaf {
    pub min: Id,
    pub max: Id,
    pub contacts: Vec<Contact>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        Self::with_capacity(id, MAX_CONTACTS)
    }

    /// Create a new [RoutingTable] whose registry holds at most `max_contacts`.
    pub fn with_capacity(id: Id, max_contacts: usize) -> Self {
        RoutingTable {
            id,
            nodes: Vec::new(),
            registry: ContactRegistry::new(max_contacts),
        }
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn registry(&self) -> &ContactRegistry {
        &self.registry
    }

    pub fn get(&self, handle: ContactHandle) -> Option<&Contact> {
        self.registry.get(handle)
    }

    /// Returns `true` if no tree node has been allocated yet.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of contacts referenced by buckets.
    pub fn size(&self) -> usize {
        self.buckets().map(|(_, bucket)| bucket.len()).sum()
    }

    /// Returns the bucket whose range covers `id`, or None if the table is empty.
    pub fn find_bucket(&self, id: &Id) -> Option<&Bucket> {
        self.find_leaf(id).and_then(|index| self.bucket(index))
    }

    /// Returns the handle of the bucket contact with this id.
    pub fn find(&self, id: &Id) -> Option<ContactHandle> {
        self.find_bucket(id)
            .and_then(|bucket| self.position_in(bucket, id))
    }

    /// Leaves from the lowest range to the highest.
    pub fn leaves(&self) -> Vec<Leaf> {
        let mut leaves = Vec::new();
        if self.nodes.is_empty() {
            return leaves;
        }

        let mut stack = vec![0];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            match &node.branch {
                Branch::Split([left, right]) => {
                    stack.push(*right);
                    stack.push(*left);
                }
                Branch::Leaf(bucket) => leaves.push(Leaf {
                    min: node.min,
                    max: node.max,
                    contacts: bucket
                        .iter()
                        .filter_map(|handle| self.registry.get(*handle).cloned())
                        .collect(),
                }),
            }
        }

        leaves
    }

    /// Every contact referenced by a bucket.
    pub fn contacts(&self) -> Vec<Contact> {
        self.leaves()
            .into_iter()
            .flat_map(|leaf| leaf.contacts)
            .collect()
    }

    // === Public Methods ===

    /// Add a contact, returning the handle of its registry slot.
    ///
    /// Returns `Ok(None)` for our own id, and the existing handle if a bucket already
    /// holds this id.
    pub fn add(&mut self, contact: Contact) -> Result<Option<ContactHandle>> {
        if contact.id() == &self.id {
            return Ok(None);
        }

        if self.nodes.is_empty() {
            self.nodes.push(TreeNode {
                min: Id::MIN,
                max: Id::MAX,
                branch: Branch::Leaf(Bucket::new()),
            });
        }

        let mut leaf = self.leaf_for(contact.id());

        if let Some(handle) = self
            .bucket(leaf)
            .and_then(|bucket| self.position_in(bucket, contact.id()))
        {
            return Ok(Some(handle));
        }

        let full = self.bucket(leaf).map(Bucket::is_full).unwrap_or(false);
        if full && self.id.in_range(&self.nodes[leaf].min, &self.nodes[leaf].max) {
            self.split(leaf);
            leaf = self.leaf_for(contact.id());
        }

        let evicted = self.bucket(leaf).and_then(Bucket::next_evicted);
        if let Some(evicted) = evicted {
            self.registry.set_in_bucket(evicted, false);
        }

        let handle = match self.registry.insert(contact) {
            Ok(handle) => handle,
            Err(error) => {
                if let Some(evicted) = evicted {
                    self.registry.set_in_bucket(evicted, true);
                }
                return Err(error);
            }
        };
        self.registry.set_in_bucket(handle, true);

        if let Branch::Leaf(bucket) = &mut self.nodes[leaf].branch {
            bucket.insert(handle);
        }

        Ok(Some(handle))
    }

    /// Return the closest contacts to the target.
    pub fn closest(&self, target: &Id) -> ClosestNodes {
        let mut closest = ClosestNodes::new(*target);

        for (_, bucket) in self.buckets() {
            closest.merge(bucket.iter().filter_map(|handle| self.node_ref(*handle)));
        }

        closest
    }

    pub fn node_ref(&self, handle: ContactHandle) -> Option<NodeRef> {
        self.registry.get(handle).map(|contact| NodeRef {
            handle,
            id: *contact.id(),
            address: contact.address(),
        })
    }

    /// Record a successful exchange with this contact.
    pub fn touch(&mut self, handle: ContactHandle) {
        if let Some(contact) = self.registry.get_mut(handle) {
            contact.touch();
        }
    }

    /// Bind the Link that reached this contact.
    pub fn bind_link(&mut self, handle: ContactHandle, link: Arc<Link>) {
        if let Some(contact) = self.registry.get_mut(handle) {
            contact.bind_link(link);
        }
    }

    pub fn mark_offline(&mut self, handle: ContactHandle) {
        if let Some(contact) = self.registry.get_mut(handle) {
            contact.mark_offline();
        }
    }

    /// Mark contacts whose Link died as offline.
    pub fn clean(&mut self) -> usize {
        self.registry.clean()
    }

    // === Private Methods ===

    fn find_leaf(&self, id: &Id) -> Option<usize> {
        if self.nodes.is_empty() {
            return None;
        }

        let mut index = 0;
        loop {
            match &self.nodes[index].branch {
                Branch::Leaf(_) => return Some(index),
                Branch::Split([left, right]) => {
                    index = if id.less(&self.nodes[*left].max) {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    /// Same as find_leaf, for callers that already allocated the root.
    fn leaf_for(&self, id: &Id) -> usize {
        self.find_leaf(id).unwrap_or(0)
    }

    fn bucket(&self, index: usize) -> Option<&Bucket> {
        match &self.nodes[index].branch {
            Branch::Leaf(bucket) => Some(bucket),
            Branch::Split(_) => None,
        }
    }

    fn position_in(&self, bucket: &Bucket, id: &Id) -> Option<ContactHandle> {
        bucket
            .iter()
            .find(|handle| self.registry.get(**handle).map(|c| c.id()) == Some(id))
            .copied()
    }

    /// Split a full leaf at the midpoint of its range and redistribute its contacts.
    fn split(&mut self, index: usize) {
        let (min, max) = (self.nodes[index].min, self.nodes[index].max);
        let mid = Id::midpoint(&min, &max);

        // A single-id range can not be split any further.
        if mid == min {
            return;
        }

        let left = self.nodes.len();
        let right = left + 1;

        let old = match std::mem::replace(&mut self.nodes[index].branch, Branch::Split([left, right]))
        {
            Branch::Leaf(bucket) => bucket,
            split => {
                self.nodes[index].branch = split;
                return;
            }
        };

        let mut lower = Bucket::new();
        let mut upper = Bucket::new();

        for handle in old.iter() {
            match self.registry.get(*handle) {
                Some(contact) if contact.id().less(&mid) => {
                    lower.insert(*handle);
                }
                Some(_) => {
                    upper.insert(*handle);
                }
                None => {}
            }
        }

        self.nodes.push(TreeNode {
            min,
            max: mid,
            branch: Branch::Leaf(lower),
        });
        self.nodes.push(TreeNode {
            min: mid,
            max,
            branch: Branch::Leaf(upper),
        });
    }

    /// Explicit-stack walk over every leaf.
    fn buckets(&self) -> impl Iterator<Item = (usize, &Bucket)> {
        let mut stack = if self.nodes.is_empty() { vec![] } else { vec![0] };

        std::iter::from_fn(move || {
            while let Some(index) = stack.pop() {
                match &self.nodes[index].branch {
                    Branch::Split([left, right]) => {
                        stack.push(*left);
                        stack.push(*right);
                    }
                    Branch::Leaf(bucket) => return Some((index, bucket)),
                }
            }
            None
        })
    }
}

impl Display for RoutingTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for leaf in self.leaves() {
            writeln!(f, "Tree Node: {}-{}", leaf.min, leaf.max)?;
            for contact in leaf.contacts {
                writeln!(f, "\tContact: {} {}", contact.id(), contact.address())?;
            }
        }
        Ok(())
    }
}

/// Up to [N_CONTACTS] contact handles, replaced in round-robin order once full.
#[derive(Debug, Clone)]
pub struct Bucket {
    contacts: Vec<ContactHandle>,
    /// Slot written by the next insertion.
    cursor: usize,
}

impl Bucket {
    pub fn new() -> Self {
        Bucket {
            contacts: Vec::with_capacity(N_CONTACTS),
            cursor: 0,
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= N_CONTACTS
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ContactHandle> {
        self.contacts.iter()
    }

    // === Public Methods ===

    /// Write `handle` at the cursor and advance it, returning the evicted handle if any.
    pub fn insert(&mut self, handle: ContactHandle) -> Option<ContactHandle> {
        let evicted = if self.cursor < self.contacts.len() {
            Some(std::mem::replace(&mut self.contacts[self.cursor], handle))
        } else {
            self.contacts.push(handle);
            None
        };

        self.cursor = (self.cursor + 1) % N_CONTACTS;

        evicted
    }

    /// The handle the next insertion would overwrite.
    fn next_evicted(&self) -> Option<ContactHandle> {
        self.contacts.get(self.cursor).copied()
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::str::FromStr;

    use super::*;
    use crate::Error;

    fn contact(id: &str) -> Contact {
        Contact::new(
            Id::from_str(id).unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 0)),
        )
    }

    fn with_first_byte(byte: u8) -> Contact {
        let mut bytes = *Id::random().as_bytes();
        bytes[0] = byte;
        Contact::new(Id::from(bytes), SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    fn assert_invariants(table: &RoutingTable) {
        let leaves = table.leaves();
        let mut seen = HashSet::new();

        assert_eq!(leaves.first().map(|l| l.min), Some(Id::MIN));
        assert_eq!(leaves.last().map(|l| l.max), Some(Id::MAX));

        for pair in leaves.windows(2) {
            assert_eq!(pair[0].max, pair[1].min, "leaves must be contiguous");
        }

        for leaf in &leaves {
            assert!(leaf.contacts.len() <= N_CONTACTS);
            for contact in &leaf.contacts {
                assert!(contact.id().in_range(&leaf.min, &leaf.max));
                assert!(seen.insert(*contact.id()), "duplicate contact");
            }
        }
    }

    #[test]
    fn table_is_empty() {
        let mut table = RoutingTable::new(Id::random());
        assert!(table.is_empty());
        assert!(table.find_bucket(&Id::random()).is_none());

        table.add(Contact::random()).unwrap();
        assert!(!table.is_empty());
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn should_not_add_self() {
        let mut table = RoutingTable::new(Id::random());
        let me = Contact::new(*table.id(), SocketAddr::from(([127, 0, 0, 1], 0)));

        assert_eq!(table.add(me).unwrap(), None);
        assert!(table.is_empty());
    }

    #[test]
    fn buckets_are_sets() {
        let mut table = RoutingTable::new(Id::random());

        let contact = Contact::random();
        let a = table.add(contact.clone()).unwrap();
        let b = table.add(contact).unwrap();

        assert_eq!(a, b);
        assert_eq!(table.size(), 1);
        assert_eq!(table.registry().len(), 1);
    }

    #[test]
    fn splits_the_bucket_covering_self() {
        let mut table =
            RoutingTable::new(Id::from_str("0000000000000000000000000000000000000001").unwrap());

        for _ in 0..N_CONTACTS {
            table.add(with_first_byte(0x90)).unwrap();
        }
        assert_eq!(table.leaves().len(), 1);

        table.add(with_first_byte(0x10)).unwrap();

        let leaves = table.leaves();
        assert_eq!(leaves.len(), 2);
        assert_eq!(
            leaves[0].max,
            Id::from_str("7fffffffffffffffffffffffffffffffffffffff").unwrap()
        );
        assert_eq!(leaves[0].contacts.len(), 1);
        assert_eq!(leaves[1].contacts.len(), N_CONTACTS);
        assert_invariants(&table);
    }

    #[test]
    fn rotates_full_bucket_away_from_self() {
        let mut table =
            RoutingTable::new(Id::from_str("0000000000000000000000000000000000000001").unwrap());

        let far: Vec<Contact> = (0..N_CONTACTS + 2).map(|_| with_first_byte(0xC0)).collect();

        for contact in &far[..N_CONTACTS] {
            table.add(contact.clone()).unwrap();
        }

        // Root splits, all contacts land in the upper half which does not cover self,
        // so the newcomer replaces the slot under the cursor.
        table.add(far[N_CONTACTS].clone()).unwrap();
        let upper = table.find_bucket(far[0].id()).unwrap();
        assert_eq!(upper.len(), N_CONTACTS);
        assert!(table.find(far[0].id()).is_none());
        assert!(table.find(far[N_CONTACTS].id()).is_some());

        table.add(far[N_CONTACTS + 1].clone()).unwrap();
        assert!(table.find(far[1].id()).is_none());
        assert!(table.find(far[2].id()).is_some());

        assert_invariants(&table);
    }

    #[test]
    fn invariants_hold_under_random_inserts() {
        for _ in 0..20 {
            let mut table = RoutingTable::with_capacity(Id::random(), 2000);

            for _ in 0..300 {
                table.add(Contact::random()).unwrap();
            }

            assert!(table.leaves().len() > 1);
            assert_invariants(&table);
        }
    }

    #[test]
    fn registry_full_leaves_buckets_untouched() {
        let mut table =
            RoutingTable::with_capacity(Id::from_str("0000000000000000000000000000000000000001").unwrap(), 2);

        table
            .add(contact("a000000000000000000000000000000000000000"))
            .unwrap();
        table
            .add(contact("b000000000000000000000000000000000000000"))
            .unwrap();

        assert!(matches!(
            table.add(contact("c000000000000000000000000000000000000000")),
            Err(Error::RegistryFull)
        ));
        assert_eq!(table.size(), 2);
        assert_invariants(&table);
    }

    #[test]
    fn closest() {
        let target = Id::random();
        let mut table = RoutingTable::with_capacity(Id::random(), 2000);

        for _ in 0..200 {
            table.add(Contact::random()).unwrap();
        }

        let mut expected: Vec<Id> = table.contacts().iter().map(|c| *c.id()).collect();
        expected.sort_by_key(|id| id.distance(&target));
        expected.truncate(N_CONTACTS);

        let closest: Vec<Id> = table.closest(&target).nodes().iter().map(|n| n.id).collect();

        assert_eq!(closest, expected);
    }

    #[test]
    fn display_lists_leaves() {
        let mut table = RoutingTable::new(Id::random());
        let contact = Contact::random();
        table.add(contact.clone()).unwrap();

        let dump = table.to_string();
        assert!(dump.starts_with("Tree Node: "));
        assert!(dump.contains(&contact.id().to_string()));
    }
}
