//! Prefix-compressed trie over byte-string keys.
//!
//! Nodes live in a `Vec`-backed arena addressed by `u32` index rather than by
//! raw pointer — the same ownership-disciplined substitute for back-pointers
//! used by [`crate::omap::OMap`], chosen here for an extra reason: a node's
//! per-label child map is itself an `OMap<u8, u32>`, so reusing the arena
//! convention keeps the two collaborating structures speaking the same
//! handle type. A node's leaf (when present) is threaded into one global
//! doubly-linked list in lexicographic key order; rotations don't exist here,
//! but splits and merges play the same role and are the only operations that
//! touch that thread.

use crate::context::DefaultCompareContext;
use crate::omap::OMap;
use crate::util::common_prefix_len;

struct Leaf<V> {
    key: Vec<u8>,
    value: V,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Node<V> {
    prefix: Vec<u8>,
    parent: Option<u32>,
    edges: OMap<u8, u32, DefaultCompareContext>,
    leaf: Option<Leaf<V>>,
    subtree_min_leaf: Option<u32>,
    subtree_max_leaf: Option<u32>,
    subtree_leaf_count: u32,
}

enum Slot<V> {
    Occupied(Node<V>),
    Vacant(Option<u32>),
}

/// A map from byte-string keys to `V`, ordered lexicographically.
pub struct RTrie<V> {
    slots: Vec<Slot<V>>,
    free_head: Option<u32>,
    root: u32,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl<V> Default for RTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> RTrie<V> {
    pub fn new() -> Self {
        let root_node = Node {
            prefix: Vec::new(),
            parent: None,
            edges: OMap::new(),
            leaf: None,
            subtree_min_leaf: None,
            subtree_max_leaf: None,
            subtree_leaf_count: 0,
        };
        RTrie {
            slots: vec![Slot::Occupied(root_node)],
            free_head: None,
            root: 0,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn node(&self, i: u32) -> &Node<V> {
        match &self.slots[i as usize] {
            Slot::Occupied(n) => n,
            Slot::Vacant(_) => panic!("dangling RTrie arena index"),
        }
    }

    fn node_mut(&mut self, i: u32) -> &mut Node<V> {
        match &mut self.slots[i as usize] {
            Slot::Occupied(n) => n,
            Slot::Vacant(_) => panic!("dangling RTrie arena index"),
        }
    }

    fn leaf_mut(&mut self, i: u32) -> &mut Leaf<V> {
        self.node_mut(i)
            .leaf
            .as_mut()
            .expect("leaf chain index must reference a node with a leaf")
    }

    fn alloc_node(&mut self, prefix: Vec<u8>, parent: Option<u32>) -> u32 {
        let node = Node {
            prefix,
            parent,
            edges: OMap::new(),
            leaf: None,
            subtree_min_leaf: None,
            subtree_max_leaf: None,
            subtree_leaf_count: 0,
        };
        match self.free_head {
            Some(idx) => {
                let next_free = match &self.slots[idx as usize] {
                    Slot::Vacant(n) => *n,
                    Slot::Occupied(_) => unreachable!("free list points at an occupied slot"),
                };
                self.free_head = next_free;
                self.slots[idx as usize] = Slot::Occupied(node);
                idx
            }
            None => {
                let idx = self.slots.len() as u32;
                self.slots.push(Slot::Occupied(node));
                idx
            }
        }
    }

    fn free_node(&mut self, idx: u32) {
        self.slots[idx as usize] = Slot::Vacant(self.free_head);
        self.free_head = Some(idx);
    }

    /// Overwrites the node's leaf value if present, else creates it.
    /// Returns the prior value; bumps `len` only on creation.
    fn set_leaf(&mut self, node: u32, full_key: &[u8], value: V) -> Option<V> {
        match &mut self.node_mut(node).leaf {
            Some(l) => Some(std::mem::replace(&mut l.value, value)),
            None => {
                self.node_mut(node).leaf = Some(Leaf {
                    key: full_key.to_vec(),
                    value,
                    prev: None,
                    next: None,
                });
                self.len += 1;
                None
            }
        }
    }

    /// Rebuilds `subtree_leaf_count`/`subtree_min_leaf`/`subtree_max_leaf`
    /// for `node` from its own leaf and its children's already-current
    /// values, and rethreads the leaf chain across that local span (in
    /// edge-map order, since the edge map is itself ordered). Must be
    /// invoked bottom-up: a node's refresh depends on its children already
    /// being current. The two ends of the resulting span are provisional —
    /// only the top-level caller knows whether they are the true global
    /// head/tail — so every assignment here is unconditional, and an
    /// ancestor further up the path overwrites them again if it turns out
    /// they have a neighbor outside this node's subtree.
    fn recompute_node(&mut self, node: u32) {
        let mut chain_head = None;
        let mut prev_max = None;
        let mut count = 0u32;

        if self.node(node).leaf.is_some() {
            chain_head = Some(node);
            prev_max = Some(node);
            count += 1;
        }

        let children: Vec<u32> = self.node(node).edges.iter().map(|(_, &c)| c).collect();
        for child in children {
            count += self.node(child).subtree_leaf_count;
            if let Some(cmin) = self.node(child).subtree_min_leaf {
                if chain_head.is_none() {
                    chain_head = Some(cmin);
                }
                self.leaf_mut(cmin).prev = prev_max;
                if let Some(pm) = prev_max {
                    self.leaf_mut(pm).next = Some(cmin);
                }
                prev_max = self.node(child).subtree_max_leaf;
            }
        }

        self.node_mut(node).subtree_leaf_count = count;
        self.node_mut(node).subtree_min_leaf = chain_head;
        self.node_mut(node).subtree_max_leaf = prev_max;
    }

    /// Pins the true ends of the global chain after a bubble-up reaches the
    /// root; everywhere else, recompute_node's writes are provisional.
    fn finalize_chain(&mut self) {
        self.head = self.node(self.root).subtree_min_leaf;
        self.tail = self.node(self.root).subtree_max_leaf;
        if let Some(h) = self.head {
            self.leaf_mut(h).prev = None;
        }
        if let Some(t) = self.tail {
            self.leaf_mut(t).next = None;
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        let mut node = self.root;
        let mut remaining = key;
        loop {
            if remaining.is_empty() {
                return self.node(node).leaf.as_ref().map(|l| &l.value);
            }
            let label = remaining[0];
            let child = *self.node(node).edges.get(&label)?;
            let child_prefix_len = self.node(child).prefix.len();
            if remaining.len() >= child_prefix_len && remaining[..child_prefix_len] == self.node(child).prefix[..] {
                remaining = &remaining[child_prefix_len..];
                node = child;
            } else {
                return None;
            }
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Value of the longest key in the trie that is a prefix of `key`.
    pub fn longest_prefix(&self, key: &[u8]) -> Option<&V> {
        let mut node = self.root;
        let mut remaining = key;
        let mut best = self.node(node).leaf.as_ref().map(|l| &l.value);
        loop {
            if remaining.is_empty() {
                break;
            }
            let label = remaining[0];
            let child = match self.node(node).edges.get(&label) {
                Some(&c) => c,
                None => break,
            };
            let child_prefix_len = self.node(child).prefix.len();
            if remaining.len() >= child_prefix_len && remaining[..child_prefix_len] == self.node(child).prefix[..] {
                remaining = &remaining[child_prefix_len..];
                node = child;
                if let Some(l) = &self.node(node).leaf {
                    best = Some(&l.value);
                }
            } else {
                break;
            }
        }
        best
    }

    /// 0-indexed order statistic in lexicographic order.
    pub fn get_at_index(&self, mut k: usize) -> Option<(&[u8], &V)> {
        if k >= self.len {
            return None;
        }
        let mut node = self.root;
        loop {
            if self.node(node).leaf.is_some() {
                if k == 0 {
                    let l = self.node(node).leaf.as_ref().unwrap();
                    return Some((&l.key, &l.value));
                }
                k -= 1;
            }
            let mut found = None;
            for (_, &child) in self.node(node).edges.iter() {
                let c = self.node(child).subtree_leaf_count as usize;
                if k < c {
                    found = Some(child);
                    break;
                }
                k -= c;
            }
            node = found.expect("index within subtree_leaf_count must land in some child");
        }
    }

    #[tracing::instrument(skip(self, key, value), level = "trace")]
    pub fn insert(&mut self, key: &[u8], value: V) -> Option<V> {
        let old = self.insert_rec(self.root, key, key, value);
        self.finalize_chain();
        old
    }

    fn insert_rec(&mut self, node: u32, remaining: &[u8], full_key: &[u8], value: V) -> Option<V> {
        if remaining.is_empty() {
            let old = self.set_leaf(node, full_key, value);
            self.recompute_node(node);
            return old;
        }

        let label = remaining[0];
        match self.node(node).edges.get(&label).copied() {
            None => {
                let child = self.alloc_node(remaining.to_vec(), Some(node));
                self.set_leaf(child, full_key, value);
                self.recompute_node(child);
                self.node_mut(node).edges.insert(label, child);
                self.recompute_node(node);
                None
            }
            Some(child) => {
                let child_prefix = self.node(child).prefix.clone();
                let common = common_prefix_len(&child_prefix, remaining);
                if common == child_prefix.len() {
                    let old = self.insert_rec(child, &remaining[common..], full_key, value);
                    self.recompute_node(node);
                    old
                } else {
                    let intermediate = self.alloc_node(remaining[..common].to_vec(), Some(node));

                    self.node_mut(child).prefix = child_prefix[common..].to_vec();
                    self.node_mut(child).parent = Some(intermediate);
                    let child_label = child_prefix[common];
                    self.node_mut(intermediate).edges.insert(child_label, child);

                    if remaining.len() > common {
                        let new_label = remaining[common];
                        let leaf_child = self.alloc_node(remaining[common..].to_vec(), Some(intermediate));
                        self.set_leaf(leaf_child, full_key, value);
                        self.recompute_node(leaf_child);
                        self.node_mut(intermediate).edges.insert(new_label, leaf_child);
                    } else {
                        self.set_leaf(intermediate, full_key, value);
                    }

                    self.recompute_node(intermediate);
                    self.node_mut(node).edges.insert(label, intermediate);
                    self.recompute_node(node);
                    None
                }
            }
        }
    }

    #[tracing::instrument(skip(self, key), level = "trace")]
    pub fn remove(&mut self, key: &[u8]) -> Option<V> {
        let result = self.remove_rec(self.root, key);
        self.finalize_chain();
        result
    }

    fn remove_rec(&mut self, node: u32, remaining: &[u8]) -> Option<V> {
        if remaining.is_empty() {
            let leaf = self.node_mut(node).leaf.take()?;
            self.len -= 1;
            self.recompute_node(node);
            return Some(leaf.value);
        }

        let label = remaining[0];
        let child = *self.node(node).edges.get(&label)?;
        let child_prefix_len = self.node(child).prefix.len();
        if remaining.len() < child_prefix_len || remaining[..child_prefix_len] != self.node(child).prefix[..] {
            return None;
        }

        let removed = self.remove_rec(child, &remaining[child_prefix_len..])?;

        let child_empty = self.node(child).leaf.is_none() && self.node(child).edges.is_empty();
        if child_empty {
            self.node_mut(node).edges.remove(&label);
            self.free_node(child);
        }

        self.maybe_merge(node);
        self.recompute_node(node);
        Some(removed)
    }

    /// A non-root node with no leaf and exactly one child is redundant:
    /// absorb the child's prefix, leaf and edges, then free it.
    fn maybe_merge(&mut self, node: u32) {
        if node == self.root {
            return;
        }
        if self.node(node).leaf.is_some() {
            return;
        }
        if self.node(node).edges.len() != 1 {
            return;
        }
        let child = *self.node(node).edges.first_key_value().unwrap().1;

        let child_prefix = self.node(child).prefix.clone();
        self.node_mut(node).prefix.extend_from_slice(&child_prefix);

        let child_leaf = self.node_mut(child).leaf.take();
        self.node_mut(node).leaf = child_leaf;

        let child_edges = std::mem::replace(&mut self.node_mut(child).edges, OMap::new());
        for (_, &grandchild) in child_edges.iter() {
            self.node_mut(grandchild).parent = Some(node);
        }
        self.node_mut(node).edges = child_edges;

        self.free_node(child);
    }

    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            trie: self,
            cur: self.head,
            remaining: self.len,
        }
    }
}

pub struct Iter<'a, V> {
    trie: &'a RTrie<V>,
    cur: Option<u32>,
    remaining: usize,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (&'a [u8], &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.cur?;
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let leaf = self.trie.node(i).leaf.as_ref().unwrap();
        self.cur = leaf.next;
        Some((leaf.key.as_slice(), &leaf.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, V> ExactSizeIterator for Iter<'a, V> {}

#[cfg(test)]
mod tests {
    use super::*;

    impl<V> RTrie<V> {
        fn validate(&self) {
            let mut seen = 0usize;
            self.validate_node(self.root, true, &mut seen);
            assert_eq!(seen, self.len);

            let mut via_chain = Vec::new();
            let mut cur = self.head;
            while let Some(i) = cur {
                via_chain.push(self.node(i).leaf.as_ref().unwrap().key.clone());
                cur = self.node(i).leaf.as_ref().unwrap().next;
            }
            assert_eq!(via_chain.len(), self.len);
            for w in via_chain.windows(2) {
                assert!(w[0] < w[1], "leaf chain order violated: {:?} >= {:?}", w[0], w[1]);
            }
        }

        fn validate_node(&self, node: u32, is_root: bool, seen: &mut usize) {
            let n = self.node(node);
            if !is_root {
                let has_leaf = n.leaf.is_some();
                let edge_count = n.edges.len();
                assert!(
                    has_leaf || edge_count >= 2,
                    "non-root node with no leaf must have >= 2 children: prefix={:?} edges={}",
                    n.prefix,
                    edge_count
                );
            }
            if n.leaf.is_some() {
                *seen += 1;
            }
            let mut expected_count = if n.leaf.is_some() { 1 } else { 0 };
            for (_, &child) in n.edges.iter() {
                self.validate_node(child, false, seen);
                expected_count += self.node(child).subtree_leaf_count as usize;
            }
            assert_eq!(n.subtree_leaf_count as usize, expected_count);
        }
    }

    #[test]
    fn scenario_4_insert_delete_insert() {
        let mut t: RTrie<i32> = RTrie::new();
        t.insert(b"foo", 1);
        t.insert(b"foobar", 2);
        t.validate();
        assert!(t.remove(b"foobar").is_some());
        t.validate();
        t.insert(b"fooz", 3);
        t.validate();
        assert!(t.remove(b"foo").is_some());
        t.validate();
        assert_eq!(t.get(b"fooz"), Some(&3));
        assert_eq!(t.get(b"foo"), None);
    }

    #[test]
    fn scenario_5_longest_prefix() {
        let mut t: RTrie<i32> = RTrie::new();
        t.insert(b"foo", 1);
        t.insert(b"foobar", 2);
        t.insert(b"f", 3);
        t.validate();
        assert_eq!(t.longest_prefix(b"foobar"), Some(&2));
        assert_eq!(t.longest_prefix(b"foobaz"), Some(&1));
        assert_eq!(t.longest_prefix(b"fooa"), Some(&1));
        assert_eq!(t.longest_prefix(b"f"), Some(&3));
        assert_eq!(t.longest_prefix(b"a"), None);
    }

    #[test]
    fn get_at_index_matches_iter() {
        let mut t: RTrie<usize> = RTrie::new();
        for (i, w) in ["apple", "app", "apricot", "banana", "band", "bandana"]
            .iter()
            .enumerate()
        {
            t.insert(w.as_bytes(), i);
        }
        t.validate();
        let collected: Vec<_> = t.iter().map(|(k, _)| k.to_vec()).collect();
        for (i, k) in collected.iter().enumerate() {
            assert_eq!(t.get_at_index(i).map(|(k, _)| k.to_vec()), Some(k.clone()));
        }
        assert_eq!(t.get_at_index(collected.len()), None);
    }

    #[test]
    fn fuzz_against_btreemap() {
        crate::ensure_test_tracing();
        use rand::rngs::SmallRng;
        use rand::{Rng, SeedableRng};
        let mut rng = SmallRng::seed_from_u64(7);
        let mut t: RTrie<i32> = RTrie::new();
        let mut model = std::collections::BTreeMap::new();
        let alphabet = b"ab";
        for _ in 0..2000 {
            let len = rng.gen_range(0..5);
            let key: Vec<u8> = (0..len).map(|_| alphabet[rng.gen_range(0..alphabet.len())]).collect();
            if rng.gen_bool(0.65) {
                let v = rng.gen();
                t.insert(&key, v);
                model.insert(key, v);
            } else {
                let a = t.remove(&key);
                let b = model.remove(&key);
                assert_eq!(a, b);
            }
        }
        t.validate();
        let collected: Vec<_> = t.iter().map(|(k, v)| (k.to_vec(), *v)).collect();
        let expected: Vec<_> = model.iter().map(|(k, v)| (k.clone(), *v)).collect();
        assert_eq!(collected, expected);
    }
}
