//! Textbook B-tree of minimum degree `t`.
//!
//! Nodes live in a `Vec`-backed arena addressed by `u32` index, the same
//! convention used by `omap`/`rtrie`/`lru`. Keys, values and child pointers
//! are stored in `SmallVec`-backed inline arrays sized for small-to-medium
//! `t`, spilling to the heap for larger `t` — the source material's own
//! `SmallVec`-for-small-fixed-arrays idiom, reused here for a different
//! shape of node.

use smallvec::SmallVec;

use crate::context::{CompareContext, DefaultCompareContext};

const INLINE_KEYS: usize = 15;
const INLINE_CHILDREN: usize = 16;

struct Node<K, V> {
    keys: SmallVec<[K; INLINE_KEYS]>,
    values: SmallVec<[V; INLINE_KEYS]>,
    /// Empty for a leaf; otherwise always `keys.len() + 1` entries.
    children: SmallVec<[u32; INLINE_CHILDREN]>,
}

impl<K, V> Node<K, V> {
    fn leaf() -> Self {
        Node {
            keys: SmallVec::new(),
            values: SmallVec::new(),
            children: SmallVec::new(),
        }
    }

    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

enum Slot<K, V> {
    Occupied(Node<K, V>),
    Vacant(Option<u32>),
}

/// A B-tree map from `K` to `V` of minimum degree `t`.
///
/// `Ctx` supplies comparison; defaults to [`DefaultCompareContext`].
pub struct BTree<K, V, Ctx = DefaultCompareContext> {
    slots: Vec<Slot<K, V>>,
    free_head: Option<u32>,
    root: u32,
    t: usize,
    len: usize,
    ctx: Ctx,
}

impl<K, V> BTree<K, V, DefaultCompareContext> {
    pub fn new(t: usize) -> Self {
        Self::with_context(t, DefaultCompareContext::default())
    }
}

impl<K, V, Ctx> BTree<K, V, Ctx> {
    pub fn with_context(t: usize, ctx: Ctx) -> Self {
        debug_assert!(t >= 2, "B-tree minimum degree must be at least 2");
        BTree {
            slots: vec![Slot::Occupied(Node::leaf())],
            free_head: None,
            root: 0,
            t,
            len: 0,
            ctx,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn node(&self, i: u32) -> &Node<K, V> {
        match &self.slots[i as usize] {
            Slot::Occupied(n) => n,
            Slot::Vacant(_) => panic!("dangling BTree arena index"),
        }
    }

    fn node_mut(&mut self, i: u32) -> &mut Node<K, V> {
        match &mut self.slots[i as usize] {
            Slot::Occupied(n) => n,
            Slot::Vacant(_) => panic!("dangling BTree arena index"),
        }
    }

    fn alloc_node(&mut self, node: Node<K, V>) -> u32 {
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
}

impl<K, V, Ctx: CompareContext<K>> BTree<K, V, Ctx> {
    fn search_pos(&self, node: u32, key: &K) -> Result<usize, usize> {
        let n = self.node(node);
        let mut lo = 0usize;
        let mut hi = n.keys.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.ctx.cmp(key, &n.keys[mid]) {
                std::cmp::Ordering::Less => hi = mid,
                std::cmp::Ordering::Greater => lo = mid + 1,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let mut node = self.root;
        loop {
            match self.search_pos(node, key) {
                Ok(i) => return Some(&self.node(node).values[i]),
                Err(i) => {
                    if self.node(node).is_leaf() {
                        return None;
                    }
                    node = self.node(node).children[i];
                }
            }
        }
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let mut node = self.root;
        loop {
            match self.search_pos(node, key) {
                Ok(i) => return Some(&mut self.node_mut(node).values[i]),
                Err(i) => {
                    if self.node(node).is_leaf() {
                        return None;
                    }
                    node = self.node(node).children[i];
                }
            }
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    #[tracing::instrument(skip(self, parent), level = "trace")]
    fn split_child(&mut self, parent: u32, i: usize) {
        let t = self.t;
        let child = self.node(parent).children[i];

        let (median_key, median_value, right_keys, right_values, right_children) = {
            let c = self.node_mut(child);
            let is_leaf = c.is_leaf();
            let right_keys = c.keys.split_off(t);
            let right_values = c.values.split_off(t);
            let median_key = c.keys.pop().expect("a full node has a median key to promote");
            let median_value = c.values.pop().expect("a full node has a median value to promote");
            let right_children = if is_leaf {
                SmallVec::new()
            } else {
                c.children.split_off(t)
            };
            (median_key, median_value, right_keys, right_values, right_children)
        };

        let right_idx = self.alloc_node(Node {
            keys: right_keys,
            values: right_values,
            children: right_children,
        });

        let p = self.node_mut(parent);
        p.keys.insert(i, median_key);
        p.values.insert(i, median_value);
        p.children.insert(i + 1, right_idx);
    }

    #[tracing::instrument(skip(self, key, value), level = "trace")]
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let root = self.root;
        if self.node(root).keys.len() == 2 * self.t - 1 {
            let new_root = self.alloc_node(Node {
                keys: SmallVec::new(),
                values: SmallVec::new(),
                children: SmallVec::from_slice(&[root]),
            });
            self.root = new_root;
            self.split_child(new_root, 0);
            let old = self.insert_nonfull(new_root, key, value);
            if old.is_none() {
                self.len += 1;
            }
            old
        } else {
            let old = self.insert_nonfull(root, key, value);
            if old.is_none() {
                self.len += 1;
            }
            old
        }
    }

    fn insert_nonfull(&mut self, node: u32, key: K, value: V) -> Option<V> {
        match self.search_pos(node, &key) {
            Ok(i) => Some(std::mem::replace(&mut self.node_mut(node).values[i], value)),
            Err(mut i) => {
                if self.node(node).is_leaf() {
                    self.node_mut(node).keys.insert(i, key);
                    self.node_mut(node).values.insert(i, value);
                    None
                } else {
                    if self.node(self.node(node).children[i]).keys.len() == 2 * self.t - 1 {
                        self.split_child(node, i);
                        match self.ctx.cmp(&key, &self.node(node).keys[i]) {
                            std::cmp::Ordering::Greater => i += 1,
                            std::cmp::Ordering::Equal => {
                                return Some(std::mem::replace(&mut self.node_mut(node).values[i], value));
                            }
                            std::cmp::Ordering::Less => {}
                        }
                    }
                    let child = self.node(node).children[i];
                    self.insert_nonfull(child, key, value)
                }
            }
        }
    }

    #[tracing::instrument(skip(self, key), level = "trace")]
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let root = self.root;
        let removed = self.remove_rec(root, key);
        if removed.is_some() {
            self.len -= 1;
        }
        if self.node(self.root).keys.is_empty() && !self.node(self.root).is_leaf() {
            let old_root = self.root;
            self.root = self.node(old_root).children[0];
            self.free_node(old_root);
        }
        removed
    }

    fn remove_rec(&mut self, node: u32, key: &K) -> Option<V> {
        let t = self.t;
        match self.search_pos(node, key) {
            Ok(i) => {
                if self.node(node).is_leaf() {
                    self.node_mut(node).keys.remove(i);
                    Some(self.node_mut(node).values.remove(i))
                } else {
                    let left_child = self.node(node).children[i];
                    let right_child = self.node(node).children[i + 1];
                    if self.node(left_child).keys.len() >= t {
                        let (pred_key, pred_val) = self.remove_max(left_child);
                        self.node_mut(node).keys[i] = pred_key;
                        let old = std::mem::replace(&mut self.node_mut(node).values[i], pred_val);
                        Some(old)
                    } else if self.node(right_child).keys.len() >= t {
                        let (succ_key, succ_val) = self.remove_min(right_child);
                        self.node_mut(node).keys[i] = succ_key;
                        let old = std::mem::replace(&mut self.node_mut(node).values[i], succ_val);
                        Some(old)
                    } else {
                        self.merge_children(node, i);
                        self.remove_rec(left_child, key)
                    }
                }
            }
            Err(i) => {
                if self.node(node).is_leaf() {
                    None
                } else {
                    let child = self.ensure_child_has_t_keys(node, i);
                    self.remove_rec(child, key)
                }
            }
        }
    }

    fn remove_max(&mut self, node: u32) -> (K, V) {
        if self.node(node).is_leaf() {
            let k = self.node_mut(node).keys.pop().expect("non-empty node");
            let v = self.node_mut(node).values.pop().expect("non-empty node");
            (k, v)
        } else {
            let last = self.node(node).children.len() - 1;
            let child = self.ensure_child_has_t_keys(node, last);
            self.remove_max(child)
        }
    }

    fn remove_min(&mut self, node: u32) -> (K, V) {
        if self.node(node).is_leaf() {
            let k = self.node_mut(node).keys.remove(0);
            let v = self.node_mut(node).values.remove(0);
            (k, v)
        } else {
            let child = self.ensure_child_has_t_keys(node, 0);
            self.remove_min(child)
        }
    }

    /// Ensures `node.children[i]` holds at least `t` keys (borrowing from a
    /// sibling, or merging if neither sibling can lend one), returning the
    /// arena index that now occupies that logical position (a merge may
    /// relocate it to `i - 1`).
    fn ensure_child_has_t_keys(&mut self, node: u32, i: usize) -> u32 {
        let t = self.t;
        let child = self.node(node).children[i];
        if self.node(child).keys.len() >= t {
            return child;
        }
        let has_left = i > 0;
        let has_right = i + 1 < self.node(node).children.len();

        if has_left && self.node(self.node(node).children[i - 1]).keys.len() >= t {
            self.borrow_from_left(node, i);
            self.node(node).children[i]
        } else if has_right && self.node(self.node(node).children[i + 1]).keys.len() >= t {
            self.borrow_from_right(node, i);
            self.node(node).children[i]
        } else if has_right {
            self.merge_children(node, i);
            self.node(node).children[i]
        } else {
            self.merge_children(node, i - 1);
            self.node(node).children[i - 1]
        }
    }

    fn borrow_from_left(&mut self, node: u32, i: usize) {
        let left = self.node(node).children[i - 1];
        let child = self.node(node).children[i];

        let sib_key = self.node_mut(left).keys.pop().expect("left sibling has a spare key");
        let sib_val = self.node_mut(left).values.pop().expect("left sibling has a spare value");
        let sib_child = if self.node(left).is_leaf() {
            None
        } else {
            self.node_mut(left).children.pop()
        };

        let sep_key = std::mem::replace(&mut self.node_mut(node).keys[i - 1], sib_key);
        let sep_val = std::mem::replace(&mut self.node_mut(node).values[i - 1], sib_val);

        self.node_mut(child).keys.insert(0, sep_key);
        self.node_mut(child).values.insert(0, sep_val);
        if let Some(c) = sib_child {
            self.node_mut(child).children.insert(0, c);
        }
    }

    fn borrow_from_right(&mut self, node: u32, i: usize) {
        let child = self.node(node).children[i];
        let right = self.node(node).children[i + 1];

        let sib_key = self.node_mut(right).keys.remove(0);
        let sib_val = self.node_mut(right).values.remove(0);
        let sib_child = if self.node(right).is_leaf() {
            None
        } else {
            Some(self.node_mut(right).children.remove(0))
        };

        let sep_key = std::mem::replace(&mut self.node_mut(node).keys[i], sib_key);
        let sep_val = std::mem::replace(&mut self.node_mut(node).values[i], sib_val);

        self.node_mut(child).keys.push(sep_key);
        self.node_mut(child).values.push(sep_val);
        if let Some(c) = sib_child {
            self.node_mut(child).children.push(c);
        }
    }

    /// Merges `children[i+1]` and the separator `keys[i]`/`values[i]` into
    /// `children[i]`, then frees the now-empty right node.
    fn merge_children(&mut self, node: u32, i: usize) {
        let left = self.node(node).children[i];
        let right = self.node(node).children.remove(i + 1);
        let sep_key = self.node_mut(node).keys.remove(i);
        let sep_val = self.node_mut(node).values.remove(i);

        let (mut right_keys, mut right_values, mut right_children) = {
            let r = self.node_mut(right);
            (
                std::mem::take(&mut r.keys),
                std::mem::take(&mut r.values),
                std::mem::take(&mut r.children),
            )
        };

        let l = self.node_mut(left);
        l.keys.push(sep_key);
        l.values.push(sep_val);
        l.keys.append(&mut right_keys);
        l.values.append(&mut right_values);
        l.children.append(&mut right_children);

        self.free_node(right);
    }

    pub fn iter(&self) -> Iter<'_, K, V, Ctx> {
        let mut stack = Vec::new();
        let mut node = Some(self.root);
        while let Some(n) = node {
            stack.push((n, 0usize));
            node = if self.node(n).is_leaf() {
                None
            } else {
                Some(self.node(n).children[0])
            };
        }
        Iter { tree: self, stack }
    }
}

pub struct Iter<'a, K, V, Ctx> {
    tree: &'a BTree<K, V, Ctx>,
    stack: Vec<(u32, usize)>,
}

impl<'a, K, V, Ctx> Iterator for Iter<'a, K, V, Ctx> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let &(node, idx) = self.stack.last()?;
            let n = self.tree.node(node);
            if idx < n.keys.len() {
                self.stack.last_mut().unwrap().1 += 1;
                if !n.is_leaf() {
                    let mut next_node = Some(n.children[idx + 1]);
                    while let Some(c) = next_node {
                        self.stack.push((c, 0));
                        next_node = if self.tree.node(c).is_leaf() {
                            None
                        } else {
                            Some(self.tree.node(c).children[0])
                        };
                    }
                }
                return Some((&n.keys[idx], &n.values[idx]));
            } else {
                self.stack.pop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl<K: Ord + std::fmt::Debug, V, Ctx: CompareContext<K>> BTree<K, V, Ctx> {
        fn validate(&self) {
            let mut count = 0usize;
            let depth = self.validate_node(self.root, true, &mut count);
            let _ = depth;
            assert_eq!(count, self.len);
        }

        fn validate_node(&self, node: u32, is_root: bool, count: &mut usize) -> usize {
            let n = self.node(node);
            let t = self.t;
            if !is_root {
                assert!(n.keys.len() >= t - 1, "node underflow: {} keys", n.keys.len());
            }
            assert!(n.keys.len() <= 2 * t - 1, "node overflow: {} keys", n.keys.len());
            assert!(n.keys.windows(2).all(|w| w[0] < w[1]), "keys not sorted");
            *count += n.keys.len();
            if n.is_leaf() {
                return 0;
            }
            assert_eq!(n.children.len(), n.keys.len() + 1);
            let mut depth = None;
            for &c in n.children.iter() {
                let d = self.validate_node(c, false, count);
                match depth {
                    None => depth = Some(d),
                    Some(prev) => assert_eq!(prev, d, "leaves at unequal depth"),
                }
            }
            depth.unwrap() + 1
        }
    }

    #[test]
    fn insert_then_search() {
        let mut t: BTree<i32, i32> = BTree::new(3);
        for i in 0..200 {
            t.insert(i, i * 10);
        }
        t.validate();
        for i in 0..200 {
            assert_eq!(t.get(&i), Some(&(i * 10)));
        }
        assert_eq!(t.get(&200), None);
    }

    #[test]
    fn sorted_iteration() {
        let mut t: BTree<i32, i32> = BTree::new(2);
        let mut values = vec![50, 30, 70, 20, 40, 60, 80, 10, 90, 25, 35, 45];
        for &v in &values {
            t.insert(v, v);
        }
        t.validate();
        values.sort_unstable();
        let collected: Vec<_> = t.iter().map(|(k, _)| *k).collect();
        assert_eq!(collected, values);
    }

    #[test]
    fn overwrite_returns_old_value() {
        let mut t: BTree<i32, i32> = BTree::new(2);
        t.insert(1, 10);
        assert_eq!(t.insert(1, 11), Some(10));
        assert_eq!(t.get(&1), Some(&11));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn fuzz_against_btreemap() {
        crate::ensure_test_tracing();
        use rand::rngs::SmallRng;
        use rand::{Rng, SeedableRng};
        let mut rng = SmallRng::seed_from_u64(99);
        let mut t: BTree<i32, i32> = BTree::new(3);
        let mut model = std::collections::BTreeMap::new();
        for _ in 0..4000 {
            let k = rng.gen_range(0..300);
            if rng.gen_bool(0.6) {
                let v = rng.gen();
                assert_eq!(t.insert(k, v), model.insert(k, v));
            } else {
                assert_eq!(t.remove(&k), model.remove(&k));
            }
            t.validate();
        }
        let collected: Vec<_> = t.iter().map(|(k, v)| (*k, *v)).collect();
        let expected: Vec<_> = model.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(collected, expected);
    }
}
