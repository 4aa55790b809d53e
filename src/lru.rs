//! Bounded least-recently-used cache.
//!
//! Fuses an [`HMap`] (key → list-node index) with an intrusive doubly-linked
//! list of `(key, value)` payload nodes, head = most recently used. All `C`
//! list nodes are allocated during the cache's first `C` insertions; after
//! that, eviction recycles the tail node in place (unlink, overwrite its key
//! and value, relink at the head) rather than allocating and freeing, the
//! same recycling posture the source material uses for its own freed pages.

use crate::context::{DefaultHashContext, HashContext};
use crate::hmap::HMap;

struct ListNode<K, V> {
    key: K,
    value: V,
    prev: Option<u32>,
    next: Option<u32>,
}

/// A fixed-capacity map that evicts the least-recently-touched entry.
///
/// `Ctx` supplies hashing/equality for the key index; defaults to
/// [`DefaultHashContext`].
pub struct Lru<K, V, Ctx = DefaultHashContext> {
    index: HMap<K, u32, Ctx>,
    nodes: Vec<ListNode<K, V>>,
    head: Option<u32>,
    tail: Option<u32>,
    capacity: usize,
}

impl<K, V> Lru<K, V, DefaultHashContext>
where
    DefaultHashContext: HashContext<K>,
{
    pub fn new(capacity: usize) -> Self {
        Self::with_context(capacity, DefaultHashContext::default())
    }
}

impl<K, V, Ctx> Lru<K, V, Ctx>
where
    Ctx: HashContext<K>,
{
    pub fn with_context(capacity: usize, ctx: Ctx) -> Self {
        Lru {
            index: HMap::with_context(ctx),
            nodes: Vec::with_capacity(capacity),
            head: None,
            tail: None,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn unlink(&mut self, idx: u32) {
        let (prev, next) = (self.nodes[idx as usize].prev, self.nodes[idx as usize].next);
        match prev {
            Some(p) => self.nodes[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n as usize].prev = prev,
            None => self.tail = prev,
        }
    }

    fn link_front(&mut self, idx: u32) {
        self.nodes[idx as usize].prev = None;
        self.nodes[idx as usize].next = self.head;
        if let Some(h) = self.head {
            self.nodes[h as usize].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn move_to_front(&mut self, idx: u32) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.link_front(idx);
    }

    /// Looks up `key`, promoting it to most-recently-used on a hit.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        self.move_to_front(idx);
        Some(&self.nodes[idx as usize].value)
    }

    /// Looks up `key` without disturbing recency order.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        Some(&self.nodes[idx as usize].value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Inserts or overwrites `key`, evicting the least-recently-used entry
    /// first if the cache is already at capacity. Returns the value that
    /// occupied `key` before this call, if any. A zero-capacity cache
    /// accepts the call but retains nothing.
    pub fn put(&mut self, key: K, value: V) -> Option<V>
    where
        K: Clone,
    {
        if let Some(&idx) = self.index.get(&key) {
            let old = std::mem::replace(&mut self.nodes[idx as usize].value, value);
            self.move_to_front(idx);
            return Some(old);
        }

        if self.capacity == 0 {
            return None;
        }

        if self.nodes.len() < self.capacity {
            let idx = self.nodes.len() as u32;
            self.nodes.push(ListNode {
                key: key.clone(),
                value,
                prev: None,
                next: None,
            });
            self.link_front(idx);
            self.index
                .put(key, idx)
                .expect("LRU index allocation failure");
            None
        } else {
            let evict_idx = self.tail.expect("a full LRU always has a tail node to recycle");
            self.unlink(evict_idx);
            let old_key = std::mem::replace(&mut self.nodes[evict_idx as usize].key, key.clone());
            self.index.remove(&old_key);
            self.nodes[evict_idx as usize].value = value;
            self.link_front(evict_idx);
            self.index
                .put(key, evict_idx)
                .expect("LRU index allocation failure after eviction freed a slot");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_6_eviction() {
        let mut c: Lru<i32, &str> = Lru::new(2);
        c.put(1, "one");
        c.put(2, "two");
        assert_eq!(c.get(&1), Some(&"one"));
        c.put(3, "three");
        assert_eq!(c.get(&2), None);
        assert_eq!(c.get(&1), Some(&"one"));
        assert_eq!(c.get(&3), Some(&"three"));
    }

    #[test]
    fn capacity_bound_holds() {
        let mut c: Lru<i32, i32> = Lru::new(16);
        for i in 0..1000 {
            c.put(i, i);
            assert!(c.len() <= c.capacity());
        }
        assert_eq!(c.len(), 16);
    }

    #[test]
    fn zero_capacity_is_a_no_op() {
        let mut c: Lru<i32, i32> = Lru::new(0);
        c.put(1, 1);
        assert_eq!(c.len(), 0);
        assert_eq!(c.get(&1), None);
    }

    #[test]
    fn peek_does_not_change_recency() {
        let mut c: Lru<i32, i32> = Lru::new(2);
        c.put(1, 1);
        c.put(2, 2);
        assert_eq!(c.peek(&1), Some(&1));
        c.put(3, 3);
        assert_eq!(c.get(&1), None, "peek must not have promoted key 1");
        assert_eq!(c.get(&3), Some(&3));
    }

    #[test]
    fn overwrite_returns_old_value_and_promotes() {
        let mut c: Lru<i32, i32> = Lru::new(2);
        c.put(1, 10);
        c.put(2, 20);
        assert_eq!(c.put(1, 11), Some(10));
        c.put(3, 30);
        assert_eq!(c.get(&2), None);
        assert_eq!(c.get(&1), Some(&11));
    }
}
