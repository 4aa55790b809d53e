//! Open-addressed SwissTable-style hash map.
//!
//! Single heap allocation holding, in order: a metadata byte per slot (plus a
//! 15-byte "clone" region mirroring the leading bytes so any slot index can
//! start an unaligned 16-byte group load without wraparound arithmetic), the
//! key array, then the value array. Probing scans 16-byte groups using the
//! classic SWAR ("does this word contain byte b") trick in place of hardware
//! SIMD, since this crate targets stable Rust.

use std::alloc::{alloc, dealloc, Layout};
use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr;

use tracing::trace;

use crate::context::{DefaultHashContext, HashContext};
use crate::error::{Error, Result};
use crate::util::capacity_for_size;

pub(crate) const MIN_CAPACITY: usize = 8;
const GROUP_WIDTH: usize = 16;

const EMPTY: u8 = 0b1000_0000;
const DELETED: u8 = 0b1111_1110;
#[allow(dead_code)]
const SENTINEL: u8 = 0b1111_1111;

#[inline]
fn is_full(tag: u8) -> bool {
    tag & 0x80 == 0
}

mod group {
    const LO: u64 = 0x0101_0101_0101_0101;
    const HI: u64 = 0x8080_8080_8080_8080;

    #[inline]
    fn repeat(b: u8) -> u64 {
        u64::from_ne_bytes([b; 8])
    }

    /// One bit set per byte lane equal to `needle` (the lane's high bit; all
    /// other bits in that lane are zero). Standard bit-parallel "has a byte
    /// equal to n" trick, applied to an 8-byte half of a 16-byte group.
    #[inline]
    pub(super) fn match_byte(word: u64, needle: u8) -> u64 {
        let x = word ^ repeat(needle);
        x.wrapping_sub(LO) & !x & HI
    }

    /// Iterates the lane indices (0..8) set by [`match_byte`], lowest first.
    pub(super) struct LaneIter(pub u64);

    impl Iterator for LaneIter {
        type Item = usize;
        fn next(&mut self) -> Option<usize> {
            if self.0 == 0 {
                return None;
            }
            let lane = (self.0.trailing_zeros() / 8) as usize;
            self.0 &= self.0 - 1;
            Some(lane)
        }
    }
}

#[inline]
unsafe fn load_word(ctrl: *const u8, offset: usize) -> u64 {
    ptr::read_unaligned(ctrl.add(offset) as *const u64)
}

fn block_layout<K, V>(capacity: usize) -> Result<(Layout, usize, usize)> {
    let ctrl_len = capacity + GROUP_WIDTH - 1;
    let ctrl_layout = Layout::array::<u8>(ctrl_len).map_err(|_| Error::AllocationFailure)?;
    let key_layout = Layout::array::<K>(capacity).map_err(|_| Error::AllocationFailure)?;
    let val_layout = Layout::array::<V>(capacity).map_err(|_| Error::AllocationFailure)?;
    let (l1, key_offset) = ctrl_layout
        .extend(key_layout)
        .map_err(|_| Error::AllocationFailure)?;
    let (l2, val_offset) = l1.extend(val_layout).map_err(|_| Error::AllocationFailure)?;
    Ok((l2.pad_to_align(), key_offset, val_offset))
}

/// Reinsert a key known to be absent from a freshly-allocated (all-EMPTY,
/// no tombstones) block. Used only while rehashing, where no equality check
/// is needed since every live key was already unique.
unsafe fn raw_insert_no_clobber<K, V, Ctx: HashContext<K>>(
    ctrl: *mut u8,
    keys: *mut K,
    values: *mut V,
    capacity: usize,
    growth_left: &mut usize,
    ctx: &Ctx,
    key: K,
    value: V,
) {
    let hash = ctx.hash(&key);
    let h2 = ((hash >> 57) & 0x7F) as u8;
    let mut idx = (hash as usize) % capacity;
    loop {
        for lane_base in [0usize, 8usize] {
            let word = load_word(ctrl, idx + lane_base);
            let empties = group::match_byte(word, EMPTY);
            if let Some(lane) = group::LaneIter(empties).next() {
                let slot = (idx + lane_base + lane) % capacity;
                set_ctrl_mirrored(ctrl, capacity, slot, h2);
                ptr::write(keys.add(slot), key);
                ptr::write(values.add(slot), value);
                *growth_left -= 1;
                return;
            }
        }
        idx = (idx + GROUP_WIDTH) % capacity;
    }
}

unsafe fn set_ctrl_mirrored(ctrl: *mut u8, capacity: usize, index: usize, value: u8) {
    *ctrl.add(index) = value;
    let mut mirror = index + capacity;
    while mirror < capacity + GROUP_WIDTH - 1 {
        *ctrl.add(mirror) = value;
        mirror += capacity;
    }
}

/// A SwissTable-style hash map from `K` to `V`.
///
/// `MAX_LOAD` is the load-factor percentage, a compile-time parameter in
/// `(0, 100)` (default 80). `Ctx` supplies hashing and equality; it defaults
/// to [`DefaultHashContext`], which hashes via `std::hash::Hash` through a
/// known non-cryptographic 64-bit mixer and compares via `PartialEq`.
pub struct HMap<K, V, Ctx = DefaultHashContext, const MAX_LOAD: usize = 80> {
    ctrl: *mut u8,
    keys: *mut K,
    values: *mut V,
    capacity: usize,
    len: usize,
    growth_left: usize,
    iter_locks: Cell<u32>,
    ctx: Ctx,
    _marker: PhantomData<(K, V)>,
}

unsafe impl<K: Send, V: Send, Ctx: Send, const MAX_LOAD: usize> Send for HMap<K, V, Ctx, MAX_LOAD> {}

impl<K, V> Default for HMap<K, V, DefaultHashContext, 80>
where
    DefaultHashContext: HashContext<K>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> HMap<K, V, DefaultHashContext, 80>
where
    DefaultHashContext: HashContext<K>,
{
    pub fn new() -> Self {
        Self::with_context(DefaultHashContext::default())
    }
}

impl<K, V, Ctx, const MAX_LOAD: usize> HMap<K, V, Ctx, MAX_LOAD>
where
    Ctx: HashContext<K>,
{
    pub fn with_context(ctx: Ctx) -> Self {
        debug_assert!(MAX_LOAD > 0 && MAX_LOAD < 100);
        HMap {
            ctrl: ptr::null_mut(),
            keys: ptr::null_mut(),
            values: ptr::null_mut(),
            capacity: 0,
            len: 0,
            growth_left: 0,
            iter_locks: Cell::new(0),
            ctx,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ensure_total_capacity(&mut self, n: usize) -> Result<()> {
        let needed = capacity_for_size(n, MAX_LOAD, MIN_CAPACITY);
        if needed > self.capacity {
            self.rehash_to(needed)?;
        }
        Ok(())
    }

    fn find_slot(&self, key: &K) -> Option<usize> {
        if self.capacity == 0 {
            return None;
        }
        let hash = self.ctx.hash(key);
        let h2 = ((hash >> 57) & 0x7F) as u8;
        let mut idx = (hash as usize) % self.capacity;
        loop {
            for lane_base in [0usize, 8usize] {
                let word = unsafe { load_word(self.ctrl, idx + lane_base) };
                for lane in group::LaneIter(group::match_byte(word, h2)) {
                    let slot = (idx + lane_base + lane) % self.capacity;
                    if self.ctx.eq(unsafe { &*self.keys.add(slot) }, key) {
                        return Some(slot);
                    }
                }
                if group::match_byte(word, EMPTY) != 0 {
                    return None;
                }
            }
            idx = (idx + GROUP_WIDTH) % self.capacity;
        }
    }

    /// Probe for an absent key's insertion slot: first tombstone seen, else
    /// first empty slot. Caller must already know `key` is absent.
    fn insert_slot_for(&mut self, key: &K) -> usize {
        let hash = self.ctx.hash(key);
        let h2 = ((hash >> 57) & 0x7F) as u8;
        let mut idx = (hash as usize) % self.capacity;
        let mut first_deleted: Option<usize> = None;
        loop {
            for lane_base in [0usize, 8usize] {
                let word = unsafe { load_word(self.ctrl, idx + lane_base) };
                if first_deleted.is_none() {
                    if let Some(lane) = group::LaneIter(group::match_byte(word, DELETED)).next() {
                        first_deleted = Some((idx + lane_base + lane) % self.capacity);
                    }
                }
                let empties = group::match_byte(word, EMPTY);
                if let Some(lane) = group::LaneIter(empties).next() {
                    let empty_slot = (idx + lane_base + lane) % self.capacity;
                    let slot = first_deleted.unwrap_or(empty_slot);
                    let consumed_empty = first_deleted.is_none();
                    unsafe { set_ctrl_mirrored(self.ctrl, self.capacity, slot, h2) };
                    if consumed_empty {
                        self.growth_left -= 1;
                    }
                    return slot;
                }
            }
            idx = (idx + GROUP_WIDTH) % self.capacity;
        }
    }

    fn ensure_room_for_one_more(&mut self) -> Result<()> {
        if self.growth_left == 0 {
            let new_capacity = capacity_for_size(self.len + 1, MAX_LOAD, MIN_CAPACITY);
            self.rehash_to(new_capacity)?;
        }
        Ok(())
    }

    /// `getOrPut`: returns the existing entry if present, otherwise inserts
    /// `make()` and returns the new entry. The bool is `true` on a hit.
    pub fn get_or_insert_with(&mut self, key: K, make: impl FnOnce() -> V) -> Result<(&mut V, bool)> {
        if let Some(slot) = self.find_slot(&key) {
            return Ok((unsafe { &mut *self.values.add(slot) }, true));
        }
        // Key is absent: only now might we need to grow, so an allocation
        // failure here never discards an existing entry.
        self.ensure_room_for_one_more()?;
        let slot = self.insert_slot_for(&key);
        unsafe {
            ptr::write(self.keys.add(slot), key);
            ptr::write(self.values.add(slot), make());
        }
        self.len += 1;
        Ok((unsafe { &mut *self.values.add(slot) }, false))
    }

    /// Insert or overwrite, returning the displaced value if any.
    pub fn put(&mut self, key: K, value: V) -> Result<Option<V>> {
        if let Some(slot) = self.find_slot(&key) {
            let old = std::mem::replace(unsafe { &mut *self.values.add(slot) }, value);
            return Ok(Some(old));
        }
        self.ensure_room_for_one_more()?;
        let slot = self.insert_slot_for(&key);
        unsafe {
            ptr::write(self.keys.add(slot), key);
            ptr::write(self.values.add(slot), value);
        }
        self.len += 1;
        Ok(None)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.find_slot(key)
            .map(|slot| unsafe { &*self.values.add(slot) })
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.find_slot(key)
            .map(|slot| unsafe { &mut *self.values.add(slot) })
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.find_slot(key).is_some()
    }

    /// Writes a tombstone at `key`'s slot. Tombstones keep costing probe
    /// steps until a rehash sweeps them; the growth budget is untouched.
    pub fn remove(&mut self, key: &K) -> bool {
        match self.find_slot(key) {
            Some(slot) => {
                unsafe {
                    ptr::drop_in_place(self.keys.add(slot));
                    ptr::drop_in_place(self.values.add(slot));
                    set_ctrl_mirrored(self.ctrl, self.capacity, slot, DELETED);
                }
                self.len -= 1;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        if self.capacity == 0 {
            return;
        }
        for slot in 0..self.capacity {
            if is_full(unsafe { *self.ctrl.add(slot) }) {
                unsafe {
                    ptr::drop_in_place(self.keys.add(slot));
                    ptr::drop_in_place(self.values.add(slot));
                }
            }
        }
        unsafe { ptr::write_bytes(self.ctrl, EMPTY, self.capacity + GROUP_WIDTH - 1) };
        self.len = 0;
        self.growth_left = self.capacity * MAX_LOAD / 100;
    }

    #[tracing::instrument(skip(self), level = "trace")]
    fn rehash_to(&mut self, new_capacity: usize) -> Result<()> {
        debug_assert_eq!(
            self.iter_locks.get(),
            0,
            "rehashing an HMap while an iterator holds the pointer-stability lock"
        );
        trace!(old_capacity = self.capacity, new_capacity, "rehash");
        let (layout, key_off, val_off) = block_layout::<K, V>(new_capacity)?;
        let base = unsafe { alloc(layout) };
        if base.is_null() {
            return Err(Error::AllocationFailure);
        }
        let new_ctrl = base;
        let new_keys = unsafe { base.add(key_off) as *mut K };
        let new_values = unsafe { base.add(val_off) as *mut V };
        unsafe { ptr::write_bytes(new_ctrl, EMPTY, new_capacity + GROUP_WIDTH - 1) };

        let (old_ctrl, old_keys, old_values, old_capacity) =
            (self.ctrl, self.keys, self.values, self.capacity);

        let mut new_growth_left = new_capacity * MAX_LOAD / 100;
        for slot in 0..old_capacity {
            let tag = unsafe { *old_ctrl.add(slot) };
            if is_full(tag) {
                let key = unsafe { ptr::read(old_keys.add(slot)) };
                let value = unsafe { ptr::read(old_values.add(slot)) };
                unsafe {
                    raw_insert_no_clobber(
                        new_ctrl,
                        new_keys,
                        new_values,
                        new_capacity,
                        &mut new_growth_left,
                        &self.ctx,
                        key,
                        value,
                    );
                }
            }
        }

        if old_capacity > 0 {
            let (old_layout, _, _) = block_layout::<K, V>(old_capacity)
                .expect("layout recomputation cannot fail for a previously allocated capacity");
            unsafe { dealloc(old_ctrl, old_layout) };
        }

        self.ctrl = new_ctrl;
        self.keys = new_keys;
        self.values = new_values;
        self.capacity = new_capacity;
        self.growth_left = new_growth_left;
        Ok(())
    }

    pub fn iter(&self) -> Iter<'_, K, V> {
        self.iter_locks.set(self.iter_locks.get() + 1);
        Iter {
            ctrl: self.ctrl,
            keys: self.keys,
            values: self.values,
            capacity: self.capacity,
            pos: 0,
            remaining: self.len,
            lock: &self.iter_locks,
            _marker: PhantomData,
        }
    }
}

impl<K, V, Ctx, const MAX_LOAD: usize> Drop for HMap<K, V, Ctx, MAX_LOAD> {
    fn drop(&mut self) {
        if self.capacity == 0 {
            return;
        }
        for slot in 0..self.capacity {
            if is_full(unsafe { *self.ctrl.add(slot) }) {
                unsafe {
                    ptr::drop_in_place(self.keys.add(slot));
                    ptr::drop_in_place(self.values.add(slot));
                }
            }
        }
        let (layout, _, _) = block_layout::<K, V>(self.capacity)
            .expect("layout recomputation cannot fail for a previously allocated capacity");
        unsafe { dealloc(self.ctrl, layout) };
    }
}

impl<K: Clone, V: Clone, Ctx: Clone + HashContext<K>, const MAX_LOAD: usize> Clone
    for HMap<K, V, Ctx, MAX_LOAD>
{
    fn clone(&self) -> Self {
        let mut out = HMap::with_context(self.ctx.clone());
        if self.len > 0 {
            out.ensure_total_capacity(self.len)
                .expect("allocation failure while cloning HMap");
            for (k, v) in self.iter() {
                out.put(k.clone(), v.clone())
                    .expect("allocation failure while cloning HMap");
            }
        }
        out
    }
}

pub struct Iter<'a, K, V> {
    ctrl: *const u8,
    keys: *const K,
    values: *const V,
    capacity: usize,
    pos: usize,
    remaining: usize,
    lock: &'a Cell<u32>,
    _marker: PhantomData<(&'a K, &'a V)>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        while self.pos < self.capacity {
            let slot = self.pos;
            self.pos += 1;
            if is_full(unsafe { *self.ctrl.add(slot) }) {
                self.remaining -= 1;
                return Some(unsafe { (&*self.keys.add(slot), &*self.values.add(slot)) });
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, K, V> ExactSizeIterator for Iter<'a, K, V> {}

impl<'a, K, V> Drop for Iter<'a, K, V> {
    fn drop(&mut self) {
        self.lock.set(self.lock.get() - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_1_basic_put_get_remove() {
        let mut m: HMap<i32, i32> = HMap::new();
        m.put(1, 10).unwrap();
        m.put(2, 20).unwrap();
        m.put(3, 30).unwrap();
        assert_eq!(m.get(&2), Some(&20));
        m.put(2, 22).unwrap();
        assert_eq!(m.get(&2), Some(&22));
        assert!(m.remove(&2));
        assert_eq!(m.get(&2), None);
        assert!(!m.remove(&2));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn count_equals_iter() {
        let mut m: HMap<i32, i32> = HMap::new();
        for i in 0..200 {
            m.put(i, i * 2).unwrap();
        }
        for i in (0..200).step_by(3) {
            m.remove(&i);
        }
        assert_eq!(m.len(), m.iter().count());
    }

    #[test]
    fn rehash_preserves_entries() {
        crate::ensure_test_tracing();
        let mut m: HMap<i32, i32> = HMap::new();
        for i in 0..5000 {
            m.put(i, i).unwrap();
        }
        for i in 0..5000 {
            assert_eq!(m.get(&i), Some(&i));
        }
        assert_eq!(m.len(), 5000);
    }

    #[test]
    fn load_bound_holds() {
        let mut m: HMap<i32, i32, crate::context::DefaultHashContext, 50> = HMap::with_context(Default::default());
        for i in 0..1000 {
            m.put(i, i).unwrap();
            assert!(m.len() * 100 <= 50 * m.capacity());
        }
    }

    #[test]
    fn tombstones_are_reused() {
        let mut m: HMap<i32, i32> = HMap::new();
        m.ensure_total_capacity(8).unwrap();
        let cap = m.capacity();
        for i in 0..4 {
            m.put(i, i).unwrap();
        }
        for i in 0..4 {
            m.remove(&i);
        }
        for i in 100..104 {
            m.put(i, i).unwrap();
        }
        assert_eq!(m.capacity(), cap);
    }

    #[test]
    fn get_or_insert_with_does_not_overwrite() {
        let mut m: HMap<i32, i32> = HMap::new();
        let (v, found) = m.get_or_insert_with(1, || 10).unwrap();
        assert_eq!(*v, 10);
        assert!(!found);
        let (v, found) = m.get_or_insert_with(1, || 999).unwrap();
        assert_eq!(*v, 10);
        assert!(found);
    }

    #[test]
    fn string_keys() {
        let mut m: HMap<String, usize> = HMap::new();
        for (i, w) in ["alpha", "beta", "gamma", "delta"].iter().enumerate() {
            m.put(w.to_string(), i).unwrap();
        }
        assert_eq!(m.get(&"gamma".to_string()), Some(&2));
    }

    #[test]
    fn drop_runs_destructors() {
        use std::rc::Rc;
        let counter = Rc::new(());
        {
            let mut m: HMap<i32, Rc<()>> = HMap::new();
            for i in 0..32 {
                m.put(i, counter.clone()).unwrap();
            }
            assert_eq!(Rc::strong_count(&counter), 33);
        }
        assert_eq!(Rc::strong_count(&counter), 1);
    }
}
