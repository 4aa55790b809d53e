//! Hashing and ordering contexts.
//!
//! Mirrors the `Ctx`-parametrized node design this crate is patterned on: a
//! container never hardcodes how its keys hash or compare, it takes a small
//! zero-sized context type supplying that policy, defaulting to an ordinary
//! one built from `std::hash::Hash`/`Ord`.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use rustc_hash::FxHasher;

/// Supplies `hash`/`eq` for [`crate::hmap::HMap`] and [`crate::lru::Lru`].
pub trait HashContext<K: ?Sized> {
    fn hash(&self, key: &K) -> u64;
    fn eq(&self, a: &K, b: &K) -> bool;
}

/// The known non-cryptographic 64-bit mixer used when no custom context is
/// supplied: `std::hash::Hash` fed through `rustc_hash::FxHasher`. Equality
/// falls back to `PartialEq`.
#[derive(Clone, Copy, Default)]
pub struct DefaultHashContext(PhantomData<()>);

impl<K: Hash + Eq + ?Sized> HashContext<K> for DefaultHashContext {
    fn hash(&self, key: &K) -> u64 {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn eq(&self, a: &K, b: &K) -> bool {
        a == b
    }
}

/// Supplies `cmp` for [`crate::omap::OMap`] and [`crate::btree::BTree`].
pub trait CompareContext<K: ?Sized> {
    fn cmp(&self, a: &K, b: &K) -> Ordering;
}

/// The natural `Ord` of the key type.
#[derive(Clone, Copy, Default)]
pub struct DefaultCompareContext(PhantomData<()>);

impl<K: Ord + ?Sized> CompareContext<K> for DefaultCompareContext {
    fn cmp(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}
