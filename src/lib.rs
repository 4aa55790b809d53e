//! Five general-purpose in-memory container types: a SwissTable-style hash
//! map, an order-statistics tree, a compressed radix trie, a bounded LRU
//! cache, and a textbook B-tree.

pub mod context;
pub mod error;
mod util;

pub mod btree;
pub mod hmap;
pub mod lru;
pub mod omap;
pub mod rtrie;

pub use btree::BTree;
pub use context::{CompareContext, DefaultCompareContext, DefaultHashContext, HashContext};
pub use error::{Error, Result};
pub use hmap::HMap;
pub use lru::Lru;
pub use omap::OMap;
pub use rtrie::RTrie;

/// Installs a process-wide `tracing` subscriber the first time it's called;
/// later calls are no-ops. The containers themselves never call this —
/// it's for a test harness or embedding application to opt into, the same
/// `Once`-guarded posture the source material uses for its own `ensure_init`.
#[cfg(test)]
pub(crate) fn ensure_test_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .init();
    });
}
