#![forbid(unsafe_code)]

//! Disk-backed B-tree: key pages, split requests and the tree driver.

/// Encoding and decoding of keys and values.
pub mod codecs;
/// Key page projection and serialization.
pub mod page;
/// Page geometry and slot states.
pub mod slot;
/// Split requests and the split pool.
pub mod split;
mod stats;
mod tree;

pub use codecs::Codec;
pub use page::{KeyPage, PageEnv, PageGuard, PageRef, PageTree};
pub use slot::{ChildSlot, KeySlot, PageLayout, ValueSlot};
pub use split::{SplitPool, SplitRequest, SplitSide};
pub use stats::{BTreeStats, BTreeStatsSnapshot};
pub use tree::{BTree, TreeReport};
