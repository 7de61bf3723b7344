//! Storage engine: configuration, payload records and the B-tree.
//!
//! [`Store`] wires the I/O pipeline, buffer pool and record store together and hands
//! out trees that share them.

/// B-tree key pages, splits and the tree driver.
pub mod btree;

/// Payload record store.
pub mod objects;

mod options;
mod store;

pub use objects::{ObjectStatsSnapshot, ObjectStore};
pub use options::StoreOptions;
pub use store::Store;
