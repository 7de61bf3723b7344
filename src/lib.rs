//! Disk-backed B-tree storage engine.
//!
//! Nodes live in fixed-size blocks spread over one or more shard files. Blocks move
//! between the buffer pool and the backing files through per-shard I/O workers; key
//! pages materialize their keys, values and children lazily from block + offset
//! pointers, and full pages are split by a pool of split workers.

#![warn(missing_docs)]

/// Tracing subscriber setup.
pub mod logging;
/// Blocks, I/O requests, the buffer pool and other building blocks.
pub mod primitives;
/// Record store, configuration and the B-tree.
pub mod storage;
/// Identifiers, pointers and the error type.
pub mod types;

pub use storage::btree::{BTree, Codec};
pub use storage::{Store, StoreOptions};
pub use types::{BlockId, Optr, Result, ShardId, StoreError};
