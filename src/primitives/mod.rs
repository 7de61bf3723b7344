//! Low-level building blocks shared by the storage layer.

/// Fixed-size blocks and payload cursors.
pub mod block;
/// Node Block Buffer used by remote shard workers.
pub mod cache;
/// Latch and barrier completions.
pub mod concurrency;
/// Positioned file I/O and seekable block channels.
pub mod io;
/// Buffer pool, block allocator and free-block pool.
pub mod pool;
/// Block I/O requests, shard workers and the I/O manager.
pub mod request;
