#![forbid(unsafe_code)]
//! Identifiers, pointers, block geometry, and the crate-wide error type.

use std::fmt;
use std::io;

/// Block checksum helpers.
pub mod checksum;

/// Index of a shard (tablespace). Each shard is backed by its own file and I/O worker.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ShardId(pub u8);

/// Virtual block number: the owning shard in the top three bits, the byte offset of the
/// block inside that shard's file in the remaining bits.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct BlockId(pub u64);

/// Raw value used on disk for "no block".
pub const SENTINEL_BLOCK: u64 = u64::MAX;

/// Maximum number of shards addressable by a [`BlockId`].
pub const MAX_SHARDS: u8 = 8;

const SHARD_SHIFT: u32 = 61;
const OFFSET_MASK: u64 = (1 << SHARD_SHIFT) - 1;

impl BlockId {
    /// Builds a block id from its shard and byte offset.
    pub const fn new(shard: ShardId, offset: u64) -> Self {
        BlockId(((shard.0 as u64) << SHARD_SHIFT) | (offset & OFFSET_MASK))
    }

    /// Decodes an on-disk child pointer, mapping the sentinel to `None`.
    pub const fn from_raw(raw: u64) -> Option<Self> {
        if raw == SENTINEL_BLOCK {
            None
        } else {
            Some(BlockId(raw))
        }
    }

    /// Encodes an optional block id using the on-disk sentinel.
    pub fn to_raw(id: Option<BlockId>) -> u64 {
        id.map_or(SENTINEL_BLOCK, |id| id.0)
    }

    /// Returns the shard that owns this block.
    pub const fn shard(self) -> ShardId {
        ShardId((self.0 >> SHARD_SHIFT) as u8)
    }

    /// Returns the byte offset of this block inside its shard file.
    pub const fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }

    /// Returns true for the on-disk sentinel value.
    pub const fn is_sentinel(self) -> bool {
        self.0 == SENTINEL_BLOCK
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_sentinel() {
            return f.write_str("<none>");
        }
        write!(f, "{}:{}", self.shard().0, self.offset())
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Location of a stored key or value payload: a block and an offset inside its payload.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Optr {
    /// Block holding the record.
    pub block: BlockId,
    /// Offset of the record inside the block payload.
    pub offset: u16,
}

impl Optr {
    /// The empty pointer: sentinel block, offset zero.
    pub const EMPTY: Optr = Optr {
        block: BlockId(SENTINEL_BLOCK),
        offset: 0,
    };

    /// Creates a pointer to `offset` inside `block`.
    pub const fn new(block: BlockId, offset: u16) -> Self {
        Self { block, offset }
    }

    /// Returns true when this is the empty pointer.
    pub const fn is_empty(&self) -> bool {
        self.block.0 == SENTINEL_BLOCK && self.offset == 0
    }
}

impl Default for Optr {
    fn default() -> Self {
        Optr::EMPTY
    }
}

impl fmt::Display for Optr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("<empty>");
        }
        write!(f, "{}+{}", self.block, self.offset)
    }
}

pub mod block {
    //! Fixed on-disk block geometry.
    use core::ops::Range;

    /// Default block size in bytes.
    pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
    /// Smallest accepted block size.
    pub const MIN_BLOCK_SIZE: u32 = 128;
    /// Largest accepted block size; payload offsets must fit in a `u16`.
    pub const MAX_BLOCK_SIZE: u32 = 65536;
    /// Length of the block header preceding the payload.
    pub const BLOCK_HDR_LEN: usize = 12;

    /// Byte offsets of the block header fields.
    pub mod header {
        use super::Range;

        pub const KIND: usize = 0;
        pub const FLAGS: usize = 1;
        pub const USED: Range<usize> = 2..4;
        pub const LIVE: Range<usize> = 4..6;
        pub const RESERVED: Range<usize> = 6..8;
        pub const CRC32: Range<usize> = 8..12;
    }

    /// Returns the payload capacity for a given block size.
    pub const fn payload_len(block_size: u32) -> usize {
        block_size as usize - BLOCK_HDR_LEN
    }
}

/// Errors surfaced by the storage core.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Failure reported by a backing file handle.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// Invalid block id or resource exhaustion with no valid victim.
    #[error("storage fault: {0}")]
    StorageFault(String),
    /// A programmer-level invariant was violated.
    #[error("invariant violated: {0}")]
    Invariant(String),
    /// Structurally invalid on-disk data.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// A stored payload could not be decoded.
    #[error("codec: {0}")]
    Codec(String),
    /// Invalid argument or configuration.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A configuration file could not be parsed.
    #[error("config: {0}")]
    Config(String),
    /// A worker was stopped or a completion was dropped before it was signalled.
    #[error("closed: {0}")]
    Closed(&'static str),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Re-creates an error so it can be reported to more than one waiter.
pub fn clone_error(err: &StoreError) -> StoreError {
    match err {
        StoreError::Io(io_err) => StoreError::Io(io::Error::new(io_err.kind(), io_err.to_string())),
        StoreError::StorageFault(msg) => StoreError::StorageFault(msg.clone()),
        StoreError::Invariant(msg) => StoreError::Invariant(msg.clone()),
        StoreError::Corruption(msg) => StoreError::Corruption(msg),
        StoreError::Codec(msg) => StoreError::Codec(msg.clone()),
        StoreError::Invalid(msg) => StoreError::Invalid(msg),
        StoreError::Config(msg) => StoreError::Config(msg.clone()),
        StoreError::Closed(msg) => StoreError::Closed(msg),
    }
}
