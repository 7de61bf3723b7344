#![forbid(unsafe_code)]
//! Node Block Buffer: the bounded block cache kept by a remote shard worker.

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::primitives::block::Block;
use crate::primitives::io::BlockIo;
use crate::types::{BlockId, Result, StoreError};

/// Bounded concurrent map from block id to block content.
///
/// Eviction only ever picks an entry that is not in-core; when every entry is still
/// unflushed there is no valid victim and [`NodeBlockBuffer::put`] fails.
pub struct NodeBlockBuffer {
    blocks: DashMap<BlockId, Block>,
    capacity: usize,
    /// Held while a new entry is admitted, so the capacity check and the insert
    /// happen as one step.
    admit: Mutex<()>,
}

impl NodeBlockBuffer {
    /// Creates an empty buffer holding at most `capacity` blocks.
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: DashMap::with_capacity(capacity),
            capacity: capacity.max(1),
            admit: Mutex::new(()),
        }
    }

    /// Maximum number of cached blocks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cached blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns true when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Number of cached blocks still flagged in-core.
    pub fn in_core_count(&self) -> usize {
        self.blocks
            .iter()
            .filter(|entry| entry.value().is_in_core())
            .count()
    }

    /// Returns a copy of the cached block, if any.
    pub fn get(&self, id: BlockId) -> Option<Block> {
        self.blocks.get(&id).map(|entry| entry.value().clone())
    }

    /// Returns true if `id` is cached.
    pub fn contains(&self, id: BlockId) -> bool {
        self.blocks.contains_key(&id)
    }

    /// Caches `block`, evicting one durable entry when full.
    ///
    /// Replacing a cached id only touches its map entry. Admitting a new id is
    /// serialized, so concurrent callers never push the buffer past its capacity.
    pub fn put(&self, block: Block) -> Result<()> {
        let id = block.id();
        if let Some(mut entry) = self.blocks.get_mut(&id) {
            *entry.value_mut() = block;
            return Ok(());
        }
        let _admit = self.admit.lock();
        if let Some(mut entry) = self.blocks.get_mut(&id) {
            *entry.value_mut() = block;
            return Ok(());
        }
        while self.blocks.len() >= self.capacity {
            let victim = self
                .blocks
                .iter()
                .find(|entry| !entry.value().is_in_core())
                .map(|entry| *entry.key());
            match victim {
                Some(victim) => {
                    // A concurrent writer may have dirtied the victim in between.
                    let removed = self
                        .blocks
                        .remove_if(&victim, |_, blk| !blk.is_in_core())
                        .is_some();
                    if removed {
                        debug!(block = %victim, "cache.evict");
                    }
                }
                None => {
                    warn!(block = %id, capacity = self.capacity, "cache.full");
                    return Err(StoreError::StorageFault(format!(
                        "node block buffer full: {} in-core blocks, no evictable victim for {}",
                        self.capacity, id
                    )));
                }
            }
        }
        self.blocks.insert(id, block);
        Ok(())
    }

    /// Clears the in-core flag of a cached block once its write is durable.
    pub fn mark_clean(&self, id: BlockId) {
        if let Some(mut entry) = self.blocks.get_mut(&id) {
            entry.value_mut().set_in_core(false);
        }
    }

    /// Drops a cached block.
    pub fn remove(&self, id: BlockId) -> Option<Block> {
        self.blocks.remove(&id).map(|(_, blk)| blk)
    }

    /// Writes every in-core entry through `io`, clears the flags, then forces durability.
    pub fn force(&self, io: &mut dyn BlockIo) -> Result<()> {
        let mut written = 0usize;
        for mut entry in self.blocks.iter_mut() {
            let blk = entry.value_mut();
            if !blk.is_in_core() {
                continue;
            }
            io.seek(blk.id().offset())?;
            io.write_used(blk)?;
            blk.set_in_core(false);
            written += 1;
        }
        if io.is_open() {
            io.force()?;
        }
        debug!(written, cached = self.blocks.len(), "cache.force");
        Ok(())
    }
}
