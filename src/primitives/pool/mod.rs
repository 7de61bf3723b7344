#![forbid(unsafe_code)]
//! Buffer pool: resident block handles, block allocation, and the free-block pool.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::primitives::block::{Block, BlockHandle, BlockKind};
use crate::primitives::request::IoManager;
use crate::types::{BlockId, Result, ShardId, StoreError};

/// Largest byte offset a block id can encode.
const MAX_SHARD_BYTES: u64 = 1 << 61;

/// Counters describing buffer pool activity.
#[derive(Default, Debug, Clone, Copy)]
pub struct PoolStatsSnapshot {
    /// Resolves served from resident handles.
    pub hits: u64,
    /// Resolves that read the block through the I/O pipeline.
    pub misses: u64,
    /// Resident blocks dropped to stay under capacity.
    pub evictions: u64,
    /// Blocks handed out by the allocator.
    pub allocations: u64,
    /// Blocks returned to the free-block pool.
    pub frees: u64,
}

#[derive(Default)]
struct PoolStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
}

struct ShardSpace {
    next_offset: u64,
    free: BTreeSet<u64>,
}

struct Allocator {
    shards: Vec<ShardSpace>,
    next_shard: usize,
}

/// Pins blocks in memory and hands them to the page and I/O layers.
pub struct BufferPool {
    io: Arc<IoManager>,
    block_size: u32,
    capacity: usize,
    resident: Mutex<HashMap<BlockId, BlockHandle>>,
    allocator: Mutex<Allocator>,
    stats: PoolStats,
}

impl BufferPool {
    /// Creates a pool over `io`. `shard_lens` are the current backing file lengths; every
    /// whole block below a shard's length counts as allocated.
    pub fn new(io: Arc<IoManager>, block_size: u32, capacity: usize, shard_lens: &[u64]) -> Self {
        let bs = block_size as u64;
        let shards = shard_lens
            .iter()
            .map(|&len| ShardSpace {
                next_offset: len.div_ceil(bs) * bs,
                free: BTreeSet::new(),
            })
            .collect();
        Self {
            io,
            block_size,
            capacity: capacity.max(1),
            resident: Mutex::new(HashMap::new()),
            allocator: Mutex::new(Allocator {
                shards,
                next_shard: 0,
            }),
            stats: PoolStats::default(),
        }
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.allocator.lock().shards.len()
    }

    /// The request pipeline backing this pool.
    pub fn io(&self) -> &Arc<IoManager> {
        &self.io
    }

    /// Allocates a fresh block, round-robin across shards.
    pub fn allocate_fresh_block(&self, kind: BlockKind) -> Result<BlockHandle> {
        let shard = {
            let mut alloc = self.allocator.lock();
            let shard = alloc.next_shard % alloc.shards.len().max(1);
            alloc.next_shard = alloc.next_shard.wrapping_add(1);
            ShardId(shard as u8)
        };
        self.allocate_in_shard(shard, kind)
    }

    /// Allocates a fresh block in `shard`, reusing a freed block when one exists.
    ///
    /// The block comes back zeroed and in-core.
    pub fn allocate_in_shard(&self, shard: ShardId, kind: BlockKind) -> Result<BlockHandle> {
        let offset = {
            let mut alloc = self.allocator.lock();
            let bs = self.block_size as u64;
            let space = alloc.shards.get_mut(shard.0 as usize).ok_or_else(|| {
                StoreError::StorageFault(format!("allocation in unknown shard {shard}"))
            })?;
            match space.free.pop_first() {
                Some(offset) => offset,
                None => {
                    let offset = space.next_offset;
                    if offset + bs > MAX_SHARD_BYTES {
                        return Err(StoreError::StorageFault(format!("shard {shard} is full")));
                    }
                    space.next_offset += bs;
                    offset
                }
            }
        };
        let id = BlockId::new(shard, offset);
        let mut blk = Block::new(id, self.block_size);
        blk.reset(kind);
        let handle: BlockHandle = Arc::new(Mutex::new(blk));
        {
            let mut resident = self.resident.lock();
            self.evict_locked(&mut resident);
            resident.insert(id, handle.clone());
        }
        self.stats.allocations.fetch_add(1, Ordering::Relaxed);
        trace!(block = %id, ?kind, "pool.allocate");
        Ok(handle)
    }

    /// Returns true if `id` names a block the allocator has handed out and not freed.
    pub fn is_allocated(&self, id: BlockId) -> bool {
        if id.is_sentinel() || id.offset() % self.block_size as u64 != 0 {
            return false;
        }
        let alloc = self.allocator.lock();
        match alloc.shards.get(id.shard().0 as usize) {
            Some(space) => id.offset() < space.next_offset && !space.free.contains(&id.offset()),
            None => false,
        }
    }

    /// Pins the block `id`, reading it through the I/O pipeline if it is not resident.
    pub fn resolve_block(&self, id: BlockId) -> Result<BlockHandle> {
        if !self.is_allocated(id) {
            return Err(StoreError::StorageFault(format!(
                "invalid or unallocated block {id}"
            )));
        }
        if let Some(handle) = self.resident.lock().get(&id) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(handle.clone());
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let handle: BlockHandle = Arc::new(Mutex::new(Block::new(id, self.block_size)));
        self.io.read_block(&handle)?;
        let mut resident = self.resident.lock();
        // Another thread may have loaded it meanwhile; its copy wins.
        if let Some(existing) = resident.get(&id) {
            return Ok(existing.clone());
        }
        self.evict_locked(&mut resident);
        resident.insert(id, handle.clone());
        Ok(handle)
    }

    /// Returns `id` to the free-block pool of its shard.
    pub fn free_block(&self, id: BlockId) -> Result<()> {
        if !self.is_allocated(id) {
            return Err(StoreError::StorageFault(format!(
                "free of invalid or unallocated block {id}"
            )));
        }
        self.resident.lock().remove(&id);
        let mut alloc = self.allocator.lock();
        if let Some(space) = alloc.shards.get_mut(id.shard().0 as usize) {
            space.free.insert(id.offset());
        }
        self.stats.frees.fetch_add(1, Ordering::Relaxed);
        debug!(block = %id, "pool.free");
        Ok(())
    }

    /// Writes every in-core resident block and then syncs all shards.
    pub fn flush(&self) -> Result<()> {
        let dirty: Vec<BlockHandle> = self
            .snapshot()
            .into_iter()
            .filter(|handle| handle.lock().is_in_core())
            .collect();
        debug!(blocks = dirty.len(), "pool.flush");
        if !dirty.is_empty() {
            self.io.write_blocks(&dirty)?;
        }
        self.io.sync_all()
    }

    /// Durability barrier over all shards without writing resident blocks.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    /// Number of resident blocks.
    pub fn resident_len(&self) -> usize {
        self.resident.lock().len()
    }

    /// Number of resident blocks with unflushed modifications.
    pub fn in_core_count(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|handle| handle.lock().is_in_core())
            .count()
    }

    // Block locks are never taken while the resident map is locked.
    fn snapshot(&self) -> Vec<BlockHandle> {
        self.resident.lock().values().cloned().collect()
    }

    /// Number of freed blocks awaiting reuse in `shard`.
    pub fn free_count(&self, shard: ShardId) -> usize {
        self.allocator
            .lock()
            .shards
            .get(shard.0 as usize)
            .map_or(0, |space| space.free.len())
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            allocations: self.stats.allocations.load(Ordering::Relaxed),
            frees: self.stats.frees.load(Ordering::Relaxed),
        }
    }

    /// Drops unpinned, durable blocks until there is room for one more.
    fn evict_locked(&self, resident: &mut HashMap<BlockId, BlockHandle>) {
        if resident.len() < self.capacity {
            return;
        }
        let excess = resident.len() + 1 - self.capacity;
        let victims: Vec<BlockId> = resident
            .iter()
            .filter(|(_, handle)| {
                Arc::strong_count(handle) == 1
                    && handle.try_lock().is_some_and(|blk| !blk.is_in_core())
            })
            .map(|(id, _)| *id)
            .take(excess)
            .collect();
        for id in &victims {
            resident.remove(id);
        }
        if !victims.is_empty() {
            self.stats
                .evictions
                .fetch_add(victims.len() as u64, Ordering::Relaxed);
            debug!(evicted = victims.len(), resident = resident.len(), "pool.evict");
        } else {
            trace!(resident = resident.len(), "pool.over_capacity");
        }
    }
}
