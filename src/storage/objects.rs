#![forbid(unsafe_code)]
//! Payload record store: length-prefixed key/value records packed into data blocks.
//!
//! Record layout inside a data block payload: `live: u8 (1)`, `len: u32`, `bytes[len]`.
//! An [`Optr`] addresses the first byte of the record.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::primitives::block::{BlockHandle, BlockKind};
use crate::primitives::pool::BufferPool;
use crate::storage::btree::Codec;
use crate::types::{BlockId, Optr, Result, ShardId, StoreError};

const RECORD_LIVE: u8 = 1;
const RECORD_HDR_LEN: usize = 5;
/// Data blocks with less spare room than this drop out of the insert rotation.
const MIN_SPARE: usize = RECORD_HDR_LEN + 1;

/// Counters for record traffic.
#[derive(Default, Debug, Clone, Copy)]
pub struct ObjectStatsSnapshot {
    /// Records deserialized from a block.
    pub reads: u64,
    /// Records written.
    pub writes: u64,
    /// Records reclaimed.
    pub deletes: u64,
}

#[derive(Default)]
struct ObjectStats {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

/// Most blocks one insert resolves before it allocates a fresh block.
const MAX_RESOLVES: usize = 4;
/// Most blocks a shard keeps in its insert rotation.
const MAX_CANDIDATES: usize = 64;

/// Insert rotation of one shard: data blocks with spare room and their spare bytes as
/// of the last append, delete or read. Only this store appends to data blocks, so the
/// recorded spare never overstates what a block can take.
#[derive(Default)]
struct InsertCursor {
    candidates: SmallVec<[(BlockId, usize); 8]>,
    next: usize,
}

impl InsertCursor {
    fn position(&self, id: BlockId) -> Option<usize> {
        self.candidates.iter().position(|(cand, _)| *cand == id)
    }

    /// Records the spare room of `id`, joining the rotation when there is room for it.
    fn note(&mut self, id: BlockId, spare: usize) {
        match self.position(id) {
            Some(idx) if spare < MIN_SPARE => self.remove(idx),
            Some(idx) => self.candidates[idx].1 = spare,
            None if spare < MIN_SPARE => {}
            None => {
                if self.candidates.len() >= MAX_CANDIDATES {
                    let tightest = self
                        .candidates
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, (_, room))| *room)
                        .map(|(idx, (_, room))| (idx, *room));
                    match tightest {
                        Some((idx, room)) if room < spare => self.remove(idx),
                        _ => return,
                    }
                }
                self.candidates.push((id, spare));
            }
        }
    }

    fn remove(&mut self, idx: usize) {
        self.candidates.remove(idx);
        if self.next > idx {
            self.next -= 1;
        }
        if self.next >= self.candidates.len() {
            self.next = 0;
        }
    }
}

/// Serializes objects into shard-local data blocks and resolves pointers back to bytes.
pub struct ObjectStore {
    pool: Arc<BufferPool>,
    cursors: Mutex<Vec<InsertCursor>>,
    stats: ObjectStats,
}

impl ObjectStore {
    /// Creates a record store allocating data blocks from `pool`.
    pub fn new(pool: Arc<BufferPool>) -> Self {
        let shards = pool.shard_count();
        Self {
            pool,
            cursors: Mutex::new((0..shards).map(|_| InsertCursor::default()).collect()),
            stats: ObjectStats::default(),
        }
    }

    /// The buffer pool backing this store.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Largest record body that fits in one block.
    pub fn max_record_len(&self) -> usize {
        crate::types::block::payload_len(self.pool.block_size()) - RECORD_HDR_LEN
    }

    /// Writes `bytes` as a new record in `shard` and returns its pointer.
    ///
    /// Placement is first-fit over the shard's data blocks with spare room, starting at a
    /// rotating cursor. At most a few blocks are resolved per insert; a fresh block is
    /// allocated when none of them fits.
    pub fn add_object(&self, shard: ShardId, bytes: &[u8]) -> Result<Optr> {
        if bytes.len() > self.max_record_len() {
            return Err(StoreError::Invalid("record larger than a block payload"));
        }
        let need = RECORD_HDR_LEN + bytes.len();
        let mut cursors = self.cursors.lock();
        let cursor = cursors
            .get_mut(shard.0 as usize)
            .ok_or_else(|| StoreError::StorageFault(format!("record insert in unknown shard {shard}")))?;

        let count = cursor.candidates.len();
        let mut resolved = 0;
        let mut placed = None;
        let mut stale: SmallVec<[(BlockId, usize); 4]> = SmallVec::new();
        for step in 0..count {
            if resolved == MAX_RESOLVES {
                break;
            }
            let (id, room) = cursor.candidates[(cursor.next + step) % count];
            if room < need {
                continue;
            }
            resolved += 1;
            let handle = self.pool.resolve_block(id)?;
            let mut blk = handle.lock();
            if blk.kind() != BlockKind::Data {
                stale.push((id, 0));
                continue;
            }
            if blk.spare() >= need {
                let ptr = Self::append(&mut blk, bytes)?;
                placed = Some((id, blk.spare(), ptr));
                break;
            }
            stale.push((id, blk.spare()));
        }
        for (id, room) in stale {
            cursor.note(id, room);
        }
        let ptr = match placed {
            Some((id, room, ptr)) => {
                cursor.note(id, room);
                if let Some(idx) = cursor.position(id) {
                    cursor.next = idx;
                }
                ptr
            }
            None => {
                let handle = self.pool.allocate_in_shard(shard, BlockKind::Data)?;
                let mut blk = handle.lock();
                let ptr = Self::append(&mut blk, bytes)?;
                cursor.note(ptr.block, blk.spare());
                if let Some(idx) = cursor.position(ptr.block) {
                    cursor.next = idx;
                }
                debug!(block = %ptr.block, shard = shard.0, resolved, "objects.new_block");
                ptr
            }
        };
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        trace!(ptr = %ptr, len = bytes.len(), "objects.add");
        Ok(ptr)
    }

    fn append(blk: &mut crate::primitives::block::Block, bytes: &[u8]) -> Result<Optr> {
        let offset = blk.used();
        {
            let mut w = blk.writer(offset)?;
            w.write_u8(RECORD_LIVE)?;
            w.write_u32(bytes.len() as u32)?;
            w.write_slice(bytes)?;
        }
        blk.set_used(offset + RECORD_HDR_LEN + bytes.len())?;
        blk.set_live(blk.live() + 1);
        blk.set_in_core(true);
        Ok(Optr::new(blk.id(), offset as u16))
    }

    fn resolve_data(&self, ptr: Optr) -> Result<BlockHandle> {
        if ptr.is_empty() {
            return Err(StoreError::Invariant(
                "dereference of an empty pointer".to_string(),
            ));
        }
        self.pool.resolve_block(ptr.block)
    }

    /// Reads the record at `ptr`.
    pub fn read_object(&self, ptr: Optr) -> Result<Vec<u8>> {
        let handle = self.resolve_data(ptr)?;
        let blk = handle.lock();
        if blk.kind() != BlockKind::Data {
            return Err(StoreError::Corruption("pointer does not reference a data block"));
        }
        if ptr.offset as usize >= blk.used() {
            return Err(StoreError::Corruption("pointer beyond used payload"));
        }
        let mut r = blk.reader(ptr.offset as usize)?;
        if r.read_u8()? != RECORD_LIVE {
            return Err(StoreError::Corruption("pointer references a deleted record"));
        }
        let len = r.read_u32()? as usize;
        let bytes = r.read_slice(len)?.to_vec();
        let spare = blk.spare();
        drop(blk);
        self.learn(ptr.block, spare);
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(bytes)
    }

    /// Reclaims the record at `ptr`. A data block left without live records is reset
    /// and rejoins the insert rotation of its shard.
    pub fn delete_object(&self, ptr: Optr) -> Result<()> {
        let handle = self.resolve_data(ptr)?;
        let (emptied, spare) = {
            let mut blk = handle.lock();
            if blk.kind() != BlockKind::Data {
                return Err(StoreError::Corruption("pointer does not reference a data block"));
            }
            let len = {
                let mut r = blk.reader(ptr.offset as usize)?;
                if r.read_u8()? != RECORD_LIVE {
                    return Err(StoreError::Corruption("double delete of a record"));
                }
                r.read_u32()? as usize
            };
            blk.writer(ptr.offset as usize)?.zero(RECORD_HDR_LEN + len)?;
            let live = blk.live().saturating_sub(1);
            blk.set_live(live);
            if live == 0 {
                blk.reset(BlockKind::Data);
            }
            blk.set_in_core(true);
            (live == 0, blk.spare())
        };
        self.learn(ptr.block, spare);
        if emptied {
            debug!(block = %ptr.block, "objects.block_emptied");
        }
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        trace!(ptr = %ptr, "objects.delete");
        Ok(())
    }

    // Blocks written in earlier sessions join the rotation once they are touched.
    fn learn(&self, id: BlockId, spare: usize) {
        let mut cursors = self.cursors.lock();
        if let Some(cursor) = cursors.get_mut(id.shard().0 as usize) {
            cursor.note(id, spare);
        }
    }

    /// Encodes and stores a typed object.
    pub fn put<T: Codec>(&self, shard: ShardId, value: &T) -> Result<Optr> {
        let mut buf = Vec::new();
        T::encode(value, &mut buf);
        self.add_object(shard, &buf)
    }

    /// Reads and decodes a typed object.
    pub fn get<T: Codec>(&self, ptr: Optr) -> Result<T> {
        let bytes = self.read_object(ptr)?;
        T::decode(&bytes)
    }

    /// Snapshot of record counters.
    pub fn stats(&self) -> ObjectStatsSnapshot {
        ObjectStatsSnapshot {
            reads: self.stats.reads.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            deletes: self.stats.deletes.load(Ordering::Relaxed),
        }
    }
}
