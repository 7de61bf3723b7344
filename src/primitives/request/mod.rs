#![forbid(unsafe_code)]
//! Block I/O requests and the shard workers that execute them.
//!
//! Every request runs against the [`IoUnit`] of one shard and reports through a
//! [`Completion`], either a point-to-point latch or one slot of a shared barrier.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::primitives::block::BlockHandle;
use crate::primitives::cache::NodeBlockBuffer;
use crate::primitives::concurrency::Completion;
use crate::primitives::io::BlockIo;
use crate::types::{BlockId, Result, ShardId, StoreError};

mod worker;

pub use worker::{IoManager, IoWorker};

/// Everything a request needs to run on one shard: the backing handle and, for remote
/// workers, the shard's Node Block Buffer.
pub struct IoUnit {
    shard: ShardId,
    channel: Box<dyn BlockIo>,
    cache: Option<Arc<NodeBlockBuffer>>,
}

impl IoUnit {
    /// Binds a channel (and optional cache) to `shard`.
    pub fn new(
        shard: ShardId,
        channel: Box<dyn BlockIo>,
        cache: Option<Arc<NodeBlockBuffer>>,
    ) -> Self {
        Self {
            shard,
            channel,
            cache,
        }
    }

    /// Shard served by this unit.
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Backing handle.
    pub fn channel(&mut self) -> &mut dyn BlockIo {
        self.channel.as_mut()
    }

    /// Node Block Buffer, present for remote workers.
    pub fn cache(&self) -> Option<&Arc<NodeBlockBuffer>> {
        self.cache.as_ref()
    }

    /// Drains the cache, if any, through the backing handle.
    pub fn drain(&mut self) -> Result<()> {
        match self.cache.as_ref() {
            Some(cache) => cache.force(self.channel.as_mut()),
            None => Ok(()),
        }
    }
}

/// A unit of work executed by a shard worker.
pub trait IoRequest: Send + fmt::Display {
    /// Shard the request must run on.
    fn shard(&self) -> ShardId;
    /// Performs the request against the shard's handle.
    fn run(&mut self, unit: &mut IoUnit) -> Result<()>;
    /// Signals the outcome to whoever waits on this request.
    fn complete(self: Box<Self>, outcome: Result<()>);
}

fn handle_identity(handle: &BlockHandle) -> (BlockId, usize) {
    let blk = handle.lock();
    (blk.id(), blk.used())
}

/// Seek to a block and read its used range into a caller-supplied buffer.
pub struct SeekReadRequest {
    block: BlockId,
    target: BlockHandle,
    done: Completion<()>,
}

impl SeekReadRequest {
    /// Reads into `target`, signalling `done`.
    pub fn new(target: BlockHandle, done: Completion<()>) -> Self {
        let (block, _) = handle_identity(&target);
        Self {
            block,
            target,
            done,
        }
    }
}

impl IoRequest for SeekReadRequest {
    fn shard(&self) -> ShardId {
        self.block.shard()
    }

    fn run(&mut self, unit: &mut IoUnit) -> Result<()> {
        let mut blk = self.target.lock();
        if blk.is_in_core() {
            return Err(StoreError::Invariant(format!(
                "read of block {} would overwrite unflushed content",
                self.block
            )));
        }
        if let Some(cached) = unit.cache().and_then(|cache| cache.get(self.block)) {
            cached.clone_into_block(&mut blk);
            trace!(request = %self, "io.read.cache_hit");
            return Ok(());
        }
        unit.channel().seek(self.block.offset())?;
        unit.channel().read_used(&mut blk)?;
        if let Some(cache) = unit.cache() {
            cache.put(blk.clone())?;
        }
        Ok(())
    }

    fn complete(self: Box<Self>, outcome: Result<()>) {
        self.done.complete(outcome);
    }
}

impl fmt::Display for SeekReadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SeekRead(shard={}, offset={})",
            self.block.shard(),
            self.block.offset()
        )
    }
}

/// Seek to a block, write its used range, force durability, and clear its in-core flag.
pub struct SeekWriteRequest {
    block: BlockId,
    used: usize,
    source: BlockHandle,
    done: Completion<()>,
}

impl SeekWriteRequest {
    /// Writes `source`, signalling `done`.
    pub fn new(source: BlockHandle, done: Completion<()>) -> Self {
        let (block, used) = handle_identity(&source);
        Self {
            block,
            used,
            source,
            done,
        }
    }
}

impl IoRequest for SeekWriteRequest {
    fn shard(&self) -> ShardId {
        self.block.shard()
    }

    fn run(&mut self, unit: &mut IoUnit) -> Result<()> {
        let mut blk = self.source.lock();
        self.used = blk.used();
        if let Some(cache) = unit.cache() {
            let mut pending = blk.clone();
            pending.set_in_core(true);
            cache.put(pending)?;
        }
        unit.channel().seek(self.block.offset())?;
        unit.channel().write_used(&blk)?;
        unit.channel().force()?;
        blk.set_in_core(false);
        if let Some(cache) = unit.cache() {
            cache.mark_clean(self.block);
        }
        Ok(())
    }

    fn complete(self: Box<Self>, outcome: Result<()>) {
        self.done.complete(outcome);
    }
}

impl fmt::Display for SeekWriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SeekWrite(shard={}, offset={}, used={})",
            self.block.shard(),
            self.block.offset(),
            self.used
        )
    }
}

/// Durability barrier for a shard with no data transfer.
pub struct SyncRequest {
    shard: ShardId,
    done: Completion<()>,
}

impl SyncRequest {
    /// Forces `shard`, signalling `done`.
    pub fn new(shard: ShardId, done: Completion<()>) -> Self {
        Self { shard, done }
    }
}

impl IoRequest for SyncRequest {
    fn shard(&self) -> ShardId {
        self.shard
    }

    fn run(&mut self, unit: &mut IoUnit) -> Result<()> {
        let channel = unit.channel();
        if channel.is_open() {
            channel.force()?;
        }
        Ok(())
    }

    fn complete(self: Box<Self>, outcome: Result<()>) {
        self.done.complete(outcome);
    }
}

impl fmt::Display for SyncRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sync(shard={})", self.shard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::block::{Block, BlockKind};
    use crate::primitives::concurrency::latch;
    use crate::primitives::io::{FileChannel, MemFileIo};
    use parking_lot::Mutex;

    fn unit(mem: &MemFileIo, cache: Option<usize>) -> IoUnit {
        IoUnit::new(
            ShardId(0),
            Box::new(FileChannel::new(Arc::new(mem.clone()))),
            cache.map(|cap| Arc::new(NodeBlockBuffer::new(cap))),
        )
    }

    fn dirty_block(offset: u64, byte: u8) -> BlockHandle {
        let mut blk = Block::new(BlockId::new(ShardId(0), offset), 128);
        blk.reset(BlockKind::Data);
        blk.payload_mut()[0] = byte;
        blk.set_used(1).unwrap();
        Arc::new(Mutex::new(blk))
    }

    fn run(req: impl IoRequest + 'static, unit: &mut IoUnit) -> Result<()> {
        let mut req: Box<dyn IoRequest> = Box::new(req);
        let outcome = req.run(unit);
        let reported = outcome.as_ref().map(|_| ()).map_err(crate::types::clone_error);
        req.complete(reported);
        outcome
    }

    #[test]
    fn write_then_read_through_channel() {
        let mem = MemFileIo::new();
        let mut unit = unit(&mem, None);
        let src = dirty_block(128, 42);
        let (done, waiter) = latch();
        run(SeekWriteRequest::new(src.clone(), done), &mut unit).unwrap();
        waiter.wait_one().unwrap();
        assert!(!src.lock().is_in_core());
        assert_eq!(mem.sync_count(), 1);

        let dst = Arc::new(Mutex::new(Block::new(BlockId::new(ShardId(0), 128), 128)));
        let (done, waiter) = latch();
        run(SeekReadRequest::new(dst.clone(), done), &mut unit).unwrap();
        waiter.wait_one().unwrap();
        assert_eq!(dst.lock().used_payload(), &[42]);
    }

    #[test]
    fn read_into_in_core_block_fails_fast() {
        let mem = MemFileIo::new();
        let mut unit = unit(&mem, None);
        let target = dirty_block(0, 1);
        let (done, waiter) = latch();
        let err = run(SeekReadRequest::new(target, done), &mut unit).unwrap_err();
        assert!(matches!(err, StoreError::Invariant(_)));
        assert!(matches!(waiter.wait_one(), Err(StoreError::Invariant(_))));
        assert_eq!(mem.read_count(), 0);
    }

    #[test]
    fn remote_read_hits_cache_without_touching_handle() {
        let mem = MemFileIo::new();
        let mut unit = unit(&mem, Some(4));
        let src = dirty_block(256, 9);
        let (done, _waiter) = latch();
        run(SeekWriteRequest::new(src, done), &mut unit).unwrap();
        let cache = unit.cache().cloned().unwrap();
        assert_eq!(cache.in_core_count(), 0);
        assert!(cache.contains(BlockId::new(ShardId(0), 256)));

        let dst = Arc::new(Mutex::new(Block::new(BlockId::new(ShardId(0), 256), 128)));
        let (done, _waiter) = latch();
        run(SeekReadRequest::new(dst.clone(), done), &mut unit).unwrap();
        assert_eq!(mem.read_count(), 0);
        assert_eq!(dst.lock().used_payload(), &[9]);
        assert!(!dst.lock().is_in_core());
    }

    #[test]
    fn failed_remote_write_stays_in_core_until_forced() {
        let mem = MemFileIo::new();
        let mut unit = unit(&mem, Some(4));
        mem.fail_writes(true);
        let src = dirty_block(0, 5);
        let (done, waiter) = latch();
        assert!(run(SeekWriteRequest::new(src.clone(), done), &mut unit).is_err());
        assert!(matches!(waiter.wait_one(), Err(StoreError::Io(_))));
        assert!(src.lock().is_in_core());
        let cache = unit.cache().cloned().unwrap();
        assert_eq!(cache.in_core_count(), 1);

        mem.fail_writes(false);
        unit.drain().unwrap();
        assert_eq!(cache.in_core_count(), 0);
        assert_eq!(mem.write_count(), 1);
    }

    #[test]
    fn display_names_shard_and_offset() {
        let (done, _w) = latch();
        let req = SeekReadRequest::new(
            Arc::new(Mutex::new(Block::new(BlockId::new(ShardId(2), 4096), 128))),
            done,
        );
        assert_eq!(req.to_string(), "SeekRead(shard=2, offset=4096)");
        let (done, _w) = latch();
        assert_eq!(SyncRequest::new(ShardId(1), done).to_string(), "Sync(shard=1)");
    }
}
