#![allow(missing_docs)]

use std::sync::Arc;

use blocktree::{
    primitives::{
        block::{Block, BlockHandle, BlockKind},
        cache::NodeBlockBuffer,
        concurrency::latch,
        io::{BlockIo, FileChannel, FileIo, MemFileIo},
        pool::BufferPool,
        request::{IoManager, SeekReadRequest},
    },
    BlockId, Result, ShardId, StoreError,
};
use parking_lot::Mutex;

const BLOCK: u32 = 512;

fn manager(files: &[MemFileIo], cache: Option<usize>) -> Result<Arc<IoManager>> {
    let channels: Vec<Box<dyn BlockIo>> = files
        .iter()
        .map(|mem| Box::new(FileChannel::new(Arc::new(mem.clone()))) as Box<dyn BlockIo>)
        .collect();
    Ok(Arc::new(IoManager::start(channels, cache)?))
}

fn data_block(shard: u8, offset: u64, fill: &[u8]) -> Result<BlockHandle> {
    let mut blk = Block::new(BlockId::new(ShardId(shard), offset), BLOCK);
    blk.reset(BlockKind::Data);
    blk.payload_mut()[..fill.len()].copy_from_slice(fill);
    blk.set_used(fill.len())?;
    Ok(Arc::new(Mutex::new(blk)))
}

fn empty_block(shard: u8, offset: u64) -> BlockHandle {
    Arc::new(Mutex::new(Block::new(BlockId::new(ShardId(shard), offset), BLOCK)))
}

#[test]
fn written_blocks_read_back_on_every_shard() -> Result<()> {
    let files = vec![MemFileIo::new(), MemFileIo::new()];
    let io = manager(&files, None)?;
    let blocks: Vec<BlockHandle> = (0..6)
        .map(|i| data_block(i % 2, u64::from(i / 2) * u64::from(BLOCK), &[i; 5]))
        .collect::<Result<_>>()?;
    io.write_blocks(&blocks)?;
    assert!(blocks.iter().all(|b| !b.lock().is_in_core()));
    assert_eq!(files[0].write_count(), 3);
    assert_eq!(files[1].write_count(), 3);

    for i in 0..6u8 {
        let target = empty_block(i % 2, u64::from(i / 2) * u64::from(BLOCK));
        io.read_block(&target)?;
        let blk = target.lock();
        assert_eq!(blk.kind(), BlockKind::Data);
        assert_eq!(blk.used_payload(), &[i; 5]);
        assert!(!blk.is_in_core());
    }
    io.shutdown()
}

#[test]
fn reading_over_unflushed_data_is_rejected() -> Result<()> {
    let files = vec![MemFileIo::new()];
    let io = manager(&files, None)?;
    let pending = data_block(0, 0, b"unsaved")?;
    let err = io.read_block(&pending).unwrap_err();
    assert!(matches!(err, StoreError::Invariant(_)));
    assert_eq!(pending.lock().used_payload(), b"unsaved");
    assert_eq!(files[0].read_count(), 0);
    io.shutdown()
}

#[test]
fn write_failure_reaches_the_barrier_and_block_stays_in_core() -> Result<()> {
    let files = vec![MemFileIo::new(), MemFileIo::new()];
    let io = manager(&files, None)?;
    files[1].fail_writes(true);
    let ok = data_block(0, 0, b"fine")?;
    let bad = data_block(1, 0, b"lost")?;
    let err = io.write_blocks(&[ok.clone(), bad.clone()]).unwrap_err();
    assert!(matches!(err, StoreError::Io(_)));
    assert!(!ok.lock().is_in_core());
    assert!(bad.lock().is_in_core());

    files[1].fail_writes(false);
    io.write_block(&bad)?;
    assert!(!bad.lock().is_in_core());
    io.shutdown()
}

#[test]
fn sync_failure_is_reported_per_shard() -> Result<()> {
    let files = vec![MemFileIo::new(), MemFileIo::new()];
    let io = manager(&files, None)?;
    files[0].fail_syncs(true);
    assert!(io.sync_shard(ShardId(1)).is_ok());
    assert!(matches!(io.sync_shard(ShardId(0)), Err(StoreError::Io(_))));
    assert!(io.sync_all().is_err());
    files[0].fail_syncs(false);
    io.sync_all()?;
    assert!(files[1].sync_count() >= 2);
    io.shutdown()
}

#[test]
fn requests_after_shutdown_are_closed() -> Result<()> {
    let files = vec![MemFileIo::new()];
    let io = manager(&files, None)?;
    io.shutdown()?;
    let target = empty_block(0, 0);
    let (done, waiter) = latch();
    io.submit(Box::new(SeekReadRequest::new(target, done)));
    assert!(matches!(waiter.wait_one(), Err(StoreError::Closed(_))));
    assert!(matches!(io.sync_all(), Err(StoreError::Closed(_))));
    Ok(())
}

#[test]
fn remote_worker_serves_reads_from_its_buffer() -> Result<()> {
    let files = vec![MemFileIo::new()];
    let io = manager(&files, Some(8))?;
    let src = data_block(0, u64::from(BLOCK), b"cached")?;
    io.write_block(&src)?;
    let cache = io.worker(ShardId(0))?.cache().cloned().expect("remote cache");
    assert!(cache.contains(src.lock().id()));
    assert_eq!(cache.in_core_count(), 0);

    let target = empty_block(0, u64::from(BLOCK));
    io.read_block(&target)?;
    assert_eq!(target.lock().used_payload(), b"cached");
    assert_eq!(files[0].read_count(), 0);
    io.shutdown()
}

#[test]
fn remote_failed_write_is_drained_on_shutdown() -> Result<()> {
    let files = vec![MemFileIo::new()];
    let io = manager(&files, Some(4))?;
    files[0].fail_writes(true);
    let src = data_block(0, 0, b"late")?;
    assert!(io.write_block(&src).is_err());
    let cache = io.worker(ShardId(0))?.cache().cloned().expect("remote cache");
    assert_eq!(cache.in_core_count(), 1);

    files[0].fail_writes(false);
    io.shutdown()?;
    assert_eq!(cache.in_core_count(), 0);

    let reader = manager(&files, None)?;
    let target = empty_block(0, 0);
    reader.read_block(&target)?;
    assert_eq!(target.lock().used_payload(), b"late");
    reader.shutdown()
}

#[test]
fn node_buffer_never_evicts_in_core_blocks() -> Result<()> {
    let cache = NodeBlockBuffer::new(2);
    let mut pinned = Block::new(BlockId::new(ShardId(0), 0), BLOCK);
    pinned.reset(BlockKind::Data);
    pinned.set_in_core(true);
    let mut other = Block::new(BlockId::new(ShardId(0), u64::from(BLOCK)), BLOCK);
    other.reset(BlockKind::Data);
    other.set_in_core(true);
    cache.put(pinned)?;
    cache.put(other)?;

    let mut third = Block::new(BlockId::new(ShardId(0), 2 * u64::from(BLOCK)), BLOCK);
    third.reset(BlockKind::Data);
    assert!(matches!(cache.put(third.clone()), Err(StoreError::StorageFault(_))));

    let mem = MemFileIo::new();
    let mut channel = FileChannel::new(Arc::new(mem.clone()));
    cache.force(&mut channel)?;
    assert_eq!(cache.in_core_count(), 0);
    assert_eq!(mem.write_count(), 2);
    cache.put(third)?;
    assert_eq!(cache.len(), 2);
    Ok(())
}

#[test]
fn pool_flush_writes_only_in_core_blocks() -> Result<()> {
    let files = vec![MemFileIo::new()];
    let io = manager(&files, None)?;
    let pool = BufferPool::new(Arc::clone(&io), BLOCK, 16, &[files[0].len()?]);
    let a = pool.allocate_fresh_block(BlockKind::Data)?;
    let b = pool.allocate_fresh_block(BlockKind::Data)?;
    {
        let mut blk = a.lock();
        blk.payload_mut()[0] = 7;
        blk.set_used(1)?;
        blk.set_in_core(true);
    }
    b.lock().set_in_core(false);
    pool.flush()?;
    assert_eq!(files[0].write_count(), 1);
    assert_eq!(pool.in_core_count(), 0);

    let a_id = a.lock().id();
    drop(a);
    drop(b);
    let again = pool.resolve_block(a_id)?;
    assert_eq!(again.lock().used_payload(), &[7]);
    io.shutdown()
}
