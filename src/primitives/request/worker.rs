use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{IoRequest, IoUnit, SeekReadRequest, SeekWriteRequest, SyncRequest};
use crate::primitives::block::BlockHandle;
use crate::primitives::cache::NodeBlockBuffer;
use crate::primitives::concurrency::{barrier, latch};
use crate::primitives::io::BlockIo;
use crate::types::{Result, ShardId, StoreError};

type Job = Box<dyn IoRequest>;

/// Background thread executing requests for one shard, in submission order.
pub struct IoWorker {
    shard: ShardId,
    remote: bool,
    cache: Option<Arc<NodeBlockBuffer>>,
    tx: Mutex<Option<Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl IoWorker {
    /// Starts a worker owning `channel`. A `cache` makes it a remote worker.
    pub fn spawn(
        shard: ShardId,
        channel: Box<dyn BlockIo>,
        cache: Option<Arc<NodeBlockBuffer>>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let remote = cache.is_some();
        let unit = IoUnit::new(shard, channel, cache.clone());
        let handle = thread::Builder::new()
            .name(format!("blocktree-io-{shard}"))
            .spawn(move || Self::worker_loop(unit, rx))
            .map_err(StoreError::from)?;
        info!(shard = shard.0, remote, "io.worker.start");
        Ok(Self {
            shard,
            remote,
            cache,
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    fn worker_loop(mut unit: IoUnit, rx: Receiver<Job>) -> Result<()> {
        while let Ok(mut req) = rx.recv() {
            debug!(request = %req, "io.worker.run");
            let outcome = req.run(&mut unit);
            if let Err(err) = &outcome {
                warn!(request = %req, error = %err, "io.worker.request_failed");
            }
            req.complete(outcome);
        }
        let drained = unit.drain();
        if let Err(err) = &drained {
            warn!(shard = unit.shard().0, error = %err, "io.worker.drain_failed");
        }
        debug!(shard = unit.shard().0, "io.worker.exit");
        drained
    }

    /// Shard served by this worker.
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// True when the worker keeps a Node Block Buffer.
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// The worker's Node Block Buffer, if remote.
    pub fn cache(&self) -> Option<&Arc<NodeBlockBuffer>> {
        self.cache.as_ref()
    }

    /// Queues a request. A stopped worker completes it with [`StoreError::Closed`].
    pub fn submit(&self, req: Job) {
        let sent = match self.tx.lock().as_ref() {
            Some(tx) => tx.send(req),
            None => Err(mpsc::SendError(req)),
        };
        if let Err(mpsc::SendError(req)) = sent {
            warn!(shard = self.shard.0, request = %req, "io.worker.submit_closed");
            req.complete(Err(StoreError::Closed("io worker stopped")));
        }
    }

    /// Stops the worker after its queue drains and reports the drain outcome.
    pub fn shutdown(&self) -> Result<()> {
        self.tx.lock().take();
        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(StoreError::Closed("io worker panicked")),
            },
            None => Ok(()),
        }
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(shard = self.shard.0, error = %err, "io.worker.drop_failed");
        }
    }
}

/// Front door of the request pipeline: one worker per shard.
pub struct IoManager {
    workers: Vec<IoWorker>,
}

impl IoManager {
    /// Spawns one worker per channel; shard ids follow the channel order.
    ///
    /// With `node_cache_blocks` set, each worker runs in remote mode with its own
    /// Node Block Buffer of that capacity.
    pub fn start(channels: Vec<Box<dyn BlockIo>>, node_cache_blocks: Option<usize>) -> Result<Self> {
        let mut workers = Vec::with_capacity(channels.len());
        for (idx, channel) in channels.into_iter().enumerate() {
            let shard = ShardId(idx as u8);
            let cache = node_cache_blocks.map(|cap| Arc::new(NodeBlockBuffer::new(cap)));
            workers.push(IoWorker::spawn(shard, channel, cache)?);
        }
        Ok(Self { workers })
    }

    /// Number of shards served.
    pub fn shard_count(&self) -> usize {
        self.workers.len()
    }

    /// Worker for `shard`.
    pub fn worker(&self, shard: ShardId) -> Result<&IoWorker> {
        self.workers
            .get(shard.0 as usize)
            .ok_or_else(|| StoreError::StorageFault(format!("no worker for shard {shard}")))
    }

    /// Submits a request to its shard's worker.
    pub fn submit(&self, req: Job) {
        match self.worker(req.shard()) {
            Ok(worker) => worker.submit(req),
            Err(err) => req.complete(Err(err)),
        }
    }

    /// Reads a block into `target` and waits for it.
    pub fn read_block(&self, target: &BlockHandle) -> Result<()> {
        let (done, waiter) = latch();
        self.submit(Box::new(SeekReadRequest::new(target.clone(), done)));
        waiter.wait_one()
    }

    /// Writes one block durably and waits for it.
    pub fn write_block(&self, source: &BlockHandle) -> Result<()> {
        let (done, waiter) = latch();
        self.submit(Box::new(SeekWriteRequest::new(source.clone(), done)));
        waiter.wait_one()
    }

    /// Writes many blocks in parallel across shards and waits for all of them.
    pub fn write_blocks(&self, sources: &[BlockHandle]) -> Result<()> {
        let (parts, waiter) = barrier(sources.len());
        for (source, done) in sources.iter().zip(parts) {
            self.submit(Box::new(SeekWriteRequest::new(source.clone(), done)));
        }
        waiter.wait().map(|_| ())
    }

    /// Forces one shard.
    pub fn sync_shard(&self, shard: ShardId) -> Result<()> {
        let (done, waiter) = latch();
        self.submit(Box::new(SyncRequest::new(shard, done)));
        waiter.wait_one()
    }

    /// Forces every shard; returns once all of them are durable.
    pub fn sync_all(&self) -> Result<()> {
        let (parts, waiter) = barrier(self.workers.len());
        for (worker, done) in self.workers.iter().zip(parts) {
            worker.submit(Box::new(SyncRequest::new(worker.shard(), done)));
        }
        waiter.wait().map(|_| ())
    }

    /// Stops every worker, returning the first failure.
    pub fn shutdown(&self) -> Result<()> {
        let mut first_err = None;
        for worker in &self.workers {
            if let Err(err) = worker.shutdown() {
                first_err.get_or_insert(err);
            }
        }
        info!(shards = self.workers.len(), "io.manager.shutdown");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::block::{Block, BlockKind};
    use crate::primitives::io::{FileChannel, MemFileIo};
    use crate::types::BlockId;
    use parking_lot::Mutex;

    fn manager(files: &[MemFileIo], cache: Option<usize>) -> IoManager {
        let channels = files
            .iter()
            .map(|mem| Box::new(FileChannel::new(Arc::new(mem.clone()))) as Box<dyn BlockIo>)
            .collect();
        IoManager::start(channels, cache).unwrap()
    }

    fn handle(shard: u8, offset: u64, byte: u8) -> BlockHandle {
        let mut blk = Block::new(BlockId::new(ShardId(shard), offset), 128);
        blk.reset(BlockKind::Data);
        blk.payload_mut()[0] = byte;
        blk.set_used(1).unwrap();
        Arc::new(Mutex::new(blk))
    }

    #[test]
    fn writes_fan_out_across_shards() {
        let files = vec![MemFileIo::new(), MemFileIo::new()];
        let io = manager(&files, None);
        let blocks = vec![handle(0, 0, 1), handle(1, 0, 2), handle(0, 128, 3)];
        io.write_blocks(&blocks).unwrap();
        assert!(blocks.iter().all(|b| !b.lock().is_in_core()));
        assert_eq!(files[0].write_count(), 2);
        assert_eq!(files[1].write_count(), 1);
        io.sync_all().unwrap();
        io.shutdown().unwrap();
    }

    #[test]
    fn sync_failure_reaches_the_waiter() {
        let files = vec![MemFileIo::new(), MemFileIo::new()];
        let io = manager(&files, None);
        files[1].fail_syncs(true);
        assert!(matches!(io.sync_all(), Err(StoreError::Io(_))));
        assert!(io.sync_shard(ShardId(0)).is_ok());
    }

    #[test]
    fn unknown_shard_is_a_storage_fault() {
        let io = manager(&[MemFileIo::new()], None);
        let target = Arc::new(Mutex::new(Block::new(BlockId::new(ShardId(3), 0), 128)));
        assert!(matches!(
            io.read_block(&target),
            Err(StoreError::StorageFault(_))
        ));
    }

    #[test]
    fn stopped_worker_rejects_requests() {
        let io = manager(&[MemFileIo::new()], None);
        io.shutdown().unwrap();
        assert!(matches!(
            io.write_block(&handle(0, 0, 1)),
            Err(StoreError::Closed(_))
        ));
    }

    #[test]
    fn remote_shutdown_drains_cache() {
        let files = vec![MemFileIo::new()];
        let io = manager(&files, Some(8));
        files[0].fail_writes(true);
        let blk = handle(0, 0, 7);
        assert!(io.write_block(&blk).is_err());
        let cache = io.worker(ShardId(0)).unwrap().cache().cloned().unwrap();
        assert_eq!(cache.in_core_count(), 1);
        files[0].fail_writes(false);
        io.shutdown().unwrap();
        assert_eq!(cache.in_core_count(), 0);
        assert_eq!(files[0].write_count(), 1);
    }
}
