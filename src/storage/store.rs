use std::fs;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::btree::{BTree, Codec, PageEnv, PageLayout, PageTree, SplitPool};
use super::objects::ObjectStore;
use super::options::StoreOptions;
use crate::primitives::io::{BlockIo, FileChannel, FileIo, StdFileIo};
use crate::primitives::pool::BufferPool;
use crate::primitives::request::IoManager;
use crate::types::{BlockId, Result, StoreError};

/// An open block store: one file per shard, its I/O workers, the buffer pool, the
/// record store and the split pool.
pub struct Store {
    options: StoreOptions,
    layout: PageLayout,
    io: Arc<IoManager>,
    pool: Arc<BufferPool>,
    objects: Arc<ObjectStore>,
    splits: Arc<SplitPool>,
    trees: Mutex<Vec<Weak<dyn PageTree>>>,
}

impl Store {
    /// Opens (or creates) the shard files `shard-<n>.blk` under `dir`.
    pub fn open(dir: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let files = (0..options.shards)
            .map(|shard| {
                let io = StdFileIo::open(dir.join(format!("shard-{shard}.blk")))?;
                Ok(Arc::new(io) as Arc<dyn FileIo>)
            })
            .collect::<Result<Vec<_>>>()?;
        info!(dir = %dir.display(), shards = options.shards, "store.open");
        Self::with_files(files, options)
    }

    /// Builds a store over caller-supplied shard files, one per shard.
    pub fn with_files(files: Vec<Arc<dyn FileIo>>, options: StoreOptions) -> Result<Self> {
        options.validate()?;
        if files.len() != options.shards as usize {
            return Err(StoreError::Invalid("one file per shard is required"));
        }
        let layout = PageLayout::new(options.block_size, options.max_keys)?;
        let mut lens = Vec::with_capacity(files.len());
        let mut channels: Vec<Box<dyn BlockIo>> = Vec::with_capacity(files.len());
        for file in files {
            lens.push(file.len()?);
            channels.push(Box::new(FileChannel::new(file)));
        }
        let io = Arc::new(IoManager::start(channels, options.node_cache_blocks)?);
        let pool = Arc::new(BufferPool::new(
            Arc::clone(&io),
            options.block_size,
            options.pool_blocks,
            &lens,
        ));
        let objects = Arc::new(ObjectStore::new(Arc::clone(&pool)));
        let splits = Arc::new(SplitPool::new(options.split_workers)?);
        info!(
            block_size = options.block_size,
            max_keys = layout.max_keys(),
            remote = options.node_cache_blocks.is_some(),
            "store.ready"
        );
        Ok(Self {
            options,
            layout,
            io,
            pool,
            objects,
            splits,
            trees: Mutex::new(Vec::new()),
        })
    }

    /// Options the store was opened with.
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Key page geometry.
    pub fn layout(&self) -> PageLayout {
        self.layout
    }

    /// Request pipeline.
    pub fn io(&self) -> &Arc<IoManager> {
        &self.io
    }

    /// Buffer pool.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Payload record store.
    pub fn objects(&self) -> &Arc<ObjectStore> {
        &self.objects
    }

    /// Page environment for a new tree, with its own counters.
    pub fn page_env(&self) -> Arc<PageEnv> {
        Arc::new(PageEnv::new(Arc::clone(&self.objects), self.layout))
    }

    /// Creates an empty tree.
    pub fn create_tree<K: Codec + Ord, V: Codec>(&self) -> Result<BTree<K, V>> {
        let tree = BTree::create(self.page_env(), Arc::clone(&self.splits))?;
        self.track(tree.root());
        Ok(tree)
    }

    /// Opens the tree whose root page is `root`.
    pub fn open_tree<K: Codec + Ord, V: Codec>(&self, root: BlockId) -> Result<BTree<K, V>> {
        let tree = BTree::open(self.page_env(), Arc::clone(&self.splits), root)?;
        self.track(tree.root());
        Ok(tree)
    }

    fn track(&self, root: Arc<dyn PageTree>) {
        let mut trees = self.trees.lock();
        trees.retain(|tree| tree.strong_count() > 0);
        trees.push(Arc::downgrade(&root));
    }

    /// Number of trees created or opened through this store that are still alive.
    pub fn open_trees(&self) -> usize {
        self.trees
            .lock()
            .iter()
            .filter(|tree| tree.strong_count() > 0)
            .count()
    }

    fn save_trees(&self) -> Result<()> {
        let live: Vec<Arc<dyn PageTree>> =
            self.trees.lock().iter().filter_map(Weak::upgrade).collect();
        for root in &live {
            root.save_pages()?;
            debug!(root = %root.root_id(), "store.tree_saved");
        }
        Ok(())
    }

    /// Saves the dirty pages of every open tree, writes every in-core block and syncs
    /// all shards.
    ///
    /// Pages are saved without the trees' writer locks; a tree still receiving inserts
    /// should be flushed through [`BTree::flush`] instead.
    pub fn flush(&self) -> Result<()> {
        self.save_trees()?;
        self.pool.flush()
    }

    /// Flushes (open trees included), then stops the split pool and the shard workers.
    /// Remote workers drain their Node Block Buffers on the way out.
    pub fn close(&self) -> Result<()> {
        let flushed = self.flush();
        if let Err(err) = &flushed {
            warn!(error = %err, "store.close.flush_failed");
        }
        self.splits.shutdown();
        let stopped = self.io.shutdown();
        info!("store.close");
        flushed.and(stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::MemFileIo;

    #[test]
    fn file_count_must_match_shards() {
        let files: Vec<Arc<dyn FileIo>> = vec![Arc::new(MemFileIo::new())];
        let err = Store::with_files(files, StoreOptions::default().shards(2))
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn open_creates_one_file_per_shard() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), StoreOptions::default().shards(3)).unwrap();
        for shard in 0..3 {
            assert!(dir.path().join(format!("shard-{shard}.blk")).exists());
        }
        store.close().unwrap();
    }

    #[test]
    fn close_saves_pages_of_open_trees() {
        let mem = MemFileIo::new();
        let options = StoreOptions::default().max_keys(5);
        let files: Vec<Arc<dyn FileIo>> = vec![Arc::new(mem.clone())];
        let store = Store::with_files(files, options.clone()).unwrap();
        let tree: BTree<u64, String> = store.create_tree().unwrap();
        for k in 0..40u64 {
            tree.insert(k, format!("v{k}")).unwrap();
        }
        let root = tree.root_id();
        assert_eq!(store.open_trees(), 1);
        store.close().unwrap();
        assert!(!tree.root().is_dirty());
        drop(tree);
        assert_eq!(store.open_trees(), 0);

        let files: Vec<Arc<dyn FileIo>> = vec![Arc::new(mem)];
        let store = Store::with_files(files, options).unwrap();
        let tree: BTree<u64, String> = store.open_tree(root).unwrap();
        assert_eq!(tree.len().unwrap(), 40);
        assert_eq!(tree.get(&17).unwrap(), Some("v17".to_string()));
        store.close().unwrap();
    }
}
