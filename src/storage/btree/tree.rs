use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::codecs::Codec;
use super::page::{KeyPage, PageEnv, PageRef};
use super::split::{SplitPool, SplitRequest, SplitSide};
use super::stats::BTreeStatsSnapshot;
use crate::types::{BlockId, Result, StoreError};

/// Shape of a tree as seen by [`BTree::verify`].
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeReport {
    /// Pages visited.
    pub pages: usize,
    /// Entries across all pages.
    pub keys: usize,
    /// Number of levels; a single leaf root has depth 1.
    pub depth: usize,
}

/// Disk-backed B-tree with pre-emptive median splits.
///
/// Inserts hold the tree lock exclusively; lookups share it, so no reader ever sees a
/// page between a split and the promotion of its median.
pub struct BTree<K, V> {
    env: Arc<PageEnv>,
    splits: Arc<SplitPool>,
    root: RwLock<PageRef<K, V>>,
}

impl<K: Codec + Ord, V: Codec> BTree<K, V> {
    /// Creates an empty tree whose root is a fresh leaf.
    pub fn create(env: Arc<PageEnv>, splits: Arc<SplitPool>) -> Result<Self> {
        let root = KeyPage::create(&env, true)?;
        info!(root = %root.id(), max_keys = env.layout().max_keys(), "btree.create");
        Ok(Self {
            env,
            splits,
            root: RwLock::new(root),
        })
    }

    /// Opens the tree rooted at `root_id`.
    pub fn open(env: Arc<PageEnv>, splits: Arc<SplitPool>, root_id: BlockId) -> Result<Self> {
        let root = KeyPage::load(&env, root_id)?;
        info!(root = %root_id, "btree.open");
        Ok(Self {
            env,
            splits,
            root: RwLock::new(root),
        })
    }

    /// Block id of the root page. Stable for the life of the tree.
    pub fn root_id(&self) -> BlockId {
        self.root.read().id()
    }

    /// Root page.
    pub fn root(&self) -> PageRef<K, V> {
        Arc::clone(&self.root.read())
    }

    /// Shared page environment.
    pub fn env(&self) -> &Arc<PageEnv> {
        &self.env
    }

    /// Inserts or replaces `key`. Returns `true` when the key was not present.
    ///
    /// A key or value too large for one record is rejected before the tree changes.
    pub fn insert(&self, key: K, value: V) -> Result<bool> {
        self.env.check_record(&key)?;
        self.env.check_record(&value)?;
        let root = self.root.write();
        if root.is_full() {
            self.split_root(&root)?;
        }
        let mut node = Arc::clone(&root);
        loop {
            let mut guard = node.lock();
            let (idx, found) = guard.search(&key)?;
            if found {
                guard.set_value(idx, Some(value))?;
                return Ok(false);
            }
            if guard.is_leaf() {
                guard.insert_entry(idx, key, Some(value))?;
                return Ok(true);
            }
            let mut child = guard.child(idx)?.ok_or_else(|| missing_child(node.id(), idx))?;
            drop(guard);
            if child.is_full() {
                let sibling = self.split_child(&node, idx, &child)?;
                let median = node
                    .get_key(idx)?
                    .ok_or_else(|| StoreError::Invariant(format!("median missing on page {}", node.id())))?;
                match key.cmp(&median) {
                    Ordering::Equal => {
                        node.lock().set_value(idx, Some(value))?;
                        return Ok(false);
                    }
                    Ordering::Greater => child = sibling,
                    Ordering::Less => {}
                }
            }
            node = child;
        }
    }

    /// Splits a full root in place: LEFT and RIGHT halves run concurrently under one
    /// barrier, then the root keeps only the median. The root id never changes.
    fn split_root(&self, root: &PageRef<K, V>) -> Result<()> {
        let requests = vec![
            SplitRequest::new(Arc::clone(root), SplitSide::Left),
            SplitRequest::new(Arc::clone(root), SplitSide::Right),
        ];
        let done = self.splits.dispatch(requests)?;
        root.lock().collapse_to_median()?;
        self.env.stats().inc_root_splits();
        debug!(
            root = %root.id(),
            halves = done.len(),
            "btree.split.root"
        );
        Ok(())
    }

    /// Splits the full `child` at `parent[idx]` and promotes its median into `parent`.
    ///
    /// The child lock is released before the parent lock is taken.
    fn split_child(
        &self,
        parent: &PageRef<K, V>,
        idx: usize,
        child: &PageRef<K, V>,
    ) -> Result<PageRef<K, V>> {
        let request = SplitRequest::new(Arc::clone(child), SplitSide::Right);
        let mut done = self.splits.dispatch(vec![request])?;
        let sibling = done
            .pop()
            .ok_or_else(|| StoreError::Invariant("split request lost".to_string()))?
            .result()?;
        let (key, value, installed) = child.lock().take_median()?;
        if !installed.as_ref().is_some_and(|page| Arc::ptr_eq(page, &sibling)) {
            return Err(StoreError::Invariant(format!(
                "split of page {} did not install its sibling",
                child.id()
            )));
        }
        let mut guard = parent.lock();
        guard.insert_slots(idx, key, value)?;
        guard.set_child(idx + 1, Some(Arc::clone(&sibling)))?;
        debug!(
            parent = %parent.id(),
            child = %child.id(),
            sibling = %sibling.id(),
            "btree.split.child"
        );
        Ok(sibling)
    }

    /// Value stored under `key`. `Ok(None)` also covers a present key with no value.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(self.find(key)?.flatten())
    }

    /// True when `key` is present.
    pub fn contains(&self, key: &K) -> Result<bool> {
        Ok(self.find(key)?.is_some())
    }

    fn find(&self, key: &K) -> Result<Option<Option<V>>> {
        let root = self.root.read();
        let mut node = Arc::clone(&root);
        loop {
            let mut guard = node.lock();
            let (idx, found) = guard.search(key)?;
            if found {
                return guard.value(idx).map(Some);
            }
            if guard.is_leaf() {
                return Ok(None);
            }
            let child = guard.child(idx)?.ok_or_else(|| missing_child(node.id(), idx))?;
            drop(guard);
            node = child;
        }
    }

    /// Smallest key.
    pub fn first(&self) -> Result<Option<K>> {
        self.edge(false)
    }

    /// Largest key.
    pub fn last(&self) -> Result<Option<K>> {
        self.edge(true)
    }

    fn edge(&self, rightmost: bool) -> Result<Option<K>> {
        let root = self.root.read();
        let mut node = Arc::clone(&root);
        loop {
            let mut guard = node.lock();
            let n = guard.num_keys();
            if n == 0 {
                return Ok(None);
            }
            if guard.is_leaf() {
                return guard.key(if rightmost { n - 1 } else { 0 });
            }
            let idx = if rightmost { n } else { 0 };
            let child = guard.child(idx)?.ok_or_else(|| missing_child(node.id(), idx))?;
            drop(guard);
            node = child;
        }
    }

    /// All entries in key order.
    pub fn entries(&self) -> Result<Vec<(K, Option<V>)>> {
        let root = self.root.read();
        let mut out = Vec::new();
        Self::collect(&root, &mut out)?;
        Ok(out)
    }

    fn collect(page: &PageRef<K, V>, out: &mut Vec<(K, Option<V>)>) -> Result<()> {
        let mut guard = page.lock();
        let n = guard.num_keys();
        let leaf = guard.is_leaf();
        let mut children = Vec::with_capacity(n + 1);
        let mut entries = Vec::with_capacity(n);
        for i in 0..n {
            let key = guard
                .key(i)?
                .ok_or_else(|| StoreError::Invariant(format!("empty key slot {i} on page {}", page.id())))?;
            entries.push((key, guard.value(i)?));
        }
        if !leaf {
            for i in 0..=n {
                children.push(guard.child(i)?.ok_or_else(|| missing_child(page.id(), i))?);
            }
        }
        drop(guard);
        let mut entries = entries.into_iter();
        for child in &children {
            Self::collect(child, out)?;
            if let Some(entry) = entries.next() {
                out.push(entry);
            }
        }
        out.extend(entries);
        Ok(())
    }

    /// Number of entries.
    pub fn len(&self) -> Result<usize> {
        Ok(self.verify()?.keys)
    }

    /// True when the tree holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.root.read().num_keys() == 0)
    }

    /// Saves every materialized page (children before parents) and flushes the pool.
    pub fn flush(&self) -> Result<()> {
        let root = self.root.write();
        root.put_pages()?;
        self.env.pool().flush()?;
        debug!(root = %root.id(), "btree.flush");
        self.env.stats().emit_tracing();
        Ok(())
    }

    /// Walks the whole tree checking key order, slot consistency, leaf flags, child
    /// counts, separator bracketing and uniform leaf depth.
    pub fn verify(&self) -> Result<TreeReport> {
        let root = self.root.read();
        let mut report = TreeReport::default();
        let depth = Self::verify_page(&root, None, None, &mut report)?;
        report.depth = depth;
        Ok(report)
    }

    fn verify_page(
        page: &PageRef<K, V>,
        lower: Option<&K>,
        upper: Option<&K>,
        report: &mut TreeReport,
    ) -> Result<usize> {
        let mut guard = page.lock();
        guard.check_slots()?;
        guard.check_leaf_flag()?;
        let n = guard.num_keys();
        let mut keys = Vec::with_capacity(n);
        for i in 0..n {
            let key = guard
                .key(i)?
                .ok_or_else(|| StoreError::Invariant(format!("empty key slot {i} on page {}", page.id())))?;
            keys.push(key);
        }
        if keys.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(StoreError::Invariant(format!("keys out of order on page {}", page.id())));
        }
        let below = |k: &K| lower.is_some_and(|lo| k < lo);
        let above = |k: &K| upper.is_some_and(|hi| k > hi);
        if keys.iter().any(|k| below(k) || above(k)) {
            return Err(StoreError::Invariant(format!(
                "page {} holds keys outside its parent separators",
                page.id()
            )));
        }
        report.pages += 1;
        report.keys += n;
        if guard.is_leaf() {
            return Ok(1);
        }
        let mut children = Vec::with_capacity(n + 1);
        for i in 0..=n {
            children.push(guard.child(i)?.ok_or_else(|| missing_child(page.id(), i))?);
        }
        drop(guard);
        let mut depth = None;
        for (i, child) in children.iter().enumerate() {
            let lo = if i == 0 { lower } else { Some(&keys[i - 1]) };
            let hi = if i == n { upper } else { Some(&keys[i]) };
            let d = Self::verify_page(child, lo, hi, report)?;
            match depth {
                None => depth = Some(d),
                Some(prev) if prev != d => {
                    return Err(StoreError::Invariant(format!(
                        "leaves at different depths under page {}",
                        page.id()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(depth.unwrap_or(0) + 1)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> BTreeStatsSnapshot {
        self.env.stats().snapshot()
    }
}

fn missing_child(page: BlockId, idx: usize) -> StoreError {
    StoreError::Invariant(format!("internal page {page} has no child at {idx}"))
}
