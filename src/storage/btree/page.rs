//! In-memory projection of one B-tree node stored in a key-page block.
//!
//! The block payload holds a fixed slot table:
//! `leaf: u8`, `num_keys: u32`, `MAXKEYS x (key Optr, value Optr)`, `(MAXKEYS + 1) x child id`.
//! Keys, values and children are materialized lazily from those pointers and cached in
//! their slots; `save` writes pending slots back as records and rewrites the table.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use super::codecs::Codec;
use super::slot::{ChildSlot, KeySlot, PageLayout, ValueSlot};
use super::stats::BTreeStats;
use crate::primitives::block::{Block, BlockHandle, BlockKind};
use crate::primitives::pool::BufferPool;
use crate::storage::objects::ObjectStore;
use crate::types::{BlockId, Optr, Result, StoreError};

/// Shared page reference.
pub type PageRef<K, V> = Arc<KeyPage<K, V>>;

/// What every page of one tree shares: the record store, the slot geometry and counters.
pub struct PageEnv {
    objects: Arc<ObjectStore>,
    layout: PageLayout,
    stats: BTreeStats,
}

impl PageEnv {
    /// Bundles a record store with a page layout.
    pub fn new(objects: Arc<ObjectStore>, layout: PageLayout) -> Self {
        Self {
            objects,
            layout,
            stats: BTreeStats::default(),
        }
    }

    /// Record store for keys and values.
    pub fn objects(&self) -> &Arc<ObjectStore> {
        &self.objects
    }

    /// Buffer pool behind the record store.
    pub fn pool(&self) -> &Arc<BufferPool> {
        self.objects.pool()
    }

    /// Slot geometry.
    pub fn layout(&self) -> PageLayout {
        self.layout
    }

    /// Tree counters.
    pub fn stats(&self) -> &BTreeStats {
        &self.stats
    }

    /// Rejects a key or value whose encoding cannot be stored as one record.
    ///
    /// Slots are only written on save, so this runs when a slot is set; a pending slot
    /// that can never be saved would fail every later flush of the tree.
    pub fn check_record<T: Codec>(&self, value: &T) -> Result<()> {
        let mut buf = Vec::new();
        T::encode(value, &mut buf);
        if buf.len() > self.objects.max_record_len() {
            return Err(StoreError::Invalid("record larger than a block payload"));
        }
        Ok(())
    }
}

pub(super) struct PageState<K, V> {
    pub(super) leaf: bool,
    pub(super) num_keys: usize,
    pub(super) keys: Vec<KeySlot<K>>,
    pub(super) values: Vec<ValueSlot<V>>,
    pub(super) children: Vec<ChildSlot<K, V>>,
    pub(super) dirty: bool,
}

impl<K, V> PageState<K, V> {
    fn fresh(max_keys: usize, leaf: bool) -> Self {
        Self {
            leaf,
            num_keys: 0,
            keys: (0..max_keys).map(|_| KeySlot::Empty).collect(),
            values: (0..max_keys).map(|_| ValueSlot::Empty).collect(),
            children: (0..=max_keys).map(|_| ChildSlot::empty()).collect(),
            dirty: true,
        }
    }

    pub(super) fn clear_entry(&mut self, i: usize) {
        self.keys[i] = KeySlot::Empty;
        self.values[i] = ValueSlot::Empty;
    }
}

/// One B-tree node.
pub struct KeyPage<K, V> {
    id: BlockId,
    env: Arc<PageEnv>,
    block: BlockHandle,
    state: Mutex<PageState<K, V>>,
}

impl<K, V> fmt::Debug for KeyPage<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPage").field("id", &self.id).finish()
    }
}

impl<K, V> KeyPage<K, V> {
    /// Block id this page occupies.
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Environment shared with the rest of the tree.
    pub fn env(&self) -> &Arc<PageEnv> {
        &self.env
    }
}

impl<K: Codec + Ord, V: Codec> KeyPage<K, V> {
    /// Creates an empty page in a freshly allocated block. The page starts dirty.
    pub fn create(env: &Arc<PageEnv>, leaf: bool) -> Result<PageRef<K, V>> {
        let block = env.pool().allocate_fresh_block(BlockKind::KeyPage)?;
        let id = block.lock().id();
        trace!(page = %id, leaf, "btree.page.create");
        Ok(Arc::new(Self {
            id,
            env: Arc::clone(env),
            block,
            state: Mutex::new(PageState::fresh(env.layout.max_keys(), leaf)),
        }))
    }

    /// Reconstructs a page from its block. Only the slot table is read; keys, values
    /// and children stay unmaterialized.
    pub fn load(env: &Arc<PageEnv>, id: BlockId) -> Result<PageRef<K, V>> {
        let block = env.pool().resolve_block(id)?;
        let state = {
            let blk = block.lock();
            Self::decode_table(env.layout, &blk)?
        };
        trace!(page = %id, leaf = state.leaf, keys = state.num_keys, "btree.page.load");
        Ok(Arc::new(Self {
            id,
            env: Arc::clone(env),
            block,
            state: Mutex::new(state),
        }))
    }

    fn decode_table(layout: PageLayout, blk: &Block) -> Result<PageState<K, V>> {
        if blk.kind() != BlockKind::KeyPage {
            return Err(StoreError::Corruption("block is not a key page"));
        }
        let max = layout.max_keys();
        let mut r = blk.reader(0)?;
        let leaf = r.read_u8()? != 0;
        let num_keys = r.read_u32()? as usize;
        if num_keys > max {
            return Err(StoreError::Corruption("key count exceeds MAXKEYS"));
        }
        let mut keys = Vec::with_capacity(max);
        let mut values = Vec::with_capacity(max);
        for i in 0..max {
            let key_ptr = r.read_optr()?;
            let value_ptr = r.read_optr()?;
            if i >= num_keys && !(key_ptr.is_empty() && value_ptr.is_empty()) {
                return Err(StoreError::Corruption("occupied slot beyond key count"));
            }
            keys.push(KeySlot::from_ptr(key_ptr));
            values.push(ValueSlot::from_ptr(value_ptr));
        }
        let mut children = Vec::with_capacity(max + 1);
        for _ in 0..=max {
            children.push(ChildSlot {
                id: BlockId::from_raw(r.read_u64()?),
                page: None,
            });
        }
        Ok(PageState {
            leaf,
            num_keys,
            keys,
            values,
            children,
            dirty: false,
        })
    }

    fn encode_table(layout: PageLayout, st: &PageState<K, V>, blk: &mut Block) -> Result<()> {
        blk.set_kind(BlockKind::KeyPage);
        {
            let mut w = blk.writer(0)?;
            w.write_u8(u8::from(st.leaf))?;
            w.write_u32(st.num_keys as u32)?;
            for (key, value) in st.keys.iter().zip(&st.values) {
                w.write_optr(key.ptr())?;
                w.write_optr(value.ptr())?;
            }
            for child in &st.children {
                w.write_u64(BlockId::to_raw(child.block_id()))?;
            }
            debug_assert_eq!(w.position(), layout.table_len());
        }
        blk.set_used(layout.table_len())?;
        blk.set_in_core(true);
        Ok(())
    }

    /// Locks the page for a sequence of slot operations.
    pub fn lock(&self) -> PageGuard<'_, K, V> {
        PageGuard {
            page: self,
            st: self.state.lock(),
        }
    }

    /// Number of occupied key slots.
    pub fn num_keys(&self) -> usize {
        self.state.lock().num_keys
    }

    /// Leaf flag as stored.
    pub fn is_leaf(&self) -> bool {
        self.state.lock().leaf
    }

    /// True when the page holds MAXKEYS keys.
    pub fn is_full(&self) -> bool {
        self.num_keys() == self.env.layout.max_keys()
    }

    /// True when the page has unsaved changes.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// See [`PageGuard::search`].
    pub fn search(&self, target: &K) -> Result<(usize, bool)> {
        self.lock().search(target)
    }

    /// See [`PageGuard::key`].
    pub fn get_key(&self, i: usize) -> Result<Option<K>> {
        self.lock().key(i)
    }

    /// See [`PageGuard::value`].
    pub fn get_value(&self, i: usize) -> Result<Option<V>> {
        self.lock().value(i)
    }

    /// See [`PageGuard::child`].
    pub fn get_child(&self, i: usize) -> Result<Option<PageRef<K, V>>> {
        self.lock().child(i)
    }

    /// See [`PageGuard::delete`].
    pub fn delete(&self, i: usize) -> Result<()> {
        self.lock().delete(i)
    }

    /// See [`PageGuard::delete_value`].
    pub fn delete_value(&self, i: usize) -> Result<()> {
        self.lock().delete_value(i)
    }

    /// Writes pending slots and the slot table. No-op for a clean page.
    pub fn save(&self) -> Result<()> {
        self.lock().save()
    }

    /// Saves every materialized descendant, then this page.
    ///
    /// The page lock is released while children are saved so that locks are always
    /// taken child before parent.
    pub fn put_pages(&self) -> Result<()> {
        let children: Vec<PageRef<K, V>> = {
            let st = self.state.lock();
            st.children.iter().filter_map(|c| c.page.clone()).collect()
        };
        for child in &children {
            child.put_pages()?;
        }
        let mut guard = self.lock();
        for slot in guard.st.children.iter_mut() {
            if let Some(page) = &slot.page {
                slot.id = Some(page.id());
            }
        }
        guard.save()
    }
}

/// A tree's root page with its key and value types erased, so a store can save the
/// pages of every open tree.
pub trait PageTree: Send + Sync {
    /// Block id of the root page.
    fn root_id(&self) -> BlockId;
    /// Saves every materialized page below and including the root.
    fn save_pages(&self) -> Result<()>;
}

impl<K: Codec + Ord, V: Codec> PageTree for KeyPage<K, V> {
    fn root_id(&self) -> BlockId {
        self.id
    }

    fn save_pages(&self) -> Result<()> {
        self.put_pages()
    }
}

/// Exclusive access to one page's slots.
pub struct PageGuard<'a, K, V> {
    page: &'a KeyPage<K, V>,
    pub(super) st: MutexGuard<'a, PageState<K, V>>,
}

impl<'a, K: Codec + Ord, V: Codec> PageGuard<'a, K, V> {
    fn max_keys(&self) -> usize {
        self.page.env.layout.max_keys()
    }

    fn check_entry(&self, i: usize) -> Result<()> {
        if i >= self.max_keys() {
            return Err(StoreError::Invariant(format!(
                "slot {i} out of range on page {}",
                self.page.id
            )));
        }
        Ok(())
    }

    fn check_child(&self, i: usize) -> Result<()> {
        if i > self.max_keys() {
            return Err(StoreError::Invariant(format!(
                "child slot {i} out of range on page {}",
                self.page.id
            )));
        }
        Ok(())
    }

    /// Page identity.
    pub fn id(&self) -> BlockId {
        self.page.id
    }

    /// Number of occupied key slots.
    pub fn num_keys(&self) -> usize {
        self.st.num_keys
    }

    /// Leaf flag as stored.
    pub fn is_leaf(&self) -> bool {
        self.st.leaf
    }

    /// Overrides the leaf flag.
    pub fn set_leaf(&mut self, leaf: bool) {
        if self.st.leaf != leaf {
            self.st.leaf = leaf;
            self.st.dirty = true;
        }
    }

    /// True when the page has unsaved changes.
    pub fn is_dirty(&self) -> bool {
        self.st.dirty
    }

    /// Key at slot `i`, deserialized on first access.
    pub fn key(&mut self, i: usize) -> Result<Option<K>> {
        self.check_entry(i)?;
        let ptr = match &self.st.keys[i] {
            KeySlot::Empty => return Ok(None),
            KeySlot::Loaded(_, key) | KeySlot::Dirty(key) => return Ok(Some(key.clone())),
            KeySlot::Unloaded(ptr) => *ptr,
        };
        let key: K = self.page.env.objects.get(ptr)?;
        self.page.env.stats.inc_key_loads();
        self.st.keys[i] = KeySlot::Loaded(ptr, key.clone());
        Ok(Some(key))
    }

    /// Value at slot `i`, deserialized on first access.
    pub fn value(&mut self, i: usize) -> Result<Option<V>> {
        self.check_entry(i)?;
        let ptr = match &self.st.values[i] {
            ValueSlot::Empty => return Ok(None),
            ValueSlot::Loaded(_, value) => return Ok(Some(value.clone())),
            ValueSlot::Dirty { value, .. } => return Ok(value.clone()),
            ValueSlot::Unloaded(ptr) => *ptr,
        };
        let value: V = self.page.env.objects.get(ptr)?;
        self.page.env.stats.inc_value_loads();
        self.st.values[i] = ValueSlot::Loaded(ptr, value.clone());
        Ok(Some(value))
    }

    /// Child page at slot `i`, loaded from its block on first access.
    ///
    /// A loaded child stays attached to its parent for the life of the tree, so there is
    /// one in-memory copy per page and the buffer pool never evicts key-page blocks of
    /// materialized pages.
    pub fn child(&mut self, i: usize) -> Result<Option<PageRef<K, V>>> {
        self.check_child(i)?;
        let slot = &self.st.children[i];
        if let Some(page) = &slot.page {
            return Ok(Some(Arc::clone(page)));
        }
        let Some(id) = slot.id else {
            return Ok(None);
        };
        let page = KeyPage::load(&self.page.env, id)?;
        self.page.env.stats.inc_child_loads();
        self.st.children[i].page = Some(Arc::clone(&page));
        Ok(Some(page))
    }

    /// Block id of child `i` without materializing it.
    pub fn child_id(&self, i: usize) -> Option<BlockId> {
        self.st.children.get(i).and_then(ChildSlot::block_id)
    }

    /// Stored key pointer of slot `i`.
    pub fn key_ptr(&self, i: usize) -> Optr {
        self.st.keys.get(i).map_or(Optr::EMPTY, KeySlot::ptr)
    }

    /// Stored value pointer of slot `i`.
    pub fn value_ptr(&self, i: usize) -> Optr {
        self.st.values.get(i).map_or(Optr::EMPTY, ValueSlot::ptr)
    }

    /// Binary search over the occupied keys.
    ///
    /// Returns `(i, true)` when `keys[i] == target`; otherwise `(i, false)` where `i` is
    /// the first slot whose key is greater than `target`, so `i - 1` is the predecessor.
    pub fn search(&mut self, target: &K) -> Result<(usize, bool)> {
        self.page.env.stats.inc_searches();
        let (mut lo, mut hi) = (0usize, self.st.num_keys);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let key = self.key(mid)?.ok_or_else(|| {
                StoreError::Invariant(format!(
                    "empty key slot {mid} inside key range of page {}",
                    self.page.id
                ))
            })?;
            match key.cmp(target) {
                Ordering::Less => lo = mid + 1,
                Ordering::Equal => return Ok((mid, true)),
                Ordering::Greater => hi = mid,
            }
        }
        Ok((lo, false))
    }

    /// Sets the key at slot `i`; it is written on the next save.
    pub fn set_key(&mut self, i: usize, key: K) -> Result<()> {
        self.check_entry(i)?;
        self.page.env.check_record(&key)?;
        self.st.keys[i] = KeySlot::Dirty(key);
        self.st.dirty = true;
        Ok(())
    }

    /// Replaces or clears the value at slot `i`; the old record is reclaimed on save.
    pub fn set_value(&mut self, i: usize, value: Option<V>) -> Result<()> {
        self.check_entry(i)?;
        if let Some(v) = &value {
            self.page.env.check_record(v)?;
        }
        self.st.values[i].replace(value);
        self.st.dirty = true;
        Ok(())
    }

    /// Installs `child` at child slot `i`.
    pub fn set_child(&mut self, i: usize, child: Option<PageRef<K, V>>) -> Result<()> {
        self.check_child(i)?;
        self.st.children[i] = ChildSlot {
            id: child.as_ref().map(|page| page.id()),
            page: child,
        };
        self.st.dirty = true;
        Ok(())
    }

    /// Sets the key count. Slots at or beyond `n` must already be clear.
    pub fn set_num_keys(&mut self, n: usize) -> Result<()> {
        if n > self.max_keys() {
            return Err(StoreError::Invariant(format!(
                "key count {n} exceeds MAXKEYS on page {}",
                self.page.id
            )));
        }
        self.st.num_keys = n;
        self.st.dirty = true;
        Ok(())
    }

    /// Inserts a new entry at slot `i`, shifting later entries right.
    ///
    /// On internal pages the children after `i` shift too, leaving child `i + 1` empty
    /// for the caller to fill.
    pub fn insert_entry(&mut self, i: usize, key: K, value: Option<V>) -> Result<()> {
        self.page.env.check_record(&key)?;
        if let Some(v) = &value {
            self.page.env.check_record(v)?;
        }
        self.insert_slots(i, KeySlot::Dirty(key), ValueSlot::Dirty {
            stale: Optr::EMPTY,
            value,
        })
    }

    /// Same as [`PageGuard::insert_entry`] for slots moved from another page.
    pub(super) fn insert_slots(&mut self, i: usize, key: KeySlot<K>, value: ValueSlot<V>) -> Result<()> {
        let n = self.st.num_keys;
        if n >= self.max_keys() || i > n {
            return Err(StoreError::Invariant(format!(
                "insert at {i} into page {} holding {n} keys",
                self.page.id
            )));
        }
        self.st.keys[i..=n].rotate_right(1);
        self.st.values[i..=n].rotate_right(1);
        if !self.st.leaf {
            self.st.children[i + 1..=n + 1].rotate_right(1);
            self.st.children[i + 1] = ChildSlot::empty();
        }
        self.st.keys[i] = key;
        self.st.values[i] = value;
        self.st.num_keys = n + 1;
        self.st.dirty = true;
        Ok(())
    }

    /// Removes entry `i`, compacting later entries (and the children to their right)
    /// leftward and clearing the vacated trailing slots.
    pub fn delete(&mut self, i: usize) -> Result<()> {
        let n = self.st.num_keys;
        if i >= n {
            return Err(StoreError::Invariant(format!(
                "delete of slot {i} on page {} holding {n} keys",
                self.page.id
            )));
        }
        if i + 1 < n {
            self.st.keys[i..n].rotate_left(1);
            self.st.values[i..n].rotate_left(1);
            self.st.children[i + 1..=n].rotate_left(1);
        }
        let last = n - 1;
        self.st.clear_entry(last);
        self.st.children[last + 1] = ChildSlot::empty();
        self.st.num_keys = last;
        self.st.dirty = true;
        Ok(())
    }

    /// Reclaims the stored value record of slot `i` and clears the value.
    pub fn delete_value(&mut self, i: usize) -> Result<()> {
        self.check_entry(i)?;
        let stale = match &self.st.values[i] {
            ValueSlot::Empty => return Ok(()),
            ValueSlot::Unloaded(ptr) | ValueSlot::Loaded(ptr, _) => *ptr,
            ValueSlot::Dirty { stale, .. } => *stale,
        };
        if !stale.is_empty() {
            self.page.env.objects.delete_object(stale)?;
        }
        self.st.values[i] = ValueSlot::Dirty {
            stale: Optr::EMPTY,
            value: None,
        };
        self.st.dirty = true;
        Ok(())
    }

    /// Writes pending keys and values as records, then rewrites the slot table.
    pub fn save(&mut self) -> Result<()> {
        if !self.st.dirty {
            return Ok(());
        }
        let shard = self.page.id.shard();
        let objects = Arc::clone(&self.page.env.objects);
        for slot in self.st.keys.iter_mut() {
            let pending = match slot {
                KeySlot::Dirty(key) => Some(key.clone()),
                _ => None,
            };
            if let Some(key) = pending {
                let ptr = objects.put(shard, &key)?;
                *slot = KeySlot::Loaded(ptr, key);
            }
        }
        for slot in self.st.values.iter_mut() {
            let (stale, value) = match slot {
                ValueSlot::Dirty { stale, value } => (*stale, value.clone()),
                _ => continue,
            };
            let ptr = match &value {
                Some(v) => objects.put(shard, v)?,
                None => Optr::EMPTY,
            };
            if !stale.is_empty() {
                objects.delete_object(stale)?;
            }
            *slot = match value {
                Some(v) => ValueSlot::Loaded(ptr, v),
                None => ValueSlot::Empty,
            };
        }
        {
            let mut blk = self.page.block.lock();
            KeyPage::encode_table(self.page.env.layout, &self.st, &mut blk)?;
        }
        self.st.dirty = false;
        self.page.env.stats.inc_page_saves();
        debug!(page = %self.page.id, keys = self.st.num_keys, leaf = self.st.leaf, "btree.page.save");
        Ok(())
    }

    /// Removes the median entry after a RIGHT split of this full page.
    ///
    /// Returns the median slots and the new sibling installed at child `T`; the page is
    /// left with its lower `T - 1` entries and `T` children.
    pub(super) fn take_median(&mut self) -> Result<(KeySlot<K>, ValueSlot<V>, Option<PageRef<K, V>>)> {
        let t = self.page.env.layout.degree();
        if self.st.num_keys != self.max_keys() {
            return Err(StoreError::Invariant(format!(
                "median taken from page {} holding {} keys",
                self.page.id, self.st.num_keys
            )));
        }
        let key = std::mem::replace(&mut self.st.keys[t - 1], KeySlot::Empty);
        let value = std::mem::replace(&mut self.st.values[t - 1], ValueSlot::Empty);
        let sibling = std::mem::take(&mut self.st.children[t]).page;
        for i in t - 1..self.max_keys() {
            self.st.clear_entry(i);
        }
        for slot in self.st.children[t..].iter_mut() {
            *slot = ChildSlot::empty();
        }
        self.st.num_keys = t - 1;
        self.st.dirty = true;
        Ok((key, value, sibling))
    }

    /// After a LEFT and a RIGHT split of this page, keeps only the median entry with the
    /// two new pages as its children.
    pub(super) fn collapse_to_median(&mut self) -> Result<()> {
        let t = self.page.env.layout.degree();
        let left = std::mem::take(&mut self.st.children[t - 1]);
        let right = std::mem::take(&mut self.st.children[t]);
        if left.is_empty() || right.is_empty() {
            return Err(StoreError::Invariant(format!(
                "collapse of page {} without both split halves",
                self.page.id
            )));
        }
        let key = std::mem::replace(&mut self.st.keys[t - 1], KeySlot::Empty);
        let value = std::mem::replace(&mut self.st.values[t - 1], ValueSlot::Empty);
        for i in 0..self.max_keys() {
            self.st.clear_entry(i);
        }
        for slot in self.st.children.iter_mut() {
            *slot = ChildSlot::empty();
        }
        self.st.keys[0] = key;
        self.st.values[0] = value;
        self.st.children[0] = left;
        self.st.children[1] = right;
        self.st.num_keys = 1;
        self.st.leaf = false;
        self.st.dirty = true;
        Ok(())
    }

    /// Verifies the stored leaf flag against the child pointers actually present.
    pub fn check_leaf_flag(&self) -> Result<()> {
        let n = self.st.num_keys;
        let present = self.st.children[..=n]
            .iter()
            .filter(|slot| !slot.is_empty())
            .count();
        let consistent = if self.st.leaf {
            present == 0
        } else {
            present == n + 1
        };
        if !consistent {
            return Err(StoreError::Invariant(format!(
                "page {} leaf={} with {present} of {} child pointers",
                self.page.id,
                self.st.leaf,
                n + 1
            )));
        }
        Ok(())
    }

    /// Verifies that every slot beyond the key count is clear.
    pub fn check_slots(&self) -> Result<()> {
        let n = self.st.num_keys;
        let stray_entry = (n..self.max_keys())
            .find(|&i| !self.st.keys[i].is_empty() || !self.st.values[i].is_empty());
        let stray_child = (n + 1..=self.max_keys()).find(|&i| !self.st.children[i].is_empty());
        if let Some(i) = stray_entry {
            return Err(StoreError::Invariant(format!(
                "page {} has an occupied entry slot {i} beyond {n} keys",
                self.page.id
            )));
        }
        if let Some(i) = stray_child {
            return Err(StoreError::Invariant(format!(
                "page {} has child slot {i} set beyond {n} keys",
                self.page.id
            )));
        }
        Ok(())
    }
}
