//! Key page geometry and per-slot materialization state.

use std::sync::Arc;

use crate::types::block::payload_len;
use crate::types::{BlockId, Optr, Result, StoreError};

use super::page::KeyPage;

/// Leaf flag byte + key count.
const TABLE_PREFIX_LEN: usize = 5;
/// Key pointer + value pointer.
const SLOT_PAIR_LEN: usize = 20;
const CHILD_ID_LEN: usize = 8;

/// Fixed geometry of a key page: how many keys it holds and where each field lives.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageLayout {
    max_keys: usize,
}

impl PageLayout {
    /// Largest odd key count whose slot table fits a block payload.
    pub fn derive_max_keys(block_size: u32) -> usize {
        let payload = payload_len(block_size);
        let per_slot = SLOT_PAIR_LEN + CHILD_ID_LEN;
        let mut max = payload.saturating_sub(TABLE_PREFIX_LEN + CHILD_ID_LEN) / per_slot;
        if max % 2 == 0 {
            max = max.saturating_sub(1);
        }
        max
    }

    /// Layout for `block_size`, optionally with a smaller odd key count.
    pub fn new(block_size: u32, max_keys: Option<usize>) -> Result<Self> {
        let fit = Self::derive_max_keys(block_size);
        let max_keys = max_keys.unwrap_or(fit);
        if max_keys < 3 || max_keys % 2 == 0 {
            return Err(StoreError::Invalid("max_keys must be odd and at least 3"));
        }
        if max_keys > fit {
            return Err(StoreError::Invalid("max_keys does not fit the block size"));
        }
        Ok(Self { max_keys })
    }

    /// MAXKEYS.
    pub fn max_keys(&self) -> usize {
        self.max_keys
    }

    /// Minimum degree `T = (MAXKEYS + 1) / 2`.
    pub fn degree(&self) -> usize {
        (self.max_keys + 1) / 2
    }

    /// Bytes occupied by the serialized slot table.
    pub fn table_len(&self) -> usize {
        TABLE_PREFIX_LEN + SLOT_PAIR_LEN * self.max_keys + CHILD_ID_LEN * (self.max_keys + 1)
    }

    /// Payload offset of the key/value pointer pair for slot `i`.
    pub fn slot_offset(&self, i: usize) -> usize {
        TABLE_PREFIX_LEN + SLOT_PAIR_LEN * i
    }

    /// Payload offset of child id `i`.
    pub fn child_offset(&self, i: usize) -> usize {
        TABLE_PREFIX_LEN + SLOT_PAIR_LEN * self.max_keys + CHILD_ID_LEN * i
    }
}

/// Materialization state of one key slot.
///
/// A key that has a pointer is immutable; replacing it yields a fresh `Dirty` slot.
#[derive(Clone, Debug)]
pub enum KeySlot<K> {
    /// No key.
    Empty,
    /// Stored but not yet deserialized.
    Unloaded(Optr),
    /// Stored and cached.
    Loaded(Optr, K),
    /// Set in memory, not yet written.
    Dirty(K),
}

impl<K> KeySlot<K> {
    /// Stored pointer, or [`Optr::EMPTY`] when nothing is stored yet.
    pub fn ptr(&self) -> Optr {
        match self {
            KeySlot::Unloaded(ptr) | KeySlot::Loaded(ptr, _) => *ptr,
            KeySlot::Empty | KeySlot::Dirty(_) => Optr::EMPTY,
        }
    }

    /// True for [`KeySlot::Empty`].
    pub fn is_empty(&self) -> bool {
        matches!(self, KeySlot::Empty)
    }

    /// True when the slot must be written on save.
    pub fn is_dirty(&self) -> bool {
        matches!(self, KeySlot::Dirty(_))
    }

    pub(crate) fn from_ptr(ptr: Optr) -> Self {
        if ptr.is_empty() {
            KeySlot::Empty
        } else {
            KeySlot::Unloaded(ptr)
        }
    }
}

/// Materialization state of one value slot.
#[derive(Clone, Debug)]
pub enum ValueSlot<V> {
    /// No value.
    Empty,
    /// Stored but not yet deserialized.
    Unloaded(Optr),
    /// Stored and cached.
    Loaded(Optr, V),
    /// Replaced or cleared in memory; `stale` is reclaimed on save.
    Dirty {
        /// Record written before the change, if any.
        stale: Optr,
        /// New value; `None` clears the slot.
        value: Option<V>,
    },
}

impl<V> ValueSlot<V> {
    /// Stored pointer, or [`Optr::EMPTY`] for empty or pending slots.
    pub fn ptr(&self) -> Optr {
        match self {
            ValueSlot::Unloaded(ptr) | ValueSlot::Loaded(ptr, _) => *ptr,
            ValueSlot::Empty | ValueSlot::Dirty { .. } => Optr::EMPTY,
        }
    }

    /// True for [`ValueSlot::Empty`].
    pub fn is_empty(&self) -> bool {
        matches!(self, ValueSlot::Empty)
    }

    /// True when the slot must be written on save.
    pub fn is_dirty(&self) -> bool {
        matches!(self, ValueSlot::Dirty { .. })
    }

    /// Replaces the value, remembering whatever record has to be reclaimed.
    pub(crate) fn replace(&mut self, value: Option<V>) {
        let stale = match std::mem::replace(self, ValueSlot::Empty) {
            ValueSlot::Empty => Optr::EMPTY,
            ValueSlot::Unloaded(ptr) | ValueSlot::Loaded(ptr, _) => ptr,
            ValueSlot::Dirty { stale, .. } => stale,
        };
        *self = ValueSlot::Dirty { stale, value };
    }

    pub(crate) fn from_ptr(ptr: Optr) -> Self {
        if ptr.is_empty() {
            ValueSlot::Empty
        } else {
            ValueSlot::Unloaded(ptr)
        }
    }
}

/// Child pointer slot: the stored block id plus the page once materialized.
pub struct ChildSlot<K, V> {
    /// Block id of the child page.
    pub id: Option<BlockId>,
    /// Materialized child page.
    pub page: Option<Arc<KeyPage<K, V>>>,
}

impl<K, V> ChildSlot<K, V> {
    /// Slot with no child.
    pub fn empty() -> Self {
        Self { id: None, page: None }
    }

    /// True when neither an id nor a page is set.
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.page.is_none()
    }

    /// Block id of the child, preferring the materialized page.
    pub fn block_id(&self) -> Option<BlockId> {
        self.page.as_ref().map(|page| page.id()).or(self.id)
    }
}

impl<K, V> Default for ChildSlot<K, V> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<K, V> Clone for ChildSlot<K, V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            page: self.page.clone(),
        }
    }
}
