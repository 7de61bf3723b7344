use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::types::block::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::types::{Result, StoreError, MAX_SHARDS};

/// Configuration supplied when opening a [`super::Store`].
///
/// Every field is optional in TOML; missing fields take their defaults.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StoreOptions {
    /// Size of every block in bytes
    pub block_size: u32,
    /// Number of shards, each backed by its own file and I/O worker
    pub shards: u8,
    /// Soft capacity of the buffer pool, in blocks
    pub pool_blocks: usize,
    /// When set, shard workers run in remote mode with a Node Block Buffer of this many blocks
    pub node_cache_blocks: Option<usize>,
    /// Threads in the split pool; zero runs splits on the inserting thread
    pub split_workers: usize,
    /// Override for the number of keys per page (odd, at least 3)
    pub max_keys: Option<usize>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            shards: 1,
            pool_blocks: 1024,
            node_cache_blocks: None,
            split_workers: 2,
            max_keys: None,
        }
    }
}

impl StoreOptions {
    /// Sets the block size.
    pub fn block_size(mut self, bytes: u32) -> Self {
        self.block_size = bytes;
        self
    }

    /// Sets the shard count.
    pub fn shards(mut self, shards: u8) -> Self {
        self.shards = shards;
        self
    }

    /// Sets the buffer pool capacity.
    pub fn pool_blocks(mut self, blocks: usize) -> Self {
        self.pool_blocks = blocks;
        self
    }

    /// Runs shard workers in remote mode with a Node Block Buffer.
    pub fn node_cache_blocks(mut self, blocks: usize) -> Self {
        self.node_cache_blocks = Some(blocks);
        self
    }

    /// Sets the split pool size.
    pub fn split_workers(mut self, threads: usize) -> Self {
        self.split_workers = threads;
        self
    }

    /// Overrides MAXKEYS.
    pub fn max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = Some(max_keys);
        self
    }

    /// Parses options from TOML text and validates them.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: StoreOptions =
            toml::from_str(text).map_err(|err| StoreError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Reads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| StoreError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Rejects inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(StoreError::Invalid("block_size must be within 128..=65536"));
        }
        if self.shards == 0 || self.shards > MAX_SHARDS {
            return Err(StoreError::Invalid("shards must be within 1..=8"));
        }
        if self.pool_blocks == 0 {
            return Err(StoreError::Invalid("pool_blocks must be positive"));
        }
        if self.node_cache_blocks == Some(0) {
            return Err(StoreError::Invalid("node_cache_blocks must be positive"));
        }
        crate::storage::btree::PageLayout::new(self.block_size, self.max_keys)?;
        Ok(())
    }
}
