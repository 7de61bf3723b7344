use std::sync::Arc;

use tracing::trace;

use super::FileIo;
use crate::primitives::block::{Block, BlockHeader};
use crate::types::block::BLOCK_HDR_LEN;
use crate::types::{Result, StoreError};

/// Seekable handle onto one shard's backing store.
///
/// Requests position the handle with [`BlockIo::seek`] and then move exactly the used
/// range of a block. Implementations are owned by a single worker thread.
pub trait BlockIo: Send {
    /// Positions the handle at an absolute byte offset.
    fn seek(&mut self, offset: u64) -> Result<()>;
    /// Reads a block header and its used payload bytes at the current position.
    fn read_used(&mut self, block: &mut Block) -> Result<()>;
    /// Writes a block header and its used payload bytes at the current position.
    fn write_used(&mut self, block: &Block) -> Result<()>;
    /// Durability barrier for everything written so far.
    fn force(&mut self) -> Result<()>;
    /// False once the handle has been closed.
    fn is_open(&self) -> bool;
}

/// [`BlockIo`] over a positioned [`FileIo`].
pub struct FileChannel {
    io: Arc<dyn FileIo>,
    position: u64,
    open: bool,
}

impl FileChannel {
    /// Wraps a file handle; the position starts at zero.
    pub fn new(io: Arc<dyn FileIo>) -> Self {
        Self {
            io,
            position: 0,
            open: true,
        }
    }

    /// Current byte position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Length of the backing file.
    pub fn len(&self) -> Result<u64> {
        self.io.len()
    }

    /// Returns true if the backing file is empty.
    pub fn is_empty(&self) -> Result<bool> {
        self.io.is_empty()
    }

    /// Closes the handle; later operations fail with [`StoreError::Closed`].
    pub fn close(&mut self) {
        self.open = false;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::Closed("block channel"))
        }
    }
}

impl BlockIo for FileChannel {
    fn seek(&mut self, offset: u64) -> Result<()> {
        self.ensure_open()?;
        self.position = offset;
        Ok(())
    }

    fn read_used(&mut self, block: &mut Block) -> Result<()> {
        self.ensure_open()?;
        let mut hdr_buf = [0u8; BLOCK_HDR_LEN];
        self.io.read_at(self.position, &mut hdr_buf)?;
        let hdr = BlockHeader::decode(&hdr_buf)?;
        block.apply_header(&hdr)?;
        let used = block.used();
        let payload_off = self.position + BLOCK_HDR_LEN as u64;
        {
            let payload = block.payload_mut();
            self.io.read_at(payload_off, &mut payload[..used])?;
            payload[used..].fill(0);
        }
        block.verify_checksum(hdr.crc32)?;
        trace!(block = %block.id(), used, "channel.read_used");
        Ok(())
    }

    fn write_used(&mut self, block: &Block) -> Result<()> {
        self.ensure_open()?;
        let mut buf = Vec::with_capacity(BLOCK_HDR_LEN + block.used());
        buf.extend_from_slice(&block.encode_header());
        buf.extend_from_slice(block.used_payload());
        self.io.write_at(self.position, &buf)?;
        trace!(block = %block.id(), used = block.used(), "channel.write_used");
        Ok(())
    }

    fn force(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.io.sync_all()
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
