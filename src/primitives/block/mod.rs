#![forbid(unsafe_code)]
//! Fixed-size storage blocks and the byte cursors used to read and write their payload.

use std::sync::Arc;

use bytes::{Buf, BufMut};
use parking_lot::Mutex;

use crate::types::block::{header, payload_len, BLOCK_HDR_LEN, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::types::checksum::block_crc32;
use crate::types::{BlockId, Optr, Result, StoreError};

/// Shared, lockable block: the unit pinned by the buffer pool and moved through I/O requests.
pub type BlockHandle = Arc<Mutex<Block>>;

/// What a block currently holds.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlockKind {
    /// Unused or freed block.
    Free = 0,
    /// Header and slot table of a B-tree key page.
    KeyPage = 1,
    /// Packed key/value payload records.
    Data = 2,
}

impl TryFrom<u8> for BlockKind {
    type Error = StoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(BlockKind::Free),
            1 => Ok(BlockKind::KeyPage),
            2 => Ok(BlockKind::Data),
            _ => Err(StoreError::Corruption("unknown block kind")),
        }
    }
}

/// Decoded block header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    /// Block content kind.
    pub kind: BlockKind,
    /// Number of payload bytes in use.
    pub used: u16,
    /// Number of live payload records (data blocks only).
    pub live: u16,
    /// Checksum over the used payload bytes.
    pub crc32: u32,
}

impl BlockHeader {
    /// Decodes a header from the first [`BLOCK_HDR_LEN`] bytes of `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < BLOCK_HDR_LEN {
            return Err(StoreError::Corruption("block header truncated"));
        }
        let mut hdr = &src[..BLOCK_HDR_LEN];
        let kind = BlockKind::try_from(hdr.get_u8())?;
        let flags = hdr.get_u8();
        if flags != 0 {
            return Err(StoreError::Corruption("block header flags not zero"));
        }
        let used = hdr.get_u16();
        let live = hdr.get_u16();
        let _reserved = hdr.get_u16();
        let crc32 = hdr.get_u32();
        Ok(Self {
            kind,
            used,
            live,
            crc32,
        })
    }
}

/// One fixed-size unit of storage: a header plus payload capacity.
///
/// The in-core flag marks unflushed modifications; it is never persisted.
#[derive(Clone, Debug)]
pub struct Block {
    id: BlockId,
    kind: BlockKind,
    used: u16,
    live: u16,
    in_core: bool,
    data: Box<[u8]>,
}

impl Block {
    /// Creates an empty, clean block for `id`.
    pub fn new(id: BlockId, block_size: u32) -> Self {
        debug_assert!((MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size));
        Self {
            id,
            kind: BlockKind::Free,
            used: 0,
            live: 0,
            in_core: false,
            data: vec![0u8; payload_len(block_size)].into_boxed_slice(),
        }
    }

    /// Block identity.
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Block content kind.
    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    /// Sets the block content kind.
    pub fn set_kind(&mut self, kind: BlockKind) {
        self.kind = kind;
    }

    /// Number of payload bytes in use.
    pub fn used(&self) -> usize {
        self.used as usize
    }

    /// Sets the number of payload bytes in use.
    pub fn set_used(&mut self, used: usize) -> Result<()> {
        if used > self.data.len() {
            return Err(StoreError::Invariant(format!(
                "block {} used {} exceeds capacity {}",
                self.id,
                used,
                self.data.len()
            )));
        }
        self.used = used as u16;
        Ok(())
    }

    /// Number of live records (data blocks).
    pub fn live(&self) -> u16 {
        self.live
    }

    /// Sets the number of live records.
    pub fn set_live(&mut self, live: u16) {
        self.live = live;
    }

    /// True when the block holds modifications not yet written to the backing store.
    pub fn is_in_core(&self) -> bool {
        self.in_core
    }

    /// Marks or clears the in-core flag.
    pub fn set_in_core(&mut self, in_core: bool) {
        self.in_core = in_core;
    }

    /// Payload capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes still available after the used range.
    pub fn spare(&self) -> usize {
        self.data.len() - self.used as usize
    }

    /// Full payload.
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    /// Mutable payload. Callers are responsible for flagging the block in-core.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Used payload range.
    pub fn used_payload(&self) -> &[u8] {
        &self.data[..self.used as usize]
    }

    /// Clears content and header for reuse as `kind`; the block becomes in-core.
    pub fn reset(&mut self, kind: BlockKind) {
        self.data.fill(0);
        self.kind = kind;
        self.used = 0;
        self.live = 0;
        self.in_core = true;
    }

    /// Copies header and content into `dst`, keeping `dst`'s identity.
    pub fn clone_into_block(&self, dst: &mut Block) {
        dst.kind = self.kind;
        dst.used = self.used;
        dst.live = self.live;
        dst.data.copy_from_slice(&self.data);
    }

    /// Encodes the on-disk header, including a checksum over the used payload.
    pub fn encode_header(&self) -> [u8; BLOCK_HDR_LEN] {
        let mut out = [0u8; BLOCK_HDR_LEN];
        out[header::KIND] = self.kind as u8;
        out[header::FLAGS] = 0;
        out[header::USED].copy_from_slice(&self.used.to_be_bytes());
        out[header::LIVE].copy_from_slice(&self.live.to_be_bytes());
        out[header::RESERVED].fill(0);
        let crc = block_crc32(self.id, self.used_payload());
        out[header::CRC32].copy_from_slice(&crc.to_be_bytes());
        out
    }

    /// Applies a decoded header before the payload is read.
    pub fn apply_header(&mut self, hdr: &BlockHeader) -> Result<()> {
        if hdr.used as usize > self.data.len() {
            return Err(StoreError::Corruption("block used length exceeds payload"));
        }
        self.kind = hdr.kind;
        self.used = hdr.used;
        self.live = hdr.live;
        Ok(())
    }

    /// Verifies the used payload against a stored checksum.
    pub fn verify_checksum(&self, expected: u32) -> Result<()> {
        if block_crc32(self.id, self.used_payload()) != expected {
            return Err(StoreError::Corruption("block checksum mismatch"));
        }
        Ok(())
    }

    /// Read cursor positioned at `pos` within the payload.
    pub fn reader(&self, pos: usize) -> Result<BlockReader<'_>> {
        if pos > self.data.len() {
            return Err(StoreError::Invariant(format!(
                "read cursor {pos} beyond block {} payload",
                self.id
            )));
        }
        Ok(BlockReader {
            cur: &self.data[pos..],
            start: pos,
            total: self.data.len(),
        })
    }

    /// Write cursor positioned at `pos` within the payload.
    pub fn writer(&mut self, pos: usize) -> Result<BlockWriter<'_>> {
        if pos > self.data.len() {
            return Err(StoreError::Invariant(format!(
                "write cursor {pos} beyond block {} payload",
                self.id
            )));
        }
        let total = self.data.len();
        Ok(BlockWriter {
            cur: &mut self.data[pos..],
            total,
        })
    }
}

/// Big-endian read cursor over a block payload.
pub struct BlockReader<'a> {
    cur: &'a [u8],
    start: usize,
    total: usize,
}

impl<'a> BlockReader<'a> {
    /// Absolute payload offset of the cursor.
    pub fn position(&self) -> usize {
        self.total - self.cur.len()
    }

    /// Bytes consumed since the cursor was created.
    pub fn consumed(&self) -> usize {
        self.position() - self.start
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.cur.remaining() < n {
            return Err(StoreError::Corruption("block read past payload end"));
        }
        Ok(())
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.cur.get_u8())
    }

    /// Reads a big-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.cur.get_u16())
    }

    /// Reads a big-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.cur.get_u32())
    }

    /// Reads a big-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.cur.get_u64())
    }

    /// Reads a block id + offset pair.
    pub fn read_optr(&mut self) -> Result<Optr> {
        let block = BlockId(self.read_u64()?);
        let offset = self.read_u16()?;
        Ok(Optr::new(block, offset))
    }

    /// Borrows the next `len` bytes.
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        self.need(len)?;
        let (head, tail) = self.cur.split_at(len);
        self.cur = tail;
        Ok(head)
    }
}

/// Big-endian write cursor over a block payload.
pub struct BlockWriter<'a> {
    cur: &'a mut [u8],
    total: usize,
}

impl<'a> BlockWriter<'a> {
    /// Absolute payload offset of the cursor.
    pub fn position(&self) -> usize {
        self.total - self.cur.len()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.cur.remaining_mut() < n {
            return Err(StoreError::Invariant(
                "block write past payload end".to_string(),
            ));
        }
        Ok(())
    }

    /// Writes one byte.
    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.need(1)?;
        self.cur.put_u8(v);
        Ok(())
    }

    /// Writes a big-endian `u16`.
    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.need(2)?;
        self.cur.put_u16(v);
        Ok(())
    }

    /// Writes a big-endian `u32`.
    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.need(4)?;
        self.cur.put_u32(v);
        Ok(())
    }

    /// Writes a big-endian `u64`.
    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.need(8)?;
        self.cur.put_u64(v);
        Ok(())
    }

    /// Writes a block id + offset pair.
    pub fn write_optr(&mut self, ptr: Optr) -> Result<()> {
        self.write_u64(ptr.block.0)?;
        self.write_u16(ptr.offset)
    }

    /// Writes raw bytes.
    pub fn write_slice(&mut self, src: &[u8]) -> Result<()> {
        self.need(src.len())?;
        self.cur.put_slice(src);
        Ok(())
    }

    /// Zero-fills `len` bytes.
    pub fn zero(&mut self, len: usize) -> Result<()> {
        self.need(len)?;
        self.cur.put_bytes(0, len);
        Ok(())
    }
}
