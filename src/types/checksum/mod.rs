#![forbid(unsafe_code)]

use super::BlockId;

/// CRC32 over a block's identity and its used payload bytes.
pub fn block_crc32(block: BlockId, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&block.0.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
