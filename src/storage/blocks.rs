//! Block/byte arithmetic
//!
//! All allocation bookkeeping happens in blocks, all payload bookkeeping in
//! bytes. This is the one place the two are converted.

use crate::error::{Error, Result};

/// Converts between block counts and byte lengths for a fixed block size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockConverter {
    block_size: usize,
}

impl BlockConverter {
    /// Create a converter for the given block size
    pub fn new(block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::InvalidArgument(
                "block_size must be greater than zero".to_string(),
            ));
        }
        Ok(Self { block_size })
    }

    /// Bytes per block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks needed to hold `bytes` (ceiling division)
    pub fn blocks_for_bytes(&self, bytes: usize) -> usize {
        bytes.div_ceil(self.block_size)
    }

    /// Number of blocks a payload occupies. Empty payloads still own one block
    /// so that every live handle covers a non-empty range.
    pub fn payload_blocks(&self, bytes: usize) -> usize {
        self.blocks_for_bytes(bytes).max(1)
    }

    /// Byte length of `blocks` blocks
    pub fn bytes_for_blocks(&self, blocks: usize) -> usize {
        blocks * self.block_size
    }

    /// Byte offset of the first byte of `block`
    pub fn byte_offset(&self, block: usize) -> usize {
        block * self.block_size
    }
}
