//! Buffer mapper
//!
//! Translates block-addressed ranges into byte-addressed views of the backing
//! buffer. A slice borrows the buffer and is only valid until the next
//! structural change; a snapshot is an immediate copy and is valid forever.

use super::blocks::BlockConverter;
use super::buffer::{open_buffer, BackingBuffer, StorageKind};
use super::range::BlockRange;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::ops::Range;
use std::path::Path;
use tracing::info;

/// Block-to-byte view over one backing buffer
pub struct BufferMapper {
    converter: BlockConverter,
    buffer: Box<dyn BackingBuffer>,
}

impl BufferMapper {
    /// Open a backing buffer large enough for `block_count` blocks
    pub fn open(
        converter: BlockConverter,
        kind: StorageKind,
        block_count: usize,
        temp_dir: Option<&Path>,
    ) -> Result<Self> {
        let buffer = open_buffer(kind, converter.bytes_for_blocks(block_count), temp_dir)?;
        Ok(Self { converter, buffer })
    }

    pub fn converter(&self) -> BlockConverter {
        self.converter
    }

    pub fn kind(&self) -> StorageKind {
        self.buffer.kind()
    }

    /// Buffer size in bytes
    pub fn capacity_bytes(&self) -> usize {
        self.buffer.capacity()
    }

    /// Whole blocks the buffer can hold
    pub fn capacity_blocks(&self) -> usize {
        self.buffer.capacity() / self.converter.block_size()
    }

    /// Byte span of the first `len` bytes of `range`
    pub fn byte_range(&self, range: BlockRange, len: usize) -> Range<usize> {
        let capacity = self.converter.bytes_for_blocks(range.size);
        assert!(
            len <= capacity,
            "{} bytes requested from {} which holds {}",
            len,
            range,
            capacity
        );
        let start = self.converter.byte_offset(range.start);
        start..start + len
    }

    /// Zero-copy view of the first `len` bytes of `range`
    pub fn slice(&self, range: BlockRange, len: usize) -> &[u8] {
        let bytes = self.byte_range(range, len);
        &self.buffer.current()[bytes]
    }

    /// Owned copy of the first `len` bytes of `range`
    pub fn snapshot(&self, range: BlockRange, len: usize) -> Bytes {
        Bytes::copy_from_slice(self.slice(range, len))
    }

    /// Write `payload` at the start of `range`
    pub fn write(&mut self, range: BlockRange, payload: &[u8]) -> Result<()> {
        self.write_at(range, 0, payload)
    }

    /// Write `payload` at byte `offset` inside `range`
    pub fn write_at(&mut self, range: BlockRange, offset: usize, payload: &[u8]) -> Result<()> {
        let capacity = self.converter.bytes_for_blocks(range.size);
        if offset + payload.len() > capacity {
            return Err(Error::InvalidArgument(format!(
                "{} bytes at offset {} do not fit in {} ({} bytes)",
                payload.len(),
                offset,
                range,
                capacity
            )));
        }
        let start = self.converter.byte_offset(range.start) + offset;
        let end = start + payload.len();
        if end > self.buffer.capacity() {
            return Err(Error::Storage(format!(
                "write to {} past the end of a {} byte buffer",
                range,
                self.buffer.capacity()
            )));
        }
        self.buffer.current_mut()[start..end].copy_from_slice(payload);
        self.buffer.reset_move_guard();
        Ok(())
    }

    /// Make room for `block_count` blocks, keeping the first `live_blocks`
    pub fn ensure_blocks(&mut self, block_count: usize, live_blocks: usize) -> Result<bool> {
        let before = self.buffer.capacity();
        let grown = self.buffer.ensure_size(
            self.converter.bytes_for_blocks(block_count),
            self.converter.bytes_for_blocks(live_blocks),
        )?;
        if grown {
            info!(
                kind = %self.buffer.kind(),
                old_bytes = before,
                new_bytes = self.buffer.capacity(),
                live_blocks,
                "Grew backing buffer"
            );
        }
        Ok(grown)
    }

    /// Move `block_count` blocks from `from` to `to`
    pub fn move_blocks(&mut self, from: usize, to: usize, block_count: usize) -> Result<()> {
        self.buffer.move_bytes(
            self.converter.byte_offset(from),
            self.converter.bytes_for_blocks(block_count),
            self.converter.byte_offset(to),
        )
    }

    /// Forget move history after a structural change that legitimately repeats a move
    pub fn reset_move_guard(&mut self) {
        self.buffer.reset_move_guard();
    }

    pub fn close(&mut self) -> Result<()> {
        self.buffer.close()
    }
}

impl std::fmt::Debug for BufferMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferMapper")
            .field("block_size", &self.converter.block_size())
            .field("kind", &self.buffer.kind())
            .field("capacity", &self.buffer.capacity())
            .finish()
    }
}
