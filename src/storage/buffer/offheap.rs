//! Off-heap buffer backed by an anonymous memory mapping

use super::{copy_prefix, move_within, BackingBuffer, MoveGuard, StorageKind};
use crate::error::{Error, Result};
use memmap2::MmapMut;
use tracing::debug;

/// Backing buffer held in an anonymous mapping, outside the process heap
#[derive(Debug, Default)]
pub struct OffHeapBuffer {
    map: Option<MmapMut>,
    moves: MoveGuard,
}

impl OffHeapBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn map_anon(size: usize) -> Result<Option<MmapMut>> {
        if size == 0 {
            return Ok(None);
        }
        MmapMut::map_anon(size)
            .map(Some)
            .map_err(|e| Error::Storage(format!("Failed to map {} off-heap bytes: {}", size, e)))
    }
}

impl BackingBuffer for OffHeapBuffer {
    fn kind(&self) -> StorageKind {
        StorageKind::OffHeap
    }

    fn allocate(&mut self, size: usize) -> Result<()> {
        self.map = Self::map_anon(size)?;
        self.moves.reset();
        debug!(size, "Allocated off-heap buffer");
        Ok(())
    }

    fn grow(&mut self, new_size: usize, copy_through: usize) -> Result<()> {
        let mut map = Self::map_anon(new_size)?;
        if let Some(new) = map.as_mut() {
            copy_prefix(self.current(), new, copy_through);
        }
        debug!(
            old_size = self.capacity(),
            new_size, copy_through, "Grew off-heap buffer"
        );
        self.map = map;
        self.moves.reset();
        Ok(())
    }

    fn current(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    fn current_mut(&mut self) -> &mut [u8] {
        self.map.as_deref_mut().unwrap_or(&mut [])
    }

    fn move_bytes(&mut self, old_start: usize, length: usize, new_start: usize) -> Result<()> {
        self.moves.check(old_start, new_start);
        move_within(self.current_mut(), old_start, length, new_start)
    }

    fn reset_move_guard(&mut self) {
        self.moves.reset();
    }

    fn close(&mut self) -> Result<()> {
        self.map = None;
        self.moves.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offheap_allocate_and_grow() -> Result<()> {
        let mut buf = OffHeapBuffer::new();
        buf.allocate(4096)?;
        assert_eq!(buf.capacity(), 4096);
        buf.current_mut()[..5].copy_from_slice(b"hello");

        buf.grow(16384, 5)?;
        assert_eq!(buf.capacity(), 16384);
        assert_eq!(&buf.current()[..5], b"hello");
        Ok(())
    }

    #[test]
    fn test_offheap_overlapping_move() -> Result<()> {
        let mut buf = OffHeapBuffer::new();
        buf.allocate(4096)?;
        buf.current_mut()[..8].copy_from_slice(b"01234567");
        buf.move_bytes(0, 6, 2)?;
        assert_eq!(&buf.current()[..8], b"01012345");
        Ok(())
    }

    #[test]
    fn test_offheap_close() -> Result<()> {
        let mut buf = OffHeapBuffer::new();
        buf.allocate(4096)?;
        buf.close()?;
        assert!(buf.current().is_empty());
        Ok(())
    }
}
