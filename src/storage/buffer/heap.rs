//! Heap-backed buffer

use super::{copy_prefix, move_within, BackingBuffer, MoveGuard, StorageKind};
use crate::error::Result;
use tracing::debug;

/// Backing buffer held in an ordinary `Vec<u8>`
#[derive(Debug, Default)]
pub struct HeapBuffer {
    data: Vec<u8>,
    moves: MoveGuard,
}

impl HeapBuffer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackingBuffer for HeapBuffer {
    fn kind(&self) -> StorageKind {
        StorageKind::Heap
    }

    fn allocate(&mut self, size: usize) -> Result<()> {
        self.data = vec![0u8; size];
        self.moves.reset();
        debug!(size, "Allocated heap buffer");
        Ok(())
    }

    fn grow(&mut self, new_size: usize, copy_through: usize) -> Result<()> {
        // Fresh allocation plus a prefix copy; Vec::resize would copy the whole capacity
        let mut data = vec![0u8; new_size];
        copy_prefix(&self.data, &mut data, copy_through);
        debug!(
            old_size = self.data.len(),
            new_size, copy_through, "Grew heap buffer"
        );
        self.data = data;
        self.moves.reset();
        Ok(())
    }

    fn current(&self) -> &[u8] {
        &self.data
    }

    fn current_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn move_bytes(&mut self, old_start: usize, length: usize, new_start: usize) -> Result<()> {
        self.moves.check(old_start, new_start);
        move_within(&mut self.data, old_start, length, new_start)
    }

    fn reset_move_guard(&mut self) {
        self.moves.reset();
    }

    fn close(&mut self) -> Result<()> {
        self.data = Vec::new();
        self.moves.reset();
        Ok(())
    }
}
