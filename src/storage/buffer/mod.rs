//! Backing buffers
//!
//! A backing buffer owns exactly one growable, contiguous byte region. Three
//! strategies share the [`BackingBuffer`] contract:
//!
//! ```text
//! StorageKind::Heap        → HeapBuffer       (Vec<u8>, GC-free but counted against the heap)
//! StorageKind::OffHeap     → OffHeapBuffer    (anonymous mmap)
//! StorageKind::MappedFile  → MappedFileBuffer (mmap of a temp file, deleted on close)
//! ```
//!
//! Growth only preserves the live prefix the caller names, since capacity
//! may be far larger than what is in use.

pub mod heap;
pub mod mapped;
pub mod offheap;

pub use heap::HeapBuffer;
pub use mapped::MappedFileBuffer;
pub use offheap::OffHeapBuffer;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Where the backing buffer lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Ordinary heap allocation
    #[default]
    Heap,
    /// Anonymous memory mapping outside the allocator's heap
    OffHeap,
    /// Memory-mapped temporary file
    MappedFile,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Heap => write!(f, "heap"),
            StorageKind::OffHeap => write!(f, "off_heap"),
            StorageKind::MappedFile => write!(f, "mapped_file"),
        }
    }
}

impl FromStr for StorageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "heap" => Ok(StorageKind::Heap),
            "off_heap" | "offheap" | "direct" => Ok(StorageKind::OffHeap),
            "mapped_file" | "mapped" | "mmap" | "file" => Ok(StorageKind::MappedFile),
            other => Err(Error::InvalidArgument(format!(
                "invalid storage kind: '{}' (expected 'heap', 'off_heap', or 'mapped_file')",
                other
            ))),
        }
    }
}

/// Contract shared by every backing-buffer strategy
pub trait BackingBuffer: Send + Sync {
    fn kind(&self) -> StorageKind;

    /// Replace the buffer with a fresh one of exactly `size` bytes
    fn allocate(&mut self, size: usize) -> Result<()>;

    /// Grow to `new_size` bytes, preserving bytes `[0, copy_through)`
    fn grow(&mut self, new_size: usize, copy_through: usize) -> Result<()>;

    /// Current contents
    fn current(&self) -> &[u8];

    fn current_mut(&mut self) -> &mut [u8];

    /// Move `length` bytes from `old_start` to `new_start`
    fn move_bytes(&mut self, old_start: usize, length: usize, new_start: usize) -> Result<()>;

    /// Forget the last move, so the same move may legitimately be issued again
    fn reset_move_guard(&mut self);

    /// Release the buffer. Later calls see an empty buffer.
    fn close(&mut self) -> Result<()>;

    fn capacity(&self) -> usize {
        self.current().len()
    }

    /// Grow if the buffer is smaller than `size`, keeping `[0, copy_bytes)`
    fn ensure_size(&mut self, size: usize, copy_bytes: usize) -> Result<bool> {
        if size <= self.capacity() {
            return Ok(false);
        }
        let new_size = grown_capacity(self.capacity(), size);
        self.grow(new_size, copy_bytes.min(self.capacity()))?;
        Ok(true)
    }
}

/// Open a backing buffer of `size` bytes for the chosen strategy
pub fn open_buffer(
    kind: StorageKind,
    size: usize,
    temp_dir: Option<&Path>,
) -> Result<Box<dyn BackingBuffer>> {
    let mut buffer: Box<dyn BackingBuffer> = match kind {
        StorageKind::Heap => Box::new(HeapBuffer::new()),
        StorageKind::OffHeap => Box::new(OffHeapBuffer::new()),
        StorageKind::MappedFile => Box::new(MappedFileBuffer::new(temp_dir)?),
    };
    buffer.allocate(size)?;
    Ok(buffer)
}

const PAGE: usize = 4096;

/// Growth policy shared by all strategies: at least 1.5x, page aligned
pub(crate) fn grown_capacity(current: usize, required: usize) -> usize {
    let target = required.max(current + current / 2);
    target.div_ceil(PAGE) * PAGE
}

/// Remembers the previous move so a repeated request is caught
///
/// Issuing the same `(old_start, new_start)` move twice in a row means the
/// table and the buffer disagree about where bytes are.
#[derive(Debug, Default)]
pub(crate) struct MoveGuard {
    last: Option<(usize, usize)>,
}

impl MoveGuard {
    pub(crate) fn check(&mut self, old_start: usize, new_start: usize) {
        assert!(
            self.last != Some((old_start, new_start)),
            "duplicate move request {} -> {}",
            old_start,
            new_start
        );
        self.last = Some((old_start, new_start));
    }

    pub(crate) fn reset(&mut self) {
        self.last = None;
    }
}

/// Move a byte range inside one buffer
///
/// Disjoint ranges are copied straight across; overlapping ranges go through
/// `copy_within`, which never reads a source byte after overwriting it.
pub(crate) fn move_within(
    buf: &mut [u8],
    old_start: usize,
    length: usize,
    new_start: usize,
) -> Result<()> {
    let old_end = old_start + length;
    let new_end = new_start + length;
    if old_end > buf.len() || new_end > buf.len() {
        return Err(Error::Storage(format!(
            "move {}..{} -> {}..{} exceeds buffer of {} bytes",
            old_start,
            old_end,
            new_start,
            new_end,
            buf.len()
        )));
    }
    if length == 0 || old_start == new_start {
        return Ok(());
    }

    let overlapping = old_start < new_end && new_start < old_end;
    if overlapping {
        buf.copy_within(old_start..old_end, new_start);
    } else if old_start < new_start {
        let (head, tail) = buf.split_at_mut(new_start);
        tail[..length].copy_from_slice(&head[old_start..old_end]);
    } else {
        let (head, tail) = buf.split_at_mut(old_start);
        head[new_start..new_end].copy_from_slice(&tail[..length]);
    }
    Ok(())
}

/// Copy the live prefix of `old` into `new`
pub(crate) fn copy_prefix(old: &[u8], new: &mut [u8], copy_through: usize) {
    let n = copy_through.min(old.len()).min(new.len());
    new[..n].copy_from_slice(&old[..n]);
}
