//! Stored bytes
//!
//! The logical payload behind one live handle. The handle's block range may
//! hold up to `block_size - 1` bytes more than the payload; every read is
//! bounded to the logical size.

use super::diag::DiagOp;
use super::engine::StoreShared;
use super::handle::LiveHandle;
use super::range::BlockRange;
use super::stream::{StoredInputStream, StoredOutputStream};
use crate::error::{Error, Result};
use crate::metrics;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// One allocated payload
///
/// Lifecycle: allocated, then any number of grows, shrinks and migrations,
/// then deleted. Using a deleted `StoredBytes` is a programming error and
/// panics. Dropping one that was not deleted deletes it.
pub struct StoredBytes {
    shared: Arc<StoreShared>,
    handle: Arc<LiveHandle>,
    logical_size: AtomicUsize,
    deleted: AtomicBool,
}

impl StoredBytes {
    pub(crate) fn new(
        shared: Arc<StoreShared>,
        handle: Arc<LiveHandle>,
        logical_size: usize,
    ) -> Self {
        Self {
            shared,
            handle,
            logical_size: AtomicUsize::new(logical_size),
            deleted: AtomicBool::new(false),
        }
    }

    fn assert_live(&self) {
        assert!(
            !self.deleted.load(Ordering::Acquire),
            "stored bytes {} used after delete",
            self.handle.id()
        );
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    /// Logical size in bytes
    pub fn size(&self) -> usize {
        self.assert_live();
        self.logical_size.load(Ordering::Acquire)
    }

    /// First block of the current allocation
    pub fn block_start(&self) -> usize {
        self.assert_live();
        self.handle.start()
    }

    /// Blocks in the current allocation
    pub fn block_count(&self) -> usize {
        self.assert_live();
        self.handle.size()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Copy of the payload
    pub fn get_bytes(&self) -> Result<Vec<u8>> {
        self.with_slice(<[u8]>::to_vec)
    }

    /// Snapshot of the payload, safe to keep across later mutations
    pub fn read_buffer(&self) -> Result<Bytes> {
        self.assert_live();
        self.shared.inspect(|inner| {
            let len = self.logical_size.load(Ordering::Acquire);
            inner.mapper.snapshot(self.handle.range(), len)
        })
    }

    /// Run `f` over the live payload bytes under the store's read lock
    ///
    /// The slice must not escape: the next structural change may move it.
    pub fn with_slice<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.assert_live();
        self.shared.inspect(|inner| {
            let len = self.logical_size.load(Ordering::Acquire);
            f(inner.mapper.slice(self.handle.range(), len))
        })
    }

    /// Replace the payload
    ///
    /// Streams reading this payload are moved onto private copies first. The
    /// allocation grows or shrinks to fit; growing may relocate it.
    pub fn set_bytes(&self, payload: &[u8]) -> Result<()> {
        self.assert_live();
        let shared = &*self.shared;
        shared.mutate(|inner| {
            let target = shared.converter.payload_blocks(payload.len());
            let current = self.handle.range();
            shared.on_before_change(inner, current);

            let (table, mut hooks) = inner.split(shared);
            if target > current.size {
                let start = table.grow(current.start, current.size, target, false, &mut hooks)?;
                if start != current.start {
                    self.handle.relocate(BlockRange::new(start, target));
                }
            } else if target < current.size {
                table.shrink(current.start, current.size, target, &mut hooks);
            }
            assert_eq!(
                self.handle.size(),
                target,
                "stored bytes {} not resized to fit {} bytes",
                self.handle.id(),
                payload.len()
            );

            inner.mapper.write(self.handle.range(), payload)?;
            self.logical_size.store(payload.len(), Ordering::Release);
            debug!(
                handle = self.handle.id(),
                range = %self.handle.range(),
                bytes = payload.len(),
                "Stored bytes replaced"
            );
            Ok(())
        })
    }

    /// Add `payload` after the current content
    ///
    /// Existing bytes are kept; growing past the allocation migrates them.
    /// Open streams are unaffected since they never read past their size.
    pub fn append(&self, payload: &[u8]) -> Result<()> {
        self.assert_live();
        if payload.is_empty() {
            return Ok(());
        }
        let shared = &*self.shared;
        shared.mutate(|inner| {
            let old_len = self.logical_size.load(Ordering::Acquire);
            let new_len = old_len + payload.len();
            let target = shared.converter.payload_blocks(new_len);
            let current = self.handle.range();

            if target > current.size {
                let (table, mut hooks) = inner.split(shared);
                table.grow(current.start, current.size, target, true, &mut hooks)?;
            }
            assert!(
                self.handle.size() >= target,
                "stored bytes {} not grown to fit {} bytes",
                self.handle.id(),
                new_len
            );

            inner.mapper.write_at(self.handle.range(), old_len, payload)?;
            self.logical_size.store(new_len, Ordering::Release);
            Ok(())
        })
    }

    /// Cut the payload to `len` bytes, releasing blocks no longer needed
    pub fn truncate(&self, len: usize) -> Result<()> {
        self.assert_live();
        let shared = &*self.shared;
        shared.mutate(|inner| {
            let old_len = self.logical_size.load(Ordering::Acquire);
            if len > old_len {
                return Err(Error::InvalidArgument(format!(
                    "cannot truncate {} bytes to {}",
                    old_len, len
                )));
            }
            if len == old_len {
                return Ok(());
            }
            let current = self.handle.range();
            shared.on_before_change(inner, current);

            let target = shared.converter.payload_blocks(len);
            if target < current.size {
                let (table, mut hooks) = inner.split(shared);
                table.shrink(current.start, current.size, target, &mut hooks);
            }
            self.logical_size.store(len, Ordering::Release);
            Ok(())
        })
    }

    /// Open a reader over the current content
    pub fn open_input_stream(&self) -> Result<StoredInputStream> {
        self.assert_live();
        let guard = self.shared.inner.read();
        if guard.is_none() {
            return Err(Error::Closed);
        }
        let size = self.logical_size.load(Ordering::Acquire);
        let id = self.shared.next_id();
        Ok(StoredInputStream::open(
            Arc::clone(&self.shared),
            id,
            Arc::clone(&self.handle),
            size,
        ))
    }

    /// Open a writer whose content replaces this payload on close
    pub fn open_output_stream(&self) -> StoredOutputStream<'_> {
        self.assert_live();
        StoredOutputStream::new(self)
    }

    /// Free the allocation
    ///
    /// The handle is discarded before its blocks are released, so a defrag
    /// triggered by this deletion never moves it.
    pub fn delete(&self) -> Result<()> {
        assert!(
            !self.deleted.swap(true, Ordering::AcqRel),
            "stored bytes {} deleted twice",
            self.handle.id()
        );
        let shared = &*self.shared;
        shared.mutate(|inner| {
            let range = self.handle.range();
            self.handle.discard();
            inner.handles.unregister(self.handle.id());

            let (table, mut hooks) = inner.split(shared);
            table.deallocate(range.start, range.size, &mut hooks)?;
            shared.diag.record(
                DiagOp::Delete,
                self.handle.id(),
                range.start as u64,
                range.size as u64,
            );
            metrics::DELETIONS_TOTAL.inc();
            debug!(handle = self.handle.id(), range = %range, "Deleted stored bytes");
            Ok(())
        })
    }
}

impl Drop for StoredBytes {
    fn drop(&mut self) {
        if self.is_deleted() || std::thread::panicking() {
            return;
        }
        match self.delete() {
            Ok(()) | Err(Error::Closed) => {}
            Err(e) => warn!(
                handle = self.handle.id(),
                error = %e,
                "Failed to delete dropped stored bytes"
            ),
        }
    }
}

impl std::fmt::Debug for StoredBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredBytes")
            .field("id", &self.handle.id())
            .field("range", &self.handle.range())
            .field("size", &self.logical_size.load(Ordering::Acquire))
            .field("deleted", &self.is_deleted())
            .finish()
    }
}
