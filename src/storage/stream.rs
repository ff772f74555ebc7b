//! Read and write streams over stored bytes
//!
//! An input stream reads straight from the shared buffer until a mutation is
//! about to touch its range. At that point the engine copies the unread
//! remainder into the stream, once, and the stream serves every later read
//! from that private copy. Migrations alone never force a copy: the stream
//! reads through its live handle, which follows every move.
//!
//! Lock order is engine state, then the stream registry, then a stream's own
//! cursor. The snapshot fast path takes only the cursor.

use super::engine::StoreShared;
use super::handle::LiveHandle;
use super::mapper::BufferMapper;
use super::range::BlockRange;
use super::stored::StoredBytes;
use crate::error::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

struct Snapshot {
    /// Stream position the copy starts at
    base: usize,
    bytes: Bytes,
}

struct Cursor {
    position: usize,
    snapshot: Option<Snapshot>,
}

/// State shared between an input stream and the registry
pub(crate) struct StreamState {
    id: u64,
    handle: Arc<LiveHandle>,
    size: usize,
    cursor: Mutex<Cursor>,
}

impl StreamState {
    fn new(id: u64, handle: Arc<LiveHandle>, size: usize) -> Self {
        Self {
            id,
            handle,
            size,
            cursor: Mutex::new(Cursor {
                position: 0,
                snapshot: None,
            }),
        }
    }

    /// Copy the unread remainder out of the live buffer. Returns `false` if
    /// the stream already reads from a copy.
    fn snapshot_from(&self, mapper: &BufferMapper) -> bool {
        let mut cursor = self.cursor.lock();
        if cursor.snapshot.is_some() {
            return false;
        }
        let bytes = mapper
            .snapshot(self.handle.range(), self.size)
            .slice(cursor.position..);
        debug!(
            stream = self.id,
            handle = self.handle.id(),
            position = cursor.position,
            bytes = bytes.len(),
            "Snapshotted input stream"
        );
        cursor.snapshot = Some(Snapshot {
            base: cursor.position,
            bytes,
        });
        true
    }

    fn read_into(
        &self,
        cursor: &mut Cursor,
        buf: &mut [u8],
        mapper: Option<&BufferMapper>,
    ) -> io::Result<usize> {
        if cursor.position >= self.size {
            return Ok(0);
        }
        let n = buf.len().min(self.size - cursor.position);
        match &cursor.snapshot {
            Some(snapshot) => {
                let offset = cursor.position - snapshot.base;
                buf[..n].copy_from_slice(&snapshot.bytes[offset..offset + n]);
            }
            None => {
                let mapper = mapper.ok_or_else(|| io::Error::other(Error::Closed))?;
                let live = mapper.slice(self.handle.range(), self.size);
                buf[..n].copy_from_slice(&live[cursor.position..cursor.position + n]);
            }
        }
        cursor.position += n;
        Ok(n)
    }
}

/// Open input streams of one store
#[derive(Default)]
pub(crate) struct StreamRegistry {
    streams: BTreeMap<u64, Weak<StreamState>>,
}

impl StreamRegistry {
    fn register(&mut self, state: &Arc<StreamState>) {
        self.streams.insert(state.id, Arc::downgrade(state));
    }

    fn unregister(&mut self, id: u64) {
        self.streams.remove(&id);
    }

    pub(crate) fn open_count(&self) -> usize {
        self.streams
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Snapshot every live-reading stream whose handle overlaps `range`
    pub(crate) fn snapshot_overlapping(&self, range: BlockRange, mapper: &BufferMapper) -> usize {
        self.streams
            .values()
            .filter_map(Weak::upgrade)
            .filter(|state| state.handle.overlaps(&range))
            .filter(|state| state.snapshot_from(mapper))
            .count()
    }

    /// Snapshot every open stream, used before the buffer goes away
    pub(crate) fn snapshot_all(&self, mapper: &BufferMapper) -> usize {
        self.streams
            .values()
            .filter_map(Weak::upgrade)
            .filter(|state| state.snapshot_from(mapper))
            .count()
    }

    pub(crate) fn clear(&mut self) {
        self.streams.clear();
    }
}

/// Reader over the content of a [`StoredBytes`] as of the moment it opened
///
/// Owns its references, so it may outlive the `StoredBytes` borrow and move
/// to another thread.
pub struct StoredInputStream {
    shared: Arc<StoreShared>,
    state: Arc<StreamState>,
}

impl StoredInputStream {
    pub(crate) fn open(
        shared: Arc<StoreShared>,
        id: u64,
        handle: Arc<LiveHandle>,
        size: usize,
    ) -> Self {
        let state = Arc::new(StreamState::new(id, handle, size));
        shared.streams.lock().register(&state);
        Self { shared, state }
    }

    /// Total bytes this stream will yield
    pub fn size(&self) -> usize {
        self.state.size
    }

    pub fn position(&self) -> usize {
        self.state.cursor.lock().position
    }

    pub fn remaining(&self) -> usize {
        self.state.size - self.position()
    }

    /// Whether the stream has switched to its private copy
    pub fn is_snapshotted(&self) -> bool {
        self.state.cursor.lock().snapshot.is_some()
    }
}

impl Read for StoredInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        {
            let mut cursor = self.state.cursor.lock();
            if cursor.snapshot.is_some() || cursor.position >= self.state.size {
                return self.state.read_into(&mut cursor, buf, None);
            }
        }

        let guard = self.shared.inner.read();
        let mut cursor = self.state.cursor.lock();
        let mapper = guard.as_ref().map(|inner| &inner.mapper);
        self.state.read_into(&mut cursor, buf, mapper)
    }
}

impl Drop for StoredInputStream {
    fn drop(&mut self) {
        self.shared.streams.lock().unregister(self.state.id);
    }
}

impl std::fmt::Debug for StoredInputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredInputStream")
            .field("id", &self.state.id)
            .field("size", &self.state.size)
            .field("snapshotted", &self.is_snapshotted())
            .finish()
    }
}

/// Buffers writes in memory and replaces the content on close
pub struct StoredOutputStream<'a> {
    target: &'a StoredBytes,
    buffer: Vec<u8>,
    closed: bool,
}

impl<'a> StoredOutputStream<'a> {
    pub(crate) fn new(target: &'a StoredBytes) -> Self {
        Self {
            target,
            buffer: Vec::new(),
            closed: false,
        }
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Replace the target's content with everything written
    pub fn close(mut self) -> Result<()> {
        self.commit()
    }

    fn commit(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let payload = std::mem::take(&mut self.buffer);
        self.target.set_bytes(&payload)
    }
}

impl Write for StoredOutputStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for StoredOutputStream<'_> {
    fn drop(&mut self) {
        if self.closed || std::thread::panicking() {
            return;
        }
        if let Err(e) = self.commit() {
            warn!(error = %e, "Dropped output stream failed to store its content");
        }
    }
}
