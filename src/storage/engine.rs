//! Block store engine
//!
//! [`BlockStore`] is the facade: it owns the block table, the buffer mapper
//! and the live-handle registry behind one reader/writer lock, and hands out
//! [`StoredBytes`] objects.
//!
//! ```text
//! StoredBytes ──set_bytes──▶ BlockTable ──TableListener──▶ EngineHooks
//!                                                            ├─ BufferMapper (grow, move bytes)
//!                                                            ├─ HandleRegistry (rewrite coordinates)
//!                                                            └─ StreamRegistry (snapshot readers)
//! ```
//!
//! Structural changes take the write lock; reads through the mapper take the
//! read lock. Once closed, every operation returns [`Error::Closed`].

use super::blocks::BlockConverter;
use super::buffer::StorageKind;
use super::diag::{DiagEvent, DiagOp, DiagnosticRing};
use super::handle::LiveHandle;
use super::mapper::BufferMapper;
use super::range::BlockRange;
use super::registry::HandleRegistry;
use super::stored::StoredBytes;
use super::stream::StreamRegistry;
use super::table::{BlockTable, DefragKind, TableListener};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::metrics;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Point-in-time view of a store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub storage_kind: StorageKind,
    pub block_size: usize,
    pub capacity_blocks: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub live_handles: usize,
    pub open_streams: usize,
    pub region_count: usize,
    pub fragmentation: f64,
    pub buffer_bytes: usize,
    pub deletions: u64,
    pub defrag_runs: u64,
}

pub(crate) struct Inner {
    pub(crate) table: BlockTable,
    pub(crate) mapper: BufferMapper,
    pub(crate) handles: HandleRegistry,
}

impl Inner {
    /// Borrow the table alongside a listener over everything else
    pub(crate) fn split<'a>(
        &'a mut self,
        shared: &'a StoreShared,
    ) -> (&'a mut BlockTable, EngineHooks<'a>) {
        (
            &mut self.table,
            EngineHooks {
                mapper: &mut self.mapper,
                handles: &self.handles,
                streams: &shared.streams,
                diag: &shared.diag,
            },
        )
    }

    fn usage(&self) -> (i64, i64, i64) {
        (
            self.table.used_blocks() as i64,
            self.table.block_count() as i64,
            self.mapper.capacity_bytes() as i64,
        )
    }
}

/// State shared by a store and everything it handed out
pub(crate) struct StoreShared {
    id: Uuid,
    config: EngineConfig,
    pub(crate) converter: BlockConverter,
    pub(crate) inner: RwLock<Option<Inner>>,
    pub(crate) streams: Mutex<StreamRegistry>,
    pub(crate) diag: DiagnosticRing,
    next_id: AtomicU64,
}

impl StoreShared {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run a structural change under the write lock
    pub(crate) fn mutate<R>(&self, f: impl FnOnce(&mut Inner) -> Result<R>) -> Result<R> {
        let mut guard = self.inner.write();
        let inner = guard.as_mut().ok_or(Error::Closed)?;
        // A move may legitimately repeat across separate operations
        inner.mapper.reset_move_guard();

        let (used, capacity, bytes) = inner.usage();
        let result = f(inner);
        let (used_after, capacity_after, bytes_after) = inner.usage();
        metrics::record_usage_delta(used_after - used, capacity_after - capacity, bytes_after - bytes);
        result
    }

    /// Run a read-only view under the read lock
    pub(crate) fn inspect<R>(&self, f: impl FnOnce(&Inner) -> R) -> Result<R> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or(Error::Closed)?;
        Ok(f(inner))
    }

    /// Force open streams reading `range` onto private copies before it changes
    pub(crate) fn on_before_change(&self, inner: &Inner, range: BlockRange) {
        snapshot_streams(&self.streams, &self.diag, &inner.mapper, range);
    }
}

fn snapshot_streams(
    streams: &Mutex<StreamRegistry>,
    diag: &DiagnosticRing,
    mapper: &BufferMapper,
    range: BlockRange,
) {
    let count = streams.lock().snapshot_overlapping(range, mapper);
    if count > 0 {
        diag.record(DiagOp::Snapshot, range.start as u64, range.size as u64, count as u64);
        metrics::STREAM_SNAPSHOTS_TOTAL.inc_by(count as u64);
        debug!(range = %range, streams = count, "Snapshotted streams before change");
    }
}

/// Table listener wiring structural changes to the buffer, handles and streams
pub(crate) struct EngineHooks<'a> {
    mapper: &'a mut BufferMapper,
    handles: &'a HandleRegistry,
    streams: &'a Mutex<StreamRegistry>,
    diag: &'a DiagnosticRing,
}

impl TableListener for EngineHooks<'_> {
    fn on_before_expand(&mut self, new_block_count: usize, live_blocks: usize) -> Result<()> {
        self.diag
            .record(DiagOp::Expand, new_block_count as u64, live_blocks as u64, 0);
        self.mapper.ensure_blocks(new_block_count, live_blocks)?;
        Ok(())
    }

    fn on_allocate(&mut self, range: BlockRange) -> Result<()> {
        self.diag
            .record(DiagOp::Allocate, range.start as u64, range.size as u64, 0);
        let keep = self.mapper.capacity_blocks();
        self.mapper.ensure_blocks(range.end(), keep)?;
        Ok(())
    }

    fn on_deallocate(&mut self, range: BlockRange) {
        self.diag
            .record(DiagOp::Deallocate, range.start as u64, range.size as u64, 0);
        snapshot_streams(self.streams, self.diag, self.mapper, range);
    }

    fn on_resized(&mut self, start: usize, old_size: usize, new_size: usize) {
        let op = if new_size > old_size {
            DiagOp::Grow
        } else {
            DiagOp::Shrink
        };
        self.diag
            .record(op, start as u64, old_size as u64, new_size as u64);
        let matched = self
            .handles
            .for_each_live(|h| h.resize_if_exact(start, old_size, new_size));
        if matched == 0 {
            warn!(start, old_size, new_size, "Resize notification matched no live handle");
        }
    }

    fn on_move(&mut self, from: usize, to: usize, block_count: usize) -> Result<()> {
        self.diag
            .record(DiagOp::Move, from as u64, to as u64, block_count as u64);
        self.mapper.move_blocks(from, to, block_count)
    }

    fn on_migrate(&mut self, from: usize, block_count: usize, to: usize, new_block_count: usize) {
        self.diag
            .record(DiagOp::Migrate, from as u64, to as u64, new_block_count as u64);
        let moved = self
            .handles
            .for_each_live(|h| h.maybe_migrate(from, block_count, to, new_block_count));
        metrics::MIGRATIONS_TOTAL.inc();
        debug!(from, block_count, to, new_block_count, handles = moved, "Migration applied");
    }

    fn on_defrag(&mut self, kind: DefragKind, migrations: usize) {
        let code = match kind {
            DefragKind::Full => 0,
            DefragKind::Simple => 1,
        };
        self.diag.record(DiagOp::Defrag, code, migrations as u64, 0);
        metrics::record_defrag(kind.as_str());
    }
}

/// In-process block storage engine
pub struct BlockStore {
    shared: Arc<StoreShared>,
}

impl BlockStore {
    /// Open a store with the given configuration
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        metrics::init_metrics();

        let converter = BlockConverter::new(config.block_size)?;
        let mapper = BufferMapper::open(
            converter,
            config.storage_kind,
            config.initial_block_count,
            config.temp_dir.as_deref(),
        )?;
        let table = BlockTable::new(config.initial_block_count, config.defrag_policy());
        let inner = Inner {
            table,
            mapper,
            handles: HandleRegistry::new(),
        };
        let (_, capacity, bytes) = inner.usage();
        metrics::record_usage_delta(0, capacity, bytes);

        let id = Uuid::new_v4();
        info!(
            store = %id,
            kind = %config.storage_kind,
            block_size = config.block_size,
            initial_blocks = config.initial_block_count,
            "Opened block store"
        );

        Ok(Self {
            shared: Arc::new(StoreShared {
                id,
                diag: DiagnosticRing::new(config.diagnostics_capacity),
                converter,
                config,
                inner: RwLock::new(Some(inner)),
                streams: Mutex::new(StreamRegistry::default()),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Open a store with default defrag and diagnostics settings
    pub fn new(block_size: usize, initial_block_count: usize, kind: StorageKind) -> Result<Self> {
        Self::open(
            EngineConfig::default()
                .with_block_size(block_size)
                .with_initial_block_count(initial_block_count)
                .with_storage_kind(kind),
        )
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn block_size(&self) -> usize {
        self.shared.converter.block_size()
    }

    /// Reserve room for `len` bytes. The logical size starts at 0.
    pub fn allocate(&self, len: usize) -> Result<StoredBytes> {
        self.allocate_blocks(len, None)
    }

    /// Store a copy of `content`
    pub fn allocate_with(&self, content: &[u8]) -> Result<StoredBytes> {
        self.allocate_blocks(content.len(), Some(content))
    }

    fn allocate_blocks(&self, len: usize, content: Option<&[u8]>) -> Result<StoredBytes> {
        let shared = &*self.shared;
        let blocks = shared.converter.payload_blocks(len);
        let id = shared.next_id();

        let handle = shared.mutate(|inner| {
            let (table, mut hooks) = inner.split(shared);
            let start = table.allocate(blocks, &mut hooks)?;
            let handle = Arc::new(LiveHandle::new(id, BlockRange::new(start, blocks)));
            inner.handles.register(&handle);
            if let Some(content) = content {
                inner.mapper.write(handle.range(), content)?;
            }
            Ok(handle)
        })?;

        metrics::ALLOCATIONS_TOTAL.inc();
        debug!(handle = id, range = %handle.range(), bytes = len, "Allocated stored bytes");
        let logical = content.map_or(0, <[u8]>::len);
        Ok(StoredBytes::new(Arc::clone(&self.shared), handle, logical))
    }

    /// Compact every allocation into one run from block 0
    pub fn defragment(&self) -> Result<usize> {
        let shared = &*self.shared;
        shared.mutate(|inner| {
            let (table, mut hooks) = inner.split(shared);
            table.full_defrag(&mut hooks)
        })
    }

    /// Incremental compaction, escalating to a full pass if it is not enough
    pub fn compact(&self) -> Result<usize> {
        let shared = &*self.shared;
        shared.mutate(|inner| {
            let (table, mut hooks) = inner.split(shared);
            table.simple_defrag(&mut hooks)
        })
    }

    pub fn used_blocks(&self) -> Result<usize> {
        self.shared.inspect(|inner| inner.table.used_blocks())
    }

    pub fn stats(&self) -> Result<EngineStats> {
        self.shared.inspect(|inner| EngineStats {
            storage_kind: inner.mapper.kind(),
            block_size: self.shared.converter.block_size(),
            capacity_blocks: inner.table.block_count(),
            used_blocks: inner.table.used_blocks(),
            free_blocks: inner.table.free_blocks(),
            live_handles: inner.handles.live_count(),
            open_streams: self.shared.streams.lock().open_count(),
            region_count: inner.table.region_count(true),
            fragmentation: inner.table.fragmentation(),
            buffer_bytes: inner.mapper.capacity_bytes(),
            deletions: inner.table.deletions(),
            defrag_runs: inner.table.defrag_runs(),
        })
    }

    /// Recent structural operations, oldest first
    pub fn diagnostics(&self) -> Vec<DiagEvent> {
        self.shared.diag.events()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.read().is_none()
    }

    /// Release the backing buffer and forget every handle
    ///
    /// Open input streams keep working from private copies. Any later call
    /// on the store or its stored bytes returns [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        let mut guard = self.shared.inner.write();
        let mut inner = guard.take().ok_or(Error::Closed)?;

        {
            let mut streams = self.shared.streams.lock();
            let copied = streams.snapshot_all(&inner.mapper);
            if copied > 0 {
                metrics::STREAM_SNAPSHOTS_TOTAL.inc_by(copied as u64);
            }
            streams.clear();
        }
        let (used, capacity, bytes) = inner.usage();
        let live = inner.handles.live_count();
        if !inner.handles.is_empty() {
            debug!(registered = inner.handles.len(), live, "Dropping handle registry");
        }
        inner.handles.clear();
        metrics::record_usage_delta(-used, -capacity, -bytes);

        inner.mapper.close()?;
        info!(store = %self.shared.id, live_handles = live, "Closed block store");
        Ok(())
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.close() {
            error!(store = %self.shared.id, error = %e, "Failed to close block store");
        }
    }
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.config.storage_kind)
            .field("block_size", &self.shared.converter.block_size())
            .field("closed", &self.is_closed())
            .finish()
    }
}
