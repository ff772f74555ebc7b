//! Block table
//!
//! The allocator core: one bit per block (set = used), a first-fit search for
//! contiguous free runs, an expansion policy, and compaction.
//!
//! ```text
//! used:  ████░░░░██████░░░░░░░░
//!        └─A─┘   └──B──┘
//!
//! allocate(3)  → first free run ≥ 3 → [4..7)
//! fullDefrag() → B migrated to abut A
//! ```
//!
//! The table never touches bytes or handles itself. Every structural change
//! is reported to a [`TableListener`], which keeps the backing buffer large
//! enough, moves bytes, and rewrites the coordinates of live handles.

use super::range::BlockRange;
use crate::error::Result;
use bitvec::prelude::*;
use std::fmt;
use tracing::{debug, info, trace};

/// Receiver of structural changes made by the [`BlockTable`]
pub trait TableListener {
    /// The table is about to grow to `new_block_count` blocks; only the
    /// first `live_blocks` blocks hold anything worth keeping.
    fn on_before_expand(&mut self, new_block_count: usize, live_blocks: usize) -> Result<()>;

    /// `range` is about to become used. Called before any byte is written there.
    fn on_allocate(&mut self, range: BlockRange) -> Result<()>;

    /// `range` is about to become free. Called before the bits are cleared.
    fn on_deallocate(&mut self, range: BlockRange);

    /// The allocation at `start` changed size in place
    fn on_resized(&mut self, start: usize, old_size: usize, new_size: usize);

    /// Physically move `block_count` blocks of bytes from `from` to `to`
    fn on_move(&mut self, from: usize, to: usize, block_count: usize) -> Result<()>;

    /// `[from, from + block_count)` now lives at `[to, to + new_block_count)`
    fn on_migrate(&mut self, from: usize, block_count: usize, to: usize, new_block_count: usize);

    /// A defragmentation pass finished
    fn on_defrag(&mut self, _kind: DefragKind, _migrations: usize) {}
}

/// Which compaction algorithm ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefragKind {
    /// Everything migrated into one run starting at block 0
    Full,
    /// Rightmost regions moved into earlier gaps one at a time
    Simple,
}

impl DefragKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefragKind::Full => "full",
            DefragKind::Simple => "simple",
        }
    }
}

impl fmt::Display for DefragKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Grows the table in multiples of a fixed granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionPolicy {
    granularity: usize,
}

impl ExpansionPolicy {
    pub fn new(granularity: usize) -> Self {
        assert!(granularity > 0, "expansion granularity must be positive");
        Self { granularity }
    }

    pub fn granularity(&self) -> usize {
        self.granularity
    }

    /// Smallest multiple of the granularity holding `required` blocks
    pub fn next_capacity(&self, current: usize, required: usize) -> usize {
        if required <= current {
            return current;
        }
        required.div_ceil(self.granularity) * self.granularity
    }
}

/// When deletions trigger compaction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DefragPolicy {
    /// Check fragmentation on every n-th deletion (0 disables the check)
    pub every_deletions: u64,
    /// Deletion-triggered full defrag runs above this ratio
    pub full_threshold: f64,
    /// Simple defrag escalates to full defrag above this ratio
    pub simple_threshold: f64,
}

impl Default for DefragPolicy {
    fn default() -> Self {
        Self {
            every_deletions: 5,
            full_threshold: 0.6,
            simple_threshold: 0.4,
        }
    }
}

/// Bitmap of used/free blocks
pub struct BlockTable {
    used: BitVec<usize, Lsb0>,
    expansion: ExpansionPolicy,
    defrag: DefragPolicy,
    deletions: u64,
    defrag_runs: u64,
    defragmenting: bool,
}

impl BlockTable {
    /// Create a table of `initial_block_count` free blocks. The initial count
    /// is also the expansion granularity.
    pub fn new(initial_block_count: usize, defrag: DefragPolicy) -> Self {
        Self {
            used: bitvec![usize, Lsb0; 0; initial_block_count],
            expansion: ExpansionPolicy::new(initial_block_count.max(1)),
            defrag,
            deletions: 0,
            defrag_runs: 0,
            defragmenting: false,
        }
    }

    /// Capacity in blocks
    pub fn block_count(&self) -> usize {
        self.used.len()
    }

    pub fn used_blocks(&self) -> usize {
        self.used.count_ones()
    }

    pub fn free_blocks(&self) -> usize {
        self.used.count_zeros()
    }

    pub fn is_used(&self, block: usize) -> bool {
        self.used.get(block).map(|b| *b).unwrap_or(false)
    }

    /// One past the last used block (0 when nothing is allocated)
    pub fn high_water(&self) -> usize {
        self.used.last_one().map_or(0, |last| last + 1)
    }

    /// Deletions seen so far
    pub fn deletions(&self) -> u64 {
        self.deletions
    }

    /// Completed defragmentation passes
    pub fn defrag_runs(&self) -> u64 {
        self.defrag_runs
    }

    /// Maximal runs of used (or free) blocks, left to right
    pub fn regions(&self, allocated: bool) -> Vec<BlockRange> {
        let mut regions = Vec::new();
        let mut pos = 0;
        while let Some(run) = self.next_run(pos, allocated) {
            pos = run.end();
            regions.push(run);
        }
        regions
    }

    pub fn region_count(&self, allocated: bool) -> usize {
        self.regions(allocated).len()
    }

    /// Share of all blocks held by used runs that touch neither table edge
    ///
    /// The run starting at block 0 and the run ending at the last block are
    /// edge runs and never count. After a full defrag every used block is in
    /// the leading run and the ratio is 0.
    pub fn fragmentation(&self) -> f64 {
        let total = self.used.len();
        if total == 0 {
            return 0.0;
        }
        let scattered: usize = self
            .regions(true)
            .into_iter()
            .filter(|run| run.start != 0 && run.end() != total)
            .map(|run| run.size)
            .sum();
        scattered as f64 / total as f64
    }

    /// Allocate `block_count` contiguous blocks and return the first one
    pub fn allocate(&mut self, block_count: usize, listener: &mut dyn TableListener) -> Result<usize> {
        assert!(block_count > 0, "allocation of zero blocks");
        let start = self.place(block_count, listener)?;
        self.claim(BlockRange::new(start, block_count), listener)?;
        debug!(start, blocks = block_count, "Allocated blocks");
        Ok(start)
    }

    /// Free `block_count` blocks at `start`
    ///
    /// Counts as a deletion: every n-th deletion checks fragmentation and may
    /// run a full defrag.
    pub fn deallocate(
        &mut self,
        start: usize,
        block_count: usize,
        listener: &mut dyn TableListener,
    ) -> Result<()> {
        self.release(BlockRange::new(start, block_count), listener);
        self.deletions += 1;
        debug!(start, blocks = block_count, deletions = self.deletions, "Deallocated blocks");

        let every = self.defrag.every_deletions;
        if every > 0 && self.deletions % every == 0 && !self.defragmenting {
            let fragmentation = self.fragmentation();
            if fragmentation > self.defrag.full_threshold {
                info!(
                    fragmentation,
                    threshold = self.defrag.full_threshold,
                    "Fragmentation above threshold, running full defrag"
                );
                self.full_defrag(listener)?;
            }
        }
        Ok(())
    }

    /// Grow the allocation at `start` from `old_size` to `new_size` blocks
    ///
    /// Extends in place when the following blocks are free. Otherwise the
    /// allocation moves: with `copy` its bytes are migrated to the new run,
    /// without it the old blocks are simply freed and the caller fills the
    /// new run. Returns the (possibly new) start.
    pub fn grow(
        &mut self,
        start: usize,
        old_size: usize,
        new_size: usize,
        copy: bool,
        listener: &mut dyn TableListener,
    ) -> Result<usize> {
        assert!(
            new_size > old_size,
            "grow from {} to {} blocks is not growth",
            old_size,
            new_size
        );
        let current = BlockRange::new(start, old_size);
        self.assert_range(current, true, "grown allocation");

        let extension = BlockRange::new(current.end(), new_size - old_size);
        let limit = extension.end().min(self.used.len());
        let blocked = extension.start < limit && self.used[extension.start..limit].any();

        if !blocked {
            if extension.end() > self.used.len() {
                self.expand_to(extension.end(), listener)?;
            }
            self.claim(extension, listener)?;
            listener.on_resized(start, old_size, new_size);
            debug!(start, old_size, new_size, "Grew allocation in place");
            return Ok(start);
        }

        let to = if copy {
            let to = self.place(new_size, listener)?;
            self.migrate(start, old_size, to, new_size, listener)?;
            to
        } else {
            let to = self.allocate(new_size, listener)?;
            self.release(current, listener);
            to
        };
        debug!(from = start, to, old_size, new_size, copy, "Grew allocation by relocation");
        Ok(to)
    }

    /// Shrink the allocation at `start` in place by freeing its tail
    pub fn shrink(
        &mut self,
        start: usize,
        old_size: usize,
        new_size: usize,
        listener: &mut dyn TableListener,
    ) {
        assert!(
            new_size > 0 && new_size < old_size,
            "shrink from {} to {} blocks is not a shrink",
            old_size,
            new_size
        );
        self.assert_range(BlockRange::new(start, old_size), true, "shrunk allocation");
        self.release(BlockRange::new(start + new_size, old_size - new_size), listener);
        listener.on_resized(start, old_size, new_size);
        debug!(start, old_size, new_size, "Shrank allocation");
    }

    /// Relocate `[from, from + block_count)` to `[to, to + new_block_count)`
    ///
    /// Source and target may overlap. The target blocks outside the source
    /// must be free. Bytes are moved before the bitmap changes, and live
    /// handles are told last.
    pub fn migrate(
        &mut self,
        from: usize,
        block_count: usize,
        to: usize,
        new_block_count: usize,
        listener: &mut dyn TableListener,
    ) -> Result<()> {
        assert!(
            block_count > 0 && new_block_count > 0,
            "migration of an empty range"
        );
        let source = BlockRange::new(from, block_count);
        let target = BlockRange::new(to, new_block_count);
        self.assert_range(source, true, "migration source");

        let (target_before, target_after) = target.non_overlap(&source);
        for part in [target_before, target_after].into_iter().flatten() {
            let end = part.end().min(self.used.len());
            assert!(
                part.start >= end || self.used[part.start..end].not_any(),
                "migration target {} overlaps a live allocation",
                part
            );
        }

        let before = self.used_blocks();
        if target.end() > self.used.len() {
            self.expand_to(target.end(), listener)?;
        }
        listener.on_allocate(target)?;
        listener.on_move(from, to, block_count.min(new_block_count))?;

        // Union of used bits: drop what the source leaves behind, add what
        // the target gains. Blocks in both stay set.
        let (source_before, source_after) = source.non_overlap(&target);
        for part in [source_before, source_after].into_iter().flatten() {
            self.set_range(part, false);
        }
        for part in [target_before, target_after].into_iter().flatten() {
            self.set_range(part, true);
        }

        listener.on_migrate(from, block_count, to, new_block_count);

        assert_eq!(
            self.used_blocks(),
            before - block_count + new_block_count,
            "migration {} -> {} changed the allocated block count",
            source,
            target
        );
        trace!(from = %source, to = %target, "Migrated blocks");
        Ok(())
    }

    /// Compact every allocation into one run starting at block 0
    ///
    /// A no-op when a defrag pass is already running. Returns the number of
    /// migrations performed.
    pub fn full_defrag(&mut self, listener: &mut dyn TableListener) -> Result<usize> {
        if self.defragmenting {
            return Ok(0);
        }
        self.defragmenting = true;
        let result = self.compact_all(listener);
        self.defragmenting = false;
        result
    }

    /// Move the rightmost regions into earlier gaps until no move fits
    ///
    /// Escalates to a full defrag if fragmentation stays above the simple
    /// threshold. A no-op when a defrag pass is already running.
    pub fn simple_defrag(&mut self, listener: &mut dyn TableListener) -> Result<usize> {
        if self.defragmenting {
            return Ok(0);
        }
        self.defragmenting = true;
        let result = self.compact_tail(listener);
        self.defragmenting = false;
        result
    }

    fn compact_all(&mut self, listener: &mut dyn TableListener) -> Result<usize> {
        let before = self.used_blocks();
        let fragmentation = self.fragmentation();
        let mut cursor = 0;
        let mut migrations = 0;

        while let Some(region) = self.next_run(cursor, true) {
            if region.start != cursor {
                self.migrate(region.start, region.size, cursor, region.size, listener)?;
                migrations += 1;
            }
            cursor += region.size;
        }

        assert_eq!(
            self.used_blocks(),
            before,
            "full defrag changed the allocated block count"
        );
        if before > 0 {
            assert_eq!(
                self.region_count(true),
                1,
                "full defrag left allocated blocks fragmented"
            );
        }

        self.defrag_runs += 1;
        listener.on_defrag(DefragKind::Full, migrations);
        info!(
            migrations,
            used_blocks = before,
            fragmentation_before = fragmentation,
            "Full defrag complete"
        );
        Ok(migrations)
    }

    fn compact_tail(&mut self, listener: &mut dyn TableListener) -> Result<usize> {
        let mut migrations = 0;
        loop {
            let Some(last) = self.regions(true).pop() else {
                break;
            };
            let gap = self
                .regions(false)
                .into_iter()
                .find(|gap| gap.end() <= last.start && gap.size >= last.size);
            let Some(gap) = gap else {
                break;
            };
            self.migrate(last.start, last.size, gap.start, last.size, listener)?;
            migrations += 1;
        }

        self.defrag_runs += 1;
        listener.on_defrag(DefragKind::Simple, migrations);
        let fragmentation = self.fragmentation();
        debug!(migrations, fragmentation, "Simple defrag complete");

        if fragmentation > self.defrag.simple_threshold {
            info!(
                fragmentation,
                threshold = self.defrag.simple_threshold,
                "Simple defrag insufficient, escalating to full defrag"
            );
            migrations += self.compact_all(listener)?;
        }
        Ok(migrations)
    }

    /// Start of the first free run of `block_count` blocks, expanding if none fits
    fn place(&mut self, block_count: usize, listener: &mut dyn TableListener) -> Result<usize> {
        if self.used.not_any() {
            if block_count > self.used.len() {
                self.expand_to(block_count, listener)?;
            }
            return Ok(0);
        }
        if let Some(start) = self.find_free_run(block_count) {
            return Ok(start);
        }

        // Every free run is too small. Append after the last used block
        // instead of scanning the same runs again.
        let start = self.high_water();
        self.expand_to(self.used.len() + block_count, listener)?;
        Ok(start)
    }

    fn find_free_run(&self, block_count: usize) -> Option<usize> {
        let mut pos = 0;
        while let Some(run) = self.next_run(pos, false) {
            if run.size >= block_count {
                return Some(run.start);
            }
            pos = run.end();
        }
        None
    }

    fn next_run(&self, from: usize, allocated: bool) -> Option<BlockRange> {
        if from >= self.used.len() {
            return None;
        }
        let tail = &self.used[from..];
        let offset = if allocated {
            tail.first_one()?
        } else {
            tail.first_zero()?
        };
        let start = from + offset;
        let rest = &self.used[start..];
        let size = if allocated {
            rest.first_zero()
        } else {
            rest.first_one()
        }
        .unwrap_or(rest.len());
        Some(BlockRange::new(start, size))
    }

    fn expand_to(&mut self, required: usize, listener: &mut dyn TableListener) -> Result<()> {
        let current = self.used.len();
        let new_count = self.expansion.next_capacity(current, required);
        if new_count <= current {
            return Ok(());
        }
        listener.on_before_expand(new_count, self.high_water())?;
        self.used.resize(new_count, false);
        info!(old_blocks = current, new_blocks = new_count, "Expanded block table");
        Ok(())
    }

    fn claim(&mut self, range: BlockRange, listener: &mut dyn TableListener) -> Result<()> {
        self.assert_range(range, false, "claimed range");
        listener.on_allocate(range)?;
        self.set_range(range, true);
        Ok(())
    }

    fn release(&mut self, range: BlockRange, listener: &mut dyn TableListener) {
        self.assert_range(range, true, "released range");
        listener.on_deallocate(range);
        self.set_range(range, false);
    }

    fn set_range(&mut self, range: BlockRange, value: bool) {
        self.used[range.start..range.end()].fill(value);
    }

    fn assert_range(&self, range: BlockRange, used: bool, what: &str) {
        assert!(
            range.end() <= self.used.len(),
            "{} {} extends past the table ({} blocks)",
            what,
            range,
            self.used.len()
        );
        let bits = &self.used[range.start..range.end()];
        if used {
            assert!(bits.all(), "{} {} is not fully allocated", what, range);
        } else {
            assert!(bits.not_any(), "{} {} is already in use", what, range);
        }
    }
}

impl fmt::Debug for BlockTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockTable")
            .field("block_count", &self.block_count())
            .field("used_blocks", &self.used_blocks())
            .field("regions", &self.region_count(true))
            .field("deletions", &self.deletions)
            .field("defrag_runs", &self.defrag_runs)
            .finish()
    }
}
