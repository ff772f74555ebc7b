//! Live handles
//!
//! A [`LiveHandle`] is the mutable `(start, size)` record of one outstanding
//! allocation. The block table moves bytes around underneath it; every move
//! is broadcast to the live handles, which rewrite their own coordinates.

use super::lock::HandleLock;
use super::range::BlockRange;
use std::fmt;
use tracing::trace;

#[derive(Debug)]
struct HandleState {
    range: BlockRange,
    discarded: bool,
}

/// One allocated block range whose coordinates follow migrations
#[derive(Debug)]
pub struct LiveHandle {
    id: u64,
    state: HandleLock<HandleState>,
}

impl LiveHandle {
    /// Create a handle over an allocated range
    pub fn new(id: u64, range: BlockRange) -> Self {
        assert!(!range.is_empty(), "handle {} created over an empty range", id);
        Self {
            id,
            state: HandleLock::new(HandleState {
                range,
                discarded: false,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// First block
    pub fn start(&self) -> usize {
        self.state.read().range.start
    }

    /// Number of blocks
    pub fn size(&self) -> usize {
        self.state.read().range.size
    }

    /// One past the last block
    pub fn stop(&self) -> usize {
        self.state.read().range.end()
    }

    /// Consistent `(start, size)` pair
    pub fn range(&self) -> BlockRange {
        self.state.read().range
    }

    pub fn is_discarded(&self) -> bool {
        self.state.read().discarded
    }

    pub fn matches(&self, start: usize, size: usize) -> bool {
        self.state.read().range.matches(start, size)
    }

    pub fn contains(&self, other: &BlockRange) -> bool {
        self.state.read().range.contains(other)
    }

    pub fn overlaps(&self, other: &BlockRange) -> bool {
        self.state.read().range.overlaps(other)
    }

    pub fn get_overlap(&self, other: &BlockRange) -> Option<BlockRange> {
        self.state.read().range.overlap(other)
    }

    pub fn get_non_overlap(&self, other: &BlockRange) -> (Option<BlockRange>, Option<BlockRange>) {
        self.state.read().range.non_overlap(other)
    }

    /// Mark the handle dead. Discarded handles ignore every later notification.
    pub fn discard(&self) {
        self.state.write().discarded = true;
    }

    /// Point the handle at a new range chosen by its owner
    pub fn relocate(&self, range: BlockRange) {
        assert!(!range.is_empty(), "handle {} relocated to an empty range", self.id);
        let mut state = self.state.write();
        assert!(!state.discarded, "handle {} relocated after discard", self.id);
        trace!(handle = self.id, from = %state.range, to = %range, "Relocated handle");
        state.range = range;
    }

    /// Resize in place, but only if the handle still sits at the expected
    /// pre-image. A stale notification leaves the handle untouched.
    pub fn resize_if_exact(&self, old_start: usize, old_size: usize, new_size: usize) -> bool {
        assert!(new_size > 0, "handle {} resized to zero blocks", self.id);
        let mut state = self.state.write();
        if state.discarded || !state.range.matches(old_start, old_size) {
            return false;
        }
        state.range.size = new_size;
        trace!(handle = self.id, start = old_start, old_size, new_size, "Resized handle");
        true
    }

    /// Follow a migration of `[from, from + block_count)` to
    /// `[to, to + new_block_count)`.
    ///
    /// The part of the handle inside the moved range is translated by
    /// `to - from`. If that part reaches the end of the moved range it also
    /// absorbs the size change. Parts outside the moved range stay where they
    /// are and must remain contiguous with the translated part.
    ///
    /// Returns `true` when the handle's coordinates changed.
    pub fn maybe_migrate(
        &self,
        from: usize,
        block_count: usize,
        to: usize,
        new_block_count: usize,
    ) -> bool {
        let moved = BlockRange::new(from, block_count);
        let target = BlockRange::new(to, new_block_count);

        let mut state = self.state.write();
        if state.discarded {
            return false;
        }
        let current = state.range;
        let Some(inside) = current.overlap(&moved) else {
            return false;
        };

        let delta = to as isize - from as isize;
        let mut translated = inside.offset_by(delta);
        if inside.end() == moved.end() {
            let grown = inside.size as isize + new_block_count as isize - block_count as isize;
            assert!(
                grown > 0,
                "handle {} at {} shrinks to {} blocks migrating {} to {}",
                self.id,
                current,
                grown,
                moved,
                target
            );
            translated.size = grown as usize;
        }
        assert!(
            target.contains(&translated),
            "handle {} at {}: moved part {} falls outside migration target {}",
            self.id,
            current,
            translated,
            target
        );

        let (before, after) = current.non_overlap(&moved);
        if let Some(before) = before {
            assert_eq!(
                before.end(),
                translated.start,
                "handle {} at {} split by migration {} -> {}",
                self.id,
                current,
                moved,
                target
            );
        }
        if let Some(after) = after {
            assert_eq!(
                translated.end(),
                after.start,
                "handle {} at {} split by migration {} -> {}",
                self.id,
                current,
                moved,
                target
            );
        }

        let start = before.map_or(translated.start, |r| r.start);
        let size = before.map_or(0, |r| r.size) + translated.size + after.map_or(0, |r| r.size);
        let updated = BlockRange::new(start, size);
        if updated == current {
            return false;
        }

        trace!(handle = self.id, from = %current, to = %updated, "Migrated handle");
        state.range = updated;
        true
    }
}

impl fmt::Display for LiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        write!(f, "Handle(id={}, range={}", self.id, state.range)?;
        if state.discarded {
            write!(f, ", discarded")?;
        }
        write!(f, ")")
    }
}
