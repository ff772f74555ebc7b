//! Live-handle registry
//!
//! The block table reports coordinate changes by range, not by handle. The
//! registry is how those reports reach every handle: populated when a range
//! is allocated, an entry removed when its handle is discarded, and cleared
//! when the store closes. Entries are weak so a dropped handle never pins
//! memory.

use super::handle::LiveHandle;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// Weakly-held set of live handles keyed by handle id
#[derive(Debug, Default)]
pub struct HandleRegistry {
    handles: BTreeMap<u64, Weak<LiveHandle>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handle: &Arc<LiveHandle>) {
        let previous = self.handles.insert(handle.id(), Arc::downgrade(handle));
        assert!(
            previous.is_none(),
            "handle id {} registered twice",
            handle.id()
        );
    }

    pub fn unregister(&mut self, id: u64) -> bool {
        self.handles.remove(&id).is_some()
    }

    /// Visit every handle that is still alive and not discarded
    ///
    /// Returns the number of handles for which `f` returned `true`.
    pub fn for_each_live<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&LiveHandle) -> bool,
    {
        self.handles
            .values()
            .filter_map(Weak::upgrade)
            .filter(|h| !h.is_discarded())
            .filter(|h| f(h))
            .count()
    }

    /// Number of live, non-discarded handles
    pub fn live_count(&self) -> usize {
        self.for_each_live(|_| true)
    }

    pub fn clear(&mut self) {
        self.handles.clear();
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
