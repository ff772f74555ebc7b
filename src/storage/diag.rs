//! Diagnostic ring buffer
//!
//! A fixed-size, lock-free circular log of recent structural operations, kept
//! for post-mortem debugging. Writers take a sequence number with one atomic
//! increment, then claim the slot it maps to by swapping its stamp to a
//! writing marker; readers skip claimed slots and slots rewritten underneath
//! them. Nothing in the engine depends on its content.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{fence, AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

/// Kind of operation recorded in the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum DiagOp {
    Allocate = 1,
    Deallocate = 2,
    Grow = 3,
    Shrink = 4,
    Migrate = 5,
    Move = 6,
    Expand = 7,
    Snapshot = 8,
    Defrag = 9,
    Delete = 10,
}

impl DiagOp {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => DiagOp::Allocate,
            2 => DiagOp::Deallocate,
            3 => DiagOp::Grow,
            4 => DiagOp::Shrink,
            5 => DiagOp::Migrate,
            6 => DiagOp::Move,
            7 => DiagOp::Expand,
            8 => DiagOp::Snapshot,
            9 => DiagOp::Defrag,
            10 => DiagOp::Delete,
            _ => return None,
        })
    }
}

/// One recorded operation with up to three numeric arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiagEvent {
    pub seq: u64,
    pub micros: u64,
    pub op: DiagOp,
    pub args: [u64; 3],
}

impl fmt::Display for DiagEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} +{}us {:?}({}, {}, {})",
            self.seq, self.micros, self.op, self.args[0], self.args[1], self.args[2]
        )
    }
}

// Stamp of a slot some writer is filling
const WRITING: u64 = u64::MAX;

#[derive(Default)]
struct Slot {
    // 0 = empty, WRITING, otherwise seq + 1 of the event stored here
    stamp: AtomicU64,
    micros: AtomicU64,
    op: AtomicU8,
    args: [AtomicU64; 3],
}

/// Lock-free circular log of recent operations
pub struct DiagnosticRing {
    slots: Box<[Slot]>,
    mask: u64,
    cursor: AtomicU64,
    epoch: Instant,
}

impl DiagnosticRing {
    /// Create a ring holding the last `capacity` events (rounded up to a power of two)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let slots = (0..capacity).map(|_| Slot::default()).collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
            mask: capacity as u64 - 1,
            cursor: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Total number of events ever recorded
    pub fn recorded(&self) -> u64 {
        self.cursor.load(Ordering::Relaxed)
    }

    /// Append an event, overwriting the oldest one once the ring is full
    ///
    /// Only one writer fills a slot at a time. A writer that finds its slot
    /// claimed waits for the holder to publish; if that left a newer event
    /// (a writer one or more laps ahead), its own older event is dropped.
    pub fn record(&self, op: DiagOp, a: u64, b: u64, c: u64) {
        let seq = self.cursor.fetch_add(1, Ordering::Relaxed);
        let slot = &self.slots[(seq & self.mask) as usize];
        let stamp = seq + 1;

        let mut current = slot.stamp.load(Ordering::Relaxed);
        loop {
            if current == WRITING {
                std::hint::spin_loop();
                current = slot.stamp.load(Ordering::Relaxed);
                continue;
            }
            if current > stamp {
                return;
            }
            match slot.stamp.compare_exchange_weak(
                current,
                WRITING,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        // Field stores stay after the claim
        fence(Ordering::Release);

        slot.micros
            .store(self.epoch.elapsed().as_micros() as u64, Ordering::Relaxed);
        slot.op.store(op as u8, Ordering::Relaxed);
        slot.args[0].store(a, Ordering::Relaxed);
        slot.args[1].store(b, Ordering::Relaxed);
        slot.args[2].store(c, Ordering::Relaxed);
        slot.stamp.store(stamp, Ordering::Release);
    }

    /// Copy out the retained events, oldest first
    pub fn events(&self) -> Vec<DiagEvent> {
        let mut events: Vec<DiagEvent> = self
            .slots
            .iter()
            .filter_map(|slot| {
                let stamp = slot.stamp.load(Ordering::Acquire);
                if stamp == 0 || stamp == WRITING {
                    return None;
                }
                let event = DiagEvent {
                    seq: stamp - 1,
                    micros: slot.micros.load(Ordering::Relaxed),
                    op: DiagOp::from_u8(slot.op.load(Ordering::Relaxed))?,
                    args: [
                        slot.args[0].load(Ordering::Relaxed),
                        slot.args[1].load(Ordering::Relaxed),
                        slot.args[2].load(Ordering::Relaxed),
                    ],
                };
                // Torn read: a writer reclaimed the slot while we copied it
                fence(Ordering::Acquire);
                (slot.stamp.load(Ordering::Relaxed) == stamp).then_some(event)
            })
            .collect();
        events.sort_by_key(|e| e.seq);
        events
    }
}

impl fmt::Debug for DiagnosticRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticRing")
            .field("capacity", &self.capacity())
            .field("recorded", &self.recorded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_records_in_order() {
        let ring = DiagnosticRing::new(8);
        ring.record(DiagOp::Allocate, 0, 4, 0);
        ring.record(DiagOp::Migrate, 10, 4, 0);

        let events = ring.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].op, DiagOp::Allocate);
        assert_eq!(events[1].op, DiagOp::Migrate);
        assert_eq!(events[1].args, [10, 4, 0]);
    }

    #[test]
    fn test_wraps_and_keeps_latest() {
        let ring = DiagnosticRing::new(4);
        for i in 0..10 {
            ring.record(DiagOp::Allocate, i, 1, 0);
        }
        let events = ring.events();
        assert_eq!(events.len(), 4);
        let firsts: Vec<u64> = events.iter().map(|e| e.args[0]).collect();
        assert_eq!(firsts, vec![6, 7, 8, 9]);
        assert_eq!(ring.recorded(), 10);
    }

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        assert_eq!(DiagnosticRing::new(5).capacity(), 8);
        assert_eq!(DiagnosticRing::new(0).capacity(), 1);
    }

    #[test]
    fn test_concurrent_writers() {
        let ring = Arc::new(DiagnosticRing::new(64));
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let ring = Arc::clone(&ring);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        ring.record(DiagOp::Move, t, i, 0);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(ring.recorded(), 400);
        let events = ring.events();
        assert!(events.len() <= 64);
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn test_events_never_mix_writers() {
        const WRITERS: u64 = 8;
        const PER_WRITER: u64 = 2000;
        let ring = DiagnosticRing::new(2);

        std::thread::scope(|scope| {
            for t in 0..WRITERS {
                let ring = &ring;
                scope.spawn(move || {
                    for i in 0..PER_WRITER {
                        ring.record(DiagOp::Move, t, i, t * 1_000_000 + i);
                    }
                });
            }
            let ring = &ring;
            scope.spawn(move || {
                for _ in 0..500 {
                    for e in ring.events() {
                        assert_eq!(e.args[2], e.args[0] * 1_000_000 + e.args[1], "mixed event {}", e);
                    }
                }
            });
        });

        assert_eq!(ring.recorded(), WRITERS * PER_WRITER);
        let events = ring.events();
        assert!(!events.is_empty() && events.len() <= 2);
        for e in &events {
            assert_eq!(e.op, DiagOp::Move);
            assert_eq!(e.args[2], e.args[0] * 1_000_000 + e.args[1]);
        }
    }

    #[test]
    fn test_stale_writer_does_not_overwrite_newer_event() {
        let ring = DiagnosticRing::new(1);
        ring.record(DiagOp::Allocate, 1, 0, 0);
        ring.record(DiagOp::Delete, 2, 0, 0);
        // Replay a writer that took seq 0 but reaches the slot after seq 1
        ring.cursor.store(0, Ordering::Relaxed);
        ring.record(DiagOp::Grow, 3, 0, 0);

        let events = ring.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, DiagOp::Delete);
        assert_eq!(events[0].seq, 1);
    }
}
