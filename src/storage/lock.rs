//! Per-handle read/write lock
//!
//! Address reads (`start()`, `stop()`, overlap tests) on a live handle take a
//! shared lock; coordinate rewrites take an exclusive one. A thread that
//! already holds a lock on a handle may not ask for the exclusive lock on the
//! same handle: the request panics instead of deadlocking. Each thread keeps a
//! small list of the lock ids it currently holds to enforce this.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static HELD_READ: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
    static HELD_WRITE: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

fn holds(list: &'static std::thread::LocalKey<RefCell<Vec<u64>>>, id: u64) -> bool {
    list.with(|held| held.borrow().contains(&id))
}

fn push(list: &'static std::thread::LocalKey<RefCell<Vec<u64>>>, id: u64) {
    list.with(|held| held.borrow_mut().push(id));
}

fn pop(list: &'static std::thread::LocalKey<RefCell<Vec<u64>>>, id: u64) {
    list.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|&h| h == id) {
            held.swap_remove(pos);
        }
    });
}

/// Reader/writer lock that refuses read-to-write upgrades
#[derive(Debug)]
pub struct HandleLock<T> {
    id: u64,
    inner: RwLock<T>,
}

impl<T> HandleLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            inner: RwLock::new(value),
        }
    }

    /// Lock identity, unique within the process
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Acquire a shared lock
    ///
    /// Re-entrant for readers on the same thread. Panics if this thread
    /// already holds the exclusive lock.
    pub fn read(&self) -> HandleReadGuard<'_, T> {
        assert!(
            !holds(&HELD_WRITE, self.id),
            "handle lock {}: read requested while holding the write lock",
            self.id
        );
        let guard = self.inner.read_recursive();
        push(&HELD_READ, self.id);
        HandleReadGuard {
            guard,
            id: self.id,
        }
    }

    /// Acquire the exclusive lock
    ///
    /// Panics if this thread holds the lock in either mode.
    pub fn write(&self) -> HandleWriteGuard<'_, T> {
        assert!(
            !holds(&HELD_READ, self.id),
            "handle lock {}: read lock cannot be upgraded to a write lock",
            self.id
        );
        assert!(
            !holds(&HELD_WRITE, self.id),
            "handle lock {}: write lock is not re-entrant",
            self.id
        );
        let guard = self.inner.write();
        push(&HELD_WRITE, self.id);
        HandleWriteGuard {
            guard,
            id: self.id,
        }
    }
}

/// Shared guard returned by [`HandleLock::read`]
pub struct HandleReadGuard<'a, T> {
    guard: RwLockReadGuard<'a, T>,
    id: u64,
}

impl<T> Deref for HandleReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Drop for HandleReadGuard<'_, T> {
    fn drop(&mut self) {
        pop(&HELD_READ, self.id);
    }
}

/// Exclusive guard returned by [`HandleLock::write`]
pub struct HandleWriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    id: u64,
}

impl<T> Deref for HandleWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for HandleWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for HandleWriteGuard<'_, T> {
    fn drop(&mut self) {
        pop(&HELD_WRITE, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_read_then_write_after_release() {
        let lock = HandleLock::new(5u32);
        {
            let r = lock.read();
            assert_eq!(*r, 5);
        }
        *lock.write() = 7;
        assert_eq!(*lock.read(), 7);
    }

    #[test]
    fn test_nested_reads_allowed() {
        let lock = HandleLock::new(1u32);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a + *b, 2);
    }

    #[test]
    #[should_panic(expected = "cannot be upgraded")]
    fn test_upgrade_fails_fast() {
        let lock = HandleLock::new(0u32);
        let _r = lock.read();
        let _w = lock.write();
    }

    #[test]
    #[should_panic(expected = "not re-entrant")]
    fn test_reentrant_write_fails_fast() {
        let lock = HandleLock::new(0u32);
        let _w1 = lock.write();
        let _w2 = lock.write();
    }

    #[test]
    fn test_other_lock_unaffected() {
        let a = HandleLock::new(0u32);
        let b = HandleLock::new(0u32);
        let _r = a.read();
        *b.write() = 3;
        assert_eq!(*b.read(), 3);
    }

    #[test]
    fn test_readers_on_other_threads_do_not_count() {
        let lock = Arc::new(HandleLock::new(0u32));
        let reader = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || *lock.read())
        };
        assert_eq!(reader.join().unwrap(), 0);
        *lock.write() = 1;
        assert_eq!(*lock.read(), 1);
    }
}
