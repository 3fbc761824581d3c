//! Exclusive access to the adapter.
//!
//! A device transaction is usually several primitives (reset, select,
//! command, read) that must not be interleaved with another thread's
//! traffic. The lock is re-entrant so an operation that is itself part of a
//! caller-held critical section only bumps a counter.

use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
struct Owner {
    thread: Option<ThreadId>,
    count: usize,
}

/// Re-entrant critical-section lock. Acquisition blocks without bound; the
/// lock guards a single terminal resource, so there is no ordering to
/// deadlock on.
#[derive(Debug, Default)]
pub struct ExclusiveLock {
    owner: Mutex<Owner>,
    released: Condvar,
}

impl ExclusiveLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the lock for the calling thread, blocking while another thread
    /// holds it. Re-entry by the owning thread just increments the count.
    pub fn enter(&self) {
        let me = thread::current().id();
        let mut owner = self.owner.lock().expect("exclusive lock poisoned");
        while owner.thread.is_some() && owner.thread != Some(me) {
            owner = self.released.wait(owner).expect("exclusive lock poisoned");
        }
        owner.thread = Some(me);
        owner.count += 1;
    }

    /// Release one claim. The lock opens up once the owning thread has
    /// released as many times as it entered.
    ///
    /// # Panics
    /// Panics when called by a thread that does not hold the lock; that is
    /// an unbalanced `begin`/`end` pair in the caller.
    pub fn exit(&self) {
        let me = thread::current().id();
        let mut owner = self.owner.lock().expect("exclusive lock poisoned");
        assert_eq!(owner.thread, Some(me), "exclusive lock released by non-owner");
        owner.count -= 1;
        if owner.count == 0 {
            owner.thread = None;
            drop(owner);
            self.released.notify_one();
        }
    }

    /// Scoped claim, released on drop.
    pub fn guard(&self) -> ExclusiveGuard<'_> {
        self.enter();
        ExclusiveGuard { lock: self }
    }
}

/// RAII claim on an [`ExclusiveLock`].
#[derive(Debug)]
pub struct ExclusiveGuard<'a> {
    lock: &'a ExclusiveLock,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.exit();
    }
}
