//! Revision high-water mark with waiters.
//!
//! ```text
//!   flush() ──► await_revision(7) ──► heap: [3, 5, 7]
//!                                        │
//!   event loop ──► finished_revision(5) ─┘ releases 3 and 5
//! ```

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::DriverError;

struct Waiter {
    revision: u64,
    seq: u64,
    wake: oneshot::Sender<()>,
}

// Reversed so `BinaryHeap` pops the lowest revision first
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.revision, other.seq).cmp(&(self.revision, self.seq))
    }
}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.revision == other.revision && self.seq == other.seq
    }
}

impl Eq for Waiter {}

#[derive(Default)]
struct LockState {
    applied: u64,
    next_seq: u64,
    waiters: BinaryHeap<Waiter>,
}

/// Lets callers wait until a store revision has been applied locally.
pub struct RevisionFlushLock {
    name: String,
    state: Mutex<LockState>,
}

impl RevisionFlushLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(LockState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Highest revision known to be applied.
    pub fn applied_revision(&self) -> u64 {
        self.lock().applied
    }

    /// Number of callers still waiting. Waiters dropped before their
    /// revision arrived are counted until the next timeout prunes them.
    pub fn pending_waiters(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Wait until `revision` has been applied, or fail after `timeout`.
    pub async fn await_revision(&self, revision: u64, timeout: Duration) -> Result<(), DriverError> {
        let released = {
            let mut state = self.lock();
            if revision <= state.applied {
                return Ok(());
            }
            let (wake, released) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiters.push(Waiter { revision, seq, wake });
            released
        };
        log::trace!("[{}] waiting for revision {revision}", self.name);
        match tokio::time::timeout(timeout, released).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DriverError::Closed),
            Err(_) => {
                // Our receiver is gone by now; drop it and any other abandoned ones
                self.lock().waiters.retain(|w| !w.wake.is_closed());
                log::warn!("[{}] flush timed out waiting for revision {revision}", self.name);
                Err(DriverError::FlushTimeout { revision, timeout })
            }
        }
    }

    /// Note that the effects of `revision` are being applied.
    pub fn started_revision(&self, revision: Option<u64>) {
        if let Some(revision) = revision {
            let applied = self.lock().applied;
            if revision <= applied {
                log::debug!("[{}] revision {revision} started after {applied} was already applied", self.name);
            } else {
                log::trace!("[{}] started revision {revision}", self.name);
            }
        }
    }

    /// Mark `revision` applied and release every waiter it satisfies.
    pub fn finished_revision(&self, revision: Option<u64>) {
        let Some(revision) = revision else {
            return;
        };
        let mut state = self.lock();
        state.applied = state.applied.max(revision);
        let applied = state.applied;
        while state.waiters.peek().is_some_and(|w| w.revision <= applied) {
            if let Some(waiter) = state.waiters.pop() {
                // Receiver gone means the caller already timed out
                let _ = waiter.wake.send(());
            }
        }
        log::trace!("[{}] finished revision {revision}, applied {applied}", self.name);
    }
}
