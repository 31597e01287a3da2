//! Single delay queue for every deadline a session owns.
//!
//! Timers are never cancelled in place. Each one carries the resource id and
//! the generation it was armed for; the owner compares both against its live
//! state when the timer fires and drops the timer if either moved on.

use crate::model::EntityKey;
use std::collections::BTreeMap;
use uuid::Uuid;

/// What a timer is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerTarget {
    /// Expiry of a lock on the given entity
    LockExpiry(EntityKey),
    /// Automatic resolution of an open conflict
    ConflictDeadline,
}

/// An armed timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timer {
    /// What to do when it fires
    pub target: TimerTarget,
    /// Lock id or conflict id
    pub resource: Uuid,
    /// Generation of the resource when armed
    pub generation: u64,
    /// Absolute deadline in milliseconds
    pub deadline_ms: u64,
}

/// Deadline-ordered queue of timers.
#[derive(Debug, Default)]
pub struct TimerWheel {
    queue: BTreeMap<(u64, u64), Timer>,
    seq: u64,
}

impl TimerWheel {
    /// Create an empty wheel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer.
    pub fn schedule(&mut self, target: TimerTarget, resource: Uuid, generation: u64, deadline_ms: u64) {
        self.seq += 1;
        self.queue.insert(
            (deadline_ms, self.seq),
            Timer {
                target,
                resource,
                generation,
                deadline_ms,
            },
        );
    }

    /// Earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every timer due at `now_ms`, earliest first.
    pub fn pop_due(&mut self, now_ms: u64) -> Vec<Timer> {
        let pending = self.queue.split_off(&(now_ms.saturating_add(1), 0));
        let due = std::mem::replace(&mut self.queue, pending);
        due.into_values().collect()
    }

    /// Number of armed timers, stale ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check whether nothing is armed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
