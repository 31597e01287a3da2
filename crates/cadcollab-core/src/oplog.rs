//! Bounded, append-only operation log.
//!
//! The log is not the source of truth for document state. It is the trailing
//! window conflict detection reads from and the recent history a joining
//! client receives.

use crate::model::{EntityKey, EntityType, UserId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Create an entity
    Create,
    /// Replace entity fields
    Update,
    /// Delete an entity
    Delete,
    /// Change placement
    Move,
    /// Change extents
    Resize,
    /// Change a single property
    PropertyChange,
    /// Edit text content
    TextChange,
    /// Change visual style
    StyleChange,
}

/// A mutation as submitted by a client, before it is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Kind of mutation
    pub op_type: OperationType,
    /// Target entity
    pub target: EntityKey,
    /// Mutation payload, opaque to the engine
    pub payload: serde_json::Value,
    /// Entity version the client based the edit on
    #[serde(default)]
    pub base_version: Option<u64>,
}

/// An accepted mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation identifier
    pub id: Uuid,
    /// Session the operation was accepted in
    pub session_id: Uuid,
    /// Submitting user
    pub user_id: UserId,
    /// Acceptance time
    pub timestamp_ms: u64,
    /// Kind of mutation
    pub op_type: OperationType,
    /// Target entity
    pub target: EntityKey,
    /// Mutation payload
    pub payload: serde_json::Value,
    /// Entity version the client based the edit on
    #[serde(default)]
    pub base_version: Option<u64>,
    /// Whether the document store acknowledged it
    pub applied: bool,
    /// Whether it was implicated in a conflict when accepted
    pub conflicted: bool,
    /// Position in the local log, assigned on append
    #[serde(default)]
    pub sequence: u64,
}

impl Operation {
    /// Accept a request on behalf of `user_id`.
    #[must_use]
    pub fn accept(request: OperationRequest, session_id: Uuid, user_id: &str, now_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            user_id: user_id.to_string(),
            timestamp_ms: now_ms,
            op_type: request.op_type,
            target: request.target,
            payload: request.payload,
            base_version: request.base_version,
            applied: false,
            conflicted: false,
            sequence: 0,
        }
    }

    /// Whether this operation belongs on the drawing channel.
    #[must_use]
    pub fn is_drawing(&self) -> bool {
        self.target.entity_type == EntityType::Drawing
    }
}

/// FIFO ring of accepted operations.
#[derive(Debug)]
pub struct OperationLog {
    entries: VecDeque<Operation>,
    capacity: usize,
    last_sequence: u64,
    flushed_sequence: u64,
}

impl OperationLog {
    /// Create a log holding at most `capacity` operations.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            last_sequence: 0,
            flushed_sequence: 0,
        }
    }

    /// Append an operation, evicting the oldest entry once at capacity.
    ///
    /// Returns the assigned sequence number and the evicted entry, if any.
    pub fn append(&mut self, mut operation: Operation) -> (u64, Option<Operation>) {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };

        self.last_sequence += 1;
        operation.sequence = self.last_sequence;
        self.entries.push_back(operation);

        (self.last_sequence, evicted)
    }

    /// Operations on `target` no older than `window_ms`, ordered by timestamp.
    #[must_use]
    pub fn recent_for(&self, target: &EntityKey, window_ms: u64, now_ms: u64) -> Vec<&Operation> {
        let since = now_ms.saturating_sub(window_ms);
        let mut recent: Vec<&Operation> = self
            .entries
            .iter()
            .filter(|op| &op.target == target && op.timestamp_ms >= since)
            .collect();
        recent.sort_by_key(|op| op.timestamp_ms);
        recent
    }

    /// The last `n` entries, oldest first.
    #[must_use]
    pub fn last(&self, n: usize) -> Vec<Operation> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Look up an entry by id.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<&Operation> {
        self.entries.iter().find(|op| op.id == id)
    }

    /// Record the document store acknowledgement for an entry.
    ///
    /// This is the only field that changes after append.
    pub fn mark_applied(&mut self, id: Uuid) -> bool {
        match self.entries.iter_mut().rev().find(|op| op.id == id) {
            Some(op) => {
                op.applied = true;
                true
            }
            None => false,
        }
    }

    /// Sequence number of the newest entry ever appended.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Whether entries were appended since the last [`mark_flushed`](Self::mark_flushed).
    #[must_use]
    pub fn has_unflushed(&self) -> bool {
        self.last_sequence > self.flushed_sequence
    }

    /// Record that everything up to `sequence` was persisted.
    pub fn mark_flushed(&mut self, sequence: u64) {
        self.flushed_sequence = self.flushed_sequence.max(sequence);
    }

    /// Iterate oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.entries.iter()
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(user: &str, target: EntityKey, at: u64) -> Operation {
        Operation::accept(
            OperationRequest {
                op_type: OperationType::Update,
                target,
                payload: serde_json::json!({ "by": user }),
                base_version: None,
            },
            Uuid::nil(),
            user,
            at,
        )
    }

    #[test]
    fn preserves_submission_order() {
        let mut log = OperationLog::new(10);
        let ids: Vec<Uuid> = (0..5)
            .map(|i| {
                let operation = op("alice", EntityKey::component(format!("C{i}")), 100);
                let id = operation.id;
                log.append(operation);
                id
            })
            .collect();

        let stored: Vec<Uuid> = log.iter().map(|o| o.id).collect();
        assert_eq!(stored, ids);
        assert_eq!(log.last_sequence(), 5);
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let mut log = OperationLog::new(3);
        let first = op("alice", EntityKey::component("C1"), 1);
        let first_id = first.id;
        log.append(first);
        log.append(op("alice", EntityKey::component("C2"), 2));
        log.append(op("alice", EntityKey::component("C3"), 3));

        let (sequence, evicted) = log.append(op("alice", EntityKey::component("C4"), 4));
        assert_eq!(sequence, 4);
        assert_eq!(evicted.unwrap().id, first_id);
        assert_eq!(log.len(), 3);
        assert!(log.get(first_id).is_none());
    }

    #[test]
    fn recent_for_filters_entity_and_window() {
        let mut log = OperationLog::new(10);
        let c2 = EntityKey::component("C2");
        log.append(op("alice", c2.clone(), 1_000));
        log.append(op("bob", EntityKey::component("C3"), 5_500));
        log.append(op("bob", c2.clone(), 5_900));
        log.append(op("carol", c2.clone(), 5_800));

        let recent = log.recent_for(&c2, 5_000, 6_000);
        let users: Vec<&str> = recent.iter().map(|o| o.user_id.as_str()).collect();
        assert_eq!(users, vec!["alice", "carol", "bob"]);

        let recent = log.recent_for(&c2, 1_000, 6_000);
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn last_returns_tail_oldest_first() {
        let mut log = OperationLog::new(10);
        for i in 0..6 {
            log.append(op("alice", EntityKey::component("C1"), i));
        }
        let tail = log.last(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].timestamp_ms, 4);
        assert_eq!(tail[1].timestamp_ms, 5);
        assert_eq!(log.last(50).len(), 6);
    }

    #[test]
    fn flush_tracking() {
        let mut log = OperationLog::new(10);
        assert!(!log.has_unflushed());
        let (seq, _) = log.append(op("alice", EntityKey::component("C1"), 0));
        assert!(log.has_unflushed());
        log.mark_flushed(seq);
        assert!(!log.has_unflushed());
    }
}
