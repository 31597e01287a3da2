//! Conflict detection and resolution.
//!
//! # Detection
//!
//! A mutation is checked against the operation log before it is accepted.
//! Operations on the same entity within the trailing window from a different
//! user raise `concurrent_edit`. Entries older than the submitter's own lock
//! grant, or than the last resolution on the entity, are not considered.
//!
//! # Resolution
//!
//! | Kind | Outcome |
//! |------|---------|
//! | `accept_mine` | the resolver's latest implicated operation wins |
//! | `accept_theirs` | the latest implicated operation of anyone else wins |
//! | `merge` | the document store merges the implicated payloads |
//! | `custom` | a supplied final state is applied verbatim |
//!
//! Unattended conflicts resolve at their deadline using
//! [`ConflictKind::default_resolution`] on behalf of the initiator.

use crate::error::CollabError;
use crate::model::{EntityKey, UserId};
use crate::oplog::{Operation, OperationLog, OperationType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use uuid::Uuid;

/// Resolver name recorded for automatic resolutions.
pub const SYSTEM_RESOLVER: &str = "system";

/// Kind of contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Different users mutated the same entity within the window
    ConcurrentEdit,
    /// A write hit a lock held by another user
    LockViolation,
    /// The client edited a stale version
    VersionMismatch,
    /// The role lacked a capability
    PermissionDenied,
}

impl ConflictKind {
    /// Resolution applied when the deadline passes without a decision.
    #[must_use]
    pub fn default_resolution(self) -> ResolutionKind {
        match self {
            ConflictKind::ConcurrentEdit => ResolutionKind::Merge,
            ConflictKind::LockViolation => ResolutionKind::AcceptTheirs,
            ConflictKind::VersionMismatch | ConflictKind::PermissionDenied => {
                ResolutionKind::AcceptMine
            }
        }
    }
}

/// How urgently a conflict needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational
    Low,
    /// Needs a decision
    Medium,
    /// Data may be lost
    High,
    /// Data was lost
    Critical,
}

impl Severity {
    /// Severity for a conflict of `kind` over `operations`.
    #[must_use]
    pub fn assess(kind: ConflictKind, operations: &[Operation]) -> Self {
        match kind {
            ConflictKind::ConcurrentEdit
                if operations
                    .iter()
                    .any(|op| op.op_type == OperationType::Delete) =>
            {
                Severity::High
            }
            ConflictKind::ConcurrentEdit | ConflictKind::VersionMismatch => Severity::Medium,
            ConflictKind::LockViolation => Severity::High,
            ConflictKind::PermissionDenied => Severity::Low,
        }
    }
}

/// Resolution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    /// The resolver's version wins
    AcceptMine,
    /// The counterpart's version wins
    AcceptTheirs,
    /// Field-level union via the document store
    Merge,
    /// Explicit final state
    Custom,
}

/// Record of how a conflict was settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Policy that took effect
    pub kind: ResolutionKind,
    /// Resolving user, or `system`
    pub resolved_by: String,
    /// Resolution time
    pub resolved_at_ms: u64,
    /// State applied to the entity, if any
    pub final_state: Option<serde_json::Value>,
    /// Whether the deadline triggered it
    pub automatic: bool,
    /// Operations whose versions lost
    pub discarded: Vec<Uuid>,
}

/// Detected contention on one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Conflict identifier
    pub id: Uuid,
    /// Kind of contention
    pub kind: ConflictKind,
    /// Contended entity
    pub entity: EntityKey,
    /// Users involved
    pub users: BTreeSet<UserId>,
    /// Operations implicated, in timestamp order
    pub operations: Vec<Operation>,
    /// User whose operation raised the conflict
    pub initiator: UserId,
    /// Urgency
    pub severity: Severity,
    /// Detection time
    pub detected_at_ms: u64,
    /// Automatic resolution deadline
    pub deadline_ms: u64,
    /// Settlement, once resolved
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

impl Conflict {
    /// Latest implicated operation by `user`.
    #[must_use]
    pub fn mine(&self, user: &str) -> Option<&Operation> {
        self.operations.iter().rev().find(|op| op.user_id == user)
    }

    /// Latest implicated operation by anyone but `user`.
    #[must_use]
    pub fn theirs(&self, user: &str) -> Option<&Operation> {
        self.operations.iter().rev().find(|op| op.user_id != user)
    }

    /// Work out what a resolution would do, without changing anything.
    ///
    /// `on_behalf_of` decides which side is "mine"; for user decisions it is
    /// the resolver, for automatic ones the initiator.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::InvalidRequest`] for a custom resolution
    /// without a final state, or when a user accepts "mine" without having
    /// an operation in the conflict.
    pub fn plan(
        &self,
        kind: ResolutionKind,
        resolver: &str,
        on_behalf_of: &str,
        custom_state: Option<serde_json::Value>,
    ) -> Result<ResolutionPlan, CollabError> {
        let winner = match kind {
            ResolutionKind::AcceptMine => self.mine(on_behalf_of),
            ResolutionKind::AcceptTheirs => self.theirs(on_behalf_of),
            ResolutionKind::Merge | ResolutionKind::Custom => None,
        };
        if kind == ResolutionKind::AcceptMine && winner.is_none() && resolver != SYSTEM_RESOLVER
        {
            return Err(CollabError::InvalidRequest(format!(
                "{on_behalf_of} has no operation in conflict {}",
                self.id
            )));
        }

        let final_state = match kind {
            ResolutionKind::Custom => Some(custom_state.ok_or_else(|| {
                CollabError::InvalidRequest("custom resolution requires a final state".to_string())
            })?),
            _ => winner.map(|op| op.payload.clone()),
        };

        let discarded = match (kind, winner) {
            (ResolutionKind::Merge, _) => Vec::new(),
            (_, Some(winner)) => self
                .operations
                .iter()
                .filter(|op| op.id != winner.id)
                .map(|op| op.id)
                .collect(),
            (_, None) => self.operations.iter().map(|op| op.id).collect(),
        };

        Ok(ResolutionPlan {
            conflict_id: self.id,
            entity: self.entity.clone(),
            kind,
            resolver: resolver.to_string(),
            on_behalf_of: on_behalf_of.to_string(),
            final_state,
            discarded,
            automatic: resolver == SYSTEM_RESOLVER,
        })
    }
}

/// A resolution decided but not yet applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionPlan {
    /// Conflict being resolved
    pub conflict_id: Uuid,
    /// Contended entity
    pub entity: EntityKey,
    /// Policy
    pub kind: ResolutionKind,
    /// Resolving user, or `system`
    pub resolver: String,
    /// Side considered "mine"
    pub on_behalf_of: UserId,
    /// State to apply; `None` leaves the store as it is. For `merge` this is
    /// filled in once the document store answers.
    pub final_state: Option<serde_json::Value>,
    /// Losing operations
    pub discarded: Vec<Uuid>,
    /// Whether the deadline triggered it
    pub automatic: bool,
}

impl ResolutionPlan {
    /// Whether the document store must be asked to merge.
    #[must_use]
    pub fn needs_merge(&self) -> bool {
        self.kind == ResolutionKind::Merge && self.final_state.is_none()
    }

    /// Settle into a resolution record.
    #[must_use]
    pub fn into_resolution(self, now_ms: u64) -> Resolution {
        Resolution {
            kind: self.kind,
            resolved_by: self.resolver,
            resolved_at_ms: now_ms,
            final_state: self.final_state,
            automatic: self.automatic,
            discarded: self.discarded,
        }
    }
}

/// Field-level union of JSON object payloads.
///
/// Returns `None` when a payload is not an object or two operations set the
/// same field to different values.
#[must_use]
pub fn merge_payloads(operations: &[Operation]) -> Option<serde_json::Value> {
    if operations.is_empty() {
        return None;
    }

    let mut ordered: Vec<&Operation> = operations.iter().collect();
    ordered.sort_by_key(|op| (op.timestamp_ms, op.sequence));

    let mut merged = serde_json::Map::new();
    for op in ordered {
        let fields = op.payload.as_object()?;
        for (field, value) in fields {
            match merged.get(field) {
                Some(existing) if existing != value => return None,
                Some(_) => {}
                None => {
                    merged.insert(field.clone(), value.clone());
                }
            }
        }
    }

    Some(serde_json::Value::Object(merged))
}

/// Trailing-window detector.
#[derive(Debug, Clone, Copy)]
pub struct ConflictDetector {
    window_ms: u64,
}

impl ConflictDetector {
    /// Create a detector with the given trailing window.
    #[must_use]
    pub fn new(window_ms: u64) -> Self {
        Self { window_ms }
    }

    /// Trailing window in milliseconds.
    #[must_use]
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Check `candidate` against the log.
    ///
    /// Only entries with a sequence above `after_sequence` count. Returns the
    /// implicated operations, `candidate` last, when another user touched the
    /// same entity within the window.
    #[must_use]
    pub fn detect(
        &self,
        log: &OperationLog,
        candidate: &Operation,
        after_sequence: u64,
        now_ms: u64,
    ) -> Option<Vec<Operation>> {
        let prior: Vec<&Operation> = log
            .recent_for(&candidate.target, self.window_ms, now_ms)
            .into_iter()
            .filter(|op| op.sequence > after_sequence)
            .collect();

        if !prior.iter().any(|op| op.user_id != candidate.user_id) {
            return None;
        }

        let mut implicated: Vec<Operation> = prior.into_iter().cloned().collect();
        implicated.push(candidate.clone());
        Some(implicated)
    }
}

/// Closed conflicts remembered so late resolutions can be told apart from
/// unknown ids.
const CLOSED_MEMORY: usize = 256;

/// Open conflicts of one session.
#[derive(Debug)]
pub struct ConflictRegistry {
    conflicts: HashMap<Uuid, Conflict>,
    closed: VecDeque<(Uuid, EntityKey)>,
    settled: HashMap<EntityKey, u64>,
    resolution_timeout_ms: u64,
}

impl ConflictRegistry {
    /// Create a registry whose conflicts auto-resolve after `resolution_timeout_ms`.
    #[must_use]
    pub fn new(resolution_timeout_ms: u64) -> Self {
        Self {
            conflicts: HashMap::new(),
            closed: VecDeque::new(),
            settled: HashMap::new(),
            resolution_timeout_ms,
        }
    }

    /// Raise a conflict.
    pub fn raise(
        &mut self,
        kind: ConflictKind,
        entity: EntityKey,
        operations: Vec<Operation>,
        users: BTreeSet<UserId>,
        initiator: &str,
        now_ms: u64,
    ) -> Conflict {
        let conflict = Conflict {
            id: Uuid::new_v4(),
            kind,
            severity: Severity::assess(kind, &operations),
            entity,
            users,
            operations,
            initiator: initiator.to_string(),
            detected_at_ms: now_ms,
            deadline_ms: now_ms.saturating_add(self.resolution_timeout_ms),
            resolution: None,
        };

        tracing::info!(
            conflict_id = %conflict.id,
            kind = ?conflict.kind,
            entity = %conflict.entity,
            users = ?conflict.users,
            "Conflict raised"
        );

        self.conflicts.insert(conflict.id, conflict.clone());
        conflict
    }

    /// Raise `concurrent_edit`, or extend the one already open on the entity.
    ///
    /// Returns the conflict and whether it is new.
    pub fn raise_concurrent_edit(
        &mut self,
        entity: &EntityKey,
        implicated: Vec<Operation>,
        initiator: &str,
        now_ms: u64,
    ) -> (Conflict, bool) {
        if let Some(open) = self
            .conflicts
            .values_mut()
            .find(|c| c.kind == ConflictKind::ConcurrentEdit && &c.entity == entity)
        {
            for op in implicated {
                if !open.operations.iter().any(|known| known.id == op.id) {
                    open.users.insert(op.user_id.clone());
                    open.operations.push(op);
                }
            }
            open.operations.sort_by_key(|op| (op.timestamp_ms, op.sequence));
            open.severity = Severity::assess(open.kind, &open.operations);
            tracing::debug!(conflict_id = %open.id, entity = %entity, "Conflict extended");
            return (open.clone(), false);
        }

        let users = implicated.iter().map(|op| op.user_id.clone()).collect();
        let conflict = self.raise(
            ConflictKind::ConcurrentEdit,
            entity.clone(),
            implicated,
            users,
            initiator,
            now_ms,
        );
        (conflict, true)
    }

    /// Plan a resolution for an open conflict.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::Conflict`] if the conflict was already resolved,
    /// [`CollabError::InvalidRequest`] for unknown conflicts or a custom
    /// resolution without a final state.
    pub fn plan(
        &self,
        conflict_id: Uuid,
        kind: ResolutionKind,
        resolver: &str,
        custom_state: Option<serde_json::Value>,
    ) -> Result<ResolutionPlan, CollabError> {
        let Some(conflict) = self.conflicts.get(&conflict_id) else {
            return Err(match self.closed.iter().find(|(id, _)| *id == conflict_id) {
                Some((_, entity)) => CollabError::Conflict {
                    conflict_id,
                    entity: entity.clone(),
                },
                None => CollabError::InvalidRequest(format!("unknown conflict {conflict_id}")),
            });
        };
        conflict.plan(kind, resolver, resolver, custom_state)
    }

    /// Plan the default resolution for an open conflict whose deadline passed.
    #[must_use]
    pub fn plan_automatic(&self, conflict_id: Uuid) -> Option<ResolutionPlan> {
        let conflict = self.conflicts.get(&conflict_id)?;
        conflict
            .plan(
                conflict.kind.default_resolution(),
                SYSTEM_RESOLVER,
                &conflict.initiator,
                None,
            )
            .ok()
    }

    /// Close a conflict with the given resolution.
    ///
    /// `settle_mark` is the log sequence up to which operations on the entity
    /// no longer count for detection.
    pub fn complete(
        &mut self,
        conflict_id: Uuid,
        resolution: Resolution,
        settle_mark: u64,
    ) -> Option<Conflict> {
        let mut conflict = self.conflicts.remove(&conflict_id)?;
        self.settle(&conflict.entity, settle_mark);
        self.remember_closed(&conflict);
        tracing::info!(
            conflict_id = %conflict.id,
            entity = %conflict.entity,
            kind = ?resolution.kind,
            resolved_by = %resolution.resolved_by,
            "Conflict resolved"
        );
        conflict.resolution = Some(resolution);
        Some(conflict)
    }

    /// Sequence up to which `entity` is settled.
    #[must_use]
    pub fn settled_mark(&self, entity: &EntityKey) -> u64 {
        self.settled.get(entity).copied().unwrap_or(0)
    }

    /// Look up an open conflict.
    #[must_use]
    pub fn get(&self, conflict_id: Uuid) -> Option<&Conflict> {
        self.conflicts.get(&conflict_id)
    }

    /// Mirror a conflict raised by another server process.
    pub fn insert_replica(&mut self, conflict: Conflict) {
        self.conflicts.insert(conflict.id, conflict);
    }

    /// Drop a mirrored conflict resolved elsewhere.
    pub fn remove_replica(&mut self, conflict_id: Uuid, settle_mark: u64) -> Option<Conflict> {
        let conflict = self.conflicts.remove(&conflict_id)?;
        self.settle(&conflict.entity, settle_mark);
        self.remember_closed(&conflict);
        Some(conflict)
    }

    /// Open conflicts, oldest first.
    #[must_use]
    pub fn open(&self) -> Vec<&Conflict> {
        let mut open: Vec<&Conflict> = self.conflicts.values().collect();
        open.sort_by_key(|c| c.detected_at_ms);
        open
    }

    /// Number of open conflicts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    /// Check whether no conflicts are open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    fn remember_closed(&mut self, conflict: &Conflict) {
        if self.closed.len() == CLOSED_MEMORY {
            self.closed.pop_front();
        }
        self.closed.push_back((conflict.id, conflict.entity.clone()));
    }

    fn settle(&mut self, entity: &EntityKey, mark: u64) {
        let settled = self.settled.entry(entity.clone()).or_default();
        *settled = (*settled).max(mark);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::OperationRequest;
    use serde_json::json;

    fn op(user: &str, entity: &EntityKey, payload: serde_json::Value, at: u64) -> Operation {
        Operation::accept(
            OperationRequest {
                op_type: OperationType::Update,
                target: entity.clone(),
                payload,
                base_version: None,
            },
            Uuid::nil(),
            user,
            at,
        )
    }

    #[test]
    fn different_users_within_window_conflict() {
        let detector = ConflictDetector::new(5_000);
        let mut log = OperationLog::new(100);
        let c2 = EntityKey::component("C2");

        let first = op("alice", &c2, json!({ "w": 1 }), 1_000);
        let first_id = first.id;
        log.append(first);

        let second = op("bob", &c2, json!({ "w": 2 }), 2_000);
        let implicated = detector.detect(&log, &second, 0, 2_000).unwrap();

        assert_eq!(implicated.len(), 2);
        assert_eq!(implicated[0].id, first_id);
        assert_eq!(implicated[1].id, second.id);
    }

    #[test]
    fn same_user_never_conflicts() {
        let detector = ConflictDetector::new(5_000);
        let mut log = OperationLog::new(100);
        let c2 = EntityKey::component("C2");

        for at in 0..5 {
            let next = op("alice", &c2, json!({ "step": at }), at * 10);
            assert!(detector.detect(&log, &next, 0, at * 10).is_none());
            log.append(next);
        }
    }

    #[test]
    fn outside_window_or_before_mark_is_ignored() {
        let detector = ConflictDetector::new(5_000);
        let mut log = OperationLog::new(100);
        let c2 = EntityKey::component("C2");

        let (mark, _) = log.append(op("alice", &c2, json!({}), 1_000));

        let late = op("bob", &c2, json!({}), 7_000);
        assert!(detector.detect(&log, &late, 0, 7_000).is_none());

        let soon = op("bob", &c2, json!({}), 2_000);
        assert!(detector.detect(&log, &soon, mark, 2_000).is_none());
    }

    #[test]
    fn open_concurrent_edit_is_extended_not_duplicated() {
        let mut registry = ConflictRegistry::new(30_000);
        let c2 = EntityKey::component("C2");
        let a = op("alice", &c2, json!({}), 0);
        let b = op("bob", &c2, json!({}), 1);
        let c = op("carol", &c2, json!({}), 2);

        let (first, created) =
            registry.raise_concurrent_edit(&c2, vec![a.clone(), b.clone()], "bob", 1);
        assert!(created);
        assert_eq!(first.deadline_ms, 30_001);

        let (second, created) = registry.raise_concurrent_edit(&c2, vec![a, b, c], "carol", 2);
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.operations.len(), 3);
        assert_eq!(second.users.len(), 3);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn default_resolutions() {
        assert_eq!(
            ConflictKind::ConcurrentEdit.default_resolution(),
            ResolutionKind::Merge
        );
        assert_eq!(
            ConflictKind::LockViolation.default_resolution(),
            ResolutionKind::AcceptTheirs
        );
        assert_eq!(
            ConflictKind::VersionMismatch.default_resolution(),
            ResolutionKind::AcceptMine
        );
        assert_eq!(
            ConflictKind::PermissionDenied.default_resolution(),
            ResolutionKind::AcceptMine
        );
    }

    #[test]
    fn accept_mine_and_theirs_pick_sides() {
        let mut registry = ConflictRegistry::new(30_000);
        let c2 = EntityKey::component("C2");
        let a = op("alice", &c2, json!({ "w": 1 }), 0);
        let b = op("bob", &c2, json!({ "w": 2 }), 1);
        let (conflict, _) =
            registry.raise_concurrent_edit(&c2, vec![a.clone(), b.clone()], "bob", 1);

        let mine = registry
            .plan(conflict.id, ResolutionKind::AcceptMine, "alice", None)
            .unwrap();
        assert_eq!(mine.final_state, Some(json!({ "w": 1 })));
        assert_eq!(mine.discarded, vec![b.id]);

        let theirs = registry
            .plan(conflict.id, ResolutionKind::AcceptTheirs, "alice", None)
            .unwrap();
        assert_eq!(theirs.final_state, Some(json!({ "w": 2 })));
        assert_eq!(theirs.discarded, vec![a.id]);
    }

    #[test]
    fn accept_mine_needs_an_own_operation() {
        let mut registry = ConflictRegistry::new(30_000);
        let c2 = EntityKey::component("C2");
        let b = op("bob", &c2, json!({ "w": 2 }), 1);
        let (conflict, _) = registry.raise_concurrent_edit(
            &c2,
            vec![op("alice", &c2, json!({ "w": 1 }), 0), b.clone()],
            "bob",
            1,
        );

        let err = registry
            .plan(conflict.id, ResolutionKind::AcceptMine, "olga", None)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");

        let theirs = registry
            .plan(conflict.id, ResolutionKind::AcceptTheirs, "olga", None)
            .unwrap();
        assert_eq!(theirs.final_state, Some(json!({ "w": 2 })));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn custom_requires_state() {
        let mut registry = ConflictRegistry::new(30_000);
        let c2 = EntityKey::component("C2");
        let (conflict, _) = registry.raise_concurrent_edit(
            &c2,
            vec![op("alice", &c2, json!({}), 0), op("bob", &c2, json!({}), 1)],
            "bob",
            1,
        );

        let err = registry
            .plan(conflict.id, ResolutionKind::Custom, "alice", None)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");

        let plan = registry
            .plan(
                conflict.id,
                ResolutionKind::Custom,
                "alice",
                Some(json!({ "w": 9 })),
            )
            .unwrap();
        assert_eq!(plan.final_state, Some(json!({ "w": 9 })));
    }

    #[test]
    fn automatic_lock_violation_keeps_holder_state() {
        let mut registry = ConflictRegistry::new(30_000);
        let c1 = EntityKey::component("C1");
        let rejected = op("bob", &c1, json!({ "w": 5 }), 0);
        let users = ["alice".to_string(), "bob".to_string()].into_iter().collect();
        let conflict = registry.raise(
            ConflictKind::LockViolation,
            c1,
            vec![rejected.clone()],
            users,
            "bob",
            0,
        );

        let plan = registry.plan_automatic(conflict.id).unwrap();
        assert_eq!(plan.kind, ResolutionKind::AcceptTheirs);
        assert_eq!(plan.resolver, SYSTEM_RESOLVER);
        assert!(plan.automatic);
        assert!(plan.final_state.is_none());
        assert_eq!(plan.discarded, vec![rejected.id]);
    }

    #[test]
    fn complete_removes_and_settles() {
        let mut registry = ConflictRegistry::new(30_000);
        let c2 = EntityKey::component("C2");
        let (conflict, _) = registry.raise_concurrent_edit(
            &c2,
            vec![op("alice", &c2, json!({}), 0), op("bob", &c2, json!({}), 1)],
            "bob",
            1,
        );

        let plan = registry
            .plan(conflict.id, ResolutionKind::AcceptMine, "alice", None)
            .unwrap();
        let resolved = registry
            .complete(conflict.id, plan.into_resolution(5), 7)
            .unwrap();

        assert_eq!(resolved.resolution.unwrap().resolved_by, "alice");
        assert!(registry.is_empty());
        assert_eq!(registry.settled_mark(&c2), 7);

        let late = registry
            .plan(conflict.id, ResolutionKind::AcceptTheirs, "bob", None)
            .unwrap_err();
        assert_eq!(
            late,
            CollabError::Conflict {
                conflict_id: conflict.id,
                entity: c2,
            }
        );
        assert_eq!(late.code(), "conflict");

        let unknown = registry
            .plan(Uuid::new_v4(), ResolutionKind::AcceptTheirs, "bob", None)
            .unwrap_err();
        assert_eq!(unknown.code(), "invalid_request");
    }

    #[test]
    fn merge_unions_disjoint_fields() {
        let c2 = EntityKey::component("C2");
        let ops = vec![
            op("alice", &c2, json!({ "width": 10 }), 0),
            op("bob", &c2, json!({ "color": "red" }), 1),
        ];
        assert_eq!(
            merge_payloads(&ops),
            Some(json!({ "width": 10, "color": "red" }))
        );

        let overlapping = vec![
            op("alice", &c2, json!({ "width": 10 }), 0),
            op("bob", &c2, json!({ "width": 12 }), 1),
        ];
        assert!(merge_payloads(&overlapping).is_none());

        let scalar = vec![op("alice", &c2, json!(3), 0)];
        assert!(merge_payloads(&scalar).is_none());
    }

    #[test]
    fn delete_raises_severity() {
        let c2 = EntityKey::component("C2");
        let mut delete = op("alice", &c2, json!({}), 0);
        delete.op_type = OperationType::Delete;
        assert_eq!(
            Severity::assess(ConflictKind::ConcurrentEdit, &[delete]),
            Severity::High
        );
        assert_eq!(
            Severity::assess(ConflictKind::ConcurrentEdit, &[op("a", &c2, json!({}), 0)]),
            Severity::Medium
        );
    }
}
