//! Per-project collaboration state.
//!
//! A [`Session`] owns presence, locks, the operation log, open conflicts and
//! the timer wheel of one project. It is mutated only from the coordinator's
//! serialized processing path, so nothing here is synchronized.
//!
//! Mutations pass through a fixed pipeline:
//!
//! 1. permission check
//! 2. lock check (a blocked write raises `lock_violation` and is rejected)
//! 3. conflict detection over the trailing window
//! 4. append to the operation log
//!
//! Applying to the document store happens afterwards, outside the session.

use crate::collaborators::ProjectSnapshot;
use crate::conflict::{
    Conflict, ConflictDetector, ConflictKind, ConflictRegistry, ResolutionKind, ResolutionPlan,
};
use crate::error::CollabError;
use crate::lock::{Lock, LockDecision, LockKind, LockManager};
use crate::model::{
    ConnectionId, CursorPosition, EntityKey, Permission, ProjectId, User, UserId, UserProfile,
};
use crate::oplog::{Operation, OperationLog, OperationRequest, OperationType};
use crate::presence::{Joined, PresenceStore};
use crate::timers::{TimerTarget, TimerWheel};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use uuid::Uuid;

/// Tunables for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Lock lifetime
    pub lock_timeout_ms: u64,
    /// Expected client heartbeat period; users are stale after twice this
    pub heartbeat_interval_ms: u64,
    /// Trailing window for conflict detection
    pub conflict_window_ms: u64,
    /// Delay before an unattended conflict resolves itself
    pub conflict_timeout_ms: u64,
    /// Operation log capacity
    pub log_capacity: usize,
    /// Log entries sent to a joining client
    pub history_on_join: usize,
    /// Bound of the coordinator command queue
    pub queue_capacity: usize,
    /// Auto-save period
    pub autosave_interval_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 300_000,
            heartbeat_interval_ms: 30_000,
            conflict_window_ms: 5_000,
            conflict_timeout_ms: 30_000,
            log_capacity: 200,
            history_on_join: 50,
            queue_capacity: 1024,
            autosave_interval_ms: 60_000,
        }
    }
}

impl SessionSettings {
    /// Silence after which a user is swept.
    #[must_use]
    pub fn stale_after_ms(&self) -> u64 {
        self.heartbeat_interval_ms.saturating_mul(2)
    }
}

/// Serializable snapshot of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Session identifier
    pub session_id: Uuid,
    /// Bound project
    pub project_id: ProjectId,
    /// Known users, online or not
    pub users: Vec<User>,
    /// Live locks
    pub locks: Vec<Lock>,
    /// Retained operation log, oldest first
    pub recent_operations: Vec<Operation>,
    /// Open conflicts
    pub conflicts: Vec<Conflict>,
    /// Store revision as last seen
    pub revision: u64,
    /// Creation time
    pub created_at_ms: u64,
    /// Last client activity
    pub last_activity_ms: u64,
}

/// A user who left the session, voluntarily or by sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    /// Departing user
    pub user_id: UserId,
    /// Connections that were closed
    pub connections: Vec<ConnectionId>,
    /// Whether the user has no local connection left
    pub went_offline: bool,
    /// Locks released as a consequence
    pub released: Vec<Lock>,
}

/// Outcome of [`Session::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// The operation was appended to the log and should be applied
    Accepted {
        /// The accepted operation with its log sequence
        operation: Operation,
        /// Conflicts raised or extended, with `true` for new ones
        conflicts: Vec<(Conflict, bool)>,
    },
    /// Another user's lock blocks the write
    Blocked {
        /// Lock error for the submitter
        error: CollabError,
        /// The `lock_violation` conflict raised for it
        conflict: Conflict,
    },
}

/// A deadline that passed.
#[derive(Debug, Clone, PartialEq)]
pub enum Expiry {
    /// A lock timed out and was released
    Lock {
        /// The released lock
        lock: Lock,
        /// Whether it was mirrored from another process
        replica: bool,
    },
    /// A conflict reached its deadline and should resolve by default
    Conflict(ResolutionPlan),
}

/// Collaboration state of one project.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    project_id: ProjectId,
    settings: SessionSettings,
    presence: PresenceStore,
    locks: LockManager,
    replica_locks: HashSet<Uuid>,
    log: OperationLog,
    detector: ConflictDetector,
    conflicts: ConflictRegistry,
    timers: TimerWheel,
    entity_versions: BTreeMap<String, u64>,
    revision: u64,
    created_at_ms: u64,
    last_activity_ms: u64,
}

impl Session {
    /// Open a session for a loaded project.
    #[must_use]
    pub fn new(project: ProjectSnapshot, settings: SessionSettings, now_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            presence: PresenceStore::new(project.owner_id),
            locks: LockManager::new(settings.lock_timeout_ms),
            replica_locks: HashSet::new(),
            log: OperationLog::new(settings.log_capacity),
            detector: ConflictDetector::new(settings.conflict_window_ms),
            conflicts: ConflictRegistry::new(settings.conflict_timeout_ms),
            timers: TimerWheel::new(),
            entity_versions: project.entity_versions,
            revision: project.revision,
            project_id: project.project_id,
            settings,
            created_at_ms: now_ms,
            last_activity_ms: now_ms,
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Bound project.
    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Active settings.
    #[must_use]
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    // ---- membership -------------------------------------------------------

    /// Attach an authenticated connection.
    pub fn join(&mut self, connection: ConnectionId, profile: UserProfile, now_ms: u64) -> Joined {
        self.last_activity_ms = now_ms;
        let joined = self.presence.join(connection, profile, now_ms);
        tracing::info!(
            project = %self.project_id,
            user = %joined.user.id,
            connection = %connection,
            newly_online = joined.newly_online,
            "User joined"
        );
        joined
    }

    /// Detach a connection. Releases every lock of the user once they have
    /// no local connection left.
    pub fn leave(&mut self, connection: ConnectionId, now_ms: u64) -> Option<Departure> {
        self.last_activity_ms = now_ms;
        let left = self.presence.leave(connection)?;
        let released = if left.went_offline {
            self.release_held(&left.user_id)
        } else {
            Vec::new()
        };

        tracing::info!(
            project = %self.project_id,
            user = %left.user_id,
            went_offline = left.went_offline,
            released = released.len(),
            "User left"
        );

        Some(Departure {
            user_id: left.user_id,
            connections: vec![connection],
            went_offline: left.went_offline,
            released,
        })
    }

    /// Drop users whose heartbeat went stale and release their locks.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<Departure> {
        let stale_after = self.settings.stale_after_ms();
        self.presence
            .sweep(now_ms, stale_after)
            .into_iter()
            .map(|(user_id, connections)| {
                let released = self.release_held(&user_id);
                tracing::warn!(
                    project = %self.project_id,
                    user = %user_id,
                    released = released.len(),
                    "Heartbeat stale, user marked offline"
                );
                Departure {
                    user_id,
                    connections,
                    went_offline: true,
                    released,
                }
            })
            .collect()
    }

    /// Record a heartbeat.
    pub fn heartbeat(&mut self, user_id: &str, now_ms: u64) {
        self.presence.touch(user_id, now_ms);
    }

    /// Overwrite a user's cursor.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::Auth`] if the user has not joined.
    pub fn update_cursor(
        &mut self,
        user_id: &str,
        cursor: CursorPosition,
        now_ms: u64,
    ) -> Result<(), CollabError> {
        if self.presence.update_cursor(user_id, cursor, now_ms) {
            Ok(())
        } else {
            Err(not_joined(user_id))
        }
    }

    /// Overwrite a user's selection.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::Auth`] if the user has not joined.
    pub fn update_selection(
        &mut self,
        user_id: &str,
        selection: Vec<String>,
        now_ms: u64,
    ) -> Result<(), CollabError> {
        if self.presence.update_selection(user_id, selection, now_ms) {
            Ok(())
        } else {
            Err(not_joined(user_id))
        }
    }

    /// Check that a member holds a permission.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::Auth`] for non-members and
    /// [`CollabError::Permission`] when the role lacks the capability.
    pub fn authorize(&self, user_id: &str, permission: Permission) -> Result<&User, CollabError> {
        let user = self.presence.get(user_id).ok_or_else(|| not_joined(user_id))?;
        if user.can(permission) {
            Ok(user)
        } else {
            Err(CollabError::Permission(format!(
                "{user_id} ({:?}) lacks {}",
                user.role,
                permission.as_str()
            )))
        }
    }

    // ---- locks ------------------------------------------------------------

    /// Request a lock and arm its expiry timer when granted.
    ///
    /// # Errors
    ///
    /// Returns a permission error if the user may not lock.
    pub fn request_lock(
        &mut self,
        user_id: &str,
        entity: &EntityKey,
        kind: LockKind,
        now_ms: u64,
    ) -> Result<LockDecision, CollabError> {
        self.authorize(user_id, Permission::Lock)?;
        self.last_activity_ms = now_ms;
        self.presence.touch(user_id, now_ms);

        let decision = self
            .locks
            .request(entity, kind, user_id, now_ms, self.log.last_sequence());

        match &decision {
            LockDecision::Granted { lock, .. } => {
                self.timers.schedule(
                    TimerTarget::LockExpiry(lock.entity.clone()),
                    lock.id,
                    lock.generation,
                    lock.expires_at_ms,
                );
            }
            LockDecision::Denied(denial) => {
                tracing::info!(
                    entity = %entity,
                    requester = user_id,
                    holder = %denial.holder,
                    reason = %denial.reason,
                    "Lock denied"
                );
            }
        }

        Ok(decision)
    }

    /// Release the caller's lock. `None` unless the caller held one.
    pub fn release_lock(&mut self, user_id: &str, entity: &EntityKey, now_ms: u64) -> Option<Lock> {
        self.last_activity_ms = now_ms;
        self.presence.touch(user_id, now_ms);
        let lock = self.locks.release(entity, user_id)?;
        self.replica_locks.remove(&lock.id);
        tracing::debug!(entity = %entity, holder = user_id, "Lock released");
        Some(lock)
    }

    /// Release the locks `user_id` was granted on this process. Replicas stay
    /// until their origin releases them or they expire.
    fn release_held(&mut self, user_id: &str) -> Vec<Lock> {
        let replicas = &self.replica_locks;
        self.locks
            .release_all(user_id, |lock| replicas.contains(&lock.id))
    }

    // ---- operations -------------------------------------------------------

    /// Run a mutation through permission, lock and conflict checks and append
    /// it to the log.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::Auth`] for non-members and
    /// [`CollabError::Permission`] when the role may not perform it.
    pub fn submit(
        &mut self,
        user_id: &str,
        request: OperationRequest,
        now_ms: u64,
    ) -> Result<Submission, CollabError> {
        let permission = if request.op_type == OperationType::Delete {
            Permission::Delete
        } else {
            Permission::Edit
        };
        self.authorize(user_id, permission)?;
        self.last_activity_ms = now_ms;
        self.presence.touch(user_id, now_ms);

        let mut operation = Operation::accept(request, self.id, user_id, now_ms);
        let entity = operation.target.clone();

        if let Err(denial) = self.locks.check_write(&entity, user_id) {
            operation.conflicted = true;
            let users: BTreeSet<UserId> = [denial.holder.clone(), user_id.to_string()]
                .into_iter()
                .collect();
            let conflict = self.conflicts.raise(
                ConflictKind::LockViolation,
                entity,
                vec![operation],
                users,
                user_id,
                now_ms,
            );
            self.arm_conflict(&conflict);
            return Ok(Submission::Blocked {
                error: denial.into(),
                conflict,
            });
        }

        let after_sequence = self
            .locks
            .held_by(&entity, user_id)
            .map_or(0, |lock| lock.log_mark)
            .max(self.conflicts.settled_mark(&entity));
        let implicated = self
            .detector
            .detect(&self.log, &operation, after_sequence, now_ms);
        operation.conflicted = implicated.is_some();

        let (sequence, _) = self.log.append(operation.clone());
        operation.sequence = sequence;

        let mut raised = Vec::new();
        if let Some(mut implicated) = implicated {
            if let Some(last) = implicated.last_mut() {
                *last = operation.clone();
            }
            let (conflict, created) =
                self.conflicts
                    .raise_concurrent_edit(&entity, implicated, user_id, now_ms);
            if created {
                self.arm_conflict(&conflict);
            }
            raised.push((conflict, created));
        } else if let Some(base) = operation.base_version {
            let current = self.entity_version(&entity);
            if base < current {
                let users = [user_id.to_string()].into_iter().collect();
                let conflict = self.conflicts.raise(
                    ConflictKind::VersionMismatch,
                    entity,
                    vec![operation.clone()],
                    users,
                    user_id,
                    now_ms,
                );
                self.arm_conflict(&conflict);
                raised.push((conflict, true));
            }
        }

        Ok(Submission::Accepted {
            operation,
            conflicts: raised,
        })
    }

    /// Record that the document store applied an operation.
    pub fn mark_applied(&mut self, operation_id: Uuid, entity: &EntityKey) -> bool {
        let found = self.log.mark_applied(operation_id);
        if found {
            self.bump_version(entity);
        }
        found
    }

    /// Record a store write that did not come through the log, such as a
    /// resolution's final state.
    pub fn bump_version(&mut self, entity: &EntityKey) {
        *self.entity_versions.entry(entity.to_string()).or_default() += 1;
        self.revision += 1;
    }

    /// Current version of an entity.
    #[must_use]
    pub fn entity_version(&self, entity: &EntityKey) -> u64 {
        self.entity_versions
            .get(&entity.to_string())
            .copied()
            .unwrap_or(0)
    }

    /// Store revision as last seen.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Recent history for a joining client.
    #[must_use]
    pub fn history(&self) -> Vec<Operation> {
        self.log.last(self.settings.history_on_join)
    }

    // ---- conflicts --------------------------------------------------------

    fn arm_conflict(&mut self, conflict: &Conflict) {
        self.timers.schedule(
            TimerTarget::ConflictDeadline,
            conflict.id,
            0,
            conflict.deadline_ms,
        );
    }

    /// Plan a user-chosen resolution.
    ///
    /// # Errors
    ///
    /// Returns a permission error when the resolver may not resolve
    /// conflicts, a conflict error when it was already resolved, or an
    /// invalid request for unknown conflicts.
    pub fn plan_resolution(
        &self,
        conflict_id: Uuid,
        kind: ResolutionKind,
        resolver: &str,
        custom_state: Option<serde_json::Value>,
    ) -> Result<ResolutionPlan, CollabError> {
        self.authorize(resolver, Permission::ResolveConflicts)?;
        self.conflicts
            .plan(conflict_id, kind, resolver, custom_state)
    }

    /// Replace a `merge` plan the document store could not carry out with
    /// `accept_theirs` for the same side.
    #[must_use]
    pub fn degrade_merge(&self, plan: &ResolutionPlan) -> Option<ResolutionPlan> {
        self.conflicts
            .get(plan.conflict_id)?
            .plan(
                ResolutionKind::AcceptTheirs,
                &plan.resolver,
                &plan.on_behalf_of,
                None,
            )
            .ok()
    }

    /// Push an open conflict's automatic resolution one timeout further out.
    pub fn postpone_conflict(&mut self, conflict_id: Uuid, now_ms: u64) -> bool {
        if self.conflicts.get(conflict_id).is_none() {
            return false;
        }
        self.timers.schedule(
            TimerTarget::ConflictDeadline,
            conflict_id,
            0,
            now_ms.saturating_add(self.settings.conflict_timeout_ms),
        );
        true
    }

    /// Operations implicated in an open conflict.
    #[must_use]
    pub fn conflict_operations(&self, conflict_id: Uuid) -> Vec<Operation> {
        self.conflicts
            .get(conflict_id)
            .map(|c| c.operations.clone())
            .unwrap_or_default()
    }

    /// Close a conflict according to a plan.
    pub fn complete_resolution(&mut self, plan: ResolutionPlan, now_ms: u64) -> Option<Conflict> {
        self.last_activity_ms = now_ms;
        let conflict_id = plan.conflict_id;
        let mark = self.log.last_sequence();
        self.conflicts
            .complete(conflict_id, plan.into_resolution(now_ms), mark)
    }

    /// Look up an open conflict.
    #[must_use]
    pub fn conflict(&self, conflict_id: Uuid) -> Option<&Conflict> {
        self.conflicts.get(conflict_id)
    }

    // ---- timers -----------------------------------------------------------

    /// Earliest armed deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    /// Fire every timer due at `now_ms`. Stale timers are dropped.
    pub fn fire_due(&mut self, now_ms: u64) -> Vec<Expiry> {
        let mut fired = Vec::new();
        for timer in self.timers.pop_due(now_ms) {
            match timer.target {
                TimerTarget::LockExpiry(entity) => {
                    if let Some(lock) = self.locks.expire(&entity, timer.resource, timer.generation)
                    {
                        let replica = self.replica_locks.remove(&lock.id);
                        tracing::info!(entity = %entity, holder = %lock.holder, "Lock expired");
                        fired.push(Expiry::Lock { lock, replica });
                    }
                }
                TimerTarget::ConflictDeadline => {
                    if let Some(plan) = self.conflicts.plan_automatic(timer.resource) {
                        fired.push(Expiry::Conflict(plan));
                    }
                }
            }
        }
        fired
    }

    // ---- replication ------------------------------------------------------

    /// Mirror a user joined on another process.
    pub fn apply_remote_join(&mut self, user: User) {
        if !self.presence.has_local(&user.id) {
            self.presence.upsert_remote(user);
        }
    }

    /// Mirror a user that went offline on another process.
    ///
    /// Returns `false` when the user is still connected here.
    pub fn apply_remote_leave(&mut self, user_id: &str) -> bool {
        if self.presence.has_local(user_id) {
            return false;
        }
        self.presence.mark_offline(user_id);
        true
    }

    /// Mirror a cursor update from another process.
    pub fn apply_remote_cursor(&mut self, user_id: &str, cursor: CursorPosition, now_ms: u64) {
        self.presence.update_cursor(user_id, cursor, now_ms);
    }

    /// Mirror a selection update from another process.
    pub fn apply_remote_selection(&mut self, user_id: &str, selection: Vec<String>, now_ms: u64) {
        self.presence.update_selection(user_id, selection, now_ms);
    }

    /// Mirror a lock granted on another process and arm its expiry.
    pub fn apply_remote_lock(&mut self, lock: Lock) {
        self.timers.schedule(
            TimerTarget::LockExpiry(lock.entity.clone()),
            lock.id,
            lock.generation,
            lock.expires_at_ms,
        );
        self.replica_locks.insert(lock.id);
        self.locks.insert_replica(lock);
    }

    /// Mirror a lock released on another process.
    pub fn apply_remote_release(&mut self, lock: &Lock) -> bool {
        self.replica_locks.remove(&lock.id);
        self.locks.remove_replica(&lock.entity, lock.id).is_some()
    }

    /// Mirror an operation accepted and applied on another process.
    pub fn apply_remote_operation(&mut self, operation: Operation) -> Operation {
        let entity = operation.target.clone();
        let applied = operation.applied;
        let (sequence, _) = self.log.append(operation.clone());
        if applied {
            self.bump_version(&entity);
        }
        Operation {
            sequence,
            ..operation
        }
    }

    /// Mirror a conflict raised on another process. Its deadline is owned by
    /// the origin.
    pub fn apply_remote_conflict(&mut self, conflict: Conflict) {
        self.conflicts.insert_replica(conflict);
    }

    /// Mirror a conflict resolved on another process.
    pub fn apply_remote_resolution(&mut self, conflict_id: Uuid) -> bool {
        let mark = self.log.last_sequence();
        self.conflicts.remove_replica(conflict_id, mark).is_some()
    }

    // ---- queries ----------------------------------------------------------

    /// Look up a member.
    #[must_use]
    pub fn member(&self, user_id: &str) -> Option<&User> {
        self.presence.get(user_id)
    }

    /// Member behind a local connection.
    #[must_use]
    pub fn member_for(&self, connection: ConnectionId) -> Option<&User> {
        self.presence.user_for(connection)
    }

    /// Local connections of a user.
    #[must_use]
    pub fn connections_of(&self, user_id: &str) -> Vec<ConnectionId> {
        self.presence.connections_of(user_id)
    }

    /// Number of local connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.presence.connection_count()
    }

    /// Every known user.
    #[must_use]
    pub fn users(&self) -> Vec<User> {
        self.presence.users()
    }

    /// Every live lock, oldest first.
    #[must_use]
    pub fn locks(&self) -> Vec<Lock> {
        let mut locks: Vec<Lock> = self.locks.iter().cloned().collect();
        locks.sort_by_key(|lock| (lock.acquired_at_ms, lock.id));
        locks
    }

    /// Open conflicts, oldest first.
    #[must_use]
    pub fn open_conflicts(&self) -> Vec<Conflict> {
        self.conflicts.open().into_iter().cloned().collect()
    }

    /// Whether operations were logged since the last flush.
    #[must_use]
    pub fn has_unflushed(&self) -> bool {
        self.log.has_unflushed()
    }

    /// Newest log sequence.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.log.last_sequence()
    }

    /// Record a successful flush up to `sequence`.
    pub fn mark_flushed(&mut self, sequence: u64) {
        self.log.mark_flushed(sequence);
    }

    /// Snapshot for the persistence collaborator.
    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState {
            session_id: self.id,
            project_id: self.project_id.clone(),
            users: self.users(),
            locks: self.locks(),
            recent_operations: self.log.iter().cloned().collect(),
            conflicts: self.open_conflicts(),
            revision: self.revision,
            created_at_ms: self.created_at_ms,
            last_activity_ms: self.last_activity_ms,
        }
    }

    /// Project metadata for the document store checkpoint.
    #[must_use]
    pub fn project_snapshot(&self) -> ProjectSnapshot {
        ProjectSnapshot {
            project_id: self.project_id.clone(),
            owner_id: self.presence.owner_id().map(str::to_string),
            revision: self.revision,
            entity_versions: self.entity_versions.clone(),
        }
    }
}

fn not_joined(user_id: &str) -> CollabError {
    CollabError::Auth(format!("{user_id} has not joined the session"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::SYSTEM_RESOLVER;
    use crate::model::Role;
    use serde_json::json;

    fn settings() -> SessionSettings {
        SessionSettings {
            lock_timeout_ms: 10_000,
            heartbeat_interval_ms: 1_000,
            conflict_timeout_ms: 30_000,
            ..SessionSettings::default()
        }
    }

    fn session() -> Session {
        let project = ProjectSnapshot {
            project_id: "p1".to_string(),
            owner_id: Some("owner".to_string()),
            ..ProjectSnapshot::default()
        };
        Session::new(project, settings(), 0)
    }

    fn join(session: &mut Session, user: &str, role: Role) -> ConnectionId {
        let connection = Uuid::new_v4();
        session.join(
            connection,
            UserProfile {
                id: user.to_string(),
                name: user.to_string(),
                role,
            },
            0,
        );
        connection
    }

    fn update(entity: &EntityKey, payload: serde_json::Value) -> OperationRequest {
        OperationRequest {
            op_type: OperationType::Update,
            target: entity.clone(),
            payload,
            base_version: None,
        }
    }

    fn accepted(submission: Submission) -> (Operation, Vec<(Conflict, bool)>) {
        match submission {
            Submission::Accepted {
                operation,
                conflicts,
            } => (operation, conflicts),
            Submission::Blocked { error, .. } => panic!("unexpected block: {error}"),
        }
    }

    #[test]
    fn lock_handoff_raises_no_conflict() {
        let mut s = session();
        join(&mut s, "a", Role::Editor);
        join(&mut s, "b", Role::Editor);
        let c1 = EntityKey::component("C1");

        assert!(matches!(
            s.request_lock("a", &c1, LockKind::Exclusive, 0).unwrap(),
            LockDecision::Granted { .. }
        ));
        match s.request_lock("b", &c1, LockKind::Exclusive, 10).unwrap() {
            LockDecision::Denied(denial) => assert_eq!(denial.holder, "a"),
            LockDecision::Granted { .. } => panic!("second exclusive lock granted"),
        }

        let (_, conflicts) = accepted(s.submit("a", update(&c1, json!({ "w": 1 })), 100).unwrap());
        assert!(conflicts.is_empty());
        assert!(s.release_lock("a", &c1, 200).is_some());

        assert!(matches!(
            s.request_lock("b", &c1, LockKind::Exclusive, 300).unwrap(),
            LockDecision::Granted { .. }
        ));
        let (_, conflicts) = accepted(s.submit("b", update(&c1, json!({ "w": 2 })), 400).unwrap());
        assert!(conflicts.is_empty());
        assert!(s.open_conflicts().is_empty());
    }

    #[test]
    fn simultaneous_updates_raise_one_conflict() {
        let mut s = session();
        join(&mut s, "a", Role::Editor);
        join(&mut s, "b", Role::Editor);
        let c2 = EntityKey::component("C2");

        let (first, none) = accepted(s.submit("a", update(&c2, json!({ "w": 1 })), 100).unwrap());
        assert!(none.is_empty());
        let (second, raised) =
            accepted(s.submit("b", update(&c2, json!({ "w": 2 })), 150).unwrap());

        assert_eq!(raised.len(), 1);
        let (conflict, created) = &raised[0];
        assert!(created);
        assert_eq!(conflict.kind, ConflictKind::ConcurrentEdit);
        let ids: Vec<Uuid> = conflict.operations.iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert!(conflict.users.contains("a") && conflict.users.contains("b"));
        assert!(second.conflicted);

        let plan = s
            .plan_resolution(conflict.id, ResolutionKind::AcceptMine, "a", None)
            .unwrap();
        assert_eq!(plan.final_state, Some(json!({ "w": 1 })));
        let resolved = s.complete_resolution(plan, 200).unwrap();
        assert_eq!(resolved.resolution.unwrap().resolved_by, "a");
        assert!(s.open_conflicts().is_empty());

        // Settled history does not re-trigger detection.
        let (_, raised) = accepted(s.submit("a", update(&c2, json!({ "w": 3 })), 250).unwrap());
        assert!(raised.is_empty());
    }

    #[test]
    fn write_against_foreign_lock_is_blocked() {
        let mut s = session();
        join(&mut s, "a", Role::Editor);
        join(&mut s, "b", Role::Editor);
        let c1 = EntityKey::component("C1");
        s.request_lock("a", &c1, LockKind::Exclusive, 0).unwrap();

        match s.submit("b", update(&c1, json!({})), 10).unwrap() {
            Submission::Blocked { error, conflict } => {
                assert_eq!(error.code(), "lock_error");
                assert_eq!(error.holder(), Some("a"));
                assert_eq!(conflict.kind, ConflictKind::LockViolation);
            }
            Submission::Accepted { .. } => panic!("write accepted under foreign lock"),
        }
        assert_eq!(s.last_sequence(), 0);
    }

    #[test]
    fn viewer_cannot_edit_or_lock() {
        let mut s = session();
        join(&mut s, "v", Role::Viewer);
        let c1 = EntityKey::component("C1");

        let err = s.submit("v", update(&c1, json!({})), 0).unwrap_err();
        assert_eq!(err.code(), "permission_error");
        let err = s.request_lock("v", &c1, LockKind::Shared, 0).unwrap_err();
        assert_eq!(err.code(), "permission_error");
        assert!(s.open_conflicts().is_empty());
    }

    #[test]
    fn lock_expires_and_stale_timer_is_ignored() {
        let mut s = session();
        join(&mut s, "a", Role::Editor);
        join(&mut s, "b", Role::Editor);
        let c1 = EntityKey::component("C1");

        s.request_lock("a", &c1, LockKind::Exclusive, 0).unwrap();
        // Re-confirm at 5s moves expiry to 15s; the first timer goes stale.
        s.request_lock("a", &c1, LockKind::Exclusive, 5_000).unwrap();

        assert!(s.fire_due(10_000).is_empty());
        assert_eq!(s.locks().len(), 1);

        let fired = s.fire_due(15_000);
        assert!(matches!(
            &fired[..],
            [Expiry::Lock { lock, replica: false }] if lock.holder == "a"
        ));
        assert!(matches!(
            s.request_lock("b", &c1, LockKind::Exclusive, 15_001).unwrap(),
            LockDecision::Granted { .. }
        ));
    }

    #[test]
    fn unattended_conflict_resolves_by_default() {
        let mut s = session();
        join(&mut s, "a", Role::Editor);
        join(&mut s, "b", Role::Editor);
        let c2 = EntityKey::component("C2");
        s.submit("a", update(&c2, json!({ "w": 1 })), 0).unwrap();
        s.submit("b", update(&c2, json!({ "h": 2 })), 10).unwrap();

        assert!(s.fire_due(30_009).is_empty());
        let fired = s.fire_due(30_010);
        let [Expiry::Conflict(plan)] = &fired[..] else {
            panic!("expected one conflict deadline, got {fired:?}");
        };
        assert_eq!(plan.kind, ResolutionKind::Merge);
        assert_eq!(plan.resolver, SYSTEM_RESOLVER);
        assert!(plan.needs_merge());

        let fallback = s.degrade_merge(plan).unwrap();
        assert_eq!(fallback.kind, ResolutionKind::AcceptTheirs);
        assert_eq!(fallback.final_state, Some(json!({ "w": 1 })));
    }

    #[test]
    fn disconnect_releases_locks_once_offline() {
        let mut s = session();
        let first = join(&mut s, "a", Role::Editor);
        let second = join(&mut s, "a", Role::Editor);
        s.request_lock("a", &EntityKey::component("C1"), LockKind::Exclusive, 0)
            .unwrap();
        s.request_lock("a", &EntityKey::drawing("D1"), LockKind::Shared, 0)
            .unwrap();

        let departure = s.leave(first, 10).unwrap();
        assert!(!departure.went_offline);
        assert!(departure.released.is_empty());

        let departure = s.leave(second, 20).unwrap();
        assert!(departure.went_offline);
        assert_eq!(departure.released.len(), 2);
        assert!(s.locks().is_empty());
    }

    #[test]
    fn local_departure_keeps_locks_granted_elsewhere() {
        let mut origin = session();
        join(&mut origin, "a", Role::Editor);
        let remote = match origin
            .request_lock("a", &EntityKey::component("C1"), LockKind::Exclusive, 0)
            .unwrap()
        {
            LockDecision::Granted { lock, .. } => lock,
            LockDecision::Denied(denial) => panic!("unexpected denial: {denial:?}"),
        };

        let mut s = session();
        s.apply_remote_lock(remote.clone());
        let connection = join(&mut s, "a", Role::Editor);
        s.request_lock("a", &EntityKey::drawing("D1"), LockKind::Shared, 0)
            .unwrap();

        let departure = s.leave(connection, 10).unwrap();
        assert!(departure.went_offline);
        assert_eq!(departure.released.len(), 1);
        assert_eq!(departure.released[0].entity, EntityKey::drawing("D1"));
        assert_eq!(s.locks(), vec![remote.clone()]);

        assert!(s.apply_remote_release(&remote));
        assert!(s.locks().is_empty());
    }

    #[test]
    fn sweep_releases_stale_holders() {
        let mut s = session();
        join(&mut s, "a", Role::Editor);
        join(&mut s, "b", Role::Editor);
        s.request_lock("a", &EntityKey::component("C1"), LockKind::Exclusive, 0)
            .unwrap();
        s.heartbeat("b", 1_500);

        let swept = s.sweep(2_001);
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].user_id, "a");
        assert_eq!(swept[0].released.len(), 1);
        assert!(s.member("b").unwrap().presence.online);
    }

    #[test]
    fn stale_base_version_raises_mismatch() {
        let mut s = session();
        join(&mut s, "a", Role::Editor);
        let c3 = EntityKey::component("C3");

        let (op, _) = accepted(s.submit("a", update(&c3, json!({})), 0).unwrap());
        assert!(s.mark_applied(op.id, &c3));
        assert_eq!(s.entity_version(&c3), 1);

        let mut stale = update(&c3, json!({}));
        stale.base_version = Some(0);
        let (_, raised) = accepted(s.submit("a", stale, 10).unwrap());
        assert_eq!(raised[0].0.kind, ConflictKind::VersionMismatch);
    }

    #[test]
    fn state_snapshot_lists_everything() {
        let mut s = session();
        join(&mut s, "a", Role::Editor);
        let c1 = EntityKey::component("C1");
        s.request_lock("a", &c1, LockKind::Exclusive, 0).unwrap();
        s.submit("a", update(&c1, json!({})), 5).unwrap();

        let state = s.state();
        assert_eq!(state.project_id, "p1");
        assert_eq!(state.users.len(), 1);
        assert_eq!(state.locks.len(), 1);
        assert_eq!(state.recent_operations.len(), 1);
        assert_eq!(state.last_activity_ms, 5);
        assert!(s.has_unflushed());
        s.mark_flushed(s.last_sequence());
        assert!(!s.has_unflushed());
    }
}
