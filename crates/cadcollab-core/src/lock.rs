//! Time-bounded entity locks.
//!
//! Per entity the state machine is `UNLOCKED -> LOCKED(holders) -> UNLOCKED`.
//!
//! | Held \ Requested | exclusive | shared | intent |
//! |------------------|-----------|--------|--------|
//! | none             | grant     | grant  | grant  |
//! | exclusive        | deny      | deny   | deny   |
//! | shared           | deny      | grant  | deny   |
//! | intent           | deny      | deny   | grant  |
//!
//! A holder asking again for the kind it already holds gets its lock back
//! with a fresh expiry. Asking for a different kind is denied: upgrades go
//! through an explicit release.

use crate::error::CollabError;
use crate::model::{EntityKey, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Denial reason when someone else holds an incompatible lock.
pub const LOCKED_BY_OTHER: &str = "Entity is locked by another user";

/// Denial reason when the requester already holds a different kind.
pub const UPGRADE_REQUIRES_RELEASE: &str = "Lock upgrade requires releasing the current lock";

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    /// Sole editing rights
    Exclusive,
    /// Read-stable access shared with other shared holders
    Shared,
    /// Announces a future exclusive edit
    Intent,
}

impl LockKind {
    /// Whether a lock of kind `self` held by someone else admits `requested`.
    #[must_use]
    pub fn admits(self, requested: LockKind) -> bool {
        self == requested && self != LockKind::Exclusive
    }

    /// Whether a lock of this kind held by someone else blocks writes.
    #[must_use]
    pub fn blocks_writes(self) -> bool {
        matches!(self, LockKind::Exclusive | LockKind::Shared)
    }
}

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    /// Lock identifier
    pub id: Uuid,
    /// Locked entity
    pub entity: EntityKey,
    /// Holding user
    pub holder: UserId,
    /// Lock mode
    pub kind: LockKind,
    /// Grant time
    pub acquired_at_ms: u64,
    /// Expiry time
    pub expires_at_ms: u64,
    /// Whether the lock is released automatically at expiry
    pub auto_release: bool,
    /// Bumped on every re-confirmation; expiry timers carry it
    pub generation: u64,
    /// Local operation log sequence at grant time
    #[serde(skip, default)]
    pub log_mark: u64,
}

/// Why a lock request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDenial {
    /// Contended entity
    pub entity: EntityKey,
    /// Human readable reason
    pub reason: String,
    /// User holding the blocking lock
    pub holder: UserId,
    /// Kind of the blocking lock
    pub holder_kind: LockKind,
}

impl From<LockDenial> for CollabError {
    fn from(denial: LockDenial) -> Self {
        CollabError::Lock {
            reason: denial.reason,
            holder: denial.holder,
            entity: denial.entity,
        }
    }
}

/// Outcome of a lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockDecision {
    /// The requester holds the lock
    Granted {
        /// The lock as now held
        lock: Lock,
        /// `true` if this re-confirmed a lock the requester already held
        renewed: bool,
    },
    /// The request was refused; it is never queued
    Denied(LockDenial),
}

/// Lock table for one session.
#[derive(Debug)]
pub struct LockManager {
    locks: HashMap<EntityKey, Vec<Lock>>,
    timeout_ms: u64,
}

impl LockManager {
    /// Create a lock table whose grants last `timeout_ms`.
    #[must_use]
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            locks: HashMap::new(),
            timeout_ms,
        }
    }

    /// Lock lifetime in milliseconds.
    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Request a lock.
    ///
    /// `log_mark` is the operation log sequence at the time of the request;
    /// conflict detection ignores entries at or before it.
    pub fn request(
        &mut self,
        entity: &EntityKey,
        kind: LockKind,
        requester: &str,
        now_ms: u64,
        log_mark: u64,
    ) -> LockDecision {
        let expires_at_ms = now_ms.saturating_add(self.timeout_ms);

        if let Some(held) = self.locks.get_mut(entity) {
            if let Some(own) = held.iter_mut().find(|lock| lock.holder == requester) {
                if own.kind != kind {
                    return LockDecision::Denied(LockDenial {
                        entity: entity.clone(),
                        reason: UPGRADE_REQUIRES_RELEASE.to_string(),
                        holder: own.holder.clone(),
                        holder_kind: own.kind,
                    });
                }
                own.expires_at_ms = expires_at_ms;
                own.generation += 1;
                return LockDecision::Granted {
                    lock: own.clone(),
                    renewed: true,
                };
            }

            if let Some(blocker) = held.iter().find(|lock| !lock.kind.admits(kind)) {
                return LockDecision::Denied(LockDenial {
                    entity: entity.clone(),
                    reason: LOCKED_BY_OTHER.to_string(),
                    holder: blocker.holder.clone(),
                    holder_kind: blocker.kind,
                });
            }
        }

        let lock = Lock {
            id: Uuid::new_v4(),
            entity: entity.clone(),
            holder: requester.to_string(),
            kind,
            acquired_at_ms: now_ms,
            expires_at_ms,
            auto_release: true,
            generation: 0,
            log_mark,
        };
        self.locks
            .entry(entity.clone())
            .or_default()
            .push(lock.clone());

        tracing::debug!(entity = %entity, holder = requester, kind = ?kind, "Lock granted");

        LockDecision::Granted {
            lock,
            renewed: false,
        }
    }

    /// Release the caller's lock on `entity`. No-op unless the caller holds one.
    pub fn release(&mut self, entity: &EntityKey, requester: &str) -> Option<Lock> {
        self.take(entity, |lock| lock.holder == requester)
    }

    /// Release every lock held by `user` for which `keep` returns `false`.
    pub fn release_all(&mut self, user: &str, keep: impl Fn(&Lock) -> bool) -> Vec<Lock> {
        let mut released = Vec::new();
        self.locks.retain(|_, held| {
            let (mine, others): (Vec<Lock>, Vec<Lock>) = held
                .drain(..)
                .partition(|lock| lock.holder == user && !keep(lock));
            released.extend(mine);
            *held = others;
            !held.is_empty()
        });
        released.sort_by_key(|lock| lock.acquired_at_ms);
        released
    }

    /// Expire a lock if the live entry still has the given id and generation.
    pub fn expire(&mut self, entity: &EntityKey, lock_id: Uuid, generation: u64) -> Option<Lock> {
        self.take(entity, |lock| {
            lock.id == lock_id && lock.generation == generation && lock.auto_release
        })
    }

    /// Check whether `user` may write to `entity`.
    ///
    /// # Errors
    ///
    /// Returns the blocking lock when another user holds an exclusive or
    /// shared lock on the entity.
    pub fn check_write(&self, entity: &EntityKey, user: &str) -> Result<(), LockDenial> {
        let Some(blocker) = self
            .holders(entity)
            .iter()
            .find(|lock| lock.holder != user && lock.kind.blocks_writes())
        else {
            return Ok(());
        };

        Err(LockDenial {
            entity: entity.clone(),
            reason: LOCKED_BY_OTHER.to_string(),
            holder: blocker.holder.clone(),
            holder_kind: blocker.kind,
        })
    }

    /// Current holders of `entity`.
    #[must_use]
    pub fn holders(&self, entity: &EntityKey) -> &[Lock] {
        self.locks.get(entity).map_or(&[], Vec::as_slice)
    }

    /// The lock `user` holds on `entity`, if any.
    #[must_use]
    pub fn held_by(&self, entity: &EntityKey, user: &str) -> Option<&Lock> {
        self.holders(entity).iter().find(|lock| lock.holder == user)
    }

    /// Every live lock.
    pub fn iter(&self) -> impl Iterator<Item = &Lock> {
        self.locks.values().flatten()
    }

    /// Number of live locks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.values().map(Vec::len).sum()
    }

    /// Check whether no locks are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Mirror a lock granted by another server process.
    pub fn insert_replica(&mut self, lock: Lock) {
        let held = self.locks.entry(lock.entity.clone()).or_default();
        if let Some(existing) = held.iter_mut().find(|l| l.id == lock.id) {
            *existing = lock;
        } else {
            held.retain(|l| l.holder != lock.holder);
            held.push(lock);
        }
    }

    /// Drop a mirrored lock by id.
    pub fn remove_replica(&mut self, entity: &EntityKey, lock_id: Uuid) -> Option<Lock> {
        self.take(entity, |lock| lock.id == lock_id)
    }

    fn take(&mut self, entity: &EntityKey, mut matches: impl FnMut(&Lock) -> bool) -> Option<Lock> {
        let held = self.locks.get_mut(entity)?;
        let index = held.iter().position(&mut matches)?;
        let lock = held.remove(index);
        if held.is_empty() {
            self.locks.remove(entity);
        }
        Some(lock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: u64 = 1_000;

    fn granted(decision: LockDecision) -> Lock {
        match decision {
            LockDecision::Granted { lock, .. } => lock,
            LockDecision::Denied(denial) => panic!("expected grant, got {denial:?}"),
        }
    }

    fn denied(decision: LockDecision) -> LockDenial {
        match decision {
            LockDecision::Denied(denial) => denial,
            LockDecision::Granted { lock, .. } => panic!("expected denial, got {lock:?}"),
        }
    }

    #[test]
    fn exclusive_denies_other_user_and_names_holder() {
        let mut locks = LockManager::new(TIMEOUT);
        let c1 = EntityKey::component("C1");

        let lock = granted(locks.request(&c1, LockKind::Exclusive, "alice", 0, 0));
        assert_eq!(lock.expires_at_ms, TIMEOUT);

        let denial = denied(locks.request(&c1, LockKind::Exclusive, "bob", 10, 0));
        assert_eq!(denial.holder, "alice");
        assert_eq!(denial.reason, LOCKED_BY_OTHER);

        let denial = denied(locks.request(&c1, LockKind::Shared, "bob", 10, 0));
        assert_eq!(denial.holder, "alice");
    }

    #[test]
    fn same_holder_reconfirms_without_duplicate() {
        let mut locks = LockManager::new(TIMEOUT);
        let c1 = EntityKey::component("C1");

        let first = granted(locks.request(&c1, LockKind::Exclusive, "alice", 0, 0));
        let decision = locks.request(&c1, LockKind::Exclusive, "alice", 400, 0);
        let LockDecision::Granted { lock, renewed } = decision else {
            panic!("expected grant");
        };

        assert!(renewed);
        assert_eq!(lock.id, first.id);
        assert_eq!(lock.generation, 1);
        assert_eq!(lock.expires_at_ms, 1_400);
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn upgrade_requires_release() {
        let mut locks = LockManager::new(TIMEOUT);
        let c1 = EntityKey::component("C1");

        granted(locks.request(&c1, LockKind::Shared, "alice", 0, 0));
        let denial = denied(locks.request(&c1, LockKind::Exclusive, "alice", 1, 0));
        assert_eq!(denial.reason, UPGRADE_REQUIRES_RELEASE);

        locks.release(&c1, "alice").unwrap();
        granted(locks.request(&c1, LockKind::Exclusive, "alice", 2, 0));
    }

    #[test]
    fn shared_and_intent_coexist_only_with_same_kind() {
        let mut locks = LockManager::new(TIMEOUT);
        let d1 = EntityKey::drawing("D1");

        granted(locks.request(&d1, LockKind::Shared, "alice", 0, 0));
        granted(locks.request(&d1, LockKind::Shared, "bob", 0, 0));
        denied(locks.request(&d1, LockKind::Intent, "carol", 0, 0));
        assert_eq!(locks.holders(&d1).len(), 2);

        let d2 = EntityKey::drawing("D2");
        granted(locks.request(&d2, LockKind::Intent, "alice", 0, 0));
        granted(locks.request(&d2, LockKind::Intent, "bob", 0, 0));
        denied(locks.request(&d2, LockKind::Shared, "carol", 0, 0));
        denied(locks.request(&d2, LockKind::Exclusive, "carol", 0, 0));
    }

    #[test]
    fn release_is_noop_for_non_holder() {
        let mut locks = LockManager::new(TIMEOUT);
        let c1 = EntityKey::component("C1");

        granted(locks.request(&c1, LockKind::Exclusive, "alice", 0, 0));
        assert!(locks.release(&c1, "bob").is_none());
        assert!(locks.release(&c1, "alice").is_some());
        assert!(locks.is_empty());
    }

    #[test]
    fn stale_expiry_is_ignored() {
        let mut locks = LockManager::new(TIMEOUT);
        let c1 = EntityKey::component("C1");

        let first = granted(locks.request(&c1, LockKind::Exclusive, "alice", 0, 0));
        locks.release(&c1, "alice");
        let second = granted(locks.request(&c1, LockKind::Exclusive, "alice", 10, 0));

        assert!(locks.expire(&c1, first.id, first.generation).is_none());
        assert_eq!(locks.holders(&c1).len(), 1);

        let renewed = granted(locks.request(&c1, LockKind::Exclusive, "alice", 20, 0));
        assert!(locks.expire(&c1, second.id, 0).is_none());
        assert!(locks.expire(&c1, second.id, renewed.generation).is_some());
    }

    #[test]
    fn release_all_for_user() {
        let mut locks = LockManager::new(TIMEOUT);
        granted(locks.request(&EntityKey::component("C1"), LockKind::Exclusive, "alice", 0, 0));
        granted(locks.request(&EntityKey::drawing("D1"), LockKind::Shared, "alice", 1, 0));
        granted(locks.request(&EntityKey::drawing("D1"), LockKind::Shared, "bob", 2, 0));

        let released = locks.release_all("alice", |_| false);
        assert_eq!(released.len(), 2);
        assert_eq!(locks.len(), 1);
        assert_eq!(locks.holders(&EntityKey::drawing("D1"))[0].holder, "bob");
    }

    #[test]
    fn release_all_spares_kept_locks() {
        let mut locks = LockManager::new(TIMEOUT);
        let c1 = EntityKey::component("C1");
        let kept = granted(locks.request(&c1, LockKind::Exclusive, "alice", 0, 0));
        granted(locks.request(&EntityKey::component("C2"), LockKind::Exclusive, "alice", 1, 0));

        let released = locks.release_all("alice", |lock| lock.id == kept.id);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].entity, EntityKey::component("C2"));
        assert_eq!(locks.held_by(&c1, "alice").map(|lock| lock.id), Some(kept.id));
    }

    #[test]
    fn intent_does_not_block_writes() {
        let mut locks = LockManager::new(TIMEOUT);
        let c1 = EntityKey::component("C1");

        granted(locks.request(&c1, LockKind::Intent, "alice", 0, 0));
        assert!(locks.check_write(&c1, "bob").is_ok());

        locks.release(&c1, "alice");
        granted(locks.request(&c1, LockKind::Exclusive, "alice", 0, 0));
        assert!(locks.check_write(&c1, "alice").is_ok());
        assert_eq!(locks.check_write(&c1, "bob").unwrap_err().holder, "alice");
    }
}
