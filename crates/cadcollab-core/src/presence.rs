//! Session membership and liveness.
//!
//! Users are keyed by id and may hold several connections. A user goes
//! offline when the last local connection closes or the heartbeat sweep finds
//! them stale; the entry is kept so history and conflicts can still name them.

use crate::model::{ConnectionId, CursorPosition, User, UserId, UserProfile};
use std::collections::HashMap;

/// Result of [`PresenceStore::join`].
#[derive(Debug, Clone, PartialEq)]
pub struct Joined {
    /// The participant as now stored
    pub user: User,
    /// `true` unless the user already had a live connection
    pub newly_online: bool,
}

/// Result of [`PresenceStore::leave`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Left {
    /// Departing user
    pub user_id: UserId,
    /// `true` if that was the user's last local connection
    pub went_offline: bool,
}

/// Membership table for one session.
#[derive(Debug, Default)]
pub struct PresenceStore {
    users: HashMap<UserId, User>,
    connections: HashMap<ConnectionId, UserId>,
    owner_id: Option<UserId>,
}

impl PresenceStore {
    /// Create a store for a project owned by `owner_id`.
    #[must_use]
    pub fn new(owner_id: Option<UserId>) -> Self {
        Self {
            owner_id,
            ..Self::default()
        }
    }

    /// Attach a connection for an authenticated user.
    ///
    /// Idempotent per user: a second connection refreshes the stored entry
    /// and keeps cursor and selection.
    pub fn join(&mut self, connection: ConnectionId, profile: UserProfile, now_ms: u64) -> Joined {
        let is_owner = self.owner_id.as_deref() == Some(profile.id.as_str());
        let user_id = profile.id.clone();
        let fresh = User::from_profile(profile, is_owner, now_ms);

        let had_local = self.has_local(&user_id);
        let newly_online = match self.users.get_mut(&user_id) {
            Some(existing) => {
                let was_online = existing.presence.online && had_local;
                existing.name = fresh.name;
                existing.role = fresh.role;
                existing.permissions = fresh.permissions;
                existing.presence.online = true;
                existing.presence.last_seen_ms = now_ms;
                !was_online
            }
            None => {
                self.users.insert(user_id.clone(), fresh);
                true
            }
        };

        self.connections.insert(connection, user_id.clone());

        Joined {
            user: self.users[&user_id].clone(),
            newly_online,
        }
    }

    /// Detach a connection. Unknown connections yield `None`.
    pub fn leave(&mut self, connection: ConnectionId) -> Option<Left> {
        let user_id = self.connections.remove(&connection)?;
        let went_offline = !self.has_local(&user_id);
        if went_offline {
            self.mark_offline(&user_id);
        }
        Some(Left {
            user_id,
            went_offline,
        })
    }

    /// Record liveness for a user.
    pub fn touch(&mut self, user_id: &str, now_ms: u64) -> bool {
        match self.users.get_mut(user_id) {
            Some(user) => {
                user.presence.last_seen_ms = user.presence.last_seen_ms.max(now_ms);
                true
            }
            None => false,
        }
    }

    /// Overwrite a user's cursor.
    pub fn update_cursor(&mut self, user_id: &str, cursor: CursorPosition, now_ms: u64) -> bool {
        self.touch(user_id, now_ms);
        match self.users.get_mut(user_id) {
            Some(user) => {
                user.presence.cursor = Some(cursor);
                true
            }
            None => false,
        }
    }

    /// Overwrite a user's selection.
    pub fn update_selection(&mut self, user_id: &str, selection: Vec<String>, now_ms: u64) -> bool {
        self.touch(user_id, now_ms);
        match self.users.get_mut(user_id) {
            Some(user) => {
                user.presence.selection = Some(selection);
                true
            }
            None => false,
        }
    }

    /// Mark locally connected users silent for more than `stale_after_ms` as
    /// offline and drop their connections.
    ///
    /// Returns each swept user with the connections that were dropped.
    pub fn sweep(&mut self, now_ms: u64, stale_after_ms: u64) -> Vec<(UserId, Vec<ConnectionId>)> {
        let mut stale: Vec<UserId> = self
            .users
            .values()
            .filter(|user| {
                user.presence.online
                    && now_ms.saturating_sub(user.presence.last_seen_ms) > stale_after_ms
                    && self.has_local(&user.id)
            })
            .map(|user| user.id.clone())
            .collect();
        stale.sort();

        stale
            .into_iter()
            .map(|user_id| {
                let dropped: Vec<ConnectionId> = self.connections_of(&user_id);
                for connection in &dropped {
                    self.connections.remove(connection);
                }
                self.mark_offline(&user_id);
                (user_id, dropped)
            })
            .collect()
    }

    /// Mirror a user seen on another server process.
    pub fn upsert_remote(&mut self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    /// Flip a user offline, keeping the entry.
    pub fn mark_offline(&mut self, user_id: &str) {
        if let Some(user) = self.users.get_mut(user_id) {
            user.presence.online = false;
            user.presence.cursor = None;
            user.presence.selection = None;
        }
    }

    /// Whether the user has a connection on this process.
    #[must_use]
    pub fn has_local(&self, user_id: &str) -> bool {
        self.connections.values().any(|id| id == user_id)
    }

    /// Local connections of a user.
    #[must_use]
    pub fn connections_of(&self, user_id: &str) -> Vec<ConnectionId> {
        let mut found: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, id)| id.as_str() == user_id)
            .map(|(connection, _)| *connection)
            .collect();
        found.sort();
        found
    }

    /// User behind a local connection.
    #[must_use]
    pub fn user_for(&self, connection: ConnectionId) -> Option<&User> {
        self.connections
            .get(&connection)
            .and_then(|id| self.users.get(id))
    }

    /// Look up a user.
    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<&User> {
        self.users.get(user_id)
    }

    /// Every known user, sorted by id.
    #[must_use]
    pub fn users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.values().cloned().collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }

    /// Number of local connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Project owner, if known.
    #[must_use]
    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }
}
