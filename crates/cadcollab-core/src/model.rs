//! Participants, roles and lockable entities.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Identifier of a user as issued by the auth collaborator.
pub type UserId = String;

/// Identifier of a design project.
pub type ProjectId = String;

/// Identifier of one client connection. A user may hold several.
pub type ConnectionId = Uuid;

/// Kind of lockable unit within a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// The whole model
    Model,
    /// A component of the model
    Component,
    /// A 2D drawing
    Drawing,
    /// An analysis run or its configuration
    Analysis,
    /// Bill of materials
    Bom,
}

impl EntityType {
    /// Wire name of the entity type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Model => "model",
            EntityType::Component => "component",
            EntityType::Drawing => "drawing",
            EntityType::Analysis => "analysis",
            EntityType::Bom => "bom",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(type, id)` pair naming a lockable unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Entity type
    pub entity_type: EntityType,
    /// Entity identifier within the project
    pub entity_id: String,
}

impl EntityKey {
    /// Create a new entity key.
    #[must_use]
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }

    /// Shorthand for a component key.
    #[must_use]
    pub fn component(entity_id: impl Into<String>) -> Self {
        Self::new(EntityType::Component, entity_id)
    }

    /// Shorthand for a drawing key.
    #[must_use]
    pub fn drawing(entity_id: impl Into<String>) -> Self {
        Self::new(EntityType::Drawing, entity_id)
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// Project role of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Owns the project
    Owner,
    /// Administers the project
    Admin,
    /// May modify the model
    Editor,
    /// Read and comment only
    Viewer,
    /// Read only
    Guest,
}

/// A single capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// See the project and other participants
    View,
    /// Create and modify entities
    Edit,
    /// Delete entities
    Delete,
    /// Attach comments
    Comment,
    /// Take entity locks
    Lock,
    /// Decide conflict resolutions
    ResolveConflicts,
    /// Manage participants
    ManageUsers,
}

impl Permission {
    const ALL: [Permission; 7] = [
        Permission::View,
        Permission::Edit,
        Permission::Delete,
        Permission::Comment,
        Permission::Lock,
        Permission::ResolveConflicts,
        Permission::ManageUsers,
    ];

    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::View => "view",
            Permission::Edit => "edit",
            Permission::Delete => "delete",
            Permission::Comment => "comment",
            Permission::Lock => "lock",
            Permission::ResolveConflicts => "resolve_conflicts",
            Permission::ManageUsers => "manage_users",
        }
    }
}

/// Set of permissions granted to a participant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    /// Every permission.
    #[must_use]
    pub fn all() -> Self {
        Self(Permission::ALL.into_iter().collect())
    }

    /// Permissions derived from a role.
    ///
    /// The project owner gets everything regardless of the role the auth
    /// collaborator reported.
    #[must_use]
    pub fn for_role(role: Role, is_project_owner: bool) -> Self {
        if is_project_owner {
            return Self::all();
        }
        let granted: &[Permission] = match role {
            Role::Owner | Role::Admin => &Permission::ALL,
            Role::Editor => &[
                Permission::View,
                Permission::Edit,
                Permission::Delete,
                Permission::Comment,
                Permission::Lock,
                Permission::ResolveConflicts,
            ],
            Role::Viewer => &[Permission::View, Permission::Comment],
            Role::Guest => &[Permission::View],
        };
        Self(granted.iter().copied().collect())
    }

    /// Check a permission.
    #[must_use]
    pub fn contains(&self, permission: Permission) -> bool {
        self.0.contains(&permission)
    }

    /// Iterate over the granted permissions.
    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        self.0.iter().copied()
    }
}

/// Identity returned by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// User identifier
    pub id: UserId,
    /// Display name
    pub name: String,
    /// Role within the project
    pub role: Role,
}

/// Cursor location in model space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    /// X coordinate
    pub x: f64,
    /// Y coordinate
    pub y: f64,
    /// Z coordinate, absent in 2D views
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    /// Viewport or drawing the cursor is in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<String>,
}

/// Ephemeral liveness and UI state. Never logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    /// Whether the user has a live connection somewhere
    pub online: bool,
    /// Last time any message was seen from the user
    pub last_seen_ms: u64,
    /// Cursor position
    #[serde(default)]
    pub cursor: Option<CursorPosition>,
    /// Selected entity ids
    #[serde(default)]
    pub selection: Option<Vec<String>>,
}

/// A session participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// User identifier
    pub id: UserId,
    /// Display name
    pub name: String,
    /// Role within the project
    pub role: Role,
    /// Effective permissions
    pub permissions: PermissionSet,
    /// Liveness and UI state
    pub presence: Presence,
}

impl User {
    /// Build a participant from an authenticated profile.
    #[must_use]
    pub fn from_profile(profile: UserProfile, is_project_owner: bool, now_ms: u64) -> Self {
        Self {
            permissions: PermissionSet::for_role(profile.role, is_project_owner),
            id: profile.id,
            name: profile.name,
            role: profile.role,
            presence: Presence {
                online: true,
                last_seen_ms: now_ms,
                cursor: None,
                selection: None,
            },
        }
    }

    /// Check a permission.
    #[must_use]
    pub fn can(&self, permission: Permission) -> bool {
        self.permissions.contains(permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_permissions() {
        let editor = PermissionSet::for_role(Role::Editor, false);
        assert!(editor.contains(Permission::Edit));
        assert!(editor.contains(Permission::Lock));
        assert!(!editor.contains(Permission::ManageUsers));

        let viewer = PermissionSet::for_role(Role::Viewer, false);
        assert!(viewer.contains(Permission::Comment));
        assert!(!viewer.contains(Permission::Edit));

        let guest = PermissionSet::for_role(Role::Guest, false);
        assert_eq!(guest.iter().collect::<Vec<_>>(), vec![Permission::View]);
    }

    #[test]
    fn project_owner_overrides_role() {
        let owner_as_guest = PermissionSet::for_role(Role::Guest, true);
        assert_eq!(owner_as_guest, PermissionSet::all());
    }

    #[test]
    fn entity_key_display() {
        assert_eq!(EntityKey::component("C1").to_string(), "component:C1");
        assert_eq!(
            EntityKey::new(EntityType::Bom, "main").to_string(),
            "bom:main"
        );
    }

    #[test]
    fn entity_type_wire_names() {
        let json = serde_json::to_string(&EntityType::Bom).unwrap();
        assert_eq!(json, "\"bom\"");
        let perm: Permission = serde_json::from_str("\"resolve_conflicts\"").unwrap();
        assert_eq!(perm, Permission::ResolveConflicts);
    }
}
