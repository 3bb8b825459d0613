//! Actor roles and what they may do.
//!
//! Roles are flat: each carries its own capability set and there is no
//! inheritance between them.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Unknown actor.
    Anonymous,
    /// Registered viewer of one or more groups.
    Member,
    /// Manages thresholds for their groups.
    Admin,
    /// Full access; exempt from rate limiting and blocking.
    Privileged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ViewStatus,
    ViewReadings,
    ManageThresholds,
    ViewSecurity,
    ManageBlocks,
}

impl Role {
    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            Role::Anonymous => &[],
            Role::Member => &[Capability::ViewStatus, Capability::ViewReadings],
            Role::Admin => &[
                Capability::ViewStatus,
                Capability::ViewReadings,
                Capability::ManageThresholds,
            ],
            Role::Privileged => &[
                Capability::ViewStatus,
                Capability::ViewReadings,
                Capability::ManageThresholds,
                Capability::ViewSecurity,
                Capability::ManageBlocks,
            ],
        }
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Anonymous => "anonymous",
            Role::Member => "member",
            Role::Admin => "admin",
            Role::Privileged => "privileged",
        }
    }
}

/// An actor as seen by the security layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActorIdentity {
    pub id: i64,
    pub role: Role,
}

impl ActorIdentity {
    pub fn new(id: i64, role: Role) -> Self {
        Self { id, role }
    }

    pub fn is_privileged(&self) -> bool {
        self.role == Role::Privileged
    }
}

/// Which sensor groups an actor may see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupAccess {
    All,
    Only(Vec<String>),
    Denied,
}

impl GroupAccess {
    pub fn permits(&self, group: &str) -> bool {
        match self {
            GroupAccess::All => true,
            GroupAccess::Only(groups) => groups.iter().any(|g| g == group),
            GroupAccess::Denied => false,
        }
    }
}

/// Role assignments loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct RoleDirectory {
    privileged: HashSet<i64>,
    admins: HashMap<i64, Vec<String>>,
    members: HashMap<i64, Vec<String>>,
}

impl RoleDirectory {
    pub fn new(
        privileged: impl IntoIterator<Item = i64>,
        admins: HashMap<i64, Vec<String>>,
        members: HashMap<i64, Vec<String>>,
    ) -> Self {
        Self {
            privileged: privileged.into_iter().collect(),
            admins,
            members,
        }
    }

    pub fn role_of(&self, actor: i64) -> Role {
        if self.privileged.contains(&actor) {
            Role::Privileged
        } else if self.admins.contains_key(&actor) {
            Role::Admin
        } else if self.members.contains_key(&actor) {
            Role::Member
        } else {
            Role::Anonymous
        }
    }

    pub fn resolve(&self, actor: i64) -> ActorIdentity {
        ActorIdentity::new(actor, self.role_of(actor))
    }

    pub fn group_access(&self, actor: i64) -> GroupAccess {
        match self.role_of(actor) {
            Role::Privileged => GroupAccess::All,
            Role::Admin => GroupAccess::Only(self.admins.get(&actor).cloned().unwrap_or_default()),
            Role::Member => GroupAccess::Only(self.members.get(&actor).cloned().unwrap_or_default()),
            Role::Anonymous => GroupAccess::Denied,
        }
    }

    pub fn privileged_count(&self) -> usize {
        self.privileged.len()
    }

    pub fn admin_count(&self) -> usize {
        self.admins.len()
    }
}
