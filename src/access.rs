
use serde::Serialize;

use crate::error::SyndicError;
use crate::model::{Role, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Permissions {
    pub can_view: bool,
    pub can_modify: bool,
    pub can_manage_users: bool,
}

impl Permissions {
    pub const NONE: Self = Self {
        can_view: false,
        can_modify: false,
        can_manage_users: false,
    };

    /// While the profile is still loading: view only.
    pub const PENDING: Self = Self {
        can_view: true,
        can_modify: false,
        can_manage_users: false,
    };

    pub fn for_role(role: Role) -> Self {
        Self {
            can_view: true,
            can_modify: matches!(role, Role::Editor | Role::Admin),
            can_manage_users: role == Role::Admin,
        }
    }

    pub fn allows(self, requirement: Requirement) -> bool {
        match requirement {
            Requirement::View => self.can_view,
            Requirement::Modify => self.can_modify,
            Requirement::ManageUsers => self.can_manage_users,
        }
    }

    /// Turns a missing capability into a [`SyndicError::PermissionDenied`].
    pub fn require(self, requirement: Requirement) -> Result<(), SyndicError> {
        if self.allows(requirement) {
            Ok(())
        } else {
            Err(SyndicError::PermissionDenied(requirement.denial()))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    View,
    Modify,
    ManageUsers,
}

impl Requirement {
    fn denial(self) -> &'static str {
        match self {
            Self::View => "sign in to view building data",
            Self::Modify => "editor or admin role required",
            Self::ManageUsers => "admin role required",
        }
    }
}

/// What to do with an action the user is not allowed to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DenyPolicy {
    #[default]
    Disable,
    Hide,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ActionState {
    Enabled,
    Disabled { reason: String },
    Hidden,
}

pub fn evaluate(permissions: Permissions, requirement: Requirement, policy: DenyPolicy) -> ActionState {
    if permissions.allows(requirement) {
        return ActionState::Enabled;
    }
    match policy {
        DenyPolicy::Hide => ActionState::Hidden,
        DenyPolicy::Disable => ActionState::Disabled {
            reason: "You do not have permission to perform this action".to_string(),
        },
    }
}

/// Admins may not demote or delete themselves.
pub fn ensure_not_self(actor: &UserId, target: &UserId, action: &'static str) -> Result<(), SyndicError> {
    if actor == target {
        return Err(SyndicError::SelfAction(action));
    }
    Ok(())
}
