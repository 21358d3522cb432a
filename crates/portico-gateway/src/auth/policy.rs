//! Static authorization policy.
//!
//! Pure functions over an [`Identity`]; no storage, no composition of
//! requirements.

use portico_core::{Permission, Requirement, Role};

use super::jwt::Identity;

/// Outcome of a policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Access granted.
    Allow,
    /// Access refused.
    Deny,
}

impl Decision {
    /// Whether access was granted.
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allow)
    }

    const fn from_bool(allowed: bool) -> Self {
        if allowed { Self::Allow } else { Self::Deny }
    }
}

/// Whether `role` is granted `permission`.
#[must_use]
pub const fn role_grants(role: Role, permission: Permission) -> bool {
    match role {
        Role::Director => true,
        Role::Administrator => match permission {
            Permission::ManageUsers
            | Permission::ViewReports
            | Permission::ManageSystem
            | Permission::ViewDirectory => true,
            Permission::ManageDepartments => false,
        },
        Role::Employee => match permission {
            Permission::ViewDirectory => true,
            Permission::ManageUsers
            | Permission::ViewReports
            | Permission::ManageSystem
            | Permission::ManageDepartments => false,
        },
    }
}

/// Decide whether `identity` satisfies `requirement`.
///
/// Directors satisfy every requirement.
#[must_use]
pub fn check(identity: &Identity, requirement: Requirement) -> Decision {
    if identity.role.is_director() {
        return Decision::Allow;
    }
    Decision::from_bool(match requirement {
        Requirement::Role(role) => identity.role == role,
        Requirement::Department(department) => identity.department == department,
        Requirement::Permission(permission) => role_grants(identity.role, permission),
    })
}
