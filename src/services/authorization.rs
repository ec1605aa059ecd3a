use crate::{error::AppError, models::user::Role};

/// Why an operation was refused. Logged, never returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The user has no recognised role.
    MissingRole,
    /// The role is valid but not in the required set.
    RoleNotPermitted,
    /// The client address is outside every trusted subnet.
    OutsideTrustedNetwork,
    /// No client address could be resolved.
    ClientAddressUnknown,
}

/// Outcome of an access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationDecision {
    Allow,
    Deny(DenyReason),
}

impl AuthorizationDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, AuthorizationDecision::Allow)
    }

    /// Both checks must allow. The first denial wins.
    pub fn and(self, other: AuthorizationDecision) -> AuthorizationDecision {
        match self {
            AuthorizationDecision::Allow => other,
            deny => deny,
        }
    }

    /// Collapses any denial to [`AppError::Forbidden`], logging the reason.
    pub fn into_result(self) -> Result<(), AppError> {
        match self {
            AuthorizationDecision::Allow => Ok(()),
            AuthorizationDecision::Deny(reason) => {
                tracing::warn!(?reason, "Access denied");
                Err(AppError::Forbidden)
            }
        }
    }
}

/// Checks a resolved role against the set of roles an operation accepts.
///
/// Exact membership only: there is no role hierarchy, and a missing role is
/// never treated as any default.
pub fn authorize_role(role: Option<Role>, required: &[Role]) -> AuthorizationDecision {
    match role {
        None => AuthorizationDecision::Deny(DenyReason::MissingRole),
        Some(role) if required.contains(&role) => AuthorizationDecision::Allow,
        Some(_) => AuthorizationDecision::Deny(DenyReason::RoleNotPermitted),
    }
}
