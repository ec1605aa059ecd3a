use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of roles a user can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Admin,
}

impl Role {
    /// Returns the stored representation of the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Admin => "admin",
        }
    }

    /// Parses a stored role. Matching is case-insensitive and exact; anything
    /// else yields `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "member" => Some(Role::Member),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a user in the system.
#[derive(Clone)]
pub struct User {
    /// The unique identifier for the user.
    pub id: Uuid,
    /// The user's username.
    pub username: String,
    /// The user's email address, stored lowercase.
    pub email: String,
    /// The name shown to other users.
    pub display_name: String,
    /// `None` when the stored role is missing or not one of [`Role`].
    pub role: Option<Role>,
    /// Argon2id PHC string. Federated accounts may have none.
    pub password_hash: Option<String>,
    /// Sealed TOTP secret (nonce || ciphertext). Present iff the second factor is on.
    pub totp_secret: Option<Vec<u8>>,
    /// Subject identifier at the external identity provider.
    pub external_id: Option<String>,
    /// Whether the email address has been verified.
    pub email_verified: bool,
    /// Whether an administrator approved the account.
    pub approved: bool,
    /// The timestamp when the user was created.
    pub created_at: DateTime<Utc>,
    /// The timestamp when the user was last updated.
    pub updated_at: DateTime<Utc>,
    /// The last time the user signed in.
    pub last_active_at: Option<DateTime<Utc>>,
}

impl User {
    /// Whether login must pass a TOTP challenge.
    pub fn second_factor_enabled(&self) -> bool {
        self.totp_secret.is_some()
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("role", &self.role)
            .field("second_factor", &self.second_factor_enabled())
            .field("email_verified", &self.email_verified)
            .field("approved", &self.approved)
            .finish_non_exhaustive()
    }
}

/// The fields needed to create a user.
#[derive(Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub display_name: String,
    pub role: Role,
    pub password_hash: Option<String>,
    pub external_id: Option<String>,
    pub email_verified: bool,
    pub approved: bool,
}
