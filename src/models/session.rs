use std::net::IpAddr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Represents a user session.
///
/// `id` is the hex SHA-256 digest of the token held in the client's cookie;
/// the raw token is never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Digest of the session token.
    pub id: String,
    /// The ID of the user this session belongs to.
    pub user_id: Uuid,
    /// The timestamp when the session was created.
    pub created_at: DateTime<Utc>,
    /// The timestamp when the session expires. Fixed at issuance.
    pub expires_at: DateTime<Utc>,
    /// The last time the session was validated.
    pub last_accessed_at: DateTime<Utc>,
    /// Client address at issuance.
    pub client_ip: Option<String>,
    /// Client user agent at issuance.
    pub user_agent: Option<String>,
}

impl Session {
    /// A session is usable strictly before its expiry.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// What is known about the caller when a session is issued.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
}
