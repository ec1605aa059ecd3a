use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State between a verified password and a verified one-time code.
///
/// Holding one grants nothing; it can only be traded, together with a valid
/// code, for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAuthentication {
    /// Digest of the challenge reference handed to the client.
    pub id: String,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingAuthentication {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A freshly generated TOTP secret waiting for its first valid code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEnrollment {
    pub user_id: Uuid,
    /// Sealed secret (nonce || ciphertext).
    pub sealed_secret: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}
