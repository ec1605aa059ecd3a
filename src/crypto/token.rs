use std::fmt;

use base64::{Engine as _, engine::general_purpose};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// The size of an opaque token in bytes.
pub const TOKEN_SIZE: usize = 32;

/// A random bearer capability: session tokens and challenge references.
///
/// Carries no claims. The value is only ever compared through its digest.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct OpaqueToken(String);

impl OpaqueToken {
    /// Generates a new token from the OS random number generator.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_SIZE];
        OsRng.fill_bytes(&mut bytes);
        let token = general_purpose::URL_SAFE_NO_PAD.encode(bytes);
        bytes.zeroize();
        Self(token)
    }

    /// Accepts only well-formed tokens: URL-safe base64 of exactly
    /// [`TOKEN_SIZE`] bytes.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let mut decoded = general_purpose::URL_SAFE_NO_PAD.decode(value).ok()?;
        let well_formed = decoded.len() == TOKEN_SIZE;
        decoded.zeroize();
        well_formed.then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex SHA-256 of the token, used as the storage key.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Debug for OpaqueToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OpaqueToken(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_parse_and_differ() {
        let a = OpaqueToken::generate();
        let b = OpaqueToken::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 43);
        assert_eq!(OpaqueToken::parse(a.as_str()), Some(a));
    }

    #[test]
    fn parse_rejects_malformed_values() {
        assert!(OpaqueToken::parse("").is_none());
        assert!(OpaqueToken::parse("not a token").is_none());
        assert!(OpaqueToken::parse("c2hvcnQ").is_none());
        assert!(OpaqueToken::parse("550e8400-e29b-41d4-a716-446655440000").is_none());
    }

    #[test]
    fn digest_is_stable_and_hides_the_token() {
        let token = OpaqueToken::generate();
        assert_eq!(token.digest(), token.clone().digest());
        assert_eq!(token.digest().len(), 64);
        assert!(!token.digest().contains(token.as_str()));
        assert_eq!(format!("{:?}", token), "OpaqueToken(..)");
    }
}
