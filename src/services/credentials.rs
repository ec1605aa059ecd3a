use std::sync::Arc;

use zeroize::Zeroizing;

use crate::{
    crypto::password::{self, PasswordParams},
    error::{AppError, Result},
    models::user::User,
    repositories::user::UserStore,
};

/// Fixed input for the dummy hash. Never a real secret.
const DUMMY_SECRET: &str = "gatehouse-timing-equalisation";

/// A user whose secret matched.
#[derive(Debug, Clone)]
pub struct VerifiedCredentials {
    pub user: User,
    pub second_factor_required: bool,
}

/// Checks an identifier and secret against stored Argon2id hashes.
#[derive(Clone)]
pub struct CredentialVerifier {
    users: Arc<dyn UserStore>,
    params: PasswordParams,
    dummy_hash: Arc<str>,
}

impl CredentialVerifier {
    pub fn new(users: Arc<dyn UserStore>, params: PasswordParams) -> Result<Self> {
        let dummy_hash = password::hash_password(DUMMY_SECRET, &params)?;
        Ok(Self {
            users,
            params,
            dummy_hash: dummy_hash.into(),
        })
    }

    /// Looks up `identifier` (username or email) and checks `secret`.
    ///
    /// Unknown identifiers still pay for one Argon2id verification, and every
    /// mismatch returns [`AppError::InvalidCredentials`].
    pub async fn verify(&self, identifier: &str, secret: &str) -> Result<VerifiedCredentials> {
        let user = self.users.find_by_identifier(identifier.trim()).await?;

        let Some(user) = user else {
            self.burn(secret).await;
            tracing::info!("Login failed: unknown identifier");
            return Err(AppError::InvalidCredentials);
        };

        if !self.verify_user_secret(&user, secret).await? {
            tracing::info!("Login failed: wrong secret for user {}", user.id);
            return Err(AppError::InvalidCredentials);
        }

        tracing::debug!("Credentials verified for user {}", user.id);
        Ok(VerifiedCredentials {
            second_factor_required: user.second_factor_enabled(),
            user,
        })
    }

    /// Checks `secret` against `user`'s stored hash.
    ///
    /// Accounts without a password (federated only) never match. A hash that
    /// cannot be parsed is logged and treated as a mismatch.
    pub async fn verify_user_secret(&self, user: &User, secret: &str) -> Result<bool> {
        let Some(hash) = user.password_hash.clone() else {
            self.burn(secret).await;
            tracing::debug!("User {} has no password set", user.id);
            return Ok(false);
        };

        match password::verify_password_blocking(Zeroizing::new(secret.to_string()), hash).await {
            Ok(matched) => Ok(matched),
            Err(AppError::Encryption(e)) => {
                tracing::error!("Stored hash for user {} is unusable: {}", user.id, e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Hashes a new secret with the configured parameters.
    pub async fn hash_secret(&self, secret: &str) -> Result<String> {
        password::hash_password_blocking(Zeroizing::new(secret.to_string()), self.params).await
    }

    async fn burn(&self, secret: &str) {
        let _ = password::verify_password_blocking(
            Zeroizing::new(secret.to_string()),
            self.dummy_hash.to_string(),
        )
        .await;
    }
}
