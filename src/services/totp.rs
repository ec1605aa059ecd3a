use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use crate::{
    clock::Clock,
    crypto::{
        aes::{self, SecureKey},
        token::OpaqueToken,
    },
    error::{AppError, Result},
    models::{
        challenge::{PendingAuthentication, PendingEnrollment},
        user::User,
    },
    repositories::challenge::ChallengeStore,
};

/// Digits per code.
const DIGITS: usize = 6;
/// Seconds per time step.
const STEP_SECS: u64 = 30;
/// Steps accepted either side of the current one.
const SKEW: u8 = 1;

#[derive(Debug, Clone)]
pub struct TotpSettings {
    /// Issuer label shown in authenticator apps.
    pub issuer: String,
    /// How long a pending login or enrollment stays usable.
    pub challenge_ttl: Duration,
}

/// A pending login and the reference handed to the client for it.
#[derive(Debug)]
pub struct IssuedChallenge {
    pub reference: OpaqueToken,
    pub pending: PendingAuthentication,
}

/// What a user needs to register a new secret in an authenticator app.
#[derive(Debug, Serialize)]
pub struct EnrollmentOffer {
    pub secret_base32: String,
    pub otpauth_url: String,
    pub expires_at: DateTime<Utc>,
}

/// Second-factor challenge flow over RFC 6238 codes.
///
/// Secrets are sealed with the master key and bound to the owning user id.
/// A `(user, time step)` pair is accepted at most once.
#[derive(Clone)]
pub struct TotpChallenge {
    store: Arc<dyn ChallengeStore>,
    clock: Arc<dyn Clock>,
    key: Arc<SecureKey>,
    settings: TotpSettings,
}

impl TotpChallenge {
    pub fn new(
        store: Arc<dyn ChallengeStore>,
        clock: Arc<dyn Clock>,
        key: Arc<SecureKey>,
        settings: TotpSettings,
    ) -> Self {
        Self {
            store,
            clock,
            key,
            settings,
        }
    }

    fn ttl(&self) -> std::time::Duration {
        self.settings
            .challenge_ttl
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(300))
    }

    /// Opens a pending login for a user whose password already verified.
    pub async fn begin(&self, user_id: Uuid) -> Result<IssuedChallenge> {
        let reference = OpaqueToken::generate();
        let now = self.clock.now();
        let pending = PendingAuthentication {
            id: reference.digest(),
            user_id,
            created_at: now,
            expires_at: now + self.settings.challenge_ttl,
        };
        self.store.insert_pending(&pending, self.ttl()).await?;
        tracing::info!("🔐 Second factor required for user {}", user_id);
        Ok(IssuedChallenge { reference, pending })
    }

    /// Looks up a pending login.
    ///
    /// Gone and past-expiry both yield [`AppError::ChallengeExpired`]: the
    /// caller has to sign in again either way.
    pub async fn load(&self, reference: &OpaqueToken) -> Result<PendingAuthentication> {
        let id = reference.digest();
        let Some(pending) = self.store.find_pending(&id).await? else {
            tracing::debug!("Challenge not found");
            return Err(AppError::ChallengeExpired);
        };

        if pending.is_expired_at(self.clock.now()) {
            tracing::debug!("Challenge for user {} expired", pending.user_id);
            if let Err(e) = self.store.delete_pending(&id).await {
                tracing::warn!("Failed to delete expired challenge: {}", e);
            }
            return Err(AppError::ChallengeExpired);
        }
        Ok(pending)
    }

    /// Consumes a pending login after its code verified.
    ///
    /// Only one caller can win the delete, so a concurrent submission of the
    /// same challenge sees [`AppError::ChallengeExpired`].
    pub async fn complete(&self, pending: &PendingAuthentication) -> Result<()> {
        if !self.store.delete_pending(&pending.id).await? {
            tracing::warn!("Challenge for user {} was already consumed", pending.user_id);
            return Err(AppError::ChallengeExpired);
        }
        Ok(())
    }

    /// Checks `code` against the user's enrolled secret and records the
    /// matching time step so the same code cannot be used twice.
    pub async fn verify_code(&self, user: &User, code: &str) -> Result<()> {
        let Some(sealed) = user.totp_secret.as_deref() else {
            tracing::warn!("User {} has no second factor enrolled", user.id);
            return Err(AppError::ChallengeCodeInvalid);
        };
        let secret = self.open_secret(user.id, sealed)?;
        self.accept(user.id, &secret, code).await
    }

    /// Starts enrollment with a fresh secret. Replaces any earlier offer.
    pub async fn begin_enrollment(&self, user: &User) -> Result<EnrollmentOffer> {
        let secret = Secret::generate_secret()
            .to_bytes()
            .map_err(|e| AppError::Internal(format!("Secret generation failed: {}", e)))?;
        let totp = self.totp(secret.clone(), &user.email)?;

        let expires_at = self.clock.now() + self.settings.challenge_ttl;
        let enrollment = PendingEnrollment {
            user_id: user.id,
            sealed_secret: aes::seal(&self.key, user.id.as_bytes(), &secret)?,
            expires_at,
        };
        self.store.put_enrollment(&enrollment, self.ttl()).await?;

        tracing::info!("📱 TOTP enrollment started for user {}", user.id);
        Ok(EnrollmentOffer {
            secret_base32: totp.get_secret_base32(),
            otpauth_url: totp.get_url(),
            expires_at,
        })
    }

    /// Finishes enrollment with the first valid code.
    ///
    /// Returns the sealed secret to persist on the user record.
    pub async fn confirm_enrollment(&self, user: &User, code: &str) -> Result<Vec<u8>> {
        let Some(enrollment) = self.store.find_enrollment(user.id).await? else {
            return Err(AppError::ChallengeExpired);
        };
        if self.clock.now() >= enrollment.expires_at {
            self.store.delete_enrollment(user.id).await?;
            return Err(AppError::ChallengeExpired);
        }

        let secret = self.open_secret(user.id, &enrollment.sealed_secret)?;
        self.accept(user.id, &secret, code).await?;
        self.store.delete_enrollment(user.id).await?;

        tracing::info!("✅ TOTP enrolled for user {}", user.id);
        Ok(enrollment.sealed_secret)
    }

    fn open_secret(&self, user_id: Uuid, sealed: &[u8]) -> Result<Vec<u8>> {
        aes::open(&self.key, user_id.as_bytes(), sealed)
    }

    fn totp(&self, secret: Vec<u8>, account: &str) -> Result<TOTP> {
        TOTP::new(
            Algorithm::SHA1,
            DIGITS,
            SKEW,
            STEP_SECS,
            secret,
            Some(self.settings.issuer.clone()),
            account.to_string(),
        )
        .map_err(|e| AppError::Internal(format!("TOTP init error: {}", e)))
    }

    async fn accept(&self, user_id: Uuid, secret: &[u8], code: &str) -> Result<()> {
        let code = code.trim();
        if code.len() != DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
            tracing::debug!("Malformed code from user {}", user_id);
            return Err(AppError::ChallengeCodeInvalid);
        }

        let totp = self.totp(secret.to_vec(), "user")?;
        let now = self.clock.now().timestamp().max(0) as u64;
        let Some(step) = matching_step(&totp, code, now) else {
            tracing::info!("Wrong second-factor code from user {}", user_id);
            return Err(AppError::ChallengeCodeInvalid);
        };

        let replay_ttl = std::time::Duration::from_secs(STEP_SECS * (2 * u64::from(SKEW) + 2));
        if !self.store.consume_time_step(user_id, step, replay_ttl).await? {
            tracing::warn!("Replayed second-factor code from user {}", user_id);
            return Err(AppError::ChallengeCodeInvalid);
        }
        Ok(())
    }
}

/// Returns the time step whose code equals `code`, checking the current step
/// and [`SKEW`] steps either side. Every candidate is compared.
fn matching_step(totp: &TOTP, code: &str, now: u64) -> Option<u64> {
    let current = now / STEP_SECS;
    let skew = u64::from(SKEW);
    let mut found = None;
    for step in current.saturating_sub(skew)..=current + skew {
        let candidate = totp.generate(step * STEP_SECS);
        if bool::from(candidate.as_bytes().ct_eq(code.as_bytes())) && found.is_none() {
            found = Some(step);
        }
    }
    found
}
