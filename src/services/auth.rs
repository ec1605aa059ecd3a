use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::{
    clock::Clock,
    crypto::{aes::SecureKey, password::PasswordParams, token::OpaqueToken},
    error::{AppError, Result},
    models::{
        session::ClientContext,
        user::{Role, User},
    },
    repositories::{
        attempts::AttemptStore, challenge::ChallengeStore, session::SessionStore,
        user::UserStore,
    },
    services::{
        credentials::CredentialVerifier,
        federation::{self, IdentityProvider},
        sessions::{IssuedSession, SessionManager},
        totp::{EnrollmentOffer, IssuedChallenge, TotpChallenge, TotpSettings},
    },
};

/// Which account flags must be set before a verified user may sign in.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoginPolicy {
    pub require_email_verified: bool,
    pub require_approval: bool,
}

/// Failure budgets per key within a sliding window.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    pub window: Duration,
    pub login_max_failures: u32,
    pub challenge_max_failures: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(900),
            login_max_failures: 5,
            challenge_max_failures: 3,
        }
    }
}

/// The storage collaborators the service runs against.
#[derive(Clone)]
pub struct AuthStores {
    pub users: Arc<dyn UserStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub challenges: Arc<dyn ChallengeStore>,
    pub attempts: Arc<dyn AttemptStore>,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub session_lifetime: chrono::Duration,
    pub password: PasswordParams,
    pub totp: TotpSettings,
    pub policy: LoginPolicy,
    pub limits: RateLimitSettings,
}

/// Result of a successful first step.
#[derive(Debug)]
pub enum LoginOutcome {
    /// No second factor: the session is live.
    Authenticated { user: User, issued: IssuedSession },
    /// A code is still needed. Nothing has been granted yet.
    ChallengeRequired(IssuedChallenge),
}

/// Drives the login flow and the account operations around it.
#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserStore>,
    attempts: Arc<dyn AttemptStore>,
    clock: Arc<dyn Clock>,
    credentials: CredentialVerifier,
    totp: TotpChallenge,
    sessions: SessionManager,
    identity_provider: Option<Arc<dyn IdentityProvider>>,
    policy: LoginPolicy,
    limits: RateLimitSettings,
}

impl AuthService {
    pub fn new(
        stores: AuthStores,
        clock: Arc<dyn Clock>,
        master_key: Arc<SecureKey>,
        settings: AuthSettings,
    ) -> Result<Self> {
        let credentials = CredentialVerifier::new(stores.users.clone(), settings.password)?;
        let totp = TotpChallenge::new(
            stores.challenges.clone(),
            clock.clone(),
            master_key,
            settings.totp,
        );
        let sessions = SessionManager::new(
            stores.sessions.clone(),
            stores.users.clone(),
            clock.clone(),
            settings.session_lifetime,
        );

        Ok(Self {
            users: stores.users,
            attempts: stores.attempts,
            clock,
            credentials,
            totp,
            sessions,
            identity_provider: None,
            policy: settings.policy,
            limits: settings.limits,
        })
    }

    pub fn with_identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity_provider = Some(provider);
        self
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// First login step: identifier and secret.
    ///
    /// # Arguments
    ///
    /// * `identifier` - Username or email.
    /// * `secret` - The plaintext password.
    /// * `client` - Caller details recorded on the session.
    ///
    /// # Returns
    ///
    /// A live session, or a pending challenge when the user has a second factor.
    pub async fn login(
        &self,
        identifier: &str,
        secret: &str,
        client: &ClientContext,
    ) -> Result<LoginOutcome> {
        let key = format!("login:{}", identifier.trim().to_lowercase());
        let verified = self
            .guarded(
                &key,
                self.limits.login_max_failures,
                self.credentials.verify(identifier, secret),
            )
            .await?;
        self.finish_primary(verified.user, client).await
    }

    /// Second login step: trades a challenge reference and a valid code for a session.
    ///
    /// A wrong code leaves the challenge usable until it expires; failures
    /// count against the user's challenge budget.
    pub async fn submit_second_factor(
        &self,
        reference: &OpaqueToken,
        code: &str,
        client: &ClientContext,
    ) -> Result<(User, IssuedSession)> {
        let pending = self.totp.load(reference).await?;

        let Some(user) = self.users.find_by_id(pending.user_id).await? else {
            tracing::warn!("Challenge references missing user {}", pending.user_id);
            self.totp.complete(&pending).await?;
            return Err(AppError::ChallengeExpired);
        };

        let key = format!("totp:{}", user.id);
        self.guarded(
            &key,
            self.limits.challenge_max_failures,
            self.totp.verify_code(&user, code),
        )
        .await?;

        self.totp.complete(&pending).await?;
        let issued = self.issue(&user, client).await?;
        Ok((user, issued))
    }

    /// Login through an external identity provider.
    ///
    /// Answers [`AppError::NotFound`] when no provider is configured.
    pub async fn federated_login(
        &self,
        assertion: &str,
        client: &ClientContext,
    ) -> Result<LoginOutcome> {
        let provider = self.identity_provider.as_ref().ok_or(AppError::NotFound)?;
        let identity = provider.exchange(assertion).await?;
        let user = federation::resolve_local_user(&self.users, &self.clock, &identity).await?;
        self.finish_primary(user, client).await
    }

    /// Replaces the user's password, revokes all their sessions and returns a fresh one.
    pub async fn change_password(
        &self,
        user: &User,
        current_secret: &str,
        new_secret: &str,
        client: &ClientContext,
    ) -> Result<IssuedSession> {
        let key = format!("password:{}", user.id);
        self.guarded(&key, self.limits.login_max_failures, async {
            if self.credentials.verify_user_secret(user, current_secret).await? {
                Ok(())
            } else {
                tracing::info!("Password change rejected for user {}: wrong secret", user.id);
                Err(AppError::InvalidCredentials)
            }
        })
        .await?;

        let hash = self.credentials.hash_secret(new_secret).await?;

        // Old sessions go first: a failed revocation must leave the old password in place.
        self.sessions.revoke_all(user.id).await?;
        self.users
            .update_password(user.id, &hash, self.clock.now())
            .await?;
        tracing::info!("🔑 Password changed for user {}", user.id);

        self.sessions.create(user.id, client).await
    }

    pub async fn begin_totp_enrollment(&self, user: &User) -> Result<EnrollmentOffer> {
        if user.second_factor_enabled() {
            return Err(AppError::Validation(
                "Second factor is already enabled".to_string(),
            ));
        }
        self.totp.begin_enrollment(user).await
    }

    pub async fn confirm_totp_enrollment(&self, user: &User, code: &str) -> Result<()> {
        let key = format!("totp:{}", user.id);
        let sealed = self
            .guarded(
                &key,
                self.limits.challenge_max_failures,
                self.totp.confirm_enrollment(user, code),
            )
            .await?;
        self.users
            .update_totp_secret(user.id, Some(sealed), self.clock.now())
            .await?;
        Ok(())
    }

    /// Turns the second factor off. Requires a current code.
    pub async fn disable_totp(&self, user: &User, code: &str) -> Result<()> {
        if !user.second_factor_enabled() {
            return Err(AppError::Validation(
                "Second factor is not enabled".to_string(),
            ));
        }
        let key = format!("totp:{}", user.id);
        self.guarded(
            &key,
            self.limits.challenge_max_failures,
            self.totp.verify_code(user, code),
        )
        .await?;
        self.users
            .update_totp_secret(user.id, None, self.clock.now())
            .await?;
        tracing::info!("📴 Second factor disabled for user {}", user.id);
        Ok(())
    }

    /// Revokes every session of another user.
    pub async fn revoke_user_sessions(&self, user_id: Uuid) -> Result<u64> {
        if self.users.find_by_id(user_id).await?.is_none() {
            return Err(AppError::NotFound);
        }
        self.sessions.revoke_all(user_id).await
    }

    pub async fn set_role(&self, user_id: Uuid, role: Role) -> Result<()> {
        if !self.users.update_role(user_id, role, self.clock.now()).await? {
            return Err(AppError::NotFound);
        }
        tracing::info!("👤 Role of user {} set to {}", user_id, role);
        Ok(())
    }

    async fn finish_primary(&self, user: User, client: &ClientContext) -> Result<LoginOutcome> {
        self.check_eligibility(&user)?;

        if user.second_factor_enabled() {
            let challenge = self.totp.begin(user.id).await?;
            return Ok(LoginOutcome::ChallengeRequired(challenge));
        }

        let issued = self.issue(&user, client).await?;
        Ok(LoginOutcome::Authenticated { user, issued })
    }

    fn check_eligibility(&self, user: &User) -> Result<()> {
        if self.policy.require_email_verified && !user.email_verified {
            tracing::info!("Login blocked for user {}: email not verified", user.id);
            return Err(AppError::AccountRestricted);
        }
        if self.policy.require_approval && !user.approved {
            tracing::info!("Login blocked for user {}: not approved", user.id);
            return Err(AppError::AccountRestricted);
        }
        Ok(())
    }

    async fn issue(&self, user: &User, client: &ClientContext) -> Result<IssuedSession> {
        let issued = self.sessions.create(user.id, client).await?;
        if let Err(e) = self.users.touch_last_active(user.id, self.clock.now()).await {
            tracing::warn!("Failed to record activity for user {}: {}", user.id, e);
        }
        tracing::info!("✅ User logged in: {}", user.id);
        Ok(issued)
    }

    /// Runs `attempt` under the failure budget for `key`.
    ///
    /// A slot is reserved atomically before `attempt` is polled, so at most
    /// `max_failures` attempts can be in flight or failed within the window.
    /// Past that, [`AppError::RateLimited`] is returned without running the
    /// check. A credential or code failure keeps its slot, a success resets
    /// the counter, and any other outcome hands the slot back.
    async fn guarded<T>(
        &self,
        key: &str,
        max_failures: u32,
        attempt: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let count = self.attempts.reserve(key, self.limits.window).await?;
        if count > max_failures {
            tracing::warn!("Rate limit hit for {} ({} attempts)", key, count);
            self.give_back(key).await;
            return Err(AppError::RateLimited);
        }

        match attempt.await {
            Ok(value) => {
                if let Err(e) = self.attempts.clear(key).await {
                    tracing::warn!("Failed to reset attempts for {}: {}", key, e);
                }
                Ok(value)
            }
            Err(e @ (AppError::InvalidCredentials | AppError::ChallengeCodeInvalid)) => {
                tracing::debug!("Failure {} recorded for {}", count, key);
                Err(e)
            }
            Err(e) => {
                self.give_back(key).await;
                Err(e)
            }
        }
    }

    async fn give_back(&self, key: &str) {
        if let Err(e) = self.attempts.release(key).await {
            tracing::warn!("Failed to release attempt slot for {}: {}", key, e);
        }
    }
}
