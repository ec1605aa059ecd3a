use std::sync::Arc;

use chrono::Duration;
use uuid::Uuid;

use crate::{
    clock::Clock,
    crypto::token::OpaqueToken,
    error::{AppError, Result, StoreError},
    models::{
        session::{ClientContext, Session},
        user::User,
    },
    repositories::{session::SessionStore, user::UserStore},
};

/// How many fresh tokens to try before giving up on a colliding insert.
const MAX_CREATE_ATTEMPTS: usize = 3;

/// A newly created session and the token the client holds for it.
#[derive(Debug)]
pub struct IssuedSession {
    pub token: OpaqueToken,
    pub session: Session,
}

/// Issues, validates and revokes server-side sessions.
///
/// Expiry is absolute: `expires_at` is fixed at issuance from the configured
/// lifetime and validation only refreshes `last_accessed_at`.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    users: Arc<dyn UserStore>,
    clock: Arc<dyn Clock>,
    lifetime: Duration,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        users: Arc<dyn UserStore>,
        clock: Arc<dyn Clock>,
        lifetime: Duration,
    ) -> Self {
        Self {
            store,
            users,
            clock,
            lifetime,
        }
    }

    /// Creates and persists a session for `user_id`.
    ///
    /// Only the token digest is stored. The single insert either commits the
    /// whole record or nothing.
    pub async fn create(&self, user_id: Uuid, client: &ClientContext) -> Result<IssuedSession> {
        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            let token = OpaqueToken::generate();
            let now = self.clock.now();
            let session = Session {
                id: token.digest(),
                user_id,
                created_at: now,
                expires_at: now + self.lifetime,
                last_accessed_at: now,
                client_ip: client.ip.map(|ip| ip.to_string()),
                user_agent: client.user_agent.clone(),
            };

            match self.store.insert(&session).await {
                Ok(()) => {
                    tracing::info!("✅ Session created for user {}", user_id);
                    return Ok(IssuedSession { token, session });
                }
                Err(StoreError::Duplicate(_)) => {
                    tracing::warn!("Session id collision on attempt {}, retrying", attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::Internal(
            "Could not allocate a unique session id".to_string(),
        ))
    }

    /// Resolves a token to its user and session.
    ///
    /// Missing, expired and revoked sessions all come back as
    /// [`AppError::Unauthenticated`]; the distinction is only logged.
    pub async fn validate(&self, token: &OpaqueToken) -> Result<(User, Session)> {
        let id = token.digest();
        let session = match self.store.find(&id).await? {
            Some(session) => session,
            None => {
                tracing::debug!("Session lookup miss");
                return Err(AppError::Unauthenticated);
            }
        };

        let now = self.clock.now();
        if session.is_expired_at(now) {
            tracing::debug!("Session for user {} expired at {}", session.user_id, session.expires_at);
            if let Err(e) = self.store.delete(&id).await {
                tracing::warn!("Failed to delete expired session: {}", e);
            }
            return Err(AppError::Unauthenticated);
        }

        let user = match self.users.find_by_id(session.user_id).await? {
            Some(user) => user,
            None => {
                tracing::warn!("Session references missing user {}", session.user_id);
                self.store.delete(&id).await?;
                return Err(AppError::Unauthenticated);
            }
        };

        self.store.touch(&id, now).await?;
        Ok((
            user,
            Session {
                last_accessed_at: now,
                ..session
            },
        ))
    }

    /// Deletes the session for `token`. Unknown or expired tokens succeed.
    pub async fn revoke(&self, token: &OpaqueToken) -> Result<()> {
        self.store.delete(&token.digest()).await?;
        Ok(())
    }

    /// Deletes every session of `user_id`. Returns how many were removed.
    pub async fn revoke_all(&self, user_id: Uuid) -> Result<u64> {
        let removed = self.store.delete_for_user(user_id).await?;
        tracing::info!("🔒 Revoked {} session(s) for user {}", removed, user_id);
        Ok(removed)
    }

    /// Deletes every session past its expiry.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let removed = self.store.delete_expired(self.clock.now()).await?;
        if removed > 0 {
            tracing::info!("🧹 Swept {} expired session(s)", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        models::user::{NewUser, Role},
        repositories::memory::MemoryStore,
    };
    use chrono::Utc;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        sessions: SessionManager,
        user: User,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let user = UserStore::insert(
            store.as_ref(),
            NewUser {
                username: "ada".to_string(),
                email: "ada@example.com".to_string(),
                display_name: "Ada".to_string(),
                role: Role::Member,
                password_hash: None,
                external_id: None,
                email_verified: true,
                approved: true,
            },
            clock.now(),
        )
        .await
        .unwrap();
        let sessions = SessionManager::new(
            store.clone(),
            store.clone(),
            clock.clone(),
            Duration::hours(1),
        );
        Fixture {
            clock,
            store,
            sessions,
            user,
        }
    }

    #[tokio::test]
    async fn created_session_validates_immediately() {
        let f = fixture().await;
        let issued = f
            .sessions
            .create(f.user.id, &ClientContext::default())
            .await
            .unwrap();

        let (user, session) = f.sessions.validate(&issued.token).await.unwrap();
        assert_eq!(user.id, f.user.id);
        assert_eq!(session.id, issued.session.id);
        assert_ne!(session.id, issued.token.as_str());
    }

    #[tokio::test]
    async fn session_is_invalid_after_lifetime_and_is_deleted() {
        let f = fixture().await;
        let issued = f
            .sessions
            .create(f.user.id, &ClientContext::default())
            .await
            .unwrap();

        f.clock.advance(Duration::minutes(59));
        assert!(f.sessions.validate(&issued.token).await.is_ok());

        f.clock.advance(Duration::minutes(1));
        assert!(matches!(
            f.sessions.validate(&issued.token).await,
            Err(AppError::Unauthenticated)
        ));
        assert_eq!(f.store.session_count(), 0);
    }

    #[tokio::test]
    async fn validation_never_extends_expiry() {
        let f = fixture().await;
        let issued = f
            .sessions
            .create(f.user.id, &ClientContext::default())
            .await
            .unwrap();

        f.clock.advance(Duration::minutes(30));
        let (_, session) = f.sessions.validate(&issued.token).await.unwrap();
        assert_eq!(session.expires_at, issued.session.expires_at);
        assert_eq!(session.last_accessed_at, f.clock.now());
    }

    #[tokio::test]
    async fn revoke_is_idempotent_and_final() {
        let f = fixture().await;
        let issued = f
            .sessions
            .create(f.user.id, &ClientContext::default())
            .await
            .unwrap();

        f.sessions.revoke(&issued.token).await.unwrap();
        f.sessions.revoke(&issued.token).await.unwrap();
        f.sessions.revoke(&OpaqueToken::generate()).await.unwrap();
        assert!(matches!(
            f.sessions.validate(&issued.token).await,
            Err(AppError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn revoking_an_expired_session_succeeds() {
        let f = fixture().await;
        let issued = f
            .sessions
            .create(f.user.id, &ClientContext::default())
            .await
            .unwrap();
        f.clock.advance(Duration::hours(2));

        f.sessions.revoke(&issued.token).await.unwrap();
        assert!(f.sessions.validate(&issued.token).await.is_err());
    }

    #[tokio::test]
    async fn revoke_all_removes_every_session_of_the_user() {
        let f = fixture().await;
        let a = f.sessions.create(f.user.id, &ClientContext::default()).await.unwrap();
        let b = f.sessions.create(f.user.id, &ClientContext::default()).await.unwrap();
        f.sessions
            .create(Uuid::new_v4(), &ClientContext::default())
            .await
            .unwrap();

        assert_eq!(f.sessions.revoke_all(f.user.id).await.unwrap(), 2);
        assert!(f.sessions.validate(&a.token).await.is_err());
        assert!(f.sessions.validate(&b.token).await.is_err());
        assert_eq!(f.store.session_count(), 1);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_sessions() {
        let f = fixture().await;
        f.sessions.create(f.user.id, &ClientContext::default()).await.unwrap();
        f.clock.advance(Duration::minutes(45));
        let fresh = f.sessions.create(f.user.id, &ClientContext::default()).await.unwrap();
        f.clock.advance(Duration::minutes(20));

        assert_eq!(f.sessions.sweep_expired().await.unwrap(), 1);
        assert!(f.sessions.validate(&fresh.token).await.is_ok());
    }

    #[tokio::test]
    async fn client_context_is_recorded() {
        let f = fixture().await;
        let client = ClientContext {
            ip: Some("100.64.0.7".parse().unwrap()),
            user_agent: Some("curl/8".to_string()),
        };
        let issued = f.sessions.create(f.user.id, &client).await.unwrap();
        assert_eq!(issued.session.client_ip.as_deref(), Some("100.64.0.7"));
        assert_eq!(issued.session.user_agent.as_deref(), Some("curl/8"));
    }
}
