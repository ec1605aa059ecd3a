use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    clock::Clock,
    error::{AppError, Result, StoreError},
    models::user::{NewUser, Role, User},
    repositories::user::UserStore,
};

/// How many username suffixes to try before giving up.
const MAX_USERNAME_ATTEMPTS: u32 = 5;

/// A verified identity asserted by an external provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalIdentity {
    pub external_id: String,
    pub email: String,
    pub display_name: Option<String>,
}

/// Exchanges a provider assertion for a verified identity.
///
/// The protocol behind the exchange belongs to the deployment.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Fails with [`AppError::InvalidCredentials`] when the assertion does not verify.
    async fn exchange(&self, assertion: &str) -> Result<ExternalIdentity>;
}

/// Maps an external identity onto a local user, creating one if needed.
///
/// Lookup order: by external id, then by email (linking the external id),
/// otherwise a new `member` account with a verified email.
pub async fn resolve_local_user(
    users: &Arc<dyn UserStore>,
    clock: &Arc<dyn Clock>,
    identity: &ExternalIdentity,
) -> Result<User> {
    if let Some(user) = users.find_by_external_id(&identity.external_id).await? {
        return Ok(user);
    }

    if let Some(user) = users.find_by_email(&identity.email).await? {
        users
            .link_external_id(user.id, &identity.external_id, clock.now())
            .await?;
        tracing::info!("🔗 Linked external identity to user {}", user.id);
        return Ok(User {
            external_id: Some(identity.external_id.clone()),
            ..user
        });
    }

    let base = username_from_email(&identity.email);
    for attempt in 0..MAX_USERNAME_ATTEMPTS {
        let username = if attempt == 0 {
            base.clone()
        } else {
            format!("{}{}", base, attempt + 1)
        };
        let new_user = NewUser {
            username: username.clone(),
            email: identity.email.clone(),
            display_name: identity
                .display_name
                .clone()
                .unwrap_or_else(|| username.clone()),
            role: Role::Member,
            password_hash: None,
            external_id: Some(identity.external_id.clone()),
            email_verified: true,
            approved: false,
        };

        match users.insert(new_user, clock.now()).await {
            Ok(user) => {
                tracing::info!("✅ Created user {} from external identity", user.id);
                return Ok(user);
            }
            Err(StoreError::Duplicate(_)) => {
                // A concurrent request may have created the same identity.
                if let Some(user) = users.find_by_external_id(&identity.external_id).await? {
                    return Ok(user);
                }
                tracing::debug!("Username {} taken, trying another", username);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(AppError::Internal(
        "Could not allocate a username for external identity".to_string(),
    ))
}

/// Local part of the email, restricted to `[a-z0-9_]`.
fn username_from_email(email: &str) -> String {
    let local = email.split('@').next().unwrap_or_default();
    let cleaned: String = local
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(24)
        .collect();
    if cleaned.len() < 3 {
        format!("user_{}", cleaned)
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, repositories::memory::MemoryStore};
    use chrono::Utc;

    fn stores() -> (Arc<dyn UserStore>, Arc<dyn Clock>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        (store, clock)
    }

    fn identity(external_id: &str, email: &str) -> ExternalIdentity {
        ExternalIdentity {
            external_id: external_id.to_string(),
            email: email.to_string(),
            display_name: None,
        }
    }

    #[test]
    fn usernames_are_derived_from_the_local_part() {
        assert_eq!(username_from_email("Ada.Lovelace@example.com"), "ada_lovelace");
        assert_eq!(username_from_email("x@example.com"), "user_x");
    }

    #[tokio::test]
    async fn first_login_creates_a_member_and_later_logins_reuse_it() {
        let (users, clock) = stores();
        let id = identity("sub-1", "ada@example.com");

        let created = resolve_local_user(&users, &clock, &id).await.unwrap();
        assert_eq!(created.role, Some(Role::Member));
        assert_eq!(created.username, "ada");
        assert!(created.password_hash.is_none());

        let again = resolve_local_user(&users, &clock, &id).await.unwrap();
        assert_eq!(again.id, created.id);
    }

    #[tokio::test]
    async fn existing_email_is_linked() {
        let (users, clock) = stores();
        let existing = users
            .insert(
                NewUser {
                    username: "ada".to_string(),
                    email: "ada@example.com".to_string(),
                    display_name: "Ada".to_string(),
                    role: Role::Admin,
                    password_hash: None,
                    external_id: None,
                    email_verified: true,
                    approved: true,
                },
                clock.now(),
            )
            .await
            .unwrap();

        let linked = resolve_local_user(&users, &clock, &identity("sub-9", "ADA@example.com"))
            .await
            .unwrap();
        assert_eq!(linked.id, existing.id);
        assert_eq!(linked.role, Some(Role::Admin));
        let stored = users.find_by_external_id("sub-9").await.unwrap().unwrap();
        assert_eq!(stored.id, existing.id);
    }

    #[tokio::test]
    async fn taken_username_gets_a_suffix() {
        let (users, clock) = stores();
        resolve_local_user(&users, &clock, &identity("sub-1", "ada@example.com"))
            .await
            .unwrap();
        let second = resolve_local_user(&users, &clock, &identity("sub-2", "ada@other.org"))
            .await
            .unwrap();
        assert_eq!(second.username, "ada2");
    }
}
