//! In-process implementation of every store seam, for `STORE_BACKEND=memory`
//! and for tests. State lives only as long as the process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::{
    clock::Clock,
    error::StoreError,
    models::{
        challenge::{PendingAuthentication, PendingEnrollment},
        session::Session,
        user::{NewUser, Role, User},
    },
    repositories::{
        attempts::AttemptStore,
        challenge::ChallengeStore,
        session::SessionStore,
        user::{UserStore, is_email_identifier},
    },
};

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
}

pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    users: RwLock<HashMap<Uuid, User>>,
    sessions: RwLock<HashMap<String, Session>>,
    pending: RwLock<HashMap<String, (PendingAuthentication, DateTime<Utc>)>>,
    enrollments: RwLock<HashMap<Uuid, (PendingEnrollment, DateTime<Utc>)>>,
    used_steps: Mutex<HashMap<(Uuid, u64), DateTime<Utc>>>,
    attempts: Mutex<HashMap<String, (u32, DateTime<Utc>)>>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            users: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            enrollments: RwLock::new(HashMap::new()),
            used_steps: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn find_user(&self, matches: impl Fn(&User) -> bool) -> Option<User> {
        self.users.read().values().find(|u| matches(u)).cloned()
    }

    fn update_user(&self, user_id: Uuid, now: DateTime<Utc>, apply: impl FnOnce(&mut User)) -> bool {
        match self.users.write().get_mut(&user_id) {
            Some(user) => {
                apply(user);
                user.updated_at = now;
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    #[cfg(test)]
    pub fn attempt_count(&self, key: &str) -> Option<u32> {
        self.attempts.lock().get(key).map(|(count, _)| *count)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<User>, StoreError> {
        if is_email_identifier(identifier) {
            let email = identifier.to_lowercase();
            Ok(self.find_user(|u| u.email == email))
        } else {
            Ok(self.find_user(|u| u.username == identifier))
        }
    }

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.users.read().get(&user_id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let email = email.to_lowercase();
        Ok(self.find_user(|u| u.email == email))
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.find_user(|u| u.external_id.as_deref() == Some(external_id)))
    }

    async fn insert(&self, user: NewUser, now: DateTime<Utc>) -> Result<User, StoreError> {
        let email = user.email.to_lowercase();
        let mut users = self.users.write();
        let taken = users.values().any(|u| {
            u.username == user.username
                || u.email == email
                || (user.external_id.is_some() && u.external_id == user.external_id)
        });
        if taken {
            return Err(StoreError::Duplicate("user".to_string()));
        }

        let record = User {
            id: Uuid::new_v4(),
            username: user.username,
            email,
            display_name: user.display_name,
            role: Some(user.role),
            password_hash: user.password_hash,
            totp_secret: None,
            external_id: user.external_id,
            email_verified: user.email_verified,
            approved: user.approved,
            created_at: now,
            updated_at: now,
            last_active_at: None,
        };
        users.insert(record.id, record.clone());
        Ok(record)
    }

    async fn link_external_id(
        &self,
        user_id: Uuid,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self
            .find_user(|u| u.external_id.as_deref() == Some(external_id) && u.id != user_id)
            .is_some()
        {
            return Err(StoreError::Duplicate("external_id".to_string()));
        }
        self.update_user(user_id, now, |u| u.external_id = Some(external_id.to_string()));
        Ok(())
    }

    async fn update_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update_user(user_id, now, |u| u.password_hash = Some(password_hash.to_string()));
        Ok(())
    }

    async fn update_totp_secret(
        &self,
        user_id: Uuid,
        sealed_secret: Option<Vec<u8>>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update_user(user_id, now, |u| u.totp_secret = sealed_secret);
        Ok(())
    }

    async fn update_role(
        &self,
        user_id: Uuid,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.update_user(user_id, now, |u| u.role = Some(role)))
    }

    async fn touch_last_active(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(user) = self.users.write().get_mut(&user_id) {
            user.last_active_at = Some(now);
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.id) {
            return Err(StoreError::Duplicate("session".to_string()));
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().get(id).cloned())
    }

    async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(session) = self.sessions.write().get_mut(id) {
            session.last_accessed_at = at;
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.sessions.write().remove(id);
        Ok(())
    }

    async fn delete_for_user(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| s.user_id != user_id);
        Ok((before - sessions.len()) as u64)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired_at(now));
        Ok((before - sessions.len()) as u64)
    }
}

#[async_trait]
impl ChallengeStore for MemoryStore {
    async fn insert_pending(
        &self,
        pending: &PendingAuthentication,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut map = self.pending.write();
        map.retain(|_, (_, evict_at)| *evict_at > now);
        map.insert(pending.id.clone(), (pending.clone(), expiry(now, ttl)));
        Ok(())
    }

    async fn find_pending(&self, id: &str) -> Result<Option<PendingAuthentication>, StoreError> {
        Ok(self.pending.read().get(id).map(|(p, _)| p.clone()))
    }

    async fn delete_pending(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.pending.write().remove(id).is_some())
    }

    async fn consume_time_step(
        &self,
        user_id: Uuid,
        step: u64,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut used = self.used_steps.lock();
        used.retain(|_, evict_at| *evict_at > now);
        if used.contains_key(&(user_id, step)) {
            return Ok(false);
        }
        used.insert((user_id, step), expiry(now, ttl));
        Ok(true)
    }

    async fn put_enrollment(
        &self,
        enrollment: &PendingEnrollment,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.enrollments
            .write()
            .insert(enrollment.user_id, (enrollment.clone(), expiry(now, ttl)));
        Ok(())
    }

    async fn find_enrollment(
        &self,
        user_id: Uuid,
    ) -> Result<Option<PendingEnrollment>, StoreError> {
        Ok(self.enrollments.read().get(&user_id).map(|(e, _)| e.clone()))
    }

    async fn delete_enrollment(&self, user_id: Uuid) -> Result<(), StoreError> {
        self.enrollments.write().remove(&user_id);
        Ok(())
    }
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn reserve(&self, key: &str, window: Duration) -> Result<u32, StoreError> {
        let now = self.clock.now();
        let mut attempts = self.attempts.lock();
        attempts.retain(|_, (_, until)| *until > now);
        let entry = attempts.entry(key.to_string()).or_insert((0, now));
        entry.0 += 1;
        entry.1 = expiry(now, window);
        Ok(entry.0)
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        let mut attempts = self.attempts.lock();
        if let Some((count, _)) = attempts.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                attempts.remove(key);
            }
        }
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.attempts.lock().remove(key);
        Ok(())
    }
}
