use std::sync::Arc;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;

use crate::{
    clock::{Clock, SystemClock},
    config::{Config, MAX_SESSION_DURATION_HOURS, StoreBackend},
    cookie::CookieCodec,
    crypto::{aes::SecureKey, password::PasswordParams},
    repositories::{
        attempts::RedisAttemptStore, challenge::RedisChallengeStore, memory::MemoryStore,
        session::PgSessionStore, user::PgUserStore,
    },
    services::{
        auth::{AuthService, AuthSettings, AuthStores, LoginPolicy, RateLimitSettings},
        network::{NetworkAccessGate, NetworkGateConfig},
        totp::TotpSettings,
    },
};

/// The application's state.
#[derive(Clone)]
pub struct AppState {
    /// The application's configuration.
    pub config: Arc<Config>,
    /// Login flow, sessions and account operations.
    pub auth: AuthService,
    pub cookies: CookieCodec,
    pub network: NetworkAccessGate,
}

impl AppState {
    /// Creates a new `AppState`, connecting the configured backend.
    ///
    /// # Arguments
    ///
    /// * `config` - The application's configuration.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `AppState`.
    pub async fn new(config: &Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let stores = match config.store_backend {
            StoreBackend::Postgres => {
                let database_url = config
                    .database_url
                    .as_deref()
                    .context("DATABASE_URL must be set when STORE_BACKEND=postgres")?;
                let db = crate::db::create_pool(database_url)?;
                crate::db::run_migrations(&db).await?;
                tracing::info!("✅ PostgreSQL pool initialized");

                let redis_client = redis::Client::open(config.redis_url.as_str())
                    .context("Invalid REDIS_URL")?;
                let redis = ConnectionManager::new(redis_client)
                    .await
                    .context("Failed to connect to Redis")?;
                tracing::info!("✅ Redis connection manager initialized");

                AuthStores {
                    users: Arc::new(PgUserStore::new(db.clone())),
                    sessions: Arc::new(PgSessionStore::new(db)),
                    challenges: Arc::new(RedisChallengeStore::new(redis.clone())),
                    attempts: Arc::new(RedisAttemptStore::new(redis)),
                }
            }
            StoreBackend::Memory => {
                tracing::warn!("⚠️ Using in-memory store: all state is lost on restart");
                let store = Arc::new(MemoryStore::new(clock.clone()));
                AuthStores {
                    users: store.clone(),
                    sessions: store.clone(),
                    challenges: store.clone(),
                    attempts: store,
                }
            }
        };

        Self::from_parts(config, stores, clock, PasswordParams::default())
    }

    /// Assembles the state from already-built stores.
    pub fn from_parts(
        config: &Config,
        stores: AuthStores,
        clock: Arc<dyn Clock>,
        password: PasswordParams,
    ) -> Result<Self> {
        let master_key = SecureKey::from_slice(&config.master_key)
            .map_err(|e| anyhow::anyhow!("Invalid MASTER_KEY: {}", e))?;

        if !(1..=MAX_SESSION_DURATION_HOURS).contains(&config.session_duration_hours) {
            anyhow::bail!(
                "Session lifetime of {} hours is out of range",
                config.session_duration_hours
            );
        }
        let session_lifetime = chrono::Duration::try_hours(config.session_duration_hours)
            .context("Session lifetime out of range")?;

        let settings = AuthSettings {
            session_lifetime,
            password,
            totp: TotpSettings {
                issuer: config.totp_issuer.clone(),
                challenge_ttl: chrono::Duration::seconds(config.challenge_ttl_secs as i64),
            },
            policy: LoginPolicy {
                require_email_verified: config.require_email_verified,
                require_approval: config.require_approval,
            },
            limits: RateLimitSettings {
                window: std::time::Duration::from_secs(config.rate_limit_window_secs),
                login_max_failures: config.login_max_failures,
                challenge_max_failures: config.challenge_max_failures,
            },
        };

        let auth = AuthService::new(stores, clock, Arc::new(master_key), settings)
            .map_err(|e| anyhow::anyhow!("Failed to initialise auth service: {}", e))?;

        let cookies = CookieCodec::new(
            config.session_cookie_name.clone(),
            config.production,
            session_lifetime.num_seconds(),
        );

        let network = NetworkAccessGate::new(NetworkGateConfig {
            enabled: config.network_gate_enabled,
            required: config.network_gate_required,
            trusted_subnets: config.trusted_subnets.clone(),
            trust_proxy_headers: config.trust_proxy_headers,
            trusted_proxy_hops: config.trusted_proxy_hops,
        });
        tracing::info!(
            enabled = config.network_gate_enabled,
            enforced = network.is_enforced(),
            "✅ Network gate configured"
        );

        Ok(AppState {
            config: Arc::new(config.clone()),
            auth,
            cookies,
            network,
        })
    }
}
