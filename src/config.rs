use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use zeroize::{Zeroize, Zeroizing};

/// Upper bound on `SESSION_DURATION_HOURS` (one year).
pub const MAX_SESSION_DURATION_HOURS: i64 = 8760;

/// Where users, sessions and challenges live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// PostgreSQL for users and sessions, Redis for short-lived state.
    Postgres,
    /// Process memory. Local development and tests only.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => anyhow::bail!("STORE_BACKEND must be 'postgres' or 'memory', got '{}'", other),
        }
    }
}

/// The application's configuration.
#[derive(Clone)]
pub struct Config {
    /// The address the server listens on.
    pub bind_addr: SocketAddr,
    pub store_backend: StoreBackend,
    /// The URL of the PostgreSQL database. Required for the postgres backend.
    pub database_url: Option<String>,
    /// The URL of the Redis server.
    pub redis_url: String,
    /// The master key used to seal second-factor secrets.
    pub master_key: Zeroizing<Vec<u8>>,
    /// Absolute session lifetime in hours.
    pub session_duration_hours: i64,
    pub session_cookie_name: String,
    /// `Secure` cookies are only set in production.
    pub production: bool,
    pub challenge_ttl_secs: u64,
    pub totp_issuer: String,
    pub rate_limit_window_secs: u64,
    pub login_max_failures: u32,
    pub challenge_max_failures: u32,
    pub network_gate_enabled: bool,
    pub network_gate_required: bool,
    pub trusted_subnets: Vec<IpNetwork>,
    pub trust_proxy_headers: bool,
    /// Reverse proxies in front of the service, each appending one
    /// `X-Forwarded-For` entry.
    pub trusted_proxy_hops: usize,
    pub require_email_verified: bool,
    pub require_approval: bool,
    pub session_sweep_interval_secs: u64,
    pub cors_allowed_origins: Vec<String>,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = var_or(name, default);
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid {} '{}': {}", name, raw, e))
}

fn parse_flag(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("Invalid {} '{}': expected true or false", name, raw),
        },
    }
}

fn parse_subnets(raw: &str) -> Result<Vec<IpNetwork>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpNetwork>()
                .with_context(|| format!("Invalid CIDR in TRUSTED_SUBNETS: {}", s))
        })
        .collect()
}

impl Config {
    /// Creates a new `Config` from environment variables.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `Config`.
    pub fn from_env() -> Result<Self> {
        let mut master_key_hex = env::var("MASTER_KEY")
            .context("MASTER_KEY must be set (generate with: openssl rand -hex 32)")?;

        let master_key_bytes =
            hex::decode(master_key_hex.trim()).context("MASTER_KEY must be valid hexadecimal");

        master_key_hex.zeroize();
        let master_key_bytes = master_key_bytes?;

        if master_key_bytes.len() != 32 {
            anyhow::bail!("MASTER_KEY must be exactly 32 bytes (64 hex characters)");
        }

        let store_backend: StoreBackend = var_or("STORE_BACKEND", "postgres").parse()?;
        let database_url = env::var("DATABASE_URL").ok();
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            anyhow::bail!("DATABASE_URL must be set when STORE_BACKEND=postgres");
        }

        let session_duration_hours: i64 = parse_var("SESSION_DURATION_HOURS", "168")?;
        if !(1..=MAX_SESSION_DURATION_HOURS).contains(&session_duration_hours) {
            anyhow::bail!(
                "SESSION_DURATION_HOURS must be between 1 and {}",
                MAX_SESSION_DURATION_HOURS
            );
        }

        let trusted_proxy_hops: usize = parse_var("TRUSTED_PROXY_HOPS", "1")?;
        if trusted_proxy_hops == 0 {
            anyhow::bail!("TRUSTED_PROXY_HOPS must be at least 1");
        }

        let trusted_subnets = parse_subnets(&var_or("TRUSTED_SUBNETS", "100.64.0.0/10"))?;
        let network_gate_enabled = parse_flag("NETWORK_GATE_ENABLED", false)?;
        if network_gate_enabled && trusted_subnets.is_empty() {
            tracing::warn!("Network gate enabled with no trusted subnets: every staff request will be denied");
        }

        let totp_issuer = var_or("TOTP_ISSUER", "gatehouse");
        if totp_issuer.contains(':') {
            anyhow::bail!("TOTP_ISSUER must not contain ':'");
        }

        Ok(Self {
            bind_addr: parse_var("BIND_ADDR", "127.0.0.1:3000")?,
            store_backend,
            database_url,
            redis_url: var_or("REDIS_URL", "redis://127.0.0.1:6379"),
            master_key: Zeroizing::new(master_key_bytes),
            session_duration_hours,
            session_cookie_name: var_or("SESSION_COOKIE_NAME", "session_id"),
            production: var_or("APP_ENV", "development") == "production",
            challenge_ttl_secs: parse_var("CHALLENGE_TTL_SECS", "300")?,
            totp_issuer,
            rate_limit_window_secs: parse_var("RATE_LIMIT_WINDOW_SECS", "900")?,
            login_max_failures: parse_var("LOGIN_MAX_FAILURES", "5")?,
            challenge_max_failures: parse_var("CHALLENGE_MAX_FAILURES", "3")?,
            network_gate_enabled,
            network_gate_required: parse_flag("NETWORK_GATE_REQUIRED", true)?,
            trusted_subnets,
            trust_proxy_headers: parse_flag("TRUST_PROXY_HEADERS", false)?,
            trusted_proxy_hops,
            require_email_verified: parse_flag("REQUIRE_EMAIL_VERIFIED", false)?,
            require_approval: parse_flag("REQUIRE_APPROVAL", false)?,
            session_sweep_interval_secs: parse_var("SESSION_SWEEP_INTERVAL_SECS", "3600")?,
            cors_allowed_origins: var_or("CORS_ALLOWED_ORIGINS", "http://localhost:3000")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }
}
