use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Failures raised by the storage collaborators.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A PostgreSQL error.
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// The PostgreSQL pool could not hand out a connection.
    #[error("Connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// A Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A unique key already exists.
    #[error("Duplicate key: {0}")]
    Duplicate(String),

    /// A stored record could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Maps unique-constraint violations to [`StoreError::Duplicate`].
    pub fn from_insert(err: tokio_postgres::Error, what: &str) -> Self {
        if err.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION) {
            StoreError::Duplicate(what.to_string())
        } else {
            StoreError::Database(err)
        }
    }
}

/// The application's error type.
///
/// Variants carry the precise reason only where it is safe to show; the
/// security-relevant detail is logged at the point of failure and collapsed
/// here into one generic outward message per kind.
#[derive(Error, Debug)]
pub enum AppError {
    /// Unknown identifier or wrong secret.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// The pending second-factor challenge is gone or past its expiry.
    #[error("Second-factor challenge expired")]
    ChallengeExpired,

    /// The submitted one-time code did not verify.
    #[error("Second-factor code invalid")]
    ChallengeCodeInvalid,

    /// No usable session.
    #[error("Unauthenticated")]
    Unauthenticated,

    /// A role or network check failed.
    #[error("Forbidden")]
    Forbidden,

    /// Too many recent failures for an identifier or challenge.
    #[error("Rate limited")]
    RateLimited,

    /// Credentials verified but the account is not eligible to sign in.
    #[error("Account restricted")]
    AccountRestricted,

    /// The external store could not be reached or returned garbage.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// A validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A resource not found error.
    #[error("Resource not found")]
    NotFound,

    /// An encryption error.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// An internal server error.
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// A `Result` type that uses `AppError` as the error type.
pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::StoreUnavailable(_) | AppError::Encryption(_) | AppError::Internal(_)
        )
    }

    fn status_and_message(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::InvalidCredentials => {
                (StatusCode::UNAUTHORIZED, "Invalid username or password")
            }
            AppError::ChallengeExpired => (
                StatusCode::UNAUTHORIZED,
                "Verification expired, please sign in again",
            ),
            AppError::ChallengeCodeInvalid => {
                (StatusCode::UNAUTHORIZED, "Invalid verification code")
            }
            AppError::Unauthenticated => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "Access denied"),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many attempts. Try again later",
            ),
            AppError::AccountRestricted => {
                (StatusCode::FORBIDDEN, "Account is not enabled for sign-in")
            }
            AppError::StoreUnavailable(_) | AppError::Encryption(_) | AppError::Internal(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service temporarily unavailable",
            ),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "Invalid request"),
            AppError::NotFound => (StatusCode::NOT_FOUND, "Resource not found"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::StoreUnavailable(e) => tracing::error!("Store unavailable: {}", e),
            AppError::Encryption(msg) => tracing::error!("Encryption error: {}", msg),
            AppError::Internal(msg) => tracing::error!("Internal error: {}", msg),
            AppError::Validation(msg) => tracing::debug!("Validation error: {}", msg),
            AppError::RateLimited => tracing::warn!("Rate limit exceeded"),
            other => tracing::debug!("Request rejected: {}", other),
        }

        let (status, message) = self.status_and_message();
        let message = match &self {
            AppError::Validation(msg) => msg.clone(),
            _ => message.to_string(),
        };

        let body = sonic_rs::to_string(&sonic_rs::json!({
            "error": message,
            "retryable": self.is_retryable(),
        }))
        .unwrap_or_else(|_| r#"{"error":"Service temporarily unavailable"}"#.to_string());

        (
            status,
            [(http::header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}
