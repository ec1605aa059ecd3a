use garde::Validate;
use serde::Deserialize;

use crate::error::{AppError, Result};

/// Validates a request payload, reporting the first problem found.
pub fn validate_payload<T>(payload: &T) -> Result<()>
where
    T: Validate,
    T::Context: Default,
{
    payload.validate().map_err(|report| {
        let message = report
            .iter()
            .next()
            .map(|(path, error)| format!("{}: {}", path, error))
            .unwrap_or_else(|| "Invalid request".to_string());
        AppError::Validation(message)
    })
}

/// The request payload for user login.
#[derive(Deserialize, Validate)]
pub struct LoginRequest {
    /// Username or email.
    #[serde(alias = "username", alias = "email")]
    #[garde(length(min = 1, max = 255))]
    pub identifier: String,
    #[garde(length(min = 1, max = 1024))]
    pub password: String,
}

/// The request payload for the second login step.
#[derive(Deserialize, Validate)]
pub struct SecondFactorRequest {
    #[garde(length(min = 1, max = 128))]
    pub challenge_id: String,
    #[garde(length(min = 1, max = 16))]
    pub code: String,
}

#[derive(Deserialize, Validate)]
pub struct FederatedLoginRequest {
    #[garde(length(min = 1, max = 16384))]
    pub assertion: String,
}

/// The request payload for changing a user's password.
#[derive(Deserialize, Validate)]
pub struct ChangePasswordRequest {
    #[garde(length(min = 1, max = 1024))]
    pub current_password: String,
    #[garde(length(min = 8, max = 128))]
    pub new_password: String,
}

#[derive(Deserialize, Validate)]
pub struct TotpCodeRequest {
    #[garde(length(min = 1, max = 16))]
    pub code: String,
}

#[derive(Deserialize, Validate)]
pub struct SetRoleRequest {
    #[garde(length(min = 1, max = 32))]
    pub role: String,
}
