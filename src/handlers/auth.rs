use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_cookies::Cookies;
use uuid::Uuid;

use crate::{
    crypto::token::OpaqueToken,
    error::{AppError, Result},
    middleware_layer::auth::CurrentUser,
    models::{
        session::ClientContext,
        user::{Role, User},
    },
    services::{auth::LoginOutcome, totp::EnrollmentOffer},
    state::AppState,
    validation::auth::*,
};

/// Identity fields safe to hand back to the client.
#[derive(Serialize, Debug)]
pub struct UserView {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub role: Option<Role>,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            role: user.role,
        }
    }
}

/// The response payload for a login step.
#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginResponse {
    Authenticated {
        user: UserView,
    },
    ChallengeRequired {
        challenge_id: String,
        expires_at: DateTime<Utc>,
    },
}

/// The response payload for operations with nothing else to report.
#[derive(Serialize)]
pub struct AuthResponse {
    pub success: bool,
    pub message: String,
}

impl AuthResponse {
    fn ok(message: &str) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.to_string(),
        })
    }
}

fn login_response(state: &AppState, cookies: &Cookies, outcome: LoginOutcome) -> Response {
    match outcome {
        LoginOutcome::Authenticated { user, issued } => {
            state.cookies.issue(cookies, &issued.token);
            let body = LoginResponse::Authenticated {
                user: UserView::from(&user),
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        LoginOutcome::ChallengeRequired(challenge) => {
            let body = LoginResponse::ChallengeRequired {
                challenge_id: challenge.reference.as_str().to_string(),
                expires_at: challenge.pending.expires_at,
            };
            (StatusCode::ACCEPTED, Json(body)).into_response()
        }
    }
}

/// Handles user login.
#[axum::debug_handler(state = AppState)]
pub async fn login(
    State(state): State<AppState>,
    client: ClientContext,
    cookies: Cookies,
    Json(payload): Json<LoginRequest>,
) -> Result<Response> {
    validate_payload(&payload)?;
    tracing::info!("🔐 Login attempt");

    let outcome = state
        .auth
        .login(&payload.identifier, &payload.password, &client)
        .await?;
    Ok(login_response(&state, &cookies, outcome))
}

/// Handles the second login step.
#[axum::debug_handler(state = AppState)]
pub async fn second_factor(
    State(state): State<AppState>,
    client: ClientContext,
    cookies: Cookies,
    Json(payload): Json<SecondFactorRequest>,
) -> Result<Response> {
    validate_payload(&payload)?;

    let reference = OpaqueToken::parse(&payload.challenge_id).ok_or_else(|| {
        tracing::debug!("Malformed challenge reference");
        AppError::ChallengeExpired
    })?;

    let (user, issued) = state
        .auth
        .submit_second_factor(&reference, &payload.code, &client)
        .await?;
    state.cookies.issue(&cookies, &issued.token);

    let body = LoginResponse::Authenticated {
        user: UserView::from(&user),
    };
    Ok((StatusCode::OK, Json(body)).into_response())
}

/// Handles login through the configured identity provider.
#[axum::debug_handler(state = AppState)]
pub async fn federated(
    State(state): State<AppState>,
    client: ClientContext,
    cookies: Cookies,
    Json(payload): Json<FederatedLoginRequest>,
) -> Result<Response> {
    validate_payload(&payload)?;
    let outcome = state.auth.federated_login(&payload.assertion, &client).await?;
    Ok(login_response(&state, &cookies, outcome))
}

/// Handles user logout.
///
/// The cookie is cleared before anything else can fail, and the response is
/// a success whether or not a session existed.
#[axum::debug_handler]
pub async fn logout(State(state): State<AppState>, cookies: Cookies) -> Response {
    let token = state.cookies.decode(&cookies);
    state.cookies.clear(&cookies);

    if let Some(token) = token {
        match state.auth.sessions().revoke(&token).await {
            Ok(()) => tracing::info!("👋 Session revoked"),
            Err(e) => tracing::error!("Failed to revoke session on logout: {}", e),
        }
    }

    (StatusCode::OK, AuthResponse::ok("Logout successful")).into_response()
}

/// Returns the identity behind the current session.
#[axum::debug_handler]
pub async fn me(Extension(current): Extension<CurrentUser>) -> Json<UserView> {
    Json(UserView::from(&current.user))
}

/// Handles changing a user's password.
#[axum::debug_handler(state = AppState)]
pub async fn change_password(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
    client: ClientContext,
    cookies: Cookies,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Response> {
    validate_payload(&payload)?;

    let issued = state
        .auth
        .change_password(
            &current.user,
            &payload.current_password,
            &payload.new_password,
            &client,
        )
        .await?;
    state.cookies.issue(&cookies, &issued.token);

    Ok((StatusCode::OK, AuthResponse::ok("Password changed successfully")).into_response())
}

#[axum::debug_handler]
pub async fn totp_enroll(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
) -> Result<Json<EnrollmentOffer>> {
    let offer = state.auth.begin_totp_enrollment(&current.user).await?;
    Ok(Json(offer))
}

#[axum::debug_handler]
pub async fn totp_confirm(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
    Json(payload): Json<TotpCodeRequest>,
) -> Result<Response> {
    validate_payload(&payload)?;
    state
        .auth
        .confirm_totp_enrollment(&current.user, &payload.code)
        .await?;
    Ok((StatusCode::OK, AuthResponse::ok("Second factor enabled")).into_response())
}

#[axum::debug_handler]
pub async fn totp_disable(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
    Json(payload): Json<TotpCodeRequest>,
) -> Result<Response> {
    validate_payload(&payload)?;
    state.auth.disable_totp(&current.user, &payload.code).await?;
    Ok((StatusCode::OK, AuthResponse::ok("Second factor disabled")).into_response())
}
