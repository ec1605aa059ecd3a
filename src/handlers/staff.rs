use axum::{
    Extension, Json,
    extract::{Path, State},
};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    middleware_layer::auth::CurrentUser,
    models::user::Role,
    state::AppState,
    validation::auth::{SetRoleRequest, validate_payload},
};

#[derive(Serialize)]
pub struct RevokedResponse {
    pub revoked: u64,
}

#[derive(Serialize)]
pub struct RoleResponse {
    pub user_id: Uuid,
    pub role: Role,
}

#[derive(Serialize)]
pub struct SweepResponse {
    pub removed: u64,
}

/// Revokes every session of a user.
#[axum::debug_handler]
pub async fn revoke_sessions(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<RevokedResponse>> {
    let revoked = state.auth.revoke_user_sessions(user_id).await?;
    tracing::info!("🛡️ Admin {} revoked sessions of user {}", current.user.id, user_id);
    Ok(Json(RevokedResponse { revoked }))
}

/// Assigns a role to a user.
#[axum::debug_handler]
pub async fn set_role(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
    Path(user_id): Path<Uuid>,
    Json(payload): Json<SetRoleRequest>,
) -> Result<Json<RoleResponse>> {
    validate_payload(&payload)?;
    let role = Role::parse(&payload.role)
        .ok_or_else(|| AppError::Validation("role: must be 'member' or 'admin'".to_string()))?;

    state.auth.set_role(user_id, role).await?;
    tracing::info!("🛡️ Admin {} set role of user {} to {}", current.user.id, user_id, role);
    Ok(Json(RoleResponse { user_id, role }))
}

/// Deletes expired sessions now instead of waiting for the background sweep.
#[axum::debug_handler]
pub async fn sweep_sessions(State(state): State<AppState>) -> Result<Json<SweepResponse>> {
    let removed = state.auth.sessions().sweep_expired().await?;
    Ok(Json(SweepResponse { removed }))
}
