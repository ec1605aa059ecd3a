use axum::{
    Extension,
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};

use crate::{
    error::AppError,
    middleware_layer::auth::CurrentUser,
    models::{session::ClientContext, user::Role},
    services::authorization::authorize_role,
    state::AppState,
};

/// Roles allowed on staff routes.
const STAFF_ROLES: &[Role] = &[Role::Admin];

/// Guards staff routes. Runs after [`require_auth`](super::auth::require_auth).
///
/// The role check and the network gate are both evaluated and must both
/// allow. Either denial becomes the same `403`.
pub async fn require_staff(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
    client: ClientContext,
    request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let role = authorize_role(current.user.role, STAFF_ROLES);
    let network = state.network.check(client.ip);

    if let Err(e) = role.and(network).into_result() {
        tracing::warn!(
            user_id = %current.user.id,
            client_ip = ?client.ip,
            path = %request.uri().path(),
            "Staff access denied"
        );
        return Err(e);
    }

    Ok(next.run(request).await)
}
