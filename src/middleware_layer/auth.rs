use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use tower_cookies::Cookies;

use crate::{
    error::AppError,
    models::{session::Session, user::User},
    state::AppState,
};

/// The identity resolved for the current request.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user: User,
    pub session: Session,
}

/// A middleware that requires a valid session to be present.
///
/// On success the resolved [`CurrentUser`] is added to the request
/// extensions. A cookie that no longer maps to a live session is cleared.
pub async fn require_auth(
    State(state): State<AppState>,
    cookies: Cookies,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let Some(token) = state.cookies.decode(&cookies) else {
        tracing::debug!("No usable session cookie");
        return Err(AppError::Unauthenticated);
    };

    match state.auth.sessions().validate(&token).await {
        Ok((user, session)) => {
            tracing::debug!("User authenticated: {}", user.id);
            request
                .extensions_mut()
                .insert(CurrentUser { user, session });
            Ok(next.run(request).await)
        }
        Err(AppError::Unauthenticated) => {
            state.cookies.clear(&cookies);
            Err(AppError::Unauthenticated)
        }
        Err(e) => Err(e),
    }
}
