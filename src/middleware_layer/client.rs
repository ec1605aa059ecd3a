use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{header, request::Parts},
};

use crate::{models::session::ClientContext, state::AppState};

/// Longest user agent kept on a session record.
const MAX_USER_AGENT_LEN: usize = 512;

/// Resolves the caller's address and user agent.
///
/// The socket peer is optional so the router also works without
/// `into_make_service_with_connect_info`.
impl FromRequestParts<AppState> for ClientContext {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip());
        let ip = state.network.resolve_client_ip(&parts.headers, peer);

        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(|ua| ua.chars().take(MAX_USER_AGENT_LEN).collect());

        Ok(ClientContext { ip, user_agent })
    }
}
