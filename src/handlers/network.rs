use axum::{Json, extract::State};

use crate::{models::session::ClientContext, services::network::NetworkStatus, state::AppState};

/// Reports how the network gate sees the caller. Grants nothing.
#[axum::debug_handler(state = AppState)]
pub async fn status(State(state): State<AppState>, client: ClientContext) -> Json<NetworkStatus> {
    Json(state.network.status(client.ip))
}
