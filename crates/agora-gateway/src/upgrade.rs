use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tracing::debug;

use agora_db::Database;
use agora_types::api::ErrorBody;
use agora_types::auth::decode_token;

use crate::connection::{self, current_username};
use crate::dispatcher::Dispatcher;

#[derive(Clone)]
pub struct GatewayState {
    pub dispatcher: Dispatcher,
    pub db: Arc<Database>,
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// `GET /api/ws`.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/api/ws", get(ws_upgrade))
        .with_state(state)
}

fn unauthorized(message: &str) -> Response {
    let body = ErrorBody {
        error: message.to_string(),
        details: None,
    };
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

/// A `?token=` is checked before upgrading; without one the client must
/// send `identify` as its first frame.
async fn ws_upgrade(
    State(state): State<GatewayState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = query.token.filter(|t| !t.is_empty()) else {
        return ws
            .on_upgrade(move |socket| connection::handle_connection(socket, state))
            .into_response();
    };

    let claims = match decode_token(&state.jwt_secret, &token) {
        Ok(claims) => claims,
        Err(e) => {
            debug!("Gateway upgrade rejected: {}", e);
            return unauthorized("Invalid or expired token");
        }
    };
    let Some(username) = current_username(&state.db, claims.sub).await else {
        return unauthorized("Invalid or expired token");
    };

    ws.on_upgrade(move |socket| {
        connection::handle_connection_authenticated(socket, state.dispatcher, claims.sub, username)
    })
    .into_response()
}
