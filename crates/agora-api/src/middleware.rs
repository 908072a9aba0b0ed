use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use tracing::debug;

use agora_types::auth::decode_token;

use crate::error::ApiError;
use crate::state::AppState;

/// Validate the JWT from the Authorization header when one is present and
/// store its claims in the request extensions. Requests without a token
/// pass through; handlers decide with `AuthUser` or `Viewer`.
pub async fn authenticate(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(Authorization(bearer)) = req.headers().typed_get::<Authorization<Bearer>>() {
        let claims = decode_token(&state.jwt_secret, bearer.token()).map_err(|e| {
            debug!("Rejected bearer token: {}", e);
            ApiError::Unauthorized("Invalid or expired token".into())
        })?;
        req.extensions_mut().insert(claims);
    }

    Ok(next.run(req).await)
}
