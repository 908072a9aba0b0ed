use std::convert::Infallible;

use axum::extract::{FromRequest, FromRequestParts};
use axum::http::request::Parts;

use agora_types::auth::Claims;

use crate::error::ApiError;

/// `axum::Json` with rejections reported as [`ApiError`] bodies.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// `axum::extract::Query` with rejections reported as [`ApiError`] bodies.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

/// `axum::extract::Path` with rejections reported as [`ApiError`] bodies.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct ApiPath<T>(pub T);

/// Claims of the authenticated caller. Rejects with 401 when the request
/// carried no bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Claims>()
            .cloned()
            .map(AuthUser)
            .ok_or_else(|| ApiError::Unauthorized("Authentication required".into()))
    }
}

/// Claims of the caller when a token was sent, for endpoints that are
/// public but personalise their output.
#[derive(Debug, Clone)]
pub struct Viewer(pub Option<Claims>);

impl Viewer {
    pub fn id(&self) -> Option<String> {
        self.0.as_ref().map(|c| c.sub.to_string())
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Viewer {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Viewer(parts.extensions.get::<Claims>().cloned()))
    }
}
