use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::{debug, info, warn};
use uuid::Uuid;

use agora_notify::{PushError, PushTarget};
use agora_types::api::{
    MessageBody, PushPayload, PushSubscriptionRequest, UnsubscribeRequest, VapidKeyResponse,
};
use agora_types::auth::Claims;

use crate::error::ApiError;
use crate::extract::{ApiJson, AuthUser};
use crate::state::{AppState, db_call};

/// GET /api/notifications/vapid-public-key
pub async fn vapid_public_key(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let public_key = state
        .settings
        .vapid_public_key
        .clone()
        .ok_or_else(|| ApiError::NotFound("Push notifications are not configured".into()))?;
    Ok(Json(VapidKeyResponse { public_key }))
}

/// POST /api/notifications/subscribe
pub async fn subscribe(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ApiJson(req): ApiJson<PushSubscriptionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !req.endpoint.starts_with("https://") {
        return Err(ApiError::BadRequest("Subscription endpoint must be an https URL".into()));
    }
    if req.keys.p256dh.trim().is_empty() || req.keys.auth.trim().is_empty() {
        return Err(ApiError::BadRequest("Subscription keys are required".into()));
    }

    let uid = claims.sub.to_string();
    db_call(&state, move |db| {
        db.upsert_push_subscription(&uid, &req.endpoint, &req.keys.p256dh, &req.keys.auth)
    })
    .await?;
    info!("{} registered a push subscription", claims.username);

    Ok((
        StatusCode::CREATED,
        Json(MessageBody {
            message: "Subscribed".into(),
        }),
    ))
}

/// DELETE /api/notifications/subscribe
pub async fn unsubscribe(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ApiJson(req): ApiJson<UnsubscribeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let uid = claims.sub.to_string();
    let removed = db_call(&state, move |db| db.delete_push_subscription(&uid, &req.endpoint)).await?;
    if !removed {
        return Err(ApiError::not_found("Subscription"));
    }
    Ok(Json(MessageBody {
        message: "Unsubscribed".into(),
    }))
}

/// The caller's name as it is now. Tokens keep the name from login time,
/// so anything shown to other users reads it from the database.
pub(crate) async fn current_username(state: &AppState, claims: &Claims) -> Result<String, ApiError> {
    let uid = claims.sub.to_string();
    let user = db_call(state, move |db| db.get_user_summary(&uid)).await?;
    Ok(user.map_or_else(|| claims.username.clone(), |u| u.username))
}

/// Queue a push notification to every subscription of `user_id`. Delivery
/// runs in the background; failures never reach the caller.
pub(crate) fn notify_user(state: &AppState, user_id: Uuid, payload: PushPayload) {
    let state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = deliver(&state, user_id, &payload).await {
            warn!("Push delivery to {} failed: {}", user_id, e);
        }
    });
}

async fn deliver(state: &AppState, user_id: Uuid, payload: &PushPayload) -> Result<(), ApiError> {
    let uid = user_id.to_string();
    let subscriptions = db_call(state, move |db| db.get_push_subscriptions(&uid)).await?;
    if subscriptions.is_empty() {
        return Ok(());
    }

    let body = serde_json::to_vec(payload).map_err(anyhow::Error::from)?;
    for sub in subscriptions {
        let target = PushTarget {
            endpoint: sub.endpoint,
            p256dh: sub.p256dh,
            auth: sub.auth,
        };
        match state.push.send(&target, &body).await {
            Ok(()) => debug!("Pushed '{}' to {}", payload.title, user_id),
            Err(PushError::Gone) => {
                info!("Push endpoint gone, removing subscription {}", sub.id);
                let id = sub.id;
                db_call(state, move |db| db.delete_push_subscription_by_id(&id)).await?;
            }
            Err(e) => warn!("Push to {} failed: {}", target.endpoint, e),
        }
    }
    Ok(())
}
