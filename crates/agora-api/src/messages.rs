use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use agora_db::models::{MessageRow, NewContent};
use agora_types::api::{ConversationSummary, MessageBody, MessageResponse, PushPayload, SendMessageRequest};
use agora_types::events::{GatewayEvent, MessageAction};

use crate::convert::{group_media, message_response, user_summary};
use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath, ApiQuery, AuthUser};
use crate::media_html::{prepare_content, snippet};
use crate::notifications::{current_username, notify_user};
use crate::posts::{clamp_limit, parse_cursor};
use crate::state::{AppState, db_call};

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 200;

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
    pub before: Option<String>,
}

/// Tell both sides of a conversation to refresh their chat list.
fn broadcast_message(state: &AppState, action: MessageAction, message: MessageResponse) {
    let user_ids = vec![message.sender_id, message.recipient_id];
    state
        .dispatcher
        .broadcast(GatewayEvent::MessageUpdate { action, message });
    state
        .dispatcher
        .broadcast(GatewayEvent::ChatListUpdate { user_ids });
}

async fn with_media(state: &AppState, row: MessageRow) -> Result<MessageResponse, ApiError> {
    let id = row.id.clone();
    let media = db_call(state, move |db| db.get_media_for_messages(std::slice::from_ref(&id))).await?;
    let attached = group_media(media).remove(&row.id).unwrap_or_default();
    Ok(message_response(row, attached))
}

/// The message if it exists and the caller sent it.
async fn require_sender(state: &AppState, message_id: Uuid, user_id: Uuid) -> Result<MessageRow, ApiError> {
    let id = message_id.to_string();
    let row = db_call(state, move |db| db.get_message(&id))
        .await?
        .ok_or_else(|| ApiError::not_found("Message"))?;
    if row.sender_id != user_id.to_string() {
        return Err(ApiError::Forbidden("Only the sender can change this message".into()));
    }
    Ok(row)
}

/// GET /api/messages/conversations
pub async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let uid = claims.sub.to_string();
    let (rows, media) = db_call(&state, move |db| {
        let rows = db.list_conversations(&uid)?;
        let ids: Vec<String> = rows.iter().map(|r| r.last_message.id.clone()).collect();
        let media = db.get_media_for_messages(&ids)?;
        Ok((rows, media))
    })
    .await?;

    let mut media = group_media(media);
    let conversations: Vec<ConversationSummary> = rows
        .into_iter()
        .map(|row| {
            let attached = media.remove(&row.last_message.id).unwrap_or_default();
            ConversationSummary {
                partner: user_summary(row.partner),
                last_message: message_response(row.last_message, attached),
                unread_count: row.unread_count,
            }
        })
        .collect();

    Ok(Json(conversations))
}

/// GET /api/messages/with/{user_id}: history, oldest first. Reading the
/// history marks the partner's messages as read.
pub async fn get_conversation(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ApiPath(partner_id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let before = parse_cursor(query.before.as_deref())?;
    let limit = clamp_limit(query.limit, DEFAULT_LIMIT, MAX_LIMIT);

    let (me, partner) = (claims.sub.to_string(), partner_id.to_string());
    let found = db_call(&state, move |db| {
        if db.get_user_summary(&partner)?.is_none() {
            return Ok(None);
        }
        let marked = db.mark_read(&me, &partner)?;
        let rows = db.get_conversation(&me, &partner, before.as_deref(), limit)?;
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let media = db.get_media_for_messages(&ids)?;
        Ok(Some((marked, rows, media)))
    })
    .await?;
    let (marked, rows, media) = found.ok_or_else(|| ApiError::not_found("User"))?;

    if marked > 0 {
        debug!("{} read {} messages from {}", claims.username, marked, partner_id);
        state.dispatcher.broadcast(GatewayEvent::ChatListUpdate {
            user_ids: vec![claims.sub, partner_id],
        });
    }

    let mut media = group_media(media);
    let messages: Vec<MessageResponse> = rows
        .into_iter()
        .map(|row| {
            let attached = media.remove(&row.id).unwrap_or_default();
            message_response(row, attached)
        })
        .collect();

    Ok(Json(messages))
}

/// POST /api/messages/with/{user_id}
pub async fn send_message(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ApiPath(recipient_id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if recipient_id == claims.sub {
        return Err(ApiError::BadRequest("You cannot message yourself".into()));
    }
    let content = prepare_content(&req.content)?;
    let preview = if content.text.is_empty() {
        "Sent an attachment".to_string()
    } else {
        snippet(&content.text, 100)
    };

    let (id, sender, recipient) = (
        Uuid::new_v4().to_string(),
        claims.sub.to_string(),
        recipient_id.to_string(),
    );
    let created = db_call(&state, move |db| {
        if db.get_user_summary(&recipient)?.is_none() {
            return Ok(None);
        }
        let body = NewContent {
            content: &content.text,
            media: &content.media,
        };
        db.create_message(&id, &sender, &recipient, &body).map(Some)
    })
    .await?
    .ok_or_else(|| ApiError::not_found("User"))?;

    let message = with_media(&state, created).await?;
    info!("{} sent message {} to {}", claims.username, message.id, recipient_id);

    broadcast_message(&state, MessageAction::Created, message.clone());
    let sender_name = current_username(&state, &claims).await?;
    notify_user(
        &state,
        recipient_id,
        PushPayload {
            title: format!("New message from {}", sender_name),
            body: preview,
            url: state.settings.frontend_link(&format!("/messages/{}", claims.sub)),
        },
    );

    Ok((StatusCode::CREATED, Json(message)))
}

/// PUT /api/messages/{id}
pub async fn update_message(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ApiPath(message_id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = prepare_content(&req.content)?;
    require_sender(&state, message_id, claims.sub).await?;

    let (id, sender) = (message_id.to_string(), claims.sub.to_string());
    let updated = db_call(&state, move |db| {
        let body = NewContent {
            content: &content.text,
            media: &content.media,
        };
        db.update_message(&id, &sender, &body)
    })
    .await?
    .ok_or_else(|| ApiError::not_found("Message"))?;

    let message = with_media(&state, updated).await?;
    broadcast_message(&state, MessageAction::Updated, message.clone());
    Ok(Json(message))
}

/// DELETE /api/messages/{id}
pub async fn delete_message(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ApiPath(message_id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let row = require_sender(&state, message_id, claims.sub).await?;
    let message = with_media(&state, row).await?;

    let id = message_id.to_string();
    let paths = db_call(&state, move |db| db.delete_message(&id))
        .await?
        .ok_or_else(|| ApiError::not_found("Message"))?;
    info!(
        "{} deleted message {} to {}",
        claims.username, message_id, message.recipient_id
    );

    broadcast_message(&state, MessageAction::Deleted, message);

    let cleanup = state.clone();
    tokio::spawn(async move { cleanup.uploads.remove_all(&paths).await });

    Ok(Json(MessageBody {
        message: "Message deleted".into(),
    }))
}
