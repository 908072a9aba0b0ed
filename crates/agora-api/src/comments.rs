use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::info;
use uuid::Uuid;

use agora_db::models::NewContent;
use agora_types::api::{
    CommentResponse, CreateCommentRequest, LikeResponse, MessageBody, PushPayload,
    UpdateCommentRequest,
};

use crate::convert::{comment_response, comment_tree, group_media, parse_id};
use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath, AuthUser, Viewer};
use crate::media_html::{prepare_content, snippet};
use crate::notifications::{current_username, notify_user};
use crate::state::{AppState, db_call};

async fn load_comment(
    state: &AppState,
    comment_id: Uuid,
    viewer_id: Option<String>,
) -> Result<CommentResponse, ApiError> {
    let id = comment_id.to_string();
    let found = db_call(state, move |db| {
        let Some(row) = db.get_comment(&id, viewer_id.as_deref())? else {
            return Ok(None);
        };
        let media = db.get_media_for_comments(std::slice::from_ref(&id))?;
        Ok(Some((row, media)))
    })
    .await?;
    let (row, media) = found.ok_or_else(|| ApiError::not_found("Comment"))?;

    let attached = group_media(media).remove(&row.id).unwrap_or_default();
    Ok(comment_response(row, attached, Vec::new()))
}

/// 404 when the comment is missing, 403 when the caller did not write it.
async fn require_comment_author(
    state: &AppState,
    comment_id: Uuid,
    user_id: Uuid,
) -> Result<(), ApiError> {
    let id = comment_id.to_string();
    let comment = db_call(state, move |db| db.get_comment(&id, None))
        .await?
        .ok_or_else(|| ApiError::not_found("Comment"))?;
    if comment.author.id != user_id.to_string() {
        return Err(ApiError::Forbidden("Only the author can change this comment".into()));
    }
    Ok(())
}

/// GET /api/posts/{id}/comments
pub async fn list_comments(
    State(state): State<AppState>,
    viewer: Viewer,
    ApiPath(post_id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let (id, viewer_id) = (post_id.to_string(), viewer.id());
    let found = db_call(&state, move |db| {
        if db.get_post_author(&id)?.is_none() {
            return Ok(None);
        }
        let comments = db.list_comments(&id, viewer_id.as_deref())?;
        let ids: Vec<String> = comments.iter().map(|c| c.id.clone()).collect();
        let media = db.get_media_for_comments(&ids)?;
        Ok(Some((comments, media)))
    })
    .await?;
    let (comments, media) = found.ok_or_else(|| ApiError::not_found("Post"))?;

    Ok(Json(comment_tree(comments, &mut group_media(media))))
}

/// POST /api/posts/{id}/comments
pub async fn create_comment(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ApiPath(post_id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<CreateCommentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = prepare_content(&req.content)?;
    let preview = snippet(&content.text, 100);

    let comment_id = Uuid::new_v4();
    let (id, pid, author) = (
        comment_id.to_string(),
        post_id.to_string(),
        claims.sub.to_string(),
    );
    let parent = req.parent_id.map(|p| p.to_string());

    // (post author, parent author), or which lookup failed.
    let outcome = db_call(&state, move |db| {
        let Some(post_author) = db.get_post_author(&pid)? else {
            return Ok(Err(ApiError::not_found("Post")));
        };

        let parent_author = match &parent {
            Some(parent_id) => match db.get_comment(parent_id, None)? {
                Some(parent) if parent.post_id == pid => Some(parent.author.id),
                _ => {
                    return Ok(Err(ApiError::BadRequest(
                        "Parent comment does not belong to this post".into(),
                    )));
                }
            },
            None => None,
        };

        let body = NewContent {
            content: &content.text,
            media: &content.media,
        };
        db.create_comment(&id, &pid, &author, parent.as_deref(), &body)?;
        Ok(Ok((post_author, parent_author)))
    })
    .await?;
    let (post_author, parent_author) = outcome?;
    info!("{} commented on post {}", claims.username, post_id);

    let actor = claims.sub.to_string();
    let actor_name = current_username(&state, &claims).await?;
    let link = state.settings.frontend_link(&format!("/posts/{}", post_id));
    if post_author != actor {
        notify_user(
            &state,
            parse_id(&post_author, "post author"),
            PushPayload {
                title: format!("{} commented on your post", actor_name),
                body: preview.clone(),
                url: link.clone(),
            },
        );
    }
    if let Some(parent_author) = parent_author.filter(|a| *a != actor && *a != post_author) {
        notify_user(
            &state,
            parse_id(&parent_author, "parent author"),
            PushPayload {
                title: format!("{} replied to your comment", actor_name),
                body: preview,
                url: link,
            },
        );
    }

    let comment = load_comment(&state, comment_id, Some(actor)).await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

/// PUT /api/comments/{id}
pub async fn update_comment(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ApiPath(comment_id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdateCommentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = prepare_content(&req.content)?;
    require_comment_author(&state, comment_id, claims.sub).await?;

    let (id, author) = (comment_id.to_string(), claims.sub.to_string());
    let updated = db_call(&state, move |db| {
        let body = NewContent {
            content: &content.text,
            media: &content.media,
        };
        db.update_comment(&id, &author, &body)
    })
    .await?;
    if !updated {
        return Err(ApiError::not_found("Comment"));
    }

    let comment = load_comment(&state, comment_id, Some(claims.sub.to_string())).await?;
    Ok(Json(comment))
}

/// DELETE /api/comments/{id}: removes the comment and its replies.
pub async fn delete_comment(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ApiPath(comment_id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    require_comment_author(&state, comment_id, claims.sub).await?;

    let id = comment_id.to_string();
    let paths = db_call(&state, move |db| db.delete_comment(&id))
        .await?
        .ok_or_else(|| ApiError::not_found("Comment"))?;
    info!("{} deleted comment {}", claims.username, comment_id);

    let cleanup = state.clone();
    tokio::spawn(async move { cleanup.uploads.remove_all(&paths).await });

    Ok(Json(MessageBody {
        message: "Comment deleted".into(),
    }))
}

/// POST /api/comments/{id}/like
pub async fn toggle_like(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ApiPath(comment_id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let (id, uid) = (comment_id.to_string(), claims.sub.to_string());
    let result = db_call(&state, move |db| {
        if db.get_comment(&id, None)?.is_none() {
            return Ok(None);
        }
        db.toggle_comment_like(&id, &uid).map(Some)
    })
    .await?;
    let (liked, like_count) = result.ok_or_else(|| ApiError::not_found("Comment"))?;

    Ok(Json(LikeResponse { liked, like_count }))
}
