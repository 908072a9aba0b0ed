use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use agora_db::models::NewContent;
use agora_db::queries::PostFilter;
use agora_types::api::{
    CreatePostRequest, LikeResponse, MessageBody, PostDetailResponse, PostResponse, PushPayload,
    UpdatePostRequest,
};

use crate::convert::{comment_tree, group_media, parse_id, post_response};
use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath, ApiQuery, AuthUser, Viewer};
use crate::media_html::{prepare_content, snippet};
use crate::notifications::{current_username, notify_user};
use crate::state::{AppState, db_call};

const DEFAULT_LIMIT: u32 = 20;
const MAX_LIMIT: u32 = 100;
const TITLE_MAX: usize = 200;

#[derive(Debug, Default, Deserialize)]
pub struct PostsQuery {
    pub limit: Option<u32>,
    pub before: Option<String>,
    pub feed: Option<String>,
}

/// Page size clamped to `1..=max`.
pub(crate) fn clamp_limit(limit: Option<u32>, default: u32, max: u32) -> u32 {
    limit.unwrap_or(default).clamp(1, max)
}

/// Normalise a `before` cursor to the stored timestamp format so it
/// compares correctly against `created_at`.
pub(crate) fn parse_cursor(before: Option<&str>) -> Result<Option<String>, ApiError> {
    before
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Micros, true))
                .map_err(|_| ApiError::BadRequest("'before' must be an RFC 3339 timestamp".into()))
        })
        .transpose()
}

fn validate_title(title: Option<String>) -> Result<Option<String>, ApiError> {
    let title = title.map(|t| t.trim().to_string());
    if title.as_ref().is_some_and(|t| t.chars().count() > TITLE_MAX) {
        return Err(ApiError::BadRequest(format!(
            "Title must be at most {} characters",
            TITLE_MAX
        )));
    }
    Ok(title)
}

async fn load_posts(
    state: &AppState,
    filter: PostFilter,
    viewer_id: Option<String>,
) -> Result<Vec<PostResponse>, ApiError> {
    let (rows, media) = db_call(state, move |db| {
        let rows = db.list_posts(&filter, viewer_id.as_deref())?;
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let media = db.get_media_for_posts(&ids)?;
        Ok((rows, media))
    })
    .await?;

    let mut media = group_media(media);
    Ok(rows
        .into_iter()
        .map(|row| {
            let attached = media.remove(&row.id).unwrap_or_default();
            post_response(row, attached)
        })
        .collect())
}

async fn load_post(
    state: &AppState,
    post_id: Uuid,
    viewer_id: Option<String>,
) -> Result<PostResponse, ApiError> {
    let id = post_id.to_string();
    let found = db_call(state, move |db| {
        let Some(row) = db.get_post(&id, viewer_id.as_deref())? else {
            return Ok(None);
        };
        let media = db.get_media_for_posts(std::slice::from_ref(&id))?;
        Ok(Some((row, media)))
    })
    .await?;
    let (row, media) = found.ok_or_else(|| ApiError::not_found("Post"))?;

    let attached = group_media(media).remove(&row.id).unwrap_or_default();
    Ok(post_response(row, attached))
}

/// 404 when the post is missing, 403 when the caller is not its author.
async fn require_post_author(state: &AppState, post_id: Uuid, user_id: Uuid) -> Result<(), ApiError> {
    let id = post_id.to_string();
    let author = db_call(state, move |db| db.get_post_author(&id))
        .await?
        .ok_or_else(|| ApiError::not_found("Post"))?;
    if author != user_id.to_string() {
        return Err(ApiError::Forbidden("Only the author can change this post".into()));
    }
    Ok(())
}

/// GET /api/posts
pub async fn list_posts(
    State(state): State<AppState>,
    viewer: Viewer,
    ApiQuery(query): ApiQuery<PostsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let mut filter = PostFilter {
        before: parse_cursor(query.before.as_deref())?,
        limit: clamp_limit(query.limit, DEFAULT_LIMIT, MAX_LIMIT),
        ..Default::default()
    };

    match query.feed.as_deref() {
        None | Some("") | Some("all") => {}
        Some("following") => {
            let viewer_id = viewer
                .id()
                .ok_or_else(|| ApiError::Unauthorized("Log in to see your following feed".into()))?;
            filter.followed_by = Some(viewer_id);
        }
        Some(other) => return Err(ApiError::BadRequest(format!("Unknown feed '{}'", other))),
    }

    Ok(Json(load_posts(&state, filter, viewer.id()).await?))
}

/// GET /api/users/{id}/posts
pub async fn list_user_posts(
    State(state): State<AppState>,
    viewer: Viewer,
    ApiPath(user_id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<PostsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let uid = user_id.to_string();
    let exists = db_call(&state, move |db| Ok(db.get_user_summary(&uid)?.is_some())).await?;
    if !exists {
        return Err(ApiError::not_found("User"));
    }

    let filter = PostFilter {
        author_id: Some(user_id.to_string()),
        before: parse_cursor(query.before.as_deref())?,
        limit: clamp_limit(query.limit, DEFAULT_LIMIT, MAX_LIMIT),
        ..Default::default()
    };
    Ok(Json(load_posts(&state, filter, viewer.id()).await?))
}

/// GET /api/posts/{id}: the post with its comment tree.
pub async fn get_post(
    State(state): State<AppState>,
    viewer: Viewer,
    ApiPath(post_id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let post = load_post(&state, post_id, viewer.id()).await?;

    let (id, viewer_id) = (post_id.to_string(), viewer.id());
    let (comments, media) = db_call(&state, move |db| {
        let comments = db.list_comments(&id, viewer_id.as_deref())?;
        let ids: Vec<String> = comments.iter().map(|c| c.id.clone()).collect();
        let media = db.get_media_for_comments(&ids)?;
        Ok((comments, media))
    })
    .await?;

    let comments = comment_tree(comments, &mut group_media(media));
    Ok(Json(PostDetailResponse { post, comments }))
}

/// POST /api/posts
pub async fn create_post(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ApiJson(req): ApiJson<CreatePostRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let title = validate_title(req.title)?;
    let content = prepare_content(&req.content)?;

    let post_id = Uuid::new_v4();
    let (id, author) = (post_id.to_string(), claims.sub.to_string());
    db_call(&state, move |db| {
        let body = NewContent {
            content: &content.text,
            media: &content.media,
        };
        db.create_post(&id, &author, title.as_deref(), &body)
    })
    .await?;
    info!("{} created post {}", claims.username, post_id);

    let post = load_post(&state, post_id, Some(claims.sub.to_string())).await?;
    Ok((StatusCode::CREATED, Json(post)))
}

/// PUT /api/posts/{id}
pub async fn update_post(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ApiPath(post_id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdatePostRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.title.is_none() && req.content.is_none() {
        return Err(ApiError::BadRequest("Nothing to update".into()));
    }
    let title = validate_title(req.title)?;
    let content = req.content.as_deref().map(prepare_content).transpose()?;

    require_post_author(&state, post_id, claims.sub).await?;

    let (id, author) = (post_id.to_string(), claims.sub.to_string());
    db_call(&state, move |db| {
        let body = content.as_ref().map(|c| NewContent {
            content: &c.text,
            media: &c.media,
        });
        db.update_post(&id, &author, title.as_deref(), body.as_ref())
    })
    .await?;

    let post = load_post(&state, post_id, Some(claims.sub.to_string())).await?;
    Ok(Json(post))
}

/// DELETE /api/posts/{id}
pub async fn delete_post(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ApiPath(post_id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    require_post_author(&state, post_id, claims.sub).await?;

    let id = post_id.to_string();
    let paths = db_call(&state, move |db| db.delete_post(&id))
        .await?
        .ok_or_else(|| ApiError::not_found("Post"))?;
    info!("{} deleted post {}", claims.username, post_id);

    let cleanup = state.clone();
    tokio::spawn(async move { cleanup.uploads.remove_all(&paths).await });

    Ok(Json(MessageBody {
        message: "Post deleted".into(),
    }))
}

/// POST /api/posts/{id}/like
pub async fn toggle_like(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ApiPath(post_id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let (id, uid) = (post_id.to_string(), claims.sub.to_string());
    let result = db_call(&state, move |db| {
        let Some(post) = db.get_post(&id, None)? else {
            return Ok(None);
        };
        let (liked, like_count) = db.toggle_post_like(&id, &uid)?;
        Ok(Some((post, liked, like_count)))
    })
    .await?;
    let (post, liked, like_count) = result.ok_or_else(|| ApiError::not_found("Post"))?;

    if liked && post.author.id != claims.sub.to_string() {
        let author_id = parse_id(&post.author.id, "author id");
        let liker_name = current_username(&state, &claims).await?;
        let preview = post
            .title
            .clone()
            .unwrap_or_else(|| snippet(&post.content, 80));
        notify_user(
            &state,
            author_id,
            PushPayload {
                title: format!("{} liked your post", liker_name),
                body: preview,
                url: state.settings.frontend_link(&format!("/posts/{}", post_id)),
            },
        );
    }

    Ok(Json(LikeResponse { liked, like_count }))
}
