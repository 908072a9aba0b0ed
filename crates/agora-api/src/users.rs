use std::collections::HashSet;

use axum::{Json, extract::State, response::IntoResponse};
use tracing::info;
use uuid::Uuid;

use agora_db::queries::is_constraint_violation;
use agora_types::api::{
    ChatUser, FollowResponse, PublicProfile, PushPayload, UpdateProfileRequest, UserSummary,
};

use crate::auth::validate_username;
use crate::convert::{parse_timestamp, user_profile, user_summary};
use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath, AuthUser, Viewer};
use crate::notifications::{current_username, notify_user};
use crate::state::{AppState, db_call};

const BIO_MAX: usize = 500;
const AVATAR_URL_MAX: usize = 2048;

/// GET /api/users: everyone but the caller, with gateway presence.
pub async fn list_users(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let uid = claims.sub.to_string();
    let rows = db_call(&state, move |db| db.list_users_except(&uid)).await?;

    let online: HashSet<Uuid> = state
        .dispatcher
        .online_users()
        .await
        .into_iter()
        .map(|u| u.id)
        .collect();

    let users: Vec<ChatUser> = rows
        .into_iter()
        .map(|row| {
            let user = user_summary(row);
            let online = online.contains(&user.id);
            ChatUser { user, online }
        })
        .collect();

    Ok(Json(users))
}

/// GET /api/users/{id}
pub async fn get_profile(
    State(state): State<AppState>,
    viewer: Viewer,
    ApiPath(user_id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let uid = user_id.to_string();
    let viewer_id = viewer.id();
    let found = db_call(&state, move |db| {
        let Some(user) = db.get_user_by_id(&uid)? else {
            return Ok(None);
        };
        let stats = db.profile_stats(&uid, viewer_id.as_deref())?;
        Ok(Some((user, stats)))
    })
    .await?;
    let (user, stats) = found.ok_or_else(|| ApiError::not_found("User"))?;

    let created_at = parse_timestamp(&user.created_at);
    Ok(Json(PublicProfile {
        user: UserSummary {
            id: user_id,
            username: user.username,
            avatar_url: user.avatar_url,
        },
        bio: user.bio,
        created_at,
        post_count: stats.post_count,
        follower_count: stats.follower_count,
        following_count: stats.following_count,
        is_following: stats.is_following,
    }))
}

/// PUT /api/users/me
pub async fn update_me(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ApiJson(req): ApiJson<UpdateProfileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = req.username.map(|u| u.trim().to_string());
    if let Some(name) = &username {
        validate_username(name)?;
    }
    if req.bio.as_ref().is_some_and(|b| b.chars().count() > BIO_MAX) {
        return Err(ApiError::BadRequest(format!(
            "Bio must be at most {} characters",
            BIO_MAX
        )));
    }
    if req.avatar_url.as_ref().is_some_and(|a| a.len() > AVATAR_URL_MAX) {
        return Err(ApiError::BadRequest("Avatar URL is too long".into()));
    }

    let uid = claims.sub.to_string();
    let (name, bio, avatar) = (username.clone(), req.bio, req.avatar_url);
    let outcome = db_call(&state, move |db| {
        if let Some(name) = &name {
            if db.username_taken(name, Some(&uid))? {
                return Ok(None);
            }
        }
        match db.update_profile(&uid, name.as_deref(), bio.as_deref(), avatar.as_deref()) {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => return Ok(None),
            Err(e) => return Err(e),
        }
        db.get_user_by_id(&uid)
    })
    .await?;

    let Some(user) = outcome else {
        return Err(ApiError::Conflict("Username already taken".into()));
    };

    state.dispatcher.rename_user(claims.sub, user.username.clone()).await;
    state.dispatcher.broadcast_user_list().await;
    info!("{} updated their profile", user.username);

    Ok(Json(user_profile(user)))
}

/// POST /api/users/{id}/follow
pub async fn toggle_follow(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ApiPath(user_id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if user_id == claims.sub {
        return Err(ApiError::BadRequest("You cannot follow yourself".into()));
    }

    let (follower, target) = (claims.sub.to_string(), user_id.to_string());
    let result = db_call(&state, move |db| {
        if db.get_user_summary(&target)?.is_none() {
            return Ok(None);
        }
        db.toggle_follow(&follower, &target).map(Some)
    })
    .await?;
    let (following, follower_count) = result.ok_or_else(|| ApiError::not_found("User"))?;

    if following {
        let follower_name = current_username(&state, &claims).await?;
        notify_user(
            &state,
            user_id,
            PushPayload {
                title: "New follower".into(),
                body: format!("{} started following you", follower_name),
                url: state.settings.frontend_link(&format!("/users/{}", claims.sub)),
            },
        );
    }

    Ok(Json(FollowResponse {
        following,
        follower_count,
    }))
}

/// GET /api/users/{id}/followers
pub async fn followers(
    State(state): State<AppState>,
    ApiPath(user_id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let uid = user_id.to_string();
    let rows = db_call(&state, move |db| {
        if db.get_user_summary(&uid)?.is_none() {
            return Ok(None);
        }
        db.followers(&uid).map(Some)
    })
    .await?
    .ok_or_else(|| ApiError::not_found("User"))?;

    Ok(Json(rows.into_iter().map(user_summary).collect::<Vec<_>>()))
}

/// GET /api/users/{id}/following
pub async fn following(
    State(state): State<AppState>,
    ApiPath(user_id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let uid = user_id.to_string();
    let rows = db_call(&state, move |db| {
        if db.get_user_summary(&uid)?.is_none() {
            return Ok(None);
        }
        db.following(&uid).map(Some)
    })
    .await?
    .ok_or_else(|| ApiError::not_found("User"))?;

    Ok(Json(rows.into_iter().map(user_summary).collect::<Vec<_>>()))
}
