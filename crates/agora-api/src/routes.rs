use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post, put},
};

use crate::middleware::authenticate;
use crate::state::AppState;
use crate::{auth, comments, messages, notifications, posts, uploads, users};

/// Multipart framing on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Every REST route under `/api`. The bearer token, when sent, is checked
/// for all of them; handlers that need a caller extract `AuthUser`.
pub fn router(state: AppState) -> Router {
    let upload_limit = state.settings.max_upload_bytes + MULTIPART_OVERHEAD;

    let auth_routes = Router::new()
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/verify-email", get(auth::verify_email))
        .route("/api/auth/resend-verification", post(auth::resend_verification))
        .route("/api/auth/me", get(auth::me));

    let user_routes = Router::new()
        .route("/api/users", get(users::list_users))
        .route("/api/users/me", get(auth::me).put(users::update_me))
        .route("/api/users/{id}", get(users::get_profile))
        .route("/api/users/{id}/follow", post(users::toggle_follow))
        .route("/api/users/{id}/followers", get(users::followers))
        .route("/api/users/{id}/following", get(users::following))
        .route("/api/users/{id}/posts", get(posts::list_user_posts));

    let post_routes = Router::new()
        .route("/api/posts", get(posts::list_posts).post(posts::create_post))
        .route(
            "/api/posts/{id}",
            get(posts::get_post)
                .put(posts::update_post)
                .delete(posts::delete_post),
        )
        .route("/api/posts/{id}/like", post(posts::toggle_like))
        .route(
            "/api/posts/{id}/comments",
            get(comments::list_comments).post(comments::create_comment),
        )
        .route(
            "/api/comments/{id}",
            put(comments::update_comment).delete(comments::delete_comment),
        )
        .route("/api/comments/{id}/like", post(comments::toggle_like));

    let message_routes = Router::new()
        .route("/api/messages/conversations", get(messages::list_conversations))
        .route(
            "/api/messages/with/{user_id}",
            get(messages::get_conversation).post(messages::send_message),
        )
        .route(
            "/api/messages/{id}",
            put(messages::update_message).delete(messages::delete_message),
        );

    let notification_routes = Router::new()
        .route(
            "/api/notifications/vapid-public-key",
            get(notifications::vapid_public_key),
        )
        .route(
            "/api/notifications/subscribe",
            post(notifications::subscribe).delete(notifications::unsubscribe),
        );

    let upload_routes = Router::new().route(
        "/api/uploads/{folder}",
        post(uploads::upload).layer(DefaultBodyLimit::max(upload_limit)),
    );

    Router::new()
        .merge(auth_routes)
        .merge(user_routes)
        .merge(post_routes)
        .merge(message_routes)
        .merge(notification_routes)
        .merge(upload_routes)
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .with_state(state)
}
