use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::MediaType;

// -- Errors --

/// Body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub details: Option<String>,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    /// Email address, or username.
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: UserProfile,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailQuery {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct ResendVerificationRequest {
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageBody {
    pub message: String,
}

// -- Users --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
    pub avatar_url: Option<String>,
}

/// The caller's own profile, including private fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatUser {
    #[serde(flatten)]
    pub user: UserSummary,
    pub online: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublicProfile {
    #[serde(flatten)]
    pub user: UserSummary,
    pub bio: Option<String>,
    pub created_at: DateTime<Utc>,
    pub post_count: i64,
    pub follower_count: i64,
    pub following_count: i64,
    pub is_following: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateProfileRequest {
    pub username: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FollowResponse {
    pub following: bool,
    pub follower_count: i64,
}

// -- Media --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaResponse {
    pub id: Uuid,
    pub media_type: MediaType,
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub url: String,
    pub media_type: MediaType,
    pub size: u64,
}

// -- Posts --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreatePostRequest {
    pub title: Option<String>,
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdatePostRequest {
    pub title: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PostResponse {
    pub id: Uuid,
    pub author: UserSummary,
    pub title: Option<String>,
    pub content: String,
    pub media_type: Option<MediaType>,
    pub media_path: Option<String>,
    pub media: Vec<MediaResponse>,
    pub like_count: i64,
    pub comment_count: i64,
    pub liked_by_me: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PostDetailResponse {
    #[serde(flatten)]
    pub post: PostResponse,
    pub comments: Vec<CommentResponse>,
}

// -- Comments --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateCommentRequest {
    pub content: String,
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateCommentRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentResponse {
    pub id: Uuid,
    pub post_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub author: UserSummary,
    pub content: String,
    pub media_type: Option<MediaType>,
    pub media_path: Option<String>,
    pub media: Vec<MediaResponse>,
    pub like_count: i64,
    pub liked_by_me: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub replies: Vec<CommentResponse>,
}

// -- Likes --

#[derive(Debug, Serialize, Deserialize)]
pub struct LikeResponse {
    pub liked: bool,
    pub like_count: i64,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub content: String,
    pub media_type: Option<MediaType>,
    pub media_path: Option<String>,
    pub media: Vec<MediaResponse>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub partner: UserSummary,
    pub last_message: MessageResponse,
    pub unread_count: i64,
}

// -- Notifications --

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushSubscriptionRequest {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeRequest {
    pub endpoint: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VapidKeyResponse {
    pub public_key: String,
}

/// JSON payload delivered to the browser's service worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub url: String,
}
