//! Database row types. These map directly to SQLite rows and stay
//! independent of the API types in agora-types.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password: String,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub is_verified: bool,
    pub verification_token: Option<String>,
    pub created_at: String,
}

/// Author columns joined onto posts, comments and user listings.
#[derive(Clone)]
pub struct UserSummaryRow {
    pub id: String,
    pub username: String,
    pub avatar_url: Option<String>,
}

pub struct ProfileStatsRow {
    pub post_count: i64,
    pub follower_count: i64,
    pub following_count: i64,
    pub is_following: bool,
}

pub struct PostRow {
    pub id: String,
    pub author: UserSummaryRow,
    pub title: Option<String>,
    pub content: String,
    pub media_type: Option<String>,
    pub media_path: Option<String>,
    pub like_count: i64,
    pub comment_count: i64,
    pub liked_by_viewer: bool,
    pub created_at: String,
    pub updated_at: String,
}

pub struct CommentRow {
    pub id: String,
    pub post_id: String,
    pub parent_id: Option<String>,
    pub author: UserSummaryRow,
    pub content: String,
    pub media_type: Option<String>,
    pub media_path: Option<String>,
    pub like_count: i64,
    pub liked_by_viewer: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub media_type: Option<String>,
    pub media_path: Option<String>,
    pub is_read: bool,
    pub created_at: String,
    pub updated_at: String,
}

pub struct ConversationRow {
    pub partner: UserSummaryRow,
    pub last_message: MessageRow,
    pub unread_count: i64,
}

pub struct MediaRow {
    pub id: String,
    pub post_id: Option<String>,
    pub comment_id: Option<String>,
    pub message_id: Option<String>,
    pub media_type: String,
    pub path: String,
}

pub struct PushSubscriptionRow {
    pub id: String,
    pub user_id: String,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}

/// Media item to attach when creating or editing content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMedia {
    pub media_type: String,
    pub path: String,
}

/// Text and media columns shared by posts, comments and messages.
pub struct NewContent<'a> {
    pub content: &'a str,
    pub media: &'a [NewMedia],
}

impl NewContent<'_> {
    /// Denormalised `media_type` / `media_path` columns: the first item.
    pub fn primary_media(&self) -> (Option<&str>, Option<&str>) {
        match self.media.first() {
            Some(m) => (Some(m.media_type.as_str()), Some(m.path.as_str())),
            None => (None, None),
        }
    }
}
