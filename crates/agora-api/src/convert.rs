//! Row to response mapping. Stored ids and timestamps are trusted but
//! never unwrapped: corrupt values are logged and replaced by defaults.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use agora_db::models::{CommentRow, MediaRow, MessageRow, PostRow, UserRow, UserSummaryRow};
use agora_types::api::{
    CommentResponse, MediaResponse, MessageResponse, PostResponse, UserProfile, UserSummary,
};
use agora_types::models::MediaType;

pub fn parse_id(raw: &str, what: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, raw, e);
        Uuid::default()
    })
}

pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // Rows written by SQLite's CURRENT_TIMESTAMP have no timezone.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", raw, e);
            DateTime::default()
        })
}

fn parse_media_type(raw: Option<&str>) -> Option<MediaType> {
    let raw = raw?;
    match raw.parse() {
        Ok(kind) => Some(kind),
        Err(e) => {
            warn!("{}", e);
            None
        }
    }
}

pub fn user_summary(row: UserSummaryRow) -> UserSummary {
    UserSummary {
        id: parse_id(&row.id, "user id"),
        username: row.username,
        avatar_url: row.avatar_url,
    }
}

pub fn user_profile(row: UserRow) -> UserProfile {
    UserProfile {
        id: parse_id(&row.id, "user id"),
        username: row.username,
        email: row.email,
        bio: row.bio,
        avatar_url: row.avatar_url,
        is_verified: row.is_verified,
        created_at: parse_timestamp(&row.created_at),
    }
}

/// Media rows grouped by the id of the post, comment or message they
/// belong to, in attachment order.
pub fn group_media(rows: Vec<MediaRow>) -> HashMap<String, Vec<MediaResponse>> {
    let mut grouped: HashMap<String, Vec<MediaResponse>> = HashMap::new();
    for row in rows {
        let Some(owner) = row.post_id.or(row.comment_id).or(row.message_id) else {
            warn!("Media '{}' has no owner", row.id);
            continue;
        };
        let Some(media_type) = parse_media_type(Some(&row.media_type)) else {
            continue;
        };
        grouped.entry(owner).or_default().push(MediaResponse {
            id: parse_id(&row.id, "media id"),
            media_type,
            path: row.path,
        });
    }
    grouped
}

pub fn post_response(row: PostRow, media: Vec<MediaResponse>) -> PostResponse {
    PostResponse {
        id: parse_id(&row.id, "post id"),
        author: user_summary(row.author),
        title: row.title,
        content: row.content,
        media_type: parse_media_type(row.media_type.as_deref()),
        media_path: row.media_path,
        media,
        like_count: row.like_count,
        comment_count: row.comment_count,
        liked_by_me: row.liked_by_viewer,
        created_at: parse_timestamp(&row.created_at),
        updated_at: parse_timestamp(&row.updated_at),
    }
}

pub fn comment_response(
    row: CommentRow,
    media: Vec<MediaResponse>,
    replies: Vec<CommentResponse>,
) -> CommentResponse {
    CommentResponse {
        id: parse_id(&row.id, "comment id"),
        post_id: parse_id(&row.post_id, "post id"),
        parent_id: row.parent_id.as_deref().map(|p| parse_id(p, "parent id")),
        author: user_summary(row.author),
        content: row.content,
        media_type: parse_media_type(row.media_type.as_deref()),
        media_path: row.media_path,
        media,
        like_count: row.like_count,
        liked_by_me: row.liked_by_viewer,
        created_at: parse_timestamp(&row.created_at),
        updated_at: parse_timestamp(&row.updated_at),
        replies,
    }
}

pub fn message_response(row: MessageRow, media: Vec<MediaResponse>) -> MessageResponse {
    MessageResponse {
        id: parse_id(&row.id, "message id"),
        sender_id: parse_id(&row.sender_id, "sender id"),
        recipient_id: parse_id(&row.recipient_id, "recipient id"),
        content: row.content,
        media_type: parse_media_type(row.media_type.as_deref()),
        media_path: row.media_path,
        media,
        is_read: row.is_read,
        created_at: parse_timestamp(&row.created_at),
        updated_at: parse_timestamp(&row.updated_at),
    }
}

/// Nest a flat, oldest-first comment list into reply threads. Comments
/// whose parent is missing from the list are promoted to the top level.
pub fn comment_tree(
    rows: Vec<CommentRow>,
    media: &mut HashMap<String, Vec<MediaResponse>>,
) -> Vec<CommentResponse> {
    let ids: HashSet<String> = rows.iter().map(|r| r.id.clone()).collect();
    let mut children: HashMap<Option<String>, Vec<CommentRow>> = HashMap::new();
    for row in rows {
        let parent = row.parent_id.clone().filter(|p| ids.contains(p));
        children.entry(parent).or_default().push(row);
    }
    build_level(None, &mut children, media)
}

fn build_level(
    parent: Option<String>,
    children: &mut HashMap<Option<String>, Vec<CommentRow>>,
    media: &mut HashMap<String, Vec<MediaResponse>>,
) -> Vec<CommentResponse> {
    let Some(rows) = children.remove(&parent) else {
        return Vec::new();
    };

    rows.into_iter()
        .map(|row| {
            let replies = build_level(Some(row.id.clone()), children, media);
            let attached = media.remove(&row.id).unwrap_or_default();
            comment_response(row, attached, replies)
        })
        .collect()
}
