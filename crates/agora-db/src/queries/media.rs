use anyhow::Result;
use rusqlite::{Connection, params};

use super::placeholders;
use crate::models::{MediaRow, NewMedia};
use crate::{Database, new_id, now_timestamp};

/// Which row a media item belongs to.
#[derive(Clone, Copy)]
pub(crate) enum MediaOwner<'a> {
    Post(&'a str),
    Comment(&'a str),
    Message(&'a str),
}

impl MediaOwner<'_> {
    fn column(&self) -> &'static str {
        match self {
            Self::Post(_) => "post_id",
            Self::Comment(_) => "comment_id",
            Self::Message(_) => "message_id",
        }
    }

    fn id(&self) -> &str {
        match self {
            Self::Post(id) | Self::Comment(id) | Self::Message(id) => id,
        }
    }
}

/// Replace the media rows of `owner` with `media`, keeping document order.
pub(crate) fn replace_media(
    conn: &Connection,
    owner_user_id: &str,
    owner: MediaOwner<'_>,
    media: &[NewMedia],
) -> Result<()> {
    let column = owner.column();
    conn.execute(
        &format!("DELETE FROM media WHERE {} = ?1", column),
        [owner.id()],
    )?;

    let sql = format!(
        "INSERT INTO media (id, owner_id, {}, media_type, path, position, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        column
    );
    let mut stmt = conn.prepare(&sql)?;
    let now = now_timestamp();
    for (position, item) in media.iter().enumerate() {
        stmt.execute(params![
            new_id(),
            owner_user_id,
            owner.id(),
            item.media_type,
            item.path,
            position as i64,
            now,
        ])?;
    }
    Ok(())
}

/// A media row about to disappear: the path it embedded and who embedded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MediaRef {
    pub path: String,
    pub owner_id: String,
}

/// Media attached to `owner`, including items of rows that will cascade
/// with it. Read before the delete so the refs survive it.
pub(crate) fn media_refs_for(conn: &Connection, owner: MediaOwner<'_>) -> Result<Vec<MediaRef>> {
    let sql = match owner {
        MediaOwner::Post(_) => {
            "SELECT path, owner_id FROM media WHERE post_id = ?1
             UNION ALL
             SELECT m.path, m.owner_id FROM media m JOIN comments c ON m.comment_id = c.id
             WHERE c.post_id = ?1"
        }
        MediaOwner::Comment(_) => {
            "WITH RECURSIVE thread(id) AS (
                SELECT ?1
                UNION ALL
                SELECT c.id FROM comments c JOIN thread t ON c.parent_id = t.id
             )
             SELECT path, owner_id FROM media WHERE comment_id IN (SELECT id FROM thread)"
        }
        MediaOwner::Message(_) => "SELECT path, owner_id FROM media WHERE message_id = ?1",
    };
    let mut stmt = conn.prepare(sql)?;
    let refs = stmt
        .query_map([owner.id()], |row| {
            Ok(MediaRef {
                path: row.get(0)?,
                owner_id: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(refs)
}

/// Forget and return the uploads that `refs` leave without a reference.
///
/// A path qualifies only when the user who embedded it also uploaded it,
/// and no remaining media row or avatar still points at it. Embedding
/// somebody else's upload never makes it deletable.
pub(crate) fn reclaim_uploads(conn: &Connection, refs: &[MediaRef]) -> Result<Vec<String>> {
    let mut claim = conn.prepare(
        "DELETE FROM uploads
         WHERE path = ?1 AND owner_id = ?2
           AND NOT EXISTS (SELECT 1 FROM media WHERE path = ?1)
           AND NOT EXISTS (SELECT 1 FROM users WHERE avatar_url = ?1)",
    )?;

    let mut reclaimed: Vec<String> = Vec::new();
    for r in refs {
        if reclaimed.contains(&r.path) {
            continue;
        }
        if claim.execute(params![r.path, r.owner_id])? > 0 {
            reclaimed.push(r.path.clone());
        }
    }
    Ok(reclaimed)
}

fn query_media(conn: &Connection, column: &str, ids: &[String]) -> Result<Vec<MediaRow>> {
    if ids.is_empty() {
        return Ok(vec![]);
    }

    let sql = format!(
        "SELECT id, post_id, comment_id, message_id, media_type, path
         FROM media WHERE {} IN ({})
         ORDER BY position",
        column,
        placeholders(1, ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();

    let rows = stmt
        .query_map(params.as_slice(), |row| {
            Ok(MediaRow {
                id: row.get(0)?,
                post_id: row.get(1)?,
                comment_id: row.get(2)?,
                message_id: row.get(3)?,
                media_type: row.get(4)?,
                path: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

impl Database {
    /// Batch-fetch media for a set of post IDs.
    pub fn get_media_for_posts(&self, post_ids: &[String]) -> Result<Vec<MediaRow>> {
        self.with_conn(|conn| query_media(conn, "post_id", post_ids))
    }

    pub fn get_media_for_comments(&self, comment_ids: &[String]) -> Result<Vec<MediaRow>> {
        self.with_conn(|conn| query_media(conn, "comment_id", comment_ids))
    }

    pub fn get_media_for_messages(&self, message_ids: &[String]) -> Result<Vec<MediaRow>> {
        self.with_conn(|conn| query_media(conn, "message_id", message_ids))
    }
}
