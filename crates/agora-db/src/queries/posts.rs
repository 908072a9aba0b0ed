use anyhow::Result;
use rusqlite::{Connection, params};

use super::media::{MediaOwner, media_refs_for, reclaim_uploads, replace_media};
use super::{OptionalExt, summary_at};
use crate::models::{NewContent, PostRow};
use crate::{Database, now_timestamp};

/// Which posts to list. All filters combine with AND.
#[derive(Debug, Default, Clone)]
pub struct PostFilter {
    pub author_id: Option<String>,
    /// Only authors this user follows.
    pub followed_by: Option<String>,
    /// `created_at` cursor: only posts strictly older.
    pub before: Option<String>,
    pub limit: u32,
}

const POST_SELECT: &str = "
    SELECT p.id, u.id, u.username, u.avatar_url, p.title, p.content, p.media_type, p.media_path,
           (SELECT COUNT(*) FROM post_likes l WHERE l.post_id = p.id),
           (SELECT COUNT(*) FROM comments c WHERE c.post_id = p.id),
           EXISTS(SELECT 1 FROM post_likes l WHERE l.post_id = p.id AND l.user_id = ?1),
           p.created_at, p.updated_at
    FROM posts p
    JOIN users u ON u.id = p.author_id";

fn map_post(row: &rusqlite::Row<'_>) -> rusqlite::Result<PostRow> {
    Ok(PostRow {
        id: row.get(0)?,
        author: summary_at(row, 1)?,
        title: row.get(4)?,
        content: row.get(5)?,
        media_type: row.get(6)?,
        media_path: row.get(7)?,
        like_count: row.get(8)?,
        comment_count: row.get(9)?,
        liked_by_viewer: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

impl Database {
    pub fn create_post(
        &self,
        id: &str,
        author_id: &str,
        title: Option<&str>,
        body: &NewContent<'_>,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let now = now_timestamp();
            let (media_type, media_path) = body.primary_media();
            tx.execute(
                "INSERT INTO posts (id, author_id, title, content, media_type, media_path, created_at, updated_at)
                 VALUES (?1, ?2, NULLIF(?3, ''), ?4, ?5, ?6, ?7, ?7)",
                params![id, author_id, title, body.content, media_type, media_path, now],
            )?;
            replace_media(&tx, author_id, MediaOwner::Post(id), body.media)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_post(&self, id: &str, viewer_id: Option<&str>) -> Result<Option<PostRow>> {
        self.with_conn(|conn| {
            let sql = format!("{} WHERE p.id = ?2", POST_SELECT);
            conn.query_row(&sql, params![viewer_id, id], map_post).optional()
        })
    }

    /// Newest first.
    pub fn list_posts(&self, filter: &PostFilter, viewer_id: Option<&str>) -> Result<Vec<PostRow>> {
        self.with_conn(|conn| query_posts(conn, filter, viewer_id))
    }

    pub fn get_post_author(&self, id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT author_id FROM posts WHERE id = ?1", [id], |row| row.get(0))
                .optional()
        })
    }

    /// `None` leaves a field unchanged; an empty title clears it.
    /// Media rows are replaced only when new content is given.
    pub fn update_post(
        &self,
        id: &str,
        author_id: &str,
        title: Option<&str>,
        body: Option<&NewContent<'_>>,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let now = now_timestamp();
            let changed = tx.execute(
                "UPDATE posts SET
                    title = CASE WHEN ?2 IS NULL THEN title ELSE NULLIF(?2, '') END,
                    updated_at = ?3
                 WHERE id = ?1",
                params![id, title, now],
            )?;

            if let (true, Some(body)) = (changed > 0, body) {
                let (media_type, media_path) = body.primary_media();
                tx.execute(
                    "UPDATE posts SET content = ?2, media_type = ?3, media_path = ?4 WHERE id = ?1",
                    params![id, body.content, media_type, media_path],
                )?;
                replace_media(&tx, author_id, MediaOwner::Post(id), body.media)?;
            }
            tx.commit()?;
            Ok(changed > 0)
        })
    }

    /// Deletes the post with its comments, likes and media.
    /// Returns the uploads left unreferenced, for file cleanup.
    pub fn delete_post(&self, id: &str) -> Result<Option<Vec<String>>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let refs = media_refs_for(&tx, MediaOwner::Post(id))?;
            let removed = tx.execute("DELETE FROM posts WHERE id = ?1", [id])?;
            if removed == 0 {
                return Ok(None);
            }
            let paths = reclaim_uploads(&tx, &refs)?;
            tx.commit()?;
            Ok(Some(paths))
        })
    }

    // -- Likes --

    /// Toggle a like: removes if exists, inserts if not.
    /// Returns (liked, like_count).
    pub fn toggle_post_like(&self, post_id: &str, user_id: &str) -> Result<(bool, i64)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM post_likes WHERE post_id = ?1 AND user_id = ?2",
                params![post_id, user_id],
            )?;
            if removed == 0 {
                tx.execute(
                    "INSERT INTO post_likes (post_id, user_id, created_at) VALUES (?1, ?2, ?3)",
                    params![post_id, user_id, now_timestamp()],
                )?;
            }
            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM post_likes WHERE post_id = ?1",
                [post_id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok((removed == 0, count))
        })
    }
}

fn query_posts(conn: &Connection, filter: &PostFilter, viewer_id: Option<&str>) -> Result<Vec<PostRow>> {
    let sql = format!(
        "{}
         WHERE (?2 IS NULL OR p.author_id = ?2)
           AND (?3 IS NULL OR p.author_id IN (SELECT following_id FROM user_follows WHERE follower_id = ?3))
           AND (?4 IS NULL OR p.created_at < ?4)
         ORDER BY p.created_at DESC, p.id DESC
         LIMIT ?5",
        POST_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![
                viewer_id,
                filter.author_id,
                filter.followed_by,
                filter.before,
                filter.limit
            ],
            map_post,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
