use anyhow::Result;
use rusqlite::params;

use super::media::{MediaOwner, media_refs_for, reclaim_uploads, replace_media};
use super::{OptionalExt, summary_at};
use crate::models::{CommentRow, NewContent};
use crate::{Database, now_timestamp};

const COMMENT_SELECT: &str = "
    SELECT c.id, c.post_id, c.parent_id, u.id, u.username, u.avatar_url, c.content,
           c.media_type, c.media_path,
           (SELECT COUNT(*) FROM comment_likes l WHERE l.comment_id = c.id),
           EXISTS(SELECT 1 FROM comment_likes l WHERE l.comment_id = c.id AND l.user_id = ?1),
           c.created_at, c.updated_at
    FROM comments c
    JOIN users u ON u.id = c.author_id";

fn map_comment(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommentRow> {
    Ok(CommentRow {
        id: row.get(0)?,
        post_id: row.get(1)?,
        parent_id: row.get(2)?,
        author: summary_at(row, 3)?,
        content: row.get(6)?,
        media_type: row.get(7)?,
        media_path: row.get(8)?,
        like_count: row.get(9)?,
        liked_by_viewer: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

impl Database {
    pub fn create_comment(
        &self,
        id: &str,
        post_id: &str,
        author_id: &str,
        parent_id: Option<&str>,
        body: &NewContent<'_>,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let now = now_timestamp();
            let (media_type, media_path) = body.primary_media();
            tx.execute(
                "INSERT INTO comments (id, post_id, author_id, parent_id, content, media_type, media_path, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![id, post_id, author_id, parent_id, body.content, media_type, media_path, now],
            )?;
            replace_media(&tx, author_id, MediaOwner::Comment(id), body.media)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_comment(&self, id: &str, viewer_id: Option<&str>) -> Result<Option<CommentRow>> {
        self.with_conn(|conn| {
            let sql = format!("{} WHERE c.id = ?2", COMMENT_SELECT);
            conn.query_row(&sql, params![viewer_id, id], map_comment).optional()
        })
    }

    /// All comments of a post, oldest first. Threading is left to the caller.
    pub fn list_comments(&self, post_id: &str, viewer_id: Option<&str>) -> Result<Vec<CommentRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "{} WHERE c.post_id = ?2 ORDER BY c.created_at ASC, c.id ASC",
                COMMENT_SELECT
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![viewer_id, post_id], map_comment)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn update_comment(&self, id: &str, author_id: &str, body: &NewContent<'_>) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let (media_type, media_path) = body.primary_media();
            let changed = tx.execute(
                "UPDATE comments SET content = ?2, media_type = ?3, media_path = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![id, body.content, media_type, media_path, now_timestamp()],
            )?;
            if changed > 0 {
                replace_media(&tx, author_id, MediaOwner::Comment(id), body.media)?;
            }
            tx.commit()?;
            Ok(changed > 0)
        })
    }

    /// Deletes the comment and, through the FK cascade, all its replies.
    /// Returns the uploads the removed thread leaves unreferenced.
    pub fn delete_comment(&self, id: &str) -> Result<Option<Vec<String>>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let refs = media_refs_for(&tx, MediaOwner::Comment(id))?;
            let removed = tx.execute("DELETE FROM comments WHERE id = ?1", [id])?;
            if removed == 0 {
                return Ok(None);
            }
            let paths = reclaim_uploads(&tx, &refs)?;
            tx.commit()?;
            Ok(Some(paths))
        })
    }

    /// Toggle a like: removes if exists, inserts if not.
    /// Returns (liked, like_count).
    pub fn toggle_comment_like(&self, comment_id: &str, user_id: &str) -> Result<(bool, i64)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM comment_likes WHERE comment_id = ?1 AND user_id = ?2",
                params![comment_id, user_id],
            )?;
            if removed == 0 {
                tx.execute(
                    "INSERT INTO comment_likes (comment_id, user_id, created_at) VALUES (?1, ?2, ?3)",
                    params![comment_id, user_id, now_timestamp()],
                )?;
            }
            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM comment_likes WHERE comment_id = ?1",
                [comment_id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok((removed == 0, count))
        })
    }
}
