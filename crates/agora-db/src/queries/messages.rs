use anyhow::Result;
use rusqlite::{Row, params};

use super::media::{MediaOwner, media_refs_for, reclaim_uploads, replace_media};
use super::{OptionalExt, summary_at};
use crate::models::{ConversationRow, MessageRow, NewContent};
use crate::{Database, now_timestamp};

const MESSAGE_COLUMNS: &str =
    "m.id, m.sender_id, m.recipient_id, m.content, m.media_type, m.media_path, m.is_read, m.created_at, m.updated_at";

fn message_at(row: &Row<'_>, start: usize) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(start)?,
        sender_id: row.get(start + 1)?,
        recipient_id: row.get(start + 2)?,
        content: row.get(start + 3)?,
        media_type: row.get(start + 4)?,
        media_path: row.get(start + 5)?,
        is_read: row.get(start + 6)?,
        created_at: row.get(start + 7)?,
        updated_at: row.get(start + 8)?,
    })
}

impl Database {
    pub fn create_message(
        &self,
        id: &str,
        sender_id: &str,
        recipient_id: &str,
        body: &NewContent<'_>,
    ) -> Result<MessageRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let now = now_timestamp();
            let (media_type, media_path) = body.primary_media();
            tx.execute(
                "INSERT INTO messages (id, sender_id, recipient_id, content, media_type, media_path, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![id, sender_id, recipient_id, body.content, media_type, media_path, now],
            )?;
            replace_media(&tx, sender_id, MediaOwner::Message(id), body.media)?;
            tx.commit()?;

            Ok(MessageRow {
                id: id.to_string(),
                sender_id: sender_id.to_string(),
                recipient_id: recipient_id.to_string(),
                content: body.content.to_string(),
                media_type: media_type.map(str::to_string),
                media_path: media_path.map(str::to_string),
                is_read: false,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM messages m WHERE m.id = ?1", MESSAGE_COLUMNS);
            conn.query_row(&sql, [id], |row| message_at(row, 0)).optional()
        })
    }

    /// Messages exchanged between two users, in ascending order. With
    /// `before`, the page ends just before that `created_at`.
    pub fn get_conversation(
        &self,
        user_a: &str,
        user_b: &str,
        before: Option<&str>,
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM messages m
                 WHERE ((m.sender_id = ?1 AND m.recipient_id = ?2) OR (m.sender_id = ?2 AND m.recipient_id = ?1))
                   AND (?3 IS NULL OR m.created_at < ?3)
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?4",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt
                .query_map(params![user_a, user_b, before, limit], |row| message_at(row, 0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
    }

    /// Marks everything `sender_id` sent to `recipient_id` as read.
    /// Returns how many messages changed.
    pub fn mark_read(&self, recipient_id: &str, sender_id: &str) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE recipient_id = ?1 AND sender_id = ?2 AND is_read = 0",
                params![recipient_id, sender_id],
            )?;
            Ok(changed)
        })
    }

    pub fn update_message(&self, id: &str, sender_id: &str, body: &NewContent<'_>) -> Result<Option<MessageRow>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let (media_type, media_path) = body.primary_media();
            let changed = tx.execute(
                "UPDATE messages SET content = ?2, media_type = ?3, media_path = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![id, body.content, media_type, media_path, now_timestamp()],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            replace_media(&tx, sender_id, MediaOwner::Message(id), body.media)?;

            let sql = format!("SELECT {} FROM messages m WHERE m.id = ?1", MESSAGE_COLUMNS);
            let row = tx.query_row(&sql, [id], |row| message_at(row, 0))?;
            tx.commit()?;
            Ok(Some(row))
        })
    }

    /// Returns the uploads left unreferenced, or None if the message did not exist.
    pub fn delete_message(&self, id: &str) -> Result<Option<Vec<String>>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let refs = media_refs_for(&tx, MediaOwner::Message(id))?;
            let removed = tx.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            if removed == 0 {
                return Ok(None);
            }
            let paths = reclaim_uploads(&tx, &refs)?;
            tx.commit()?;
            Ok(Some(paths))
        })
    }

    /// One row per conversation partner with the latest message and the
    /// number of unread messages from that partner, newest first.
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "WITH ranked AS (
                    SELECT id,
                           CASE WHEN sender_id = ?1 THEN recipient_id ELSE sender_id END AS partner_id,
                           ROW_NUMBER() OVER (
                               PARTITION BY CASE WHEN sender_id = ?1 THEN recipient_id ELSE sender_id END
                               ORDER BY created_at DESC, id DESC
                           ) AS rn
                    FROM messages
                    WHERE sender_id = ?1 OR recipient_id = ?1
                 )
                 SELECT u.id, u.username, u.avatar_url,
                        (SELECT COUNT(*) FROM messages x
                         WHERE x.recipient_id = ?1 AND x.sender_id = r.partner_id AND x.is_read = 0),
                        {}
                 FROM ranked r
                 JOIN messages m ON m.id = r.id
                 JOIN users u ON u.id = r.partner_id
                 WHERE r.rn = 1
                 ORDER BY m.created_at DESC",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ConversationRow {
                        partner: summary_at(row, 0)?,
                        unread_count: row.get(3)?,
                        last_message: message_at(row, 4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}
