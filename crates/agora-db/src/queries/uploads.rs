use anyhow::Result;
use rusqlite::params;

use super::OptionalExt;
use super::media::{MediaRef, reclaim_uploads};
use crate::{Database, now_timestamp};

impl Database {
    /// Remember who stored the file behind `path`.
    pub fn record_upload(&self, path: &str, owner_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO uploads (path, owner_id, created_at) VALUES (?1, ?2, ?3)",
                params![path, owner_id, now_timestamp()],
            )?;
            Ok(())
        })
    }

    pub fn forget_upload(&self, path: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute("DELETE FROM uploads WHERE path = ?1", [path])?;
            Ok(())
        })
    }

    pub fn upload_owner(&self, path: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT owner_id FROM uploads WHERE path = ?1",
                [path],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Point the user's avatar at `url`. Returns the previous avatar when it
    /// was the user's own upload and nothing references it any more.
    pub fn replace_avatar(&self, user_id: &str, url: &str) -> Result<Option<String>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let previous: Option<String> = tx
                .query_row("SELECT avatar_url FROM users WHERE id = ?1", [user_id], |row| {
                    row.get(0)
                })
                .optional()?
                .flatten();
            let changed = tx.execute(
                "UPDATE users SET avatar_url = ?2, updated_at = ?3 WHERE id = ?1",
                params![user_id, url, now_timestamp()],
            )?;
            if changed == 0 {
                anyhow::bail!("user {} not found", user_id);
            }

            let reclaimed = match previous.filter(|p| p != url) {
                Some(path) => {
                    let refs = [MediaRef {
                        path,
                        owner_id: user_id.to_string(),
                    }];
                    reclaim_uploads(&tx, &refs)?.pop()
                }
                None => None,
            };
            tx.commit()?;
            Ok(reclaimed)
        })
    }
}
