use anyhow::Result;
use rusqlite::params;

use crate::models::PushSubscriptionRow;
use crate::{Database, new_id, now_timestamp};

impl Database {
    /// Insert or refresh a subscription. An endpoint belongs to one user at a
    /// time; re-subscribing from another account moves it.
    pub fn upsert_push_subscription(
        &self,
        user_id: &str,
        endpoint: &str,
        p256dh: &str,
        auth: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let now = now_timestamp();
            conn.execute(
                "INSERT INTO push_subscriptions (id, user_id, endpoint, p256dh, auth, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(endpoint) DO UPDATE SET
                    user_id = excluded.user_id,
                    p256dh = excluded.p256dh,
                    auth = excluded.auth,
                    updated_at = excluded.updated_at",
                params![new_id(), user_id, endpoint, p256dh, auth, now],
            )?;
            Ok(())
        })
    }

    pub fn get_push_subscriptions(&self, user_id: &str) -> Result<Vec<PushSubscriptionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, endpoint, p256dh, auth FROM push_subscriptions WHERE user_id = ?1",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(PushSubscriptionRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        endpoint: row.get(2)?,
                        p256dh: row.get(3)?,
                        auth: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn delete_push_subscription(&self, user_id: &str, endpoint: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let removed = conn.execute(
                "DELETE FROM push_subscriptions WHERE user_id = ?1 AND endpoint = ?2",
                params![user_id, endpoint],
            )?;
            Ok(removed > 0)
        })
    }

    /// Used when the push service reports the endpoint as gone.
    pub fn delete_push_subscription_by_id(&self, id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute("DELETE FROM push_subscriptions WHERE id = ?1", [id])?;
            Ok(())
        })
    }
}
