use anyhow::Result;
use rusqlite::{Connection, params};

use super::{OptionalExt, summary_at};
use crate::models::{ProfileStatsRow, UserRow, UserSummaryRow};
use crate::{Database, now_timestamp};

const USER_COLUMNS: &str =
    "id, username, email, password, bio, avatar_url, is_verified, verification_token, created_at";

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: &str,
        username: &str,
        email: &str,
        password_hash: &str,
        verification_token: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let now = now_timestamp();
            conn.execute(
                "INSERT INTO users (id, username, email, password, verification_token, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![id, username, email, password_hash, verification_token, now],
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id = ?1", id))
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email = ?1", email))
    }

    /// Login accepts either the email address or the username.
    pub fn get_user_by_login(&self, login: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email = ?1 OR username = ?1", login))
    }

    /// Whether the username is held by someone other than `except_id`.
    /// Comparison is case-insensitive through the column collation.
    pub fn username_taken(&self, username: &str, except_id: Option<&str>) -> Result<bool> {
        self.with_conn(|conn| {
            let taken = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1 AND id IS NOT ?2)",
                params![username, except_id],
                |row| row.get(0),
            )?;
            Ok(taken)
        })
    }

    pub fn email_taken(&self, email: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let taken = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE email = ?1)",
                [email],
                |row| row.get(0),
            )?;
            Ok(taken)
        })
    }

    /// Marks the owner of `token` verified and clears the token.
    /// Returns the user id, or None for an unknown token.
    pub fn verify_email(&self, token: &str) -> Result<Option<String>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let user_id: Option<String> = tx
                .query_row(
                    "SELECT id FROM users WHERE verification_token = ?1",
                    [token],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(id) = &user_id {
                tx.execute(
                    "UPDATE users SET is_verified = 1, verification_token = NULL, updated_at = ?2
                     WHERE id = ?1",
                    params![id, now_timestamp()],
                )?;
            }
            tx.commit()?;
            Ok(user_id)
        })
    }

    pub fn set_verification_token(&self, user_id: &str, token: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE users SET verification_token = ?2, updated_at = ?3 WHERE id = ?1",
                params![user_id, token, now_timestamp()],
            )?;
            Ok(())
        })
    }

    /// Partial update: `None` leaves the column unchanged.
    pub fn update_profile(
        &self,
        id: &str,
        username: Option<&str>,
        bio: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE users SET
                    username = COALESCE(?2, username),
                    bio = COALESCE(?3, bio),
                    avatar_url = COALESCE(?4, avatar_url),
                    updated_at = ?5
                 WHERE id = ?1",
                params![id, username, bio, avatar_url, now_timestamp()],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn get_user_summary(&self, id: &str) -> Result<Option<UserSummaryRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, username, avatar_url FROM users WHERE id = ?1",
                [id],
                |row| summary_at(row, 0),
            )
            .optional()
        })
    }

    /// Every user but `except_id`, alphabetically.
    pub fn list_users_except(&self, except_id: &str) -> Result<Vec<UserSummaryRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, avatar_url FROM users
                 WHERE id != ?1
                 ORDER BY username COLLATE NOCASE",
            )?;
            let rows = stmt
                .query_map([except_id], |row| summary_at(row, 0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn profile_stats(&self, user_id: &str, viewer_id: Option<&str>) -> Result<ProfileStatsRow> {
        self.with_conn(|conn| {
            let stats = conn.query_row(
                "SELECT
                    (SELECT COUNT(*) FROM posts WHERE author_id = ?1),
                    (SELECT COUNT(*) FROM user_follows WHERE following_id = ?1),
                    (SELECT COUNT(*) FROM user_follows WHERE follower_id = ?1),
                    EXISTS(SELECT 1 FROM user_follows WHERE follower_id = ?2 AND following_id = ?1)",
                params![user_id, viewer_id],
                |row| {
                    Ok(ProfileStatsRow {
                        post_count: row.get(0)?,
                        follower_count: row.get(1)?,
                        following_count: row.get(2)?,
                        is_following: row.get(3)?,
                    })
                },
            )?;
            Ok(stats)
        })
    }

    // -- Follows --

    /// Toggle a follow: removes if exists, inserts if not.
    /// Returns (following, follower_count of the target).
    pub fn toggle_follow(&self, follower_id: &str, following_id: &str) -> Result<(bool, i64)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM user_follows WHERE follower_id = ?1 AND following_id = ?2",
                params![follower_id, following_id],
            )?;

            if removed == 0 {
                tx.execute(
                    "INSERT INTO user_follows (follower_id, following_id, created_at) VALUES (?1, ?2, ?3)",
                    params![follower_id, following_id, now_timestamp()],
                )?;
            }

            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM user_follows WHERE following_id = ?1",
                [following_id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok((removed == 0, count))
        })
    }

    pub fn followers(&self, user_id: &str) -> Result<Vec<UserSummaryRow>> {
        self.with_conn(|conn| {
            query_follow_list(
                conn,
                "SELECT u.id, u.username, u.avatar_url
                 FROM user_follows f JOIN users u ON u.id = f.follower_id
                 WHERE f.following_id = ?1
                 ORDER BY f.created_at DESC",
                user_id,
            )
        })
    }

    pub fn following(&self, user_id: &str) -> Result<Vec<UserSummaryRow>> {
        self.with_conn(|conn| {
            query_follow_list(
                conn,
                "SELECT u.id, u.username, u.avatar_url
                 FROM user_follows f JOIN users u ON u.id = f.following_id
                 WHERE f.follower_id = ?1
                 ORDER BY f.created_at DESC",
                user_id,
            )
        })
    }
}

fn query_user(conn: &Connection, predicate: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users WHERE {}", USER_COLUMNS, predicate);
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                email: row.get(2)?,
                password: row.get(3)?,
                bio: row.get(4)?,
                avatar_url: row.get(5)?,
                is_verified: row.get(6)?,
                verification_token: row.get(7)?,
                created_at: row.get(8)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_follow_list(conn: &Connection, sql: &str, user_id: &str) -> Result<Vec<UserSummaryRow>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([user_id], |row| summary_at(row, 0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use crate::new_id;
    use crate::queries::is_constraint_violation;
    use crate::test_support::{open, user};

    #[test]
    fn duplicate_email_is_a_constraint_violation() {
        let t = open();
        t.db.create_user(&new_id(), "alice", "alice@example.com", "h", "t1").unwrap();

        assert!(t.db.email_taken("ALICE@example.com").unwrap());
        assert!(t.db.username_taken("Alice", None).unwrap());

        let err = t
            .db
            .create_user(&new_id(), "alice2", "alice@example.com", "h", "t2")
            .unwrap_err();
        assert!(is_constraint_violation(&err));
    }

    #[test]
    fn username_taken_ignores_own_row() {
        let t = open();
        let id = user(&t.db, "bob");
        assert!(!t.db.username_taken("bob", Some(&id)).unwrap());
        assert!(t.db.username_taken("bob", Some(&new_id())).unwrap());
    }

    #[test]
    fn verify_email_consumes_token() {
        let t = open();
        let id = new_id();
        t.db.create_user(&id, "carol", "carol@example.com", "h", "tok").unwrap();

        assert_eq!(t.db.verify_email("tok").unwrap().as_deref(), Some(id.as_str()));
        assert!(t.db.verify_email("tok").unwrap().is_none());

        let row = t.db.get_user_by_login("carol").unwrap().unwrap();
        assert!(row.is_verified);
        assert!(row.verification_token.is_none());
    }

    #[test]
    fn update_profile_keeps_unset_columns() {
        let t = open();
        let id = user(&t.db, "dave");
        t.db.update_profile(&id, None, Some("hello"), None).unwrap();
        t.db.update_profile(&id, Some("david"), None, None).unwrap();

        let row = t.db.get_user_by_id(&id).unwrap().unwrap();
        assert_eq!(row.username, "david");
        assert_eq!(row.bio.as_deref(), Some("hello"));
    }

    #[test]
    fn follow_toggles_and_rejects_self() {
        let t = open();
        let a = user(&t.db, "a_user");
        let b = user(&t.db, "b_user");

        assert_eq!(t.db.toggle_follow(&a, &b).unwrap(), (true, 1));
        assert_eq!(t.db.following(&a).unwrap()[0].id, b);
        assert_eq!(t.db.followers(&b).unwrap()[0].id, a);

        let stats = t.db.profile_stats(&b, Some(&a)).unwrap();
        assert_eq!(stats.follower_count, 1);
        assert!(stats.is_following);

        assert_eq!(t.db.toggle_follow(&a, &b).unwrap(), (false, 0));
        assert!(t.db.followers(&b).unwrap().is_empty());

        let err = t.db.toggle_follow(&a, &a).unwrap_err();
        assert!(is_constraint_violation(&err));
    }
}
