use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            BEGIN;

            CREATE TABLE users (
                id                  TEXT PRIMARY KEY,
                username            TEXT NOT NULL UNIQUE COLLATE NOCASE,
                email               TEXT NOT NULL UNIQUE COLLATE NOCASE,
                password            TEXT NOT NULL,
                bio                 TEXT,
                avatar_url          TEXT,
                is_verified         INTEGER NOT NULL DEFAULT 0,
                verification_token  TEXT,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL
            );

            CREATE INDEX idx_users_verification ON users(verification_token);

            CREATE TABLE posts (
                id          TEXT PRIMARY KEY,
                author_id   TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                title       TEXT,
                content     TEXT NOT NULL,
                media_type  TEXT,
                media_path  TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE INDEX idx_posts_created ON posts(created_at);
            CREATE INDEX idx_posts_author ON posts(author_id, created_at);

            CREATE TABLE comments (
                id          TEXT PRIMARY KEY,
                post_id     TEXT NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
                author_id   TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                parent_id   TEXT REFERENCES comments(id) ON DELETE CASCADE,
                content     TEXT NOT NULL,
                media_type  TEXT,
                media_path  TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE INDEX idx_comments_post ON comments(post_id, created_at);
            CREATE INDEX idx_comments_parent ON comments(parent_id);

            CREATE TABLE messages (
                id            TEXT PRIMARY KEY,
                sender_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                recipient_id  TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                content       TEXT NOT NULL,
                media_type    TEXT,
                media_path    TEXT,
                is_read       INTEGER NOT NULL DEFAULT 0,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );

            CREATE INDEX idx_messages_pair ON messages(sender_id, recipient_id, created_at);
            CREATE INDEX idx_messages_recipient ON messages(recipient_id, is_read);

            CREATE TABLE media (
                id          TEXT PRIMARY KEY,
                owner_id    TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                post_id     TEXT REFERENCES posts(id) ON DELETE CASCADE,
                comment_id  TEXT REFERENCES comments(id) ON DELETE CASCADE,
                message_id  TEXT REFERENCES messages(id) ON DELETE CASCADE,
                media_type  TEXT NOT NULL,
                path        TEXT NOT NULL,
                position    INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_media_post ON media(post_id);
            CREATE INDEX idx_media_comment ON media(comment_id);
            CREATE INDEX idx_media_message ON media(message_id);

            CREATE TABLE post_likes (
                post_id     TEXT NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at  TEXT NOT NULL,
                PRIMARY KEY (post_id, user_id)
            );

            CREATE TABLE comment_likes (
                comment_id  TEXT NOT NULL REFERENCES comments(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at  TEXT NOT NULL,
                PRIMARY KEY (comment_id, user_id)
            );

            CREATE TABLE user_follows (
                follower_id   TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                following_id  TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at    TEXT NOT NULL,
                PRIMARY KEY (follower_id, following_id),
                CHECK (follower_id <> following_id)
            );

            CREATE INDEX idx_follows_following ON user_follows(following_id);

            CREATE TABLE push_subscriptions (
                id          TEXT PRIMARY KEY,
                user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                endpoint    TEXT NOT NULL UNIQUE,
                p256dh      TEXT NOT NULL,
                auth        TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE INDEX idx_push_user ON push_subscriptions(user_id);

            INSERT INTO schema_version (version) VALUES (1);

            COMMIT;
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (upload ownership)");
        conn.execute_batch(
            "
            BEGIN;

            CREATE TABLE uploads (
                path        TEXT PRIMARY KEY,
                owner_id    TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_uploads_owner ON uploads(owner_id);
            CREATE INDEX idx_media_path ON media(path);
            CREATE INDEX idx_users_avatar ON users(avatar_url);

            INSERT INTO schema_version (version) VALUES (2);

            COMMIT;
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
