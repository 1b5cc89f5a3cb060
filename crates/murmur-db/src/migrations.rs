use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);"
    )?;

    let version: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (users, chat history, unread counters)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                username            TEXT PRIMARY KEY,
                password            TEXT NOT NULL,
                display_name        TEXT NOT NULL,
                status_message      TEXT NOT NULL DEFAULT '',
                profile_image       BLOB,
                additional_image    BLOB,
                current_theme       TEXT,
                registration_date   TEXT NOT NULL,
                last_seen           TEXT
            );

            CREATE TABLE chat_history (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                sender          TEXT NOT NULL REFERENCES users(username),
                receiver        TEXT NOT NULL REFERENCES users(username),
                message_type    TEXT NOT NULL CHECK (message_type IN ('text', 'image')),
                content         TEXT NOT NULL,
                timestamp       TEXT NOT NULL
            );

            CREATE INDEX idx_chat_sender ON chat_history(sender, timestamp);
            CREATE INDEX idx_chat_receiver ON chat_history(receiver, timestamp);

            CREATE TABLE unread_messages (
                username    TEXT NOT NULL REFERENCES users(username),
                sender      TEXT NOT NULL REFERENCES users(username),
                count       INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (username, sender)
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
