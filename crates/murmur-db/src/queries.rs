use crate::Database;
use crate::credentials;
use crate::models::{NewUser, ProfileChanges, UserRow};
use anyhow::{Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use murmur_types::models::{ChatMessage, MessageKind, UnreadCounts};
use rusqlite::{Connection, ErrorCode};
use tracing::warn;

const USER_COLUMNS: &str = "username, display_name, status_message, profile_image, \
     additional_image, current_theme, registration_date, last_seen";

const MESSAGE_COLUMNS: &str = "sender, receiver, message_type, content, timestamp";

impl Database {
    // -- Users --

    /// Insert a new account. Returns `false` if the username is already taken.
    pub fn create_user(&self, user: &NewUser<'_>) -> Result<bool> {
        // Hash outside the connection lock.
        let password_hash = credentials::hash_password(user.password)?;
        let now = format_timestamp(Utc::now());

        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO users
                    (username, password, display_name, profile_image, additional_image,
                     registration_date, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                rusqlite::params![
                    user.username,
                    password_hash,
                    user.display_name.unwrap_or(user.username),
                    user.profile_image,
                    user.additional_image,
                    now,
                ],
            );

            match inserted {
                Ok(_) => Ok(true),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Check a password against the stored credential. Unknown users fail.
    pub fn verify_credential(&self, username: &str, password: &str) -> Result<bool> {
        let stored: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT password FROM users WHERE username = ?1",
                [username],
                |row| row.get(0),
            )
            .optional()
        })?;

        match stored {
            Some(hash) => credentials::verify_password(password, &hash),
            None => Ok(false),
        }
    }

    pub fn user_exists(&self, username: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row("SELECT 1 FROM users WHERE username = ?1", [username], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Mark a user online: `last_seen` is cleared while a session is live.
    pub fn set_online(&self, username: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE users SET last_seen = NULL WHERE username = ?1", [username])?;
            Ok(())
        })
    }

    /// Mark a user offline, stamping `last_seen` with the current time.
    pub fn set_offline(&self, username: &str) -> Result<()> {
        let now = format_timestamp(Utc::now());
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET last_seen = ?1 WHERE username = ?2",
                [now.as_str(), username],
            )?;
            Ok(())
        })
    }

    /// Stamp every user still marked online as offline. Used at startup, when
    /// no session can be live. Returns how many rows were reset.
    pub fn mark_all_offline(&self) -> Result<usize> {
        let now = format_timestamp(Utc::now());
        self.with_conn(|conn| {
            let n = conn.execute("UPDATE users SET last_seen = ?1 WHERE last_seen IS NULL", [now])?;
            Ok(n)
        })
    }

    // -- Profiles --

    pub fn get_profile(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS);
            conn.query_row(&sql, [username], map_user).optional()
        })
    }

    pub fn get_all_profiles(&self) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM users ORDER BY username", USER_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], map_user)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Apply a partial profile update. Returns `false` if there was nothing to
    /// change or the user does not exist.
    pub fn update_profile(&self, username: &str, changes: &ProfileChanges) -> Result<bool> {
        if changes.is_empty() {
            return Ok(false);
        }

        let mut assignments: Vec<&str> = Vec::new();
        let mut params: Vec<&dyn rusqlite::types::ToSql> = Vec::new();

        if let Some(v) = &changes.display_name {
            assignments.push("display_name = ?");
            params.push(v);
        }
        if let Some(v) = &changes.status_message {
            assignments.push("status_message = ?");
            params.push(v);
        }
        if let Some(v) = &changes.profile_image {
            assignments.push("profile_image = ?");
            params.push(v);
        }
        if let Some(v) = &changes.additional_image {
            assignments.push("additional_image = ?");
            params.push(v);
        }
        if let Some(v) = &changes.current_theme {
            assignments.push("current_theme = ?");
            params.push(v);
        }

        let username = username.to_string();
        params.push(&username);

        let sql = format!("UPDATE users SET {} WHERE username = ?", assignments.join(", "));
        self.with_conn(|conn| {
            let n = conn.execute(&sql, params.as_slice())?;
            Ok(n > 0)
        })
    }

    // -- Messages --

    /// Append a message to the log, stamped with the current time.
    pub fn insert_message(
        &self,
        sender: &str,
        receiver: &str,
        kind: MessageKind,
        content: &str,
    ) -> Result<ChatMessage> {
        let timestamp = Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_history (sender, receiver, message_type, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    sender,
                    receiver,
                    kind.as_str(),
                    content,
                    format_timestamp(timestamp)
                ],
            )?;
            Ok(())
        })?;

        Ok(ChatMessage {
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            message_type: kind,
            content: content.to_string(),
            timestamp,
        })
    }

    /// Messages exchanged between two users, oldest first.
    pub fn get_conversation(&self, user_a: &str, user_b: &str) -> Result<Vec<ChatMessage>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM chat_history
                 WHERE (sender = ?1 AND receiver = ?2) OR (sender = ?2 AND receiver = ?1)
                 ORDER BY timestamp ASC, id ASC",
                MESSAGE_COLUMNS
            );
            query_messages(conn, &sql, rusqlite::params![user_a, user_b])
        })
    }

    /// Every message the user sent or received, oldest first.
    pub fn get_user_history(&self, username: &str) -> Result<Vec<ChatMessage>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM chat_history
                 WHERE sender = ?1 OR receiver = ?1
                 ORDER BY timestamp ASC, id ASC",
                MESSAGE_COLUMNS
            );
            query_messages(conn, &sql, rusqlite::params![username])
        })
    }

    // -- Unread counters --

    /// Replace the owner's unread counters with `counts`. Zero counts and
    /// unknown peers are dropped.
    pub fn replace_unread(&self, owner: &str, counts: &UnreadCounts) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM unread_messages WHERE username = ?1", [owner])?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO unread_messages (username, sender, count)
                     SELECT ?1, ?2, ?3 WHERE EXISTS (SELECT 1 FROM users WHERE username = ?2)",
                )?;
                for (peer, count) in counts.iter().filter(|(_, c)| **c > 0) {
                    stmt.execute(rusqlite::params![owner, peer, count])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_unread(&self, owner: &str) -> Result<UnreadCounts> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT sender, count FROM unread_messages WHERE username = ?1")?;
            let rows = stmt
                .query_map([owner], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?
                .collect::<std::result::Result<UnreadCounts, _>>()?;
            Ok(rows)
        })
    }
}

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        username: row.get(0)?,
        display_name: row.get(1)?,
        status_message: row.get(2)?,
        profile_image: row.get(3)?,
        additional_image: row.get(4)?,
        current_theme: row.get(5)?,
        registration_date: row.get(6)?,
        last_seen: row.get(7)?,
    })
}

fn query_messages(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::types::ToSql],
) -> Result<Vec<ChatMessage>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(sender, receiver, kind, content, timestamp)| {
            let message_type =
                MessageKind::parse(&kind).ok_or_else(|| anyhow!("Unknown message type '{}'", kind))?;
            Ok(ChatMessage {
                sender,
                receiver,
                message_type,
                content,
                timestamp: parse_timestamp(&timestamp),
            })
        })
        .collect()
}

/// Fixed-width RFC 3339 so that lexical order in SQLite is chronological.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // Rows written by SQLite's datetime('now') have no timezone.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", raw, e);
            DateTime::default()
        })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
