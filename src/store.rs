//! Durable account, session, and call-history storage.
//!
//! The dispatcher talks to two narrow seams, [`UserStore`] and [`Journal`];
//! both are implemented by one SQLite-backed [`SqliteStore`] whose connection
//! is serialized behind a single mutex, shared by the journal exactly because
//! it is append-mostly and cheap.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

use crate::crypto;
use crate::records::CallKind;

const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    NameTaken,
}

/// Terminal disposition of a call, as journaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClose {
    Rejected,
    Ended,
    EndedAbruptly,
    Aborted,
    Timeout,
}

impl CallClose {
    pub fn as_str(self) -> &'static str {
        match self {
            CallClose::Rejected => "rejected",
            CallClose::Ended => "ended",
            CallClose::EndedAbruptly => "ended_abruptly",
            CallClose::Aborted => "aborted",
            CallClose::Timeout => "timeout",
        }
    }
}

/// Account records and session tokens.
pub trait UserStore: Send + Sync {
    /// Creates an account with a salted password verifier.
    fn create(
        &self,
        username: &str,
        password: &str,
        email: Option<&str>,
    ) -> Result<RegisterOutcome, StoreError>;

    /// Returns the account id when the password matches.
    fn verify_password(&self, username: &str, password: &str)
        -> Result<Option<i64>, StoreError>;

    fn lookup_id(&self, username: &str) -> Result<Option<i64>, StoreError>;

    /// Mints a session token, revoking any earlier session of the account.
    fn issue_session(&self, user_id: i64) -> Result<String, StoreError>;

    /// Resolves a token to its account; expired tokens are deleted lazily.
    fn validate_session(&self, token: &str) -> Result<Option<i64>, StoreError>;

    fn revoke_session(&self, token: &str) -> Result<(), StoreError>;
}

/// Append-plus-update call history.
pub trait Journal: Send + Sync {
    fn call_started(
        &self,
        call_id: &str,
        caller: &str,
        callee: &str,
        kind: CallKind,
    ) -> Result<(), StoreError>;

    fn call_accepted(&self, call_id: &str) -> Result<(), StoreError>;

    fn call_closed(
        &self,
        call_id: &str,
        close: CallClose,
        duration: Option<u64>,
    ) -> Result<(), StoreError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    session_ttl: Duration,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_ttl(Connection::open(path)?, DEFAULT_SESSION_TTL)
    }

    pub fn open_with_ttl(
        path: impl AsRef<Path>,
        session_ttl: Duration,
    ) -> Result<Self, StoreError> {
        Self::with_ttl(Connection::open(path)?, session_ttl)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_ttl(Connection::open_in_memory()?, DEFAULT_SESSION_TTL)
    }

    /// In-memory store with a custom session lifetime, for expiry tests.
    pub fn open_in_memory_with_ttl(session_ttl: Duration) -> Result<Self, StoreError> {
        Self::with_ttl(Connection::open_in_memory()?, session_ttl)
    }

    fn with_ttl(conn: Connection, session_ttl: Duration) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                 id            INTEGER PRIMARY KEY AUTOINCREMENT,
                 username      TEXT UNIQUE NOT NULL,
                 password_hash TEXT NOT NULL,
                 email         TEXT,
                 created_at    TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS sessions (
                 id            INTEGER PRIMARY KEY AUTOINCREMENT,
                 user_id       INTEGER NOT NULL,
                 session_token TEXT UNIQUE NOT NULL,
                 created_at    INTEGER NOT NULL,
                 expires_at    INTEGER NOT NULL,
                 FOREIGN KEY (user_id) REFERENCES users (id)
             );
             CREATE TABLE IF NOT EXISTS call_history (
                 id         INTEGER PRIMARY KEY AUTOINCREMENT,
                 call_id    TEXT NOT NULL,
                 from_user  TEXT NOT NULL,
                 to_user    TEXT NOT NULL,
                 call_type  TEXT NOT NULL,
                 start_time TEXT NOT NULL,
                 end_time   TEXT,
                 status     TEXT NOT NULL,
                 duration   INTEGER
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            session_ttl,
        })
    }

    /// Journal row for a call, exposed for tests and operator tooling.
    pub fn call_record(&self, call_id: &str) -> Result<Option<(String, Option<u64>)>, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT status, duration FROM call_history WHERE call_id = ?1",
            params![call_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(StoreError::from)
    }
}

impl UserStore for SqliteStore {
    fn create(
        &self,
        username: &str,
        password: &str,
        email: Option<&str>,
    ) -> Result<RegisterOutcome, StoreError> {
        let conn = self.conn.lock();
        let taken: Option<i64> = conn
            .query_row(
                "SELECT id FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Ok(RegisterOutcome::NameTaken);
        }
        conn.execute(
            "INSERT INTO users (username, password_hash, email, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                username,
                crypto::hash_password(password),
                email,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(RegisterOutcome::Created)
    }

    fn verify_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<i64>, StoreError> {
        let conn = self.conn.lock();
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, password_hash FROM users WHERE username = ?1",
                params![username],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(match row {
            Some((id, stored)) if crypto::verify_password(password, &stored) => Some(id),
            _ => None,
        })
    }

    fn lookup_id(&self, username: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id FROM users WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::from)
    }

    fn issue_session(&self, user_id: i64) -> Result<String, StoreError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM sessions WHERE user_id = ?1", params![user_id])?;
        let token = crypto::session_token();
        let now = Utc::now().timestamp();
        let expires = now + self.session_ttl.as_secs() as i64;
        conn.execute(
            "INSERT INTO sessions (user_id, session_token, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, token, now, expires],
        )?;
        Ok(token)
    }

    fn validate_session(&self, token: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.conn.lock();
        let row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT user_id, expires_at FROM sessions WHERE session_token = ?1",
                params![token],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((_, expires)) if Utc::now().timestamp() > expires => {
                debug!("dropping expired session token");
                conn.execute(
                    "DELETE FROM sessions WHERE session_token = ?1",
                    params![token],
                )?;
                Ok(None)
            }
            Some((user_id, _)) => Ok(Some(user_id)),
        }
    }

    fn revoke_session(&self, token: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM sessions WHERE session_token = ?1",
            params![token],
        )?;
        Ok(())
    }
}

impl Journal for SqliteStore {
    fn call_started(
        &self,
        call_id: &str,
        caller: &str,
        callee: &str,
        kind: CallKind,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO call_history (call_id, from_user, to_user, call_type, start_time, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'initiated')",
            params![
                call_id,
                caller,
                callee,
                kind.to_string(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn call_accepted(&self, call_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE call_history SET status = 'accepted' WHERE call_id = ?1",
            params![call_id],
        )?;
        Ok(())
    }

    fn call_closed(
        &self,
        call_id: &str,
        close: CallClose,
        duration: Option<u64>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE call_history
             SET status = ?2, end_time = ?3, duration = ?4
             WHERE call_id = ?1",
            params![
                call_id,
                close.as_str(),
                Utc::now().to_rfc3339(),
                duration.map(|d| d as i64)
            ],
        )?;
        Ok(())
    }
}
