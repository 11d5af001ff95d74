//! Storage layer for expression-time session logs.
//!
//! Provides persistence for finalized sessions and user profiles using
//! `rusqlite`.
//!
//! # Thread Safety
//!
//! The [`Database`] type wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! Sessions may be accounted on many threads, but their records must be funneled
//! through a single `Database` (or one instance per thread) for writing.
//!
//! # Schema
//!
//! ## Timestamp Format
//!
//! Timestamps are stored as TEXT in ISO 8601 format with millisecond precision
//! (e.g., `2024-01-15T10:30:00.000Z`), so lexicographic ordering matches
//! chronological ordering. Clock readings in `et_core` carry the same
//! precision, so a stored record reads back equal to the one written.
//!
//! ## Category Columns
//!
//! `session_logs` carries one INTEGER column of accumulated seconds per
//! [`Category`], named by [`Category::column`]. Adding a category means adding
//! a column; old rows keep the default of 0.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, ffi, params};
use thiserror::Error;

use et_core::{
    Category, Durations, EndReason, LogSink, SessionId, SessionRecord, UserId, ValidationError,
};

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A username is already registered.
    #[error("user {0} already exists")]
    DuplicateUser(String),
    /// A session log with this ID was already written.
    #[error("session {0} already logged")]
    DuplicateSession(String),
    /// Failed to parse a stored timestamp.
    #[error("invalid timestamp for session log {row_id}: {timestamp}")]
    TimestampParse {
        row_id: i64,
        timestamp: String,
        #[source]
        source: chrono::ParseError,
    },
    /// A session record that cannot be stored, or a stored row that does not
    /// describe a valid one.
    #[error("invalid session log {session_id}: {message}")]
    InvalidRecord { session_id: String, message: String },
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
}

/// A registered user's profile. Credentials are not stored here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub username: String,
    pub rollno: Option<String>,
    pub email: Option<String>,
    pub mobile: Option<String>,
}

/// A stored session log joined with the owner's profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLog {
    pub id: i64,
    pub record: SessionRecord,
    /// Roll number of the matching registered user, if any.
    pub rollno: Option<String>,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        let category_columns: String = Category::ALL
            .iter()
            .map(|c| format!("{} INTEGER NOT NULL DEFAULT 0,\n", c.column()))
            .collect();
        self.conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                rollno TEXT,
                email TEXT,
                mobile TEXT
            );

            -- One row per finalized session
            -- start_time/end_time: ISO 8601 (e.g., '2024-01-15T10:30:00.000Z')
            -- category columns: accumulated whole seconds
            CREATE TABLE IF NOT EXISTS session_logs (
                id INTEGER PRIMARY KEY,
                session_id TEXT UNIQUE NOT NULL,
                user_id TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                end_reason TEXT NOT NULL,
                {category_columns}
                CHECK (end_time >= start_time)
            );

            CREATE INDEX IF NOT EXISTS idx_session_logs_user ON session_logs(user_id);
            CREATE INDEX IF NOT EXISTS idx_session_logs_start ON session_logs(start_time);
            ",
        ))?;
        Ok(())
    }

    /// Registers a user profile.
    pub fn insert_user(&mut self, user: &UserProfile) -> Result<i64, DbError> {
        let result = self.conn.execute(
            "INSERT INTO users (username, rollno, email, mobile) VALUES (?, ?, ?, ?)",
            params![user.username, user.rollno, user.email, user.mobile],
        );
        match result {
            Ok(_) => Ok(self.conn.last_insert_rowid()),
            Err(err) if is_unique_violation(&err) => {
                Err(DbError::DuplicateUser(user.username.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Looks up a user profile by username.
    pub fn get_user(&self, username: &str) -> Result<Option<UserProfile>, DbError> {
        let user = self
            .conn
            .query_row(
                "SELECT username, rollno, email, mobile FROM users WHERE username = ?",
                [username],
                |row| {
                    Ok(UserProfile {
                        username: row.get(0)?,
                        rollno: row.get(1)?,
                        email: row.get(2)?,
                        mobile: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    /// Stores one finalized session in a single transaction.
    pub fn write_session_log(&mut self, record: &SessionRecord) -> Result<i64, DbError> {
        let tx = self.conn.transaction()?;
        let id = insert_session_log(&tx, record)?;
        tx.commit()?;

        tracing::debug!(row = id, session = %record.session_id, "session log written");
        Ok(id)
    }

    /// Stores a batch of finalized sessions in one transaction.
    ///
    /// Either every record is stored or, on the first failure, none is.
    pub fn write_session_logs(&mut self, records: &[SessionRecord]) -> Result<usize, DbError> {
        let tx = self.conn.transaction()?;
        for record in records {
            insert_session_log(&tx, record)?;
        }
        tx.commit()?;

        tracing::debug!(count = records.len(), "session logs written");
        Ok(records.len())
    }

    /// Lists session logs ordered by start time, optionally from `since` on.
    pub fn list_session_logs(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SessionLog>, DbError> {
        let columns = Category::ALL
            .map(|c| format!("l.{}", c.column()))
            .join(", ");
        let sql = format!(
            "
            SELECT l.id, l.session_id, l.user_id, l.start_time, l.end_time, l.end_reason, u.rollno, {columns}
            FROM session_logs l
            LEFT JOIN users u ON u.username = l.user_id
            WHERE l.start_time >= ?
            ORDER BY l.start_time ASC, l.id ASC
            "
        );
        let since = since.map_or_else(String::new, format_timestamp);

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([since], RawSessionLog::from_row)?;
        let mut logs = Vec::new();
        for row in rows {
            logs.push(row?.into_log()?);
        }
        Ok(logs)
    }

    /// Number of stored session logs.
    pub fn session_log_count(&self) -> Result<i64, DbError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM session_logs", [], |row| row.get(0))?;
        Ok(count)
    }
}

impl LogSink for Database {
    type Error = DbError;

    fn write(&mut self, record: &SessionRecord) -> Result<(), DbError> {
        self.write_session_log(record).map(|_| ())
    }
}

/// Column values as read, before validation.
struct RawSessionLog {
    id: i64,
    session_id: String,
    user_id: String,
    start_time: String,
    end_time: String,
    end_reason: String,
    rollno: Option<String>,
    seconds: [i64; Category::COUNT],
}

impl RawSessionLog {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let mut seconds = [0; Category::COUNT];
        for (i, slot) in seconds.iter_mut().enumerate() {
            *slot = row.get(7 + i)?;
        }
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            user_id: row.get(2)?,
            start_time: row.get(3)?,
            end_time: row.get(4)?,
            end_reason: row.get(5)?,
            rollno: row.get(6)?,
            seconds,
        })
    }

    fn into_log(self) -> Result<SessionLog, DbError> {
        let id = self.id;
        let session_id = self.session_id.clone();
        let invalid = |message: String| DbError::InvalidRecord {
            session_id: session_id.clone(),
            message,
        };
        let id_error = |err: ValidationError| invalid(err.to_string());

        let mut secs = [0; Category::COUNT];
        for (slot, stored) in secs.iter_mut().zip(self.seconds) {
            *slot = u64::try_from(stored)
                .map_err(|_| invalid(format!("negative duration {stored}")))?;
        }

        let record = SessionRecord {
            session_id: SessionId::new(self.session_id).map_err(id_error)?,
            user_id: UserId::new(self.user_id).map_err(id_error)?,
            start_time: parse_timestamp(&self.start_time, id)?,
            end_time: parse_timestamp(&self.end_time, id)?,
            end_reason: self.end_reason.parse::<EndReason>().map_err(invalid)?,
            durations: Durations::from_array(secs),
        };
        Ok(SessionLog {
            id,
            record,
            rollno: self.rollno,
        })
    }
}

/// Columns written before the per-category duration columns.
const FIXED_COLUMNS: [&str; 5] = [
    "session_id",
    "user_id",
    "start_time",
    "end_time",
    "end_reason",
];

fn insert_session_log(tx: &Transaction<'_>, record: &SessionRecord) -> Result<i64, DbError> {
    let columns: Vec<&str> = FIXED_COLUMNS
        .into_iter()
        .chain(Category::ALL.map(Category::column))
        .collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO session_logs ({}) VALUES ({placeholders})",
        columns.join(", ")
    );

    let mut values: Vec<Value> = vec![
        record.session_id.as_str().to_string().into(),
        record.user_id.as_str().to_string().into(),
        format_timestamp(record.start_time).into(),
        format_timestamp(record.end_time).into(),
        record.end_reason.as_str().to_string().into(),
    ];
    for (category, secs) in record.durations.iter() {
        let stored = i64::try_from(secs).map_err(|_| DbError::InvalidRecord {
            session_id: record.session_id.to_string(),
            message: format!("{category} duration {secs}s does not fit in a column"),
        })?;
        values.push(stored.into());
    }

    match tx.execute(&sql, rusqlite::params_from_iter(values)) {
        Ok(_) => Ok(tx.last_insert_rowid()),
        Err(err) if is_unique_violation(&err) => {
            Err(DbError::DuplicateSession(record.session_id.to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _) if inner.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn parse_timestamp(timestamp: &str, row_id: i64) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            row_id,
            timestamp: timestamp.to_string(),
            source,
        })
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}
