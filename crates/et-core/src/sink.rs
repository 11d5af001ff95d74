//! Finalized session records and the sink that persists them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::timeline::{Durations, Session};
use crate::types::{SessionId, UserId};

/// Why a session was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Explicit logout.
    Logout,
    /// External termination (shutdown, abandoned client).
    ForceTerminated,
    /// A fresh login for the same user discarded this session.
    Replaced,
}

impl EndReason {
    /// String representation for database storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Logout => "logout",
            Self::ForceTerminated => "force_terminated",
            Self::Replaced => "replaced",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EndReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "logout" => Ok(Self::Logout),
            "force_terminated" => Ok(Self::ForceTerminated),
            "replaced" => Ok(Self::Replaced),
            _ => Err(format!("invalid end reason: {s}")),
        }
    }
}

/// Immutable summary of a closed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub start_time: DateTime<Utc>,
    /// Time of the last applied event; equals `start_time` when none arrived.
    pub end_time: DateTime<Utc>,
    pub end_reason: EndReason,
    pub durations: Durations,
}

impl SessionRecord {
    /// Finalizes a session. Consuming it rules out further events.
    pub fn finalize(session: Session, end_reason: EndReason) -> Self {
        let (session_id, user_id, start_time, end_time, durations) = session.into_parts();
        Self {
            session_id,
            user_id,
            start_time,
            end_time,
            end_reason,
            durations,
        }
    }
}

/// Durable destination for finalized sessions.
///
/// A write stores the whole record or nothing. Retrying is the caller's call.
pub trait LogSink {
    type Error: std::error::Error + Send + Sync + 'static;

    fn write(&mut self, record: &SessionRecord) -> Result<(), Self::Error>;
}

impl<S: LogSink + ?Sized> LogSink for &mut S {
    type Error = S::Error;

    fn write(&mut self, record: &SessionRecord) -> Result<(), Self::Error> {
        (**self).write(record)
    }
}
