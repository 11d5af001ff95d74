//! Replay command for feeding a recorded event script through the tracker.
//!
//! Each script line carries the server arrival time `at`, which drives a
//! [`ManualClock`]. Users are independent, so the script is split per user
//! and the partitions are replayed in parallel. The finished sessions are
//! then stored through the single database connection in one transaction,
//! so a failed replay stores nothing.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use et_core::{
    ClassifierAdapter, EventOutcome, LifecycleError, LogSink, ManualClock, SessionId,
    SessionRecord, Tracker, TrackerError, UserId,
};
use et_db::Database;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::util::format_duration;
use crate::Config;

/// One recorded server event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScriptLine {
    Login {
        user: String,
        at: DateTime<Utc>,
    },
    Detect {
        user: String,
        label: String,
        at: DateTime<Utc>,
    },
    Logout {
        user: String,
        at: DateTime<Utc>,
    },
}

impl ScriptLine {
    fn user(&self) -> &str {
        match self {
            Self::Login { user, .. } | Self::Detect { user, .. } | Self::Logout { user, .. } => {
                user
            }
        }
    }

    const fn at(&self) -> DateTime<Utc> {
        match self {
            Self::Login { at, .. } | Self::Detect { at, .. } | Self::Logout { at, .. } => *at,
        }
    }
}

/// Counters over a whole replay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub events_applied: u64,
    pub events_dropped: u64,
    /// Lines that could not be applied to any session.
    pub lines_skipped: u64,
}

impl ReplayStats {
    const fn merge(self, other: Self) -> Self {
        Self {
            events_applied: self.events_applied + other.events_applied,
            events_dropped: self.events_dropped + other.events_dropped,
            lines_skipped: self.lines_skipped + other.lines_skipped,
        }
    }
}

/// Result of a replay, in storage order.
#[derive(Debug, Serialize)]
pub struct ReplaySummary {
    pub sessions: Vec<SessionRecord>,
    #[serde(flatten)]
    pub stats: ReplayStats,
}

/// Keeps finalized records in memory until the partition is done.
#[derive(Debug, Default)]
struct RecordBuffer(Vec<SessionRecord>);

impl LogSink for RecordBuffer {
    type Error = Infallible;

    fn write(&mut self, record: &SessionRecord) -> Result<(), Infallible> {
        self.0.push(record.clone());
        Ok(())
    }
}

pub fn run<R: BufRead, W: Write>(
    reader: R,
    output: &mut W,
    db: &mut Database,
    config: &Config,
    json: bool,
) -> Result<ReplaySummary> {
    let script = parse_script(reader)?;
    let summary = replay(script, config)?;

    db.write_session_logs(&summary.sessions)
        .context("failed to store replayed sessions; nothing was stored")?;
    tracing::info!(sessions = summary.sessions.len(), "replay stored");

    if json {
        writeln!(output, "{}", serde_json::to_string_pretty(&summary)?)?;
    } else {
        output.write_all(format_summary(&summary).as_bytes())?;
    }
    Ok(summary)
}

/// Parses a JSONL script. Blank lines are ignored.
pub fn parse_script<R: BufRead>(reader: R) -> Result<Vec<ScriptLine>> {
    let mut lines = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", idx + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let parsed: ScriptLine = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid JSON on line {}", idx + 1))?;
        lines.push(parsed);
    }
    Ok(lines)
}

/// Replays a script without touching storage.
pub fn replay(script: Vec<ScriptLine>, config: &Config) -> Result<ReplaySummary> {
    let mut by_user: BTreeMap<String, Vec<ScriptLine>> = BTreeMap::new();
    for line in script {
        by_user.entry(line.user().to_string()).or_default().push(line);
    }
    let partitions: Vec<(String, Vec<ScriptLine>)> = by_user.into_iter().collect();

    let results = partitions
        .par_iter()
        .map(|(user, lines)| {
            replay_user(user, lines, config).with_context(|| format!("failed to replay {user}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut sessions = Vec::new();
    let mut stats = ReplayStats::default();
    for (records, partial) in results {
        sessions.extend(records);
        stats = stats.merge(partial);
    }
    sessions.sort_by(|a, b| {
        (a.start_time, &a.user_id, &a.session_id).cmp(&(b.start_time, &b.user_id, &b.session_id))
    });

    Ok(ReplaySummary { sessions, stats })
}

fn replay_user(
    user: &str,
    lines: &[ScriptLine],
    config: &Config,
) -> Result<(Vec<SessionRecord>, ReplayStats)> {
    let user_id = UserId::new(user)?;
    let mut stats = ReplayStats::default();
    let Some(first) = lines.first() else {
        return Ok((Vec::new(), stats));
    };

    let clock = Arc::new(ManualClock::new(first.at()));
    let mut tracker = Tracker::new(
        clock.clone(),
        ClassifierAdapter::unloaded(),
        config.session_manager(),
        RecordBuffer::default(),
    );
    let mut current: Option<SessionId> = None;

    for line in lines {
        clock.set(line.at());
        let open = current.clone();
        let result = match (line, open.as_ref()) {
            (ScriptLine::Login { .. }, _) => tracker.login(user_id.clone()).map(|id| {
                current = Some(id);
            }),
            (ScriptLine::Detect { label, .. }, Some(id)) => {
                tracker.observe_label(id, label).map(|outcome| match outcome {
                    EventOutcome::Applied(_) => stats.events_applied += 1,
                    EventOutcome::Dropped(_) => stats.events_dropped += 1,
                })
            }
            (ScriptLine::Logout { .. }, Some(id)) => tracker.logout(id).map(|_| {
                current = None;
            }),
            (ScriptLine::Detect { .. } | ScriptLine::Logout { .. }, None) => {
                tracing::warn!(user, at = %line.at(), "event for user without a session");
                stats.lines_skipped += 1;
                Ok(())
            }
        };
        if let Err(err) = result {
            let err = lifecycle_error(err);
            tracing::warn!(user, at = %line.at(), error = %err, "script line rejected");
            stats.lines_skipped += 1;
        }
    }

    let failed = tracker.shutdown();
    debug_assert!(failed.is_empty());
    Ok((tracker.sink().0.clone(), stats))
}

fn lifecycle_error(err: TrackerError<Infallible>) -> LifecycleError {
    match err {
        TrackerError::Lifecycle(err) => err,
        TrackerError::SinkWrite { source, .. } => match source {},
    }
}

fn format_summary(summary: &ReplaySummary) -> String {
    use std::fmt::Write;

    let mut output = String::new();
    let stats = summary.stats;
    writeln!(
        output,
        "Replayed {} sessions ({} events applied, {} dropped, {} lines skipped)",
        summary.sessions.len(),
        stats.events_applied,
        stats.events_dropped,
        stats.lines_skipped
    )
    .unwrap();

    for record in &summary.sessions {
        writeln!(
            output,
            "{} ({}): {} tracked",
            record.user_id,
            record.end_reason,
            format_duration(record.durations.total())
        )
        .unwrap();
        for (category, secs) in record.durations.iter().filter(|(_, secs)| *secs > 0) {
            writeln!(output, "  {category}: {}", format_duration(secs)).unwrap();
        }
    }
    output
}
