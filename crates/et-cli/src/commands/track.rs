//! Track command: one live session fed from stdin.

use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use et_core::{
    ClassifierAdapter, Clock, EventOutcome, SessionRecord, Tracker, TrackerError, UserId,
};
use et_db::Database;

use super::util::format_duration;
use crate::Config;

/// Logs `user` in, applies one label per input line, and logs out at EOF.
pub fn run<R: BufRead, W: Write>(
    reader: R,
    output: &mut W,
    db: &mut Database,
    config: &Config,
    clock: Arc<dyn Clock>,
    user: &str,
) -> Result<SessionRecord> {
    let user_id = UserId::new(user).context("invalid user")?;
    let mut tracker = Tracker::new(
        clock,
        ClassifierAdapter::unloaded(),
        config.session_manager(),
        &mut *db,
    );
    let session_id = tracker.login(user_id).context("failed to log in")?;
    tracing::info!(user, session = %session_id, "tracking");

    for line in reader.lines() {
        let line = line.context("failed to read label")?;
        let label = line.trim();
        if label.is_empty() {
            continue;
        }
        match tracker.observe_label(&session_id, label)? {
            EventOutcome::Applied(credit) => writeln!(output, "{label}: {credit}")?,
            EventOutcome::Dropped(err) => writeln!(output, "{label}: dropped ({err})")?,
        }
    }

    let record = match tracker.logout(&session_id) {
        Ok(record) => record,
        Err(TrackerError::SinkWrite { record, source }) => {
            tracing::warn!(session = %session_id, error = %source, "retrying session write");
            tracker
                .retry_write(&record)
                .context("failed to store session")?;
            *record
        }
        Err(err) => return Err(err.into()),
    };

    writeln!(
        output,
        "Session closed for {}: {} tracked",
        record.user_id,
        format_duration(record.durations.total())
    )?;
    for (category, secs) in record.durations.iter().filter(|(_, secs)| *secs > 0) {
        writeln!(output, "  {category}: {}", format_duration(secs))?;
    }
    Ok(record)
}
