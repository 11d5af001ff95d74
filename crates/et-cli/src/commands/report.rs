//! Report command for the per-session engagement overview.
//!
//! This module implements `et report` with an optional `--since` filter and
//! output formats (human-readable, JSON).

use std::fmt::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};
use et_core::{Durations, EndReason, SessionId, UserId};
use et_db::{Database, SessionLog};
use serde::Serialize;

use super::util::format_duration;

/// Computed report data.
#[derive(Debug)]
pub struct ReportData {
    pub generated_at: DateTime<Utc>,
    pub since: Option<DateTime<Utc>>,
    pub logs: Vec<SessionLog>,
}

impl ReportData {
    /// Sum of every session's durations.
    fn totals(&self) -> Durations {
        let mut totals = Durations::default();
        for log in &self.logs {
            for (category, secs) in log.record.durations.iter() {
                totals.credit(category, secs);
            }
        }
        totals
    }
}

// ========== Human Output ==========

/// Width of the category label column.
const LABEL_WIDTH: usize = 28;

pub fn format_report(data: &ReportData) -> String {
    let mut output = String::new();

    match data.since {
        Some(since) => writeln!(
            output,
            "Session logs since {}",
            since.format("%Y-%m-%d %H:%M UTC")
        )
        .unwrap(),
        None => writeln!(output, "All session logs").unwrap(),
    }

    if data.logs.is_empty() {
        writeln!(output, "\nNo sessions recorded.").unwrap();
        return output;
    }

    for log in &data.logs {
        let record = &log.record;
        let who = match &log.rollno {
            Some(rollno) => format!("{} ({rollno})", record.user_id),
            None => record.user_id.to_string(),
        };
        writeln!(output).unwrap();
        writeln!(
            output,
            "{who}  {} -> {}  {}",
            record.start_time.format("%Y-%m-%d %H:%M:%S"),
            record.end_time.format("%H:%M:%S"),
            record.end_reason
        )
        .unwrap();
        write_durations(&mut output, &record.durations);
    }

    let totals = data.totals();
    writeln!(output).unwrap();
    writeln!(
        output,
        "Total across {} sessions: {}",
        data.logs.len(),
        format_duration(totals.total())
    )
    .unwrap();
    write_durations(&mut output, &totals);

    output
}

fn write_durations(output: &mut String, durations: &Durations) {
    for (category, secs) in durations.iter() {
        writeln!(
            output,
            "  {:<LABEL_WIDTH$}{}",
            category.label(),
            format_duration(secs)
        )
        .unwrap();
    }
}

// ========== JSON Output ==========

#[derive(Serialize)]
struct JsonReport<'a> {
    generated_at: DateTime<Utc>,
    since: Option<DateTime<Utc>>,
    sessions: Vec<JsonSession<'a>>,
    totals: Durations,
}

#[derive(Serialize)]
struct JsonSession<'a> {
    session_id: &'a SessionId,
    username: &'a UserId,
    rollno: Option<&'a str>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    end_reason: EndReason,
    durations: &'a Durations,
    total_secs: u64,
}

pub fn format_report_json(data: &ReportData) -> Result<String> {
    let report = JsonReport {
        generated_at: data.generated_at,
        since: data.since,
        sessions: data
            .logs
            .iter()
            .map(|log| JsonSession {
                session_id: &log.record.session_id,
                username: &log.record.user_id,
                rollno: log.rollno.as_deref(),
                start_time: log.record.start_time,
                end_time: log.record.end_time,
                end_reason: log.record.end_reason,
                durations: &log.record.durations,
                total_secs: log.record.durations.total(),
            })
            .collect(),
        totals: data.totals(),
    };
    Ok(serde_json::to_string_pretty(&report)?)
}

pub fn run<W: std::io::Write>(
    output: &mut W,
    db: &Database,
    since: Option<DateTime<Utc>>,
    json: bool,
) -> Result<()> {
    let data = ReportData {
        generated_at: Utc::now(),
        since,
        logs: db.list_session_logs(since)?,
    };
    tracing::debug!(sessions = data.logs.len(), "report data loaded");

    if json {
        writeln!(output, "{}", format_report_json(&data)?)?;
    } else {
        output.write_all(format_report(&data).as_bytes())?;
    }
    Ok(())
}
