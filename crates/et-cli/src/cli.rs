//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Expression-time accounting.
///
/// Credits the time between classifier detections to engagement categories
/// per login session and keeps one log row per finished session.
#[derive(Debug, Parser)]
#[command(name = "et", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Replay a recorded JSONL event script and store the resulting sessions.
    Replay {
        /// Output the finished sessions as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Track one live session, reading one detected label per stdin line.
    Track {
        /// The logged-in user.
        #[arg(long)]
        user: String,
    },

    /// List stored session logs with per-category durations.
    Report {
        /// Only sessions starting at or after this time (ISO 8601 or "N days ago").
        #[arg(long)]
        since: Option<String>,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Manage user profiles.
    #[command(subcommand)]
    Users(UsersAction),

    /// Show database location and log count.
    Status,
}

/// User profile actions.
#[derive(Debug, Subcommand)]
pub enum UsersAction {
    /// Register a user profile.
    Add {
        #[arg(long)]
        username: String,

        #[arg(long)]
        rollno: String,

        #[arg(long)]
        email: Option<String>,

        #[arg(long)]
        mobile: Option<String>,
    },
}
