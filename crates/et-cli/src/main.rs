use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use et_cli::commands::{replay, report, status, track, users, util};
use et_cli::{Cli, Commands, Config, UsersAction};
use et_core::SystemClock;
use et_db::UserProfile;

/// Load config and open database, ensuring the parent directory exists.
fn open_database(config_path: Option<&Path>) -> Result<(et_db::Database, Config)> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let db = et_db::Database::open(&config.database_path).context("failed to open database")?;
    Ok((db, config))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Logs go to stderr so command output stays machine-readable.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    let mut stdout = io::stdout().lock();

    match &cli.command {
        Some(Commands::Replay { json }) => {
            let (mut db, config) = open_database(cli.config.as_deref())?;
            replay::run(io::stdin().lock(), &mut stdout, &mut db, &config, *json)?;
        }
        Some(Commands::Track { user }) => {
            let (mut db, config) = open_database(cli.config.as_deref())?;
            let clock = Arc::new(SystemClock::new());
            track::run(
                io::stdin().lock(),
                &mut stdout,
                &mut db,
                &config,
                clock,
                user,
            )?;
        }
        Some(Commands::Report { since, json }) => {
            let (db, _config) = open_database(cli.config.as_deref())?;
            let since = since
                .as_deref()
                .map(|s| util::parse_datetime(s, Utc::now()))
                .transpose()?;
            report::run(&mut stdout, &db, since, *json)?;
        }
        Some(Commands::Users(UsersAction::Add {
            username,
            rollno,
            email,
            mobile,
        })) => {
            let (mut db, _config) = open_database(cli.config.as_deref())?;
            let profile = UserProfile {
                username: username.clone(),
                rollno: Some(rollno.clone()),
                email: email.clone(),
                mobile: mobile.clone(),
            };
            users::add(&mut stdout, &mut db, profile)?;
        }
        Some(Commands::Status) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            status::run(&mut stdout, &db, &config.database_path)?;
        }
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            writeln!(stdout)?;
        }
    }

    Ok(())
}
