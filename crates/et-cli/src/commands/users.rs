//! User profile management.

use std::io::Write;

use anyhow::{Context, Result};
use et_db::{Database, UserProfile};

/// Registers a profile. Blank optional fields are stored as absent.
pub fn add<W: Write>(output: &mut W, db: &mut Database, profile: UserProfile) -> Result<()> {
    let username = profile.username.trim();
    if username.is_empty() {
        anyhow::bail!("username must not be empty");
    }
    let profile = UserProfile {
        username: username.to_string(),
        rollno: non_blank(profile.rollno),
        email: non_blank(profile.email),
        mobile: non_blank(profile.mobile),
    };

    db.insert_user(&profile)
        .with_context(|| format!("failed to add user {}", profile.username))?;
    match &profile.rollno {
        Some(rollno) => writeln!(output, "Added user {} ({rollno})", profile.username)?,
        None => writeln!(output, "Added user {}", profile.username)?,
    }
    Ok(())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|val| val.trim().to_string())
        .filter(|val| !val.is_empty())
}
