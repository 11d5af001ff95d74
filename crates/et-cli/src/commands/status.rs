//! Status command for showing where session logs are kept.

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use et_db::Database;

pub fn run<W: Write>(writer: &mut W, db: &Database, database_path: &Path) -> Result<()> {
    let count = db.session_log_count()?;

    writeln!(writer, "Expression-time status")?;
    writeln!(writer, "Database: {}", database_path.display())?;
    writeln!(writer, "Session logs: {count}")?;

    Ok(())
}
