//! CLI subcommand implementations.

pub mod replay;
pub mod report;
pub mod status;
pub mod track;
pub mod users;
pub mod util;
