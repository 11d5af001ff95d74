//! Expression-time accounting CLI library.
//!
//! This crate provides the CLI interface for the session accounting engine.

mod cli;
pub mod commands;
mod config;

pub use cli::{Cli, Commands, UsersAction};
pub use config::Config;
