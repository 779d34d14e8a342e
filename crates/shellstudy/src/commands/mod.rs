//! Command implementations
//!
//! This module contains implementations for all CLI subcommands.

pub mod check_config;
pub mod diff;
pub mod sandbox;
pub mod schedule;
pub mod snapshot;

use anyhow::Result;
use serde::Serialize;

/// Process exit code for a command that already reported its outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub i32);

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "exit code {}", self.0)
    }
}

impl std::error::Error for ExitCode {}

/// Pretty-print a value as JSON on stdout
pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
