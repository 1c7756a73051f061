use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::config::{FloatchatConfig, RuntimePaths};
use crate::models::query_envelope::QueryEnvelope;

pub mod ask;
pub mod check;
pub mod schema;

/// Resolved global options shared by every command.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub paths: RuntimePaths,
    pub config: FloatchatConfig,
    pub db_override: Option<PathBuf>,
}

fn print_envelope(envelope: &QueryEnvelope) -> Result<()> {
    let encoded = serde_json::to_string_pretty(envelope).context("failed to encode envelope")?;
    println!("{encoded}");
    Ok(())
}
