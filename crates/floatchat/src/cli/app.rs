use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use super::commands::{ask::AskArgs, check::CheckArgs, schema::SchemaArgs};

#[derive(Debug, Parser)]
#[command(
    name = "floatchat",
    version,
    about = "Natural-language questions over ARGO float profiles"
)]
pub struct Cli {
    #[command(flatten)]
    pub runtime: RuntimeArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Args)]
pub struct RuntimeArgs {
    #[arg(long, global = true, value_name = "PATH")]
    pub home_dir: Option<PathBuf>,

    #[arg(long, global = true, value_name = "PATH")]
    pub cwd: Option<PathBuf>,

    /// Defaults to ~/.floatchat/config.toml when it exists.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Profile store; overrides `store.path`.
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Answer a question: narration, validated query, result table and chart plans.
    Ask(AskArgs),
    /// Validate a SQL statement offline, optionally against a question's intent.
    Check(CheckArgs),
    /// Show the schema descriptor and the prompt schema text.
    Schema(SchemaArgs),
}
