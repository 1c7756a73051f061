#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::Parser;
use clap::error::ErrorKind;
use floatchat::cli::app::{Cli, Command, RuntimeArgs};
use floatchat::cli::commands::{self, CommandContext};
use floatchat::config::{RuntimePaths, load_config};
use floatchat::logging::{self, LogFormat};
use floatchat::models::query_envelope::{EnvelopedFailure, RejectedQueryFailure};
use tracing::{error, info};

const EXIT_SUCCESS: i32 = 0;
const EXIT_RUNTIME_FAILURE: i32 = 1;
const EXIT_VALIDATION_FAILURE: i32 = 2;
const EXIT_USAGE_ERROR: i32 = 64;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => return exit_code_for_parse_error(error),
    };
    // A missing .env is the normal case.
    let _ = dotenvy::dotenv();
    logging::init(if cli.runtime.log_json {
        LogFormat::Json
    } else {
        LogFormat::Human
    });

    let command_name = command_name(&cli.command);
    info!(command = command_name, "floatchat: starting");

    match execute(cli) {
        Ok(()) => {
            info!(command = command_name, exit_code = EXIT_SUCCESS, "floatchat: completed");
            EXIT_SUCCESS
        }
        Err(failure) => {
            let exit_code = report_failure(&failure);
            error!(command = command_name, exit_code, "floatchat: failed");
            exit_code
        }
    }
}

fn execute(cli: Cli) -> Result<()> {
    let context = resolve_context(&cli.runtime)?;
    match cli.command {
        Command::Ask(args) => commands::ask::run(&args, &context),
        Command::Check(args) => commands::check::run(&args, &context),
        Command::Schema(args) => commands::schema::run(&args, &context),
    }
}

/// Envelope-carrying failures go to stdout like successful output; anything
/// else is a plain runtime error on stderr.
fn report_failure(failure: &anyhow::Error) -> i32 {
    if let Some(rejected) = failure.downcast_ref::<RejectedQueryFailure>() {
        print_json(rejected.envelope());
        EXIT_VALIDATION_FAILURE
    } else if let Some(enveloped) = failure.downcast_ref::<EnvelopedFailure>() {
        print_json(enveloped.envelope());
        EXIT_RUNTIME_FAILURE
    } else {
        eprintln!("{failure:#}");
        EXIT_RUNTIME_FAILURE
    }
}

fn print_json(envelope: &floatchat::models::query_envelope::QueryEnvelope) {
    match serde_json::to_string_pretty(envelope) {
        Ok(encoded) => println!("{encoded}"),
        Err(error) => eprintln!("failed to encode envelope: {error}"),
    }
}

fn exit_code_for_parse_error(error: clap::Error) -> i32 {
    match error.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            let _ = error.print();
            EXIT_SUCCESS
        }
        _ => {
            let _ = error.print();
            EXIT_USAGE_ERROR
        }
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Ask(_) => "ask",
        Command::Check(_) => "check",
        Command::Schema(_) => "schema",
    }
}

fn resolve_context(args: &RuntimeArgs) -> Result<CommandContext> {
    let home_dir = match &args.home_dir {
        Some(path) => path.clone(),
        None => std::env::var_os("HOME")
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("HOME is not set; pass --home-dir"))?,
    };

    let cwd = match &args.cwd {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };

    let paths: RuntimePaths = floatchat::config::resolve_runtime_paths(&home_dir, &cwd)?;
    let config = load_config(&paths, args.config.as_deref())?;
    Ok(CommandContext {
        paths,
        config,
        db_override: args.db.clone(),
    })
}
