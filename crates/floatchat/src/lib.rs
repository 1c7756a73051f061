#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod error;
pub mod intent;
pub mod llm;
pub mod logging;
pub mod models;
pub mod narrate;
pub mod pipeline;
pub mod prompts;
pub mod retrieval;
pub mod schema;
pub mod sql;
pub mod store;
pub mod synth;
pub mod utils;
pub mod visualize;

pub use cli::app::{Cli, Command};
pub use error::PipelineError;
pub use pipeline::AskPipeline;
