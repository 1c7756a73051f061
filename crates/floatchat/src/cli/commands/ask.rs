use anyhow::{Context, Error, Result};
use clap::Args;
use serde_json::json;
use tracing::info;

use super::{CommandContext, print_envelope};
use crate::models::query_envelope::{EnvelopedFailure, QueryEnvelope};
use crate::pipeline::AskPipeline;

#[derive(Debug, Clone, Args)]
pub struct AskArgs {
    #[arg(value_name = "QUESTION")]
    pub question: String,

    /// Context snippets to retrieve; defaults to `retrieval.k`.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub k: Option<u32>,
}

pub fn run(args: &AskArgs, context: &CommandContext) -> Result<()> {
    let pipeline = AskPipeline::from_config(
        &context.config,
        &context.paths,
        context.db_override.as_deref(),
    )?;
    let k = args
        .k
        .map_or(context.config.retrieval.k, |k| k as usize);
    info!(store = %pipeline.store().path().display(), k, "ask: pipeline ready");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let outcome = runtime.block_on(pipeline.ask_with_k(&args.question, k));

    let response = match outcome {
        Ok(response) => response,
        Err(error) => {
            let envelope = QueryEnvelope::from_pipeline_error("ask", &error)
                .with_meta("k", json!(k));
            return Err(Error::new(EnvelopedFailure::new(envelope)));
        }
    };

    let data = serde_json::to_value(&response).context("failed to encode ask response")?;
    let envelope = QueryEnvelope::ok("ask", data)
        .with_meta("k", json!(k))
        .with_meta("partial", json!(response.is_partial()))
        .with_meta("query_source", json!(response.query_source))
        .with_failures(&response.failures);
    print_envelope(&envelope)
}
