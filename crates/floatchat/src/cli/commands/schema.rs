use std::sync::Arc;
use std::time::Duration;

use anyhow::{Error, Result};
use clap::Args;
use serde_json::json;

use super::{CommandContext, print_envelope};
use crate::models::query_envelope::{EnvelopedFailure, QueryEnvelope};
use crate::store::ProfileStore;

#[derive(Debug, Clone, Args)]
pub struct SchemaArgs {
    /// Compare the descriptor with the store's table.
    #[arg(long, default_value_t = false)]
    pub verify: bool,

    /// Include the JSON schema of the `ask` response.
    #[arg(long, default_value_t = false)]
    pub response_schema: bool,
}

pub fn run(args: &SchemaArgs, context: &CommandContext) -> Result<()> {
    let descriptor = context.config.load_descriptor(&context.paths)?;
    descriptor.validate()?;
    let limits = context.config.query_limits();

    let mut data = json!({
        "descriptor": &descriptor,
        "prompt_text": descriptor.render_prompt_text(),
        "limits": {
            "max_limit": limits.max_limit,
            "default_limit": limits.default_limit,
        },
    });
    if args.response_schema {
        data["response_schema"] = crate::models::json_schema();
    }

    if args.verify {
        let store_path = context
            .config
            .store_path(&context.paths, context.db_override.as_deref())?;
        let store = ProfileStore::new(
            store_path,
            Arc::new(descriptor),
            usize::try_from(limits.max_limit).unwrap_or(usize::MAX),
            Duration::from_millis(context.config.store.busy_timeout_ms),
        );
        let verification = match store.verify_schema() {
            Ok(verification) => verification,
            Err(error) => {
                let envelope = QueryEnvelope::error(
                    "schema",
                    "store_unavailable",
                    format!("{error:#}"),
                )
                .with_data(data);
                return Err(Error::new(EnvelopedFailure::new(envelope)));
            }
        };
        let compatible = verification.is_compatible();
        data["verification"] = json!(verification);

        if !compatible {
            let envelope = QueryEnvelope::error(
                "schema",
                "schema_mismatch",
                "profile store does not provide every described column",
            )
            .with_data(data);
            return Err(Error::new(EnvelopedFailure::new(envelope)));
        }
    }

    print_envelope(&QueryEnvelope::ok("schema", data).with_meta("verified", json!(args.verify)))
}
