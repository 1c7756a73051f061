use std::sync::Arc;

use anyhow::{Error, Result};
use clap::Args;
use serde_json::json;

use super::{CommandContext, print_envelope};
use crate::intent::QuestionIntent;
use crate::models::query_envelope::{QueryEnvelope, RejectedQueryFailure};
use crate::sql::{QueryValidator, check_intent_coverage};

#[derive(Debug, Clone, Args)]
pub struct CheckArgs {
    #[arg(value_name = "SQL")]
    pub sql: String,

    /// Also check that the statement covers what this question implies.
    #[arg(long, value_name = "TEXT")]
    pub question: Option<String>,
}

/// Offline: needs neither the store nor the generation service.
pub fn run(args: &CheckArgs, context: &CommandContext) -> Result<()> {
    let descriptor = context.config.load_descriptor(&context.paths)?;
    descriptor.validate()?;
    let validator = QueryValidator::new(Arc::new(descriptor), context.config.query_limits());

    let query = validator
        .validate(&args.sql)
        .map_err(|rejection| Error::new(RejectedQueryFailure::new("check", &rejection)))?;

    let intent = args.question.as_deref().map(QuestionIntent::analyze);
    if let Some(intent) = intent.as_ref() {
        check_intent_coverage(&query, intent, validator.descriptor())
            .map_err(|rejection| Error::new(RejectedQueryFailure::new("check", &rejection)))?;
    }

    let envelope = QueryEnvelope::ok(
        "check",
        json!({
            "validated_query": query.as_str(),
            "limit": query.limit(),
            "limit_action": query.limit_action(),
            "intent": intent,
        }),
    )
    .with_meta("table", json!(validator.descriptor().table))
    .with_meta("max_limit", json!(validator.limits().max_limit))
    .with_meta("intent_checked", json!(intent.is_some()));
    print_envelope(&envelope)
}
