use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::intent::QuestionIntent;
use crate::llm::{CompletionClient, CompletionRequest, ModelParams, complete_with_retry};
use crate::prompts::PromptSet;
use crate::retrieval::{ContextSnippet, render_context_block};
use crate::schema::SchemaDescriptor;

pub const AGGREGATION_REDIRECT_MESSAGE: &str = "This requires numerical aggregation. Please see the generated SQL query and result table/plot below for details.";

pub const INSUFFICIENT_CONTEXT_MESSAGE: &str =
    "I cannot answer this with the given data: no matching profiles were retrieved for the question.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStyle {
    Descriptive,
    Statistical,
}

#[must_use]
pub fn classify_question(question: &str) -> QuestionStyle {
    if QuestionIntent::analyze(question).statistical {
        QuestionStyle::Statistical
    } else {
        QuestionStyle::Descriptive
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, schemars::JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Narration {
    /// Summary produced from the retrieved snippets.
    Grounded { text: String },
    /// Nothing to ground an answer in.
    Declined { text: String },
    /// Statistical questions are answered by the query result instead.
    Redirect { text: String },
}

impl Narration {
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Grounded { text } | Self::Declined { text } | Self::Redirect { text } => text,
        }
    }

    #[must_use]
    pub fn redirect() -> Self {
        Self::Redirect {
            text: AGGREGATION_REDIRECT_MESSAGE.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NarrationSettings {
    pub params: ModelParams,
    pub timeout: Duration,
    pub max_transport_retries: u32,
}

/// Answers descriptive questions from retrieved context only. It never sees
/// the query result.
#[derive(Clone)]
pub struct NarrationGenerator {
    client: Arc<dyn CompletionClient>,
    prompts: Arc<PromptSet>,
    settings: NarrationSettings,
}

impl NarrationGenerator {
    #[must_use]
    pub fn new(
        client: Arc<dyn CompletionClient>,
        prompts: Arc<PromptSet>,
        settings: NarrationSettings,
    ) -> Self {
        Self {
            client,
            prompts,
            settings,
        }
    }

    pub async fn narrate(
        &self,
        descriptor: &SchemaDescriptor,
        question: &str,
        snippets: &[ContextSnippet],
    ) -> Result<Narration, PipelineError> {
        match classify_question(question) {
            QuestionStyle::Statistical => {
                info!("statistical question; narration redirects to the query result");
                return Ok(Narration::redirect());
            }
            QuestionStyle::Descriptive if snippets.is_empty() => {
                info!("no context retrieved; narration declines");
                return Ok(Narration::Declined {
                    text: INSUFFICIENT_CONTEXT_MESSAGE.to_string(),
                });
            }
            QuestionStyle::Descriptive => {}
        }

        let request = self.build_request(descriptor, question, snippets);
        let started = Instant::now();
        let text = complete_with_retry(
            self.client.as_ref(),
            &request,
            self.settings.timeout,
            self.settings.max_transport_retries,
        )
        .await
        .map_err(|error| {
            warn!(error = %error, "narration failed");
            PipelineError::NarrationUnavailable(error.to_string())
        })?;

        info!(
            duration_ms = started.elapsed().as_millis() as u64,
            snippets = snippets.len(),
            "narration generated"
        );
        Ok(Narration::Grounded {
            text: text.trim().to_string(),
        })
    }

    #[must_use]
    pub fn build_request(
        &self,
        descriptor: &SchemaDescriptor,
        question: &str,
        snippets: &[ContextSnippet],
    ) -> CompletionRequest {
        let mut values = BTreeMap::new();
        values.insert("table", descriptor.table.clone());
        values.insert("db_schema", descriptor.render_prompt_text());
        values.insert("context", render_context_block(snippets));
        values.insert("question", question.trim().to_string());

        CompletionRequest {
            system_prompt: self.prompts.narration_system.clone(),
            user_prompt: self.prompts.narration.render(&values),
            params: self.settings.params.clone(),
        }
    }
}
