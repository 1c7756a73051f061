use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::intent::QuestionIntent;
use crate::llm::{CompletionClient, CompletionRequest, ModelParams, complete_with_retry};
use crate::prompts::PromptSet;
use crate::retrieval::{ContextSnippet, render_context_block};
use crate::schema::SchemaDescriptor;
use crate::sql::Rejection;

/// Guidance appended to the prompt when a previous candidate was rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisFeedback {
    pub previous_candidate: String,
    pub rejection: Rejection,
}

#[derive(Debug, Clone)]
pub struct SynthesizerSettings {
    pub params: ModelParams,
    pub timeout: Duration,
    pub max_transport_retries: u32,
    pub max_limit: u64,
}

/// Turns a question plus retrieved context into one candidate SELECT.
/// The output is untrusted; callers must validate it before execution.
#[derive(Clone)]
pub struct QuerySynthesizer {
    client: Arc<dyn CompletionClient>,
    prompts: Arc<PromptSet>,
    settings: SynthesizerSettings,
}

impl QuerySynthesizer {
    #[must_use]
    pub fn new(
        client: Arc<dyn CompletionClient>,
        prompts: Arc<PromptSet>,
        settings: SynthesizerSettings,
    ) -> Self {
        Self {
            client,
            prompts,
            settings,
        }
    }

    pub async fn synthesize(
        &self,
        descriptor: &SchemaDescriptor,
        question: &str,
        snippets: &[ContextSnippet],
        feedback: Option<&SynthesisFeedback>,
    ) -> Result<String, PipelineError> {
        let request = self.build_request(descriptor, question, snippets, feedback);
        let started = Instant::now();
        let raw = complete_with_retry(
            self.client.as_ref(),
            &request,
            self.settings.timeout,
            self.settings.max_transport_retries,
        )
        .await
        .map_err(|error| {
            warn!(error = %error, "query synthesis failed");
            PipelineError::SynthesisUnavailable(error.to_string())
        })?;

        let candidate = extract_sql(&raw);
        if candidate.is_empty() {
            return Err(PipelineError::SynthesisUnavailable(
                "generation returned no SQL".to_string(),
            ));
        }
        info!(
            duration_ms = started.elapsed().as_millis() as u64,
            retry = feedback.is_some(),
            candidate_len = candidate.len(),
            "candidate query synthesized"
        );
        debug!(candidate = %candidate, "candidate query text");
        Ok(candidate)
    }

    #[must_use]
    pub fn build_request(
        &self,
        descriptor: &SchemaDescriptor,
        question: &str,
        snippets: &[ContextSnippet],
        feedback: Option<&SynthesisFeedback>,
    ) -> CompletionRequest {
        let mut values = BTreeMap::new();
        values.insert("table", descriptor.table.clone());
        values.insert("db_schema", descriptor.render_prompt_text());
        values.insert("context", render_context_block(snippets));
        values.insert("question", question.trim().to_string());
        values.insert("max_limit", self.settings.max_limit.to_string());
        values.insert("default_columns", descriptor.default_projection_sql());

        let mut user_prompt = self.prompts.synthesis.render(&values);

        let hints = QuestionIntent::analyze(question).hints();
        if !hints.is_empty() {
            user_prompt.push_str("\n\nQuestion hints: ");
            user_prompt.push_str(&hints.join(", "));
            user_prompt.push('.');
        }

        if let Some(feedback) = feedback {
            user_prompt.push_str(&format!(
                "\n\nYour previous answer was rejected.\nPrevious answer:\n{}\nReason: {}\nReturn a corrected statement that fixes this.",
                feedback.previous_candidate.trim(),
                feedback.rejection
            ));
        }

        CompletionRequest {
            system_prompt: self.prompts.synthesis_system.clone(),
            user_prompt,
            params: self.settings.params.clone(),
        }
    }
}

/// Pulls the statement out of a model reply: the body of the first Markdown
/// code fence if any, without a leading `SQL:` label or prose preamble.
#[must_use]
pub fn extract_sql(raw: &str) -> String {
    let mut text = raw.trim();

    if let Some(open) = text.find("```") {
        let after_fence = &text[open + 3..];
        let body_start = after_fence.find('\n').map_or(after_fence.len(), |index| index + 1);
        let info_string = after_fence[..body_start].trim();
        let body = if info_string.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            &after_fence[body_start..]
        } else {
            after_fence
        };
        text = match body.find("```") {
            Some(close) => &body[..close],
            None => body,
        };
        text = text.trim();
    }

    if text
        .get(..4)
        .is_some_and(|label| label.eq_ignore_ascii_case("sql:"))
    {
        text = text[4..].trim_start();
    }

    if !starts_with_select(text) {
        if let Some(offset) = text
            .split('\n')
            .scan(0_usize, |position, line| {
                let start = *position;
                *position += line.len() + 1;
                Some((start, line))
            })
            .find(|(_, line)| starts_with_select(line.trim_start()))
            .map(|(start, line)| start + (line.len() - line.trim_start().len()))
        {
            text = &text[offset..];
        }
    }

    text.trim().to_string()
}

fn starts_with_select(text: &str) -> bool {
    text.get(..6)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("select"))
}
