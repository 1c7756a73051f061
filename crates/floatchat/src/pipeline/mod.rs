//! Request orchestration.
//!
//! Retrieval runs first and degrades to an empty context when the index is
//! unavailable. Query synthesis, validation and execution then run
//! concurrently with narration; the two halves are joined before the
//! response is assembled. A half that fails leaves a `failures` entry and
//! the other half still stands; only when both fail does `ask` return an
//! error.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::{FloatchatConfig, RuntimePaths};
use crate::error::{ComponentFailure, PipelineError};
use crate::intent::QuestionIntent;
use crate::llm::{ChatCompletionsClient, CompletionClient};
use crate::logging::loggable;
use crate::models::{AskResponse, QuerySource};
use crate::narrate::{Narration, NarrationGenerator, NarrationSettings};
use crate::retrieval::{ContextRetriever, ContextSnippet, DisabledRetriever, HttpRetriever};
use crate::schema::SchemaDescriptor;
use crate::sql::{QueryValidator, Rejection, ValidatedQuery, check_intent_coverage};
use crate::store::{ProfileStore, ResultTable};
use crate::synth::{QuerySynthesizer, SynthesisFeedback, SynthesizerSettings};
use crate::visualize::plan_charts;

pub const AMBIGUOUS_QUESTION_NOTE: &str = "The question names no location, period, measurement or aggregate; showing the default profile columns.";

/// Everything a pipeline needs, already constructed. `from_config` builds
/// this from configuration; tests assemble it from in-memory doubles.
pub struct PipelineComponents {
    pub descriptor: Arc<SchemaDescriptor>,
    pub validator: Arc<QueryValidator>,
    pub retriever: Arc<dyn ContextRetriever>,
    pub synthesizer: QuerySynthesizer,
    pub narrator: NarrationGenerator,
    pub store: Arc<ProfileStore>,
    pub snippet_count: usize,
    pub retrieval_timeout: Duration,
}

#[derive(Clone)]
pub struct AskPipeline {
    descriptor: Arc<SchemaDescriptor>,
    validator: Arc<QueryValidator>,
    retriever: Arc<dyn ContextRetriever>,
    synthesizer: QuerySynthesizer,
    narrator: NarrationGenerator,
    store: Arc<ProfileStore>,
    snippet_count: usize,
    retrieval_timeout: Duration,
}

/// Outcome of the synthesis, validation and execution half.
#[derive(Default)]
struct QueryHalf {
    query: Option<(ValidatedQuery, QuerySource)>,
    table: Option<ResultTable>,
    notes: Vec<String>,
    failure: Option<PipelineError>,
}

impl AskPipeline {
    #[must_use]
    pub fn new(components: PipelineComponents) -> Self {
        Self {
            descriptor: components.descriptor,
            validator: components.validator,
            retriever: components.retriever,
            synthesizer: components.synthesizer,
            narrator: components.narrator,
            store: components.store,
            snippet_count: components.snippet_count.max(1),
            retrieval_timeout: components.retrieval_timeout,
        }
    }

    /// Wires the HTTP collaborators and the store from configuration.
    /// `db_override` replaces `store.path`.
    pub fn from_config(
        config: &FloatchatConfig,
        paths: &RuntimePaths,
        db_override: Option<&Path>,
    ) -> Result<Self> {
        let descriptor = config.load_descriptor(paths)?;
        descriptor
            .validate()
            .context("schema descriptor failed validation")?;
        let descriptor = Arc::new(descriptor);
        let validator = Arc::new(QueryValidator::new(
            Arc::clone(&descriptor),
            config.query_limits(),
        ));

        let store_path = config.store_path(paths, db_override)?;
        let store = Arc::new(ProfileStore::new(
            store_path,
            Arc::clone(&descriptor),
            usize::try_from(config.store.max_limit).unwrap_or(usize::MAX),
            Duration::from_millis(config.store.busy_timeout_ms),
        ));

        let retrieval_timeout = Duration::from_millis(config.retrieval.timeout_ms);
        let retriever: Arc<dyn ContextRetriever> = match config.retrieval.endpoint.as_deref() {
            Some(endpoint) if !endpoint.trim().is_empty() => {
                Arc::new(HttpRetriever::new(endpoint, retrieval_timeout)?)
            }
            _ => {
                info!("no retrieval endpoint configured; requests run without context");
                Arc::new(DisabledRetriever)
            }
        };

        let generation = &config.generation;
        let api_key = std::env::var(&generation.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        if api_key.is_none() {
            warn!(
                env = %generation.api_key_env,
                "generation API key not set; generation calls will likely be refused"
            );
        }
        let generation_timeout = Duration::from_millis(generation.timeout_ms);
        let client: Arc<dyn CompletionClient> = Arc::new(ChatCompletionsClient::new(
            generation.endpoint.clone(),
            api_key,
            generation_timeout,
        )?);
        let prompts = Arc::new(config.prompt_set()?);

        Ok(Self::new(PipelineComponents {
            descriptor: Arc::clone(&descriptor),
            validator,
            retriever,
            synthesizer: QuerySynthesizer::new(
                Arc::clone(&client),
                Arc::clone(&prompts),
                SynthesizerSettings {
                    params: generation.synthesis.clone(),
                    timeout: generation_timeout,
                    max_transport_retries: generation.max_transport_retries,
                    max_limit: config.store.max_limit,
                },
            ),
            narrator: NarrationGenerator::new(
                client,
                prompts,
                NarrationSettings {
                    params: generation.narration.clone(),
                    timeout: generation_timeout,
                    max_transport_retries: generation.max_transport_retries,
                },
            ),
            store,
            snippet_count: config.retrieval.k,
            retrieval_timeout,
        }))
    }

    #[must_use]
    pub fn descriptor(&self) -> &SchemaDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn validator(&self) -> &QueryValidator {
        &self.validator
    }

    #[must_use]
    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    pub async fn ask(&self, question: &str) -> Result<AskResponse, PipelineError> {
        self.ask_with_k(question, self.snippet_count).await
    }

    pub async fn ask_with_k(&self, question: &str, k: usize) -> Result<AskResponse, PipelineError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(PipelineError::EmptyQuestion);
        }
        let started = Instant::now();
        let intent = QuestionIntent::analyze(question);
        info!(
            question = %loggable(question),
            question_len = question.len(),
            hints = ?intent.hints(),
            "ask started"
        );

        let mut notes = Vec::new();
        let snippets = match self.retrieve(question, k.max(1)).await {
            Ok(snippets) => snippets,
            Err(error) => {
                warn!(error = %error, "continuing without retrieved context");
                notes.push(format!("{error}; continuing without context"));
                Vec::new()
            }
        };

        let (mut query_half, narration) = tokio::join!(
            self.run_query_half(question, &intent, &snippets),
            self.narrator.narrate(&self.descriptor, question, &snippets),
        );

        let mut failures = Vec::new();
        let narration = match (narration, query_half.failure.take()) {
            (Err(narration_error), Some(query_error)) => {
                warn!(
                    query_error = %query_error,
                    narration_error = %narration_error,
                    "both halves failed"
                );
                return Err(query_error);
            }
            (Err(narration_error), None) => {
                failures.push(narration_error.to_failure());
                None
            }
            (Ok(narration), query_error) => {
                failures.extend(query_error.as_ref().map(PipelineError::to_failure));
                Some(narration)
            }
        };

        notes.append(&mut query_half.notes);
        query_half.notes = notes;
        let response = self.assemble(question, intent, snippets, query_half, narration, failures);
        info!(
            duration_ms = started.elapsed().as_millis() as u64,
            source = ?response.query_source,
            rows = response.result_table.as_ref().map_or(0, |table| table.row_count),
            failures = response.failures.len(),
            "ask finished"
        );
        Ok(response)
    }

    fn assemble(
        &self,
        question: &str,
        intent: QuestionIntent,
        snippets: Vec<ContextSnippet>,
        half: QueryHalf,
        narration: Option<Narration>,
        failures: Vec<ComponentFailure>,
    ) -> AskResponse {
        let mut notes = half.notes;
        let charts = half.table.as_ref().map(|table| {
            let plan = plan_charts(table, &self.descriptor);
            notes.extend(plan.notes.iter().cloned());
            plan
        });
        if let Some(table) = half.table.as_ref().filter(|table| table.truncated) {
            notes.push(format!("Result truncated to {} rows.", table.row_count));
        }

        let (validated_query, query_source, limit_action) = match half.query {
            Some((query, source)) => (
                Some(query.as_str().to_string()),
                Some(source),
                Some(query.limit_action().clone()),
            ),
            None => (None, None, None),
        };

        AskResponse {
            question: question.to_string(),
            intent,
            validated_query,
            query_source,
            limit_action,
            result_table: half.table,
            narration,
            charts,
            context: snippets,
            notes,
            failures,
        }
    }

    async fn retrieve(&self, question: &str, k: usize) -> Result<Vec<ContextSnippet>, PipelineError> {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.retrieval_timeout, self.retriever.search(question, k))
            .await
            .map_err(|_| {
                PipelineError::RetrievalUnavailable(format!(
                    "timed out after {} ms",
                    self.retrieval_timeout.as_millis()
                ))
            })?
            .map_err(|error| PipelineError::RetrievalUnavailable(error.0))?;

        info!(
            snippets = outcome.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "context retrieved"
        );
        Ok(outcome)
    }

    async fn run_query_half(
        &self,
        question: &str,
        intent: &QuestionIntent,
        snippets: &[ContextSnippet],
    ) -> QueryHalf {
        let mut half = QueryHalf::default();

        let selected = if intent.is_ambiguous() {
            info!("ambiguous question; using the default projection");
            half.notes.push(AMBIGUOUS_QUESTION_NOTE.to_string());
            self.fallback(QuerySource::Fallback)
        } else {
            self.synthesize_validated(question, intent, snippets, &mut half.notes)
                .await
        };

        let (query, source) = match selected {
            Ok(selected) => selected,
            Err(error) => {
                half.failure = Some(error);
                return half;
            }
        };

        match self.execute(query.clone()).await {
            Ok(table) => half.table = Some(table),
            Err(error) => {
                warn!(error = %error, "query execution failed");
                half.failure = Some(error);
            }
        }
        half.query = Some((query, source));
        half
    }

    /// First attempt, then one retry with the rejection as feedback, then
    /// the conservative fallback. Nothing unvalidated leaves this function.
    async fn synthesize_validated(
        &self,
        question: &str,
        intent: &QuestionIntent,
        snippets: &[ContextSnippet],
        notes: &mut Vec<String>,
    ) -> Result<(ValidatedQuery, QuerySource), PipelineError> {
        let candidate = self
            .synthesizer
            .synthesize(&self.descriptor, question, snippets, None)
            .await?;
        let rejection = match self.check(&candidate, intent) {
            Ok(query) => return Ok((query, QuerySource::Synthesized)),
            Err(rejection) => rejection,
        };
        warn!(reason = rejection.reason.code(), "candidate rejected; retrying once");

        let feedback = SynthesisFeedback {
            previous_candidate: candidate,
            rejection,
        };
        let retried = match self
            .synthesizer
            .synthesize(&self.descriptor, question, snippets, Some(&feedback))
            .await
        {
            Ok(retried) => retried,
            Err(error) => {
                notes.push(format!(
                    "Generated query was rejected ({}) and the retry failed ({error}); showing the default profile columns.",
                    feedback.rejection
                ));
                return self.fallback(QuerySource::Fallback);
            }
        };

        match self.check(&retried, intent) {
            Ok(query) => {
                notes.push(format!(
                    "First generated query was rejected ({}); the corrected query was used.",
                    feedback.rejection
                ));
                Ok((query, QuerySource::Corrected))
            }
            Err(second) => {
                warn!(reason = second.reason.code(), "retry rejected; using fallback");
                notes.push(format!(
                    "Generated query was rejected twice ({second}); showing the default profile columns."
                ));
                self.fallback(QuerySource::Fallback)
            }
        }
    }

    fn check(&self, candidate: &str, intent: &QuestionIntent) -> Result<ValidatedQuery, Rejection> {
        let query = self.validator.validate(candidate)?;
        check_intent_coverage(&query, intent, &self.descriptor)?;
        Ok(query)
    }

    fn fallback(&self, source: QuerySource) -> Result<(ValidatedQuery, QuerySource), PipelineError> {
        self.validator
            .fallback_query()
            .map(|query| (query, source))
            .map_err(PipelineError::RejectedQuery)
    }

    async fn execute(&self, query: ValidatedQuery) -> Result<ResultTable, PipelineError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.execute(&query))
            .await
            .map_err(|error| PipelineError::ExecutionError(format!("executor task failed: {error}")))?
    }
}
