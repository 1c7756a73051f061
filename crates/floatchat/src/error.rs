use serde::Serialize;
use thiserror::Error;

use crate::sql::Rejection;

/// Failure taxonomy for a single `ask` request.
///
/// Retrieval failures never abort a request (the pipeline degrades to an
/// empty context), so `RetrievalUnavailable` only surfaces in notes and logs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("question is empty")]
    EmptyQuestion,

    #[error("context retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("query synthesis unavailable: {0}")]
    SynthesisUnavailable(String),

    #[error("query rejected: {0}")]
    RejectedQuery(Rejection),

    #[error("query execution failed: {0}")]
    ExecutionError(String),

    #[error("narration unavailable: {0}")]
    NarrationUnavailable(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl PipelineError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyQuestion => "empty_question",
            Self::RetrievalUnavailable(_) => "retrieval_unavailable",
            Self::SynthesisUnavailable(_) => "synthesis_unavailable",
            Self::RejectedQuery(_) => "rejected_query",
            Self::ExecutionError(_) => "execution_error",
            Self::NarrationUnavailable(_) => "narration_unavailable",
            Self::Configuration(_) => "configuration_invalid",
        }
    }

    #[must_use]
    pub fn to_failure(&self) -> ComponentFailure {
        ComponentFailure {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

/// Serializable view of a [`PipelineError`] attached to partial responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, schemars::JsonSchema)]
pub struct ComponentFailure {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("retrieval index unavailable: {0}")]
pub struct RetrievalUnavailable(pub String);

/// Errors from a chat-completion backend, split so callers can retry only
/// transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("generation service responded with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("generation service returned no content")]
    EmptyContent,

    #[error("generation service response could not be decoded: {0}")]
    Decode(String),
}

impl CompletionError {
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
