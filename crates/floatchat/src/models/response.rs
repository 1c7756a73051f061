use serde::Serialize;
use serde_json::Value;

use crate::error::ComponentFailure;
use crate::intent::QuestionIntent;
use crate::narrate::Narration;
use crate::retrieval::ContextSnippet;
use crate::sql::LimitAction;
use crate::store::ResultTable;
use crate::visualize::VisualizationPlan;

pub const ASK_RESPONSE_SCHEMA_VERSION: &str = "floatchat.ask-response.v1";

/// Where the executed statement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum QuerySource {
    /// First synthesis attempt passed validation.
    Synthesized,
    /// Passed after one retry with rejection feedback.
    Corrected,
    /// Conservative default projection.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, schemars::JsonSchema)]
pub struct AskResponse {
    pub question: String,
    pub intent: QuestionIntent,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub validated_query: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_source: Option<QuerySource>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_action: Option<LimitAction>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_table: Option<ResultTable>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub narration: Option<Narration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub charts: Option<VisualizationPlan>,

    pub context: Vec<ContextSnippet>,
    pub notes: Vec<String>,
    pub failures: Vec<ComponentFailure>,
}

impl AskResponse {
    /// At least one half of the request failed.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[must_use]
pub fn json_schema() -> Value {
    let schema = schemars::schema_for!(AskResponse);
    match serde_json::to_value(schema) {
        Ok(value) => value,
        Err(error) => {
            panic!("failed to serialize generated ask response schema: {error}");
        }
    }
}
