use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{ComponentFailure, PipelineError};
use crate::sql::Rejection;
use crate::utils::time::now_utc;

pub const QUERY_ENVELOPE_SCHEMA_VERSION: &str = "floatchat.query-envelope.v1";

pub type QueryEnvelopeMeta = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEnvelopeWarning {
    pub code: String,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEnvelopeError {
    pub code: String,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Everything a command prints on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEnvelope {
    pub ok: bool,
    pub command: String,
    pub generated_at_utc: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    pub meta: QueryEnvelopeMeta,
    pub warnings: Vec<QueryEnvelopeWarning>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryEnvelopeError>,
}

/// `ask` or `schema` failed after building an error envelope; `main`
/// prints the envelope and exits with the runtime code.
#[derive(Debug, Clone)]
pub struct EnvelopedFailure {
    envelope: QueryEnvelope,
}

impl EnvelopedFailure {
    #[must_use]
    pub fn new(envelope: QueryEnvelope) -> Self {
        Self { envelope }
    }

    #[must_use]
    pub fn envelope(&self) -> &QueryEnvelope {
        &self.envelope
    }
}

impl Display for EnvelopedFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(&self.envelope) {
            Ok(encoded) => f.write_str(&encoded),
            Err(_) => f.write_str("envelope serialization failure"),
        }
    }
}

impl std::error::Error for EnvelopedFailure {}

/// `check` found the statement unacceptable; distinct from a runtime
/// failure so the binary can exit with the validation code.
#[derive(Debug, Clone)]
pub struct RejectedQueryFailure {
    envelope: QueryEnvelope,
}

impl RejectedQueryFailure {
    #[must_use]
    pub fn new(command: impl Into<String>, rejection: &Rejection) -> Self {
        Self {
            envelope: QueryEnvelope::rejected(command, rejection),
        }
    }

    #[must_use]
    pub fn envelope(&self) -> &QueryEnvelope {
        &self.envelope
    }
}

impl Display for RejectedQueryFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(&self.envelope) {
            Ok(encoded) => f.write_str(&encoded),
            Err(_) => f.write_str("rejected query envelope serialization failure"),
        }
    }
}

impl std::error::Error for RejectedQueryFailure {}

impl QueryEnvelope {
    #[must_use]
    pub fn ok(command: impl Into<String>, data: Value) -> Self {
        Self::base(command, true).with_data(data)
    }

    #[must_use]
    pub fn error(
        command: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut envelope = Self::base(command, false);
        envelope.error = Some(QueryEnvelopeError {
            code: code.into(),
            message: message.into(),
            details: None,
        });
        envelope
    }

    #[must_use]
    pub fn rejected(command: impl Into<String>, rejection: &Rejection) -> Self {
        Self::error(command, "rejected_query", rejection.to_string())
            .with_error_details(rejection.details_json())
    }

    #[must_use]
    pub fn from_pipeline_error(command: impl Into<String>, error: &PipelineError) -> Self {
        let envelope = Self::error(command, error.code(), error.to_string());
        match error {
            PipelineError::RejectedQuery(rejection) => {
                envelope.with_error_details(rejection.details_json())
            }
            _ => envelope,
        }
    }

    fn base(command: impl Into<String>, ok: bool) -> Self {
        let mut meta = QueryEnvelopeMeta::new();
        meta.insert(
            "schema_version".to_string(),
            json!(QUERY_ENVELOPE_SCHEMA_VERSION),
        );

        Self {
            ok,
            command: command.into(),
            generated_at_utc: now_utc(),
            data: None,
            meta,
            warnings: Vec::new(),
            error: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_warning(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.warnings.push(QueryEnvelopeWarning {
            code: code.into(),
            message: message.into(),
            details: None,
        });
        self
    }

    /// Partial responses surface each component failure as a warning.
    #[must_use]
    pub fn with_failures(self, failures: &[ComponentFailure]) -> Self {
        failures.iter().fold(self, |envelope, failure| {
            envelope.with_warning(failure.code.clone(), failure.message.clone())
        })
    }

    #[must_use]
    pub fn with_error_details(mut self, details: Value) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.details = Some(details);
        }
        self
    }
}
