use std::sync::Arc;

use floatchat::error::{ComponentFailure, PipelineError};
use floatchat::models::query_envelope::{
    EnvelopedFailure, QUERY_ENVELOPE_SCHEMA_VERSION, QueryEnvelope, RejectedQueryFailure,
};
use floatchat::schema::SchemaDescriptor;
use floatchat::sql::{QueryLimits, QueryValidator};
use serde_json::json;

fn rejection(sql: &str) -> floatchat::sql::Rejection {
    QueryValidator::new(
        Arc::new(SchemaDescriptor::argo_profiles("profiles")),
        QueryLimits::default(),
    )
    .validate(sql)
    .expect_err("statement should be rejected")
}

#[test]
fn ok_envelope_tracks_contract_fields() {
    let envelope = QueryEnvelope::ok("ask", json!({"question": "list floats"}))
        .with_meta("k", json!(4))
        .with_warning("narration_unavailable", "narration unavailable: timed out");

    assert!(envelope.ok);
    assert_eq!(envelope.command, "ask");
    assert!(envelope.generated_at_utc.ends_with('Z'));
    assert_eq!(
        envelope.meta.get("schema_version"),
        Some(&json!(QUERY_ENVELOPE_SCHEMA_VERSION))
    );
    assert_eq!(envelope.meta.get("k"), Some(&json!(4)));
    assert_eq!(envelope.warnings.len(), 1);
    assert_eq!(envelope.warnings[0].code, "narration_unavailable");
    assert!(envelope.error.is_none());
}

#[test]
fn ok_envelope_serializes_required_top_level_fields() {
    let envelope = QueryEnvelope::ok("schema", json!({"descriptor": {}}));
    let encoded = serde_json::to_value(&envelope).expect("envelope should serialize");

    for key in ["ok", "command", "generated_at_utc", "data", "meta", "warnings"] {
        assert!(encoded.get(key).is_some(), "missing {key}");
    }
    assert!(encoded.get("error").is_none());
}

#[test]
fn failures_become_warnings() {
    let failures = vec![
        ComponentFailure {
            code: "synthesis_unavailable".to_string(),
            message: "query synthesis unavailable: status 401".to_string(),
        },
        ComponentFailure {
            code: "execution_error".to_string(),
            message: "query execution failed: locked".to_string(),
        },
    ];
    let envelope = QueryEnvelope::ok("ask", json!({})).with_failures(&failures);

    let codes = envelope
        .warnings
        .iter()
        .map(|warning| warning.code.as_str())
        .collect::<Vec<_>>();
    assert_eq!(codes, vec!["synthesis_unavailable", "execution_error"]);
}

#[test]
fn rejected_envelope_carries_violation_details() {
    let failure = RejectedQueryFailure::new("check", &rejection("DROP TABLE profiles"));
    let envelope = failure.envelope();

    assert!(!envelope.ok);
    assert!(envelope.data.is_none());
    let error = envelope.error.as_ref().expect("error should be present");
    assert_eq!(error.code, "rejected_query");
    assert!(error.message.contains("forbidden_keyword"));
    assert_eq!(
        error
            .details
            .as_ref()
            .and_then(|details| details.pointer("/violation/reason")),
        Some(&json!("forbidden_keyword"))
    );
    assert_eq!(
        error
            .details
            .as_ref()
            .and_then(|details| details.pointer("/violation/detail")),
        Some(&json!("drop"))
    );
}

#[test]
fn pipeline_errors_map_to_stable_codes() {
    let envelope = QueryEnvelope::from_pipeline_error(
        "ask",
        &PipelineError::SynthesisUnavailable("status 401".to_string()),
    );
    let error = envelope.error.as_ref().expect("error should be present");
    assert_eq!(error.code, "synthesis_unavailable");
    assert_eq!(error.message, "query synthesis unavailable: status 401");
    assert!(error.details.is_none());

    let envelope = QueryEnvelope::from_pipeline_error(
        "ask",
        &PipelineError::RejectedQuery(rejection("SELECT * FROM secrets")),
    );
    let error = envelope.error.as_ref().expect("error should be present");
    assert_eq!(error.code, "rejected_query");
    assert!(error.details.is_some());
}

#[test]
fn enveloped_failure_displays_as_json() {
    let failure = EnvelopedFailure::new(QueryEnvelope::error(
        "schema",
        "schema_mismatch",
        "profile store does not provide every described column",
    ));

    let rendered = failure.to_string();
    let decoded: serde_json::Value =
        serde_json::from_str(&rendered).expect("display should be JSON");
    assert_eq!(decoded["error"]["code"], "schema_mismatch");
    assert_eq!(decoded["ok"], false);
}
