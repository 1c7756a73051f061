//! Read-only query guardrail.
//!
//! Every statement that reaches the store goes through [`QueryValidator`]:
//! one SELECT over the configured table, descriptor columns only, and a
//! bounded top-level LIMIT. Validation is pure and deterministic, so a
//! validated text validates again to itself.

pub mod policy;
mod scan;
mod tree;

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use schemars::JsonSchema;
use serde::Serialize;
use serde_json::{Value, json};

use crate::schema::SchemaDescriptor;

pub use policy::{QueryShape, check_intent_coverage};

pub const DEFAULT_MAX_LIMIT: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    EmptyStatement,
    Malformed,
    MultipleStatements,
    CommentSequence,
    BindParameter,
    UnsupportedStatement,
    ForbiddenKeyword,
    CompoundSelect,
    JoinNotAllowed,
    QualifiedTable,
    UnknownTable,
    UnknownColumn,
    InvalidLimit,
    TrailingTokens,
    MissingSpatialFilter,
    MissingTemporalFilter,
    MissingAggregate,
    MissingNearestOrdering,
}

impl RejectionReason {
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::EmptyStatement => "empty_statement",
            Self::Malformed => "malformed",
            Self::MultipleStatements => "multi_statement",
            Self::CommentSequence => "comment_sequence",
            Self::BindParameter => "bind_parameter",
            Self::UnsupportedStatement => "unsupported_statement",
            Self::ForbiddenKeyword => "forbidden_keyword",
            Self::CompoundSelect => "compound_select",
            Self::JoinNotAllowed => "join_not_allowed",
            Self::QualifiedTable => "qualified_table",
            Self::UnknownTable => "unknown_table",
            Self::UnknownColumn => "unknown_column",
            Self::InvalidLimit => "invalid_limit",
            Self::TrailingTokens => "trailing_tokens",
            Self::MissingSpatialFilter => "missing_spatial_filter",
            Self::MissingTemporalFilter => "missing_temporal_filter",
            Self::MissingAggregate => "missing_aggregate",
            Self::MissingNearestOrdering => "missing_nearest_ordering",
        }
    }

    /// Grammar rejections come from the statement alone; policy rejections
    /// compare the statement with what the question asked for.
    #[must_use]
    pub fn is_policy(self) -> bool {
        matches!(
            self,
            Self::MissingSpatialFilter
                | Self::MissingTemporalFilter
                | Self::MissingAggregate
                | Self::MissingNearestOrdering
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct Rejection {
    pub reason: RejectionReason,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Rejection {
    #[must_use]
    pub fn new(reason: RejectionReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn details_json(&self) -> Value {
        json!({
            "guardrail": "read_only_single_table_select",
            "allowed_forms": ["SELECT ... FROM <table> [WHERE ...] [GROUP BY ...] [ORDER BY ...] [LIMIT n]"],
            "violation": {
                "reason": self.reason.code(),
                "detail": self.detail,
            }
        })
    }
}

impl Display for Rejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.reason.code())
    }
}

impl std::error::Error for Rejection {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LimitAction {
    Kept,
    Appended,
    Capped { requested: String },
}

/// A statement that passed [`QueryValidator::validate`]. Only the validator
/// constructs these, and the executor accepts nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedQuery {
    text: String,
    limit: u64,
    limit_action: LimitAction,
    /// Length of the statement before the top-level LIMIT clause.
    body_len: usize,
    wildcard: bool,
}

impl ValidatedQuery {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.text
    }

    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    #[must_use]
    pub fn limit_action(&self) -> &LimitAction {
        &self.limit_action
    }

    /// Whether the top-level projection selects `*`.
    #[must_use]
    pub fn has_wildcard(&self) -> bool {
        self.wildcard
    }

    pub(crate) fn body(&self) -> &str {
        self.text
            .get(..self.body_len)
            .unwrap_or(&self.text)
            .trim_end()
    }
}

impl Display for ValidatedQuery {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLimits {
    pub max_limit: u64,
    pub default_limit: u64,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_limit: DEFAULT_MAX_LIMIT,
            default_limit: DEFAULT_MAX_LIMIT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryValidator {
    descriptor: Arc<SchemaDescriptor>,
    limits: QueryLimits,
}

impl QueryValidator {
    #[must_use]
    pub fn new(descriptor: Arc<SchemaDescriptor>, limits: QueryLimits) -> Self {
        let limits = QueryLimits {
            max_limit: limits.max_limit,
            default_limit: limits.default_limit.min(limits.max_limit),
        };
        Self { descriptor, limits }
    }

    #[must_use]
    pub fn descriptor(&self) -> &SchemaDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn limits(&self) -> QueryLimits {
        self.limits
    }

    /// The conservative projection used when synthesis cannot be trusted.
    pub fn fallback_query(&self) -> Result<ValidatedQuery, Rejection> {
        self.validate(&format!(
            "SELECT {} FROM {} LIMIT {}",
            self.descriptor.default_projection_sql(),
            self.descriptor.table,
            self.limits.default_limit
        ))
    }

    pub fn validate(&self, candidate: &str) -> Result<ValidatedQuery, Rejection> {
        let statement = strip_trailing_semicolons(candidate);
        if statement.is_empty() {
            return Err(Rejection::new(
                RejectionReason::EmptyStatement,
                "query is empty; expected a single SELECT statement",
            ));
        }

        let scan = scan::scan_statement(statement)?;
        let body = statement.get(..scan.body_end).unwrap_or(statement).trim_end();
        let query = tree::parse_query(body)?;
        let summary = tree::check_tree(&query, &self.descriptor)?;
        Ok(self.apply_limit(statement, &scan, summary))
    }

    fn apply_limit(
        &self,
        statement: &str,
        scan: &scan::StatementScan,
        summary: tree::TreeSummary,
    ) -> ValidatedQuery {
        let Some(count) = scan.limit.as_ref() else {
            return ValidatedQuery {
                text: format!("{statement} LIMIT {}", self.limits.default_limit),
                limit: self.limits.default_limit,
                limit_action: LimitAction::Appended,
                body_len: statement.len(),
                wildcard: summary.wildcard,
            };
        };

        // Digit strings too large for u64 are over any cap.
        let requested = count.text.parse::<u64>().unwrap_or(u64::MAX);
        if requested <= self.limits.max_limit {
            return ValidatedQuery {
                text: statement.to_string(),
                limit: requested,
                limit_action: LimitAction::Kept,
                body_len: scan.body_end,
                wildcard: summary.wildcard,
            };
        }

        let mut text = String::with_capacity(statement.len());
        text.push_str(&statement[..count.start]);
        text.push_str(&self.limits.max_limit.to_string());
        text.push_str(&statement[count.end..]);
        ValidatedQuery {
            text,
            limit: self.limits.max_limit,
            limit_action: LimitAction::Capped {
                requested: count.text.clone(),
            },
            body_len: scan.body_end,
            wildcard: summary.wildcard,
        }
    }
}

fn strip_trailing_semicolons(raw_sql: &str) -> &str {
    let mut candidate = raw_sql.trim();
    while let Some(stripped) = candidate.strip_suffix(';') {
        candidate = stripped.trim_end();
    }
    candidate
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{LimitAction, QueryLimits, QueryValidator, RejectionReason};
    use crate::schema::SchemaDescriptor;

    fn validator() -> QueryValidator {
        QueryValidator::new(
            Arc::new(SchemaDescriptor::argo_profiles("profiles")),
            QueryLimits::default(),
        )
    }

    fn reason(sql: &str) -> RejectionReason {
        validator()
            .validate(sql)
            .expect_err("query should be rejected")
            .reason
    }

    #[test]
    fn output_aliases_only_resolve_as_ordering_terms() {
        let validated = validator()
            .validate("SELECT AVG(TEMP) AS mean_temp, PLATFORM_NUMBER FROM profiles GROUP BY PLATFORM_NUMBER ORDER BY mean_temp DESC")
            .expect("ordering by an output alias should validate");
        assert_eq!(validated.limit_action(), &LimitAction::Appended);

        let rejection = validator()
            .validate("SELECT AVG(TEMP) AS mean_temp FROM profiles WHERE mean_temp > 3")
            .expect_err("WHERE resolves names against the table");
        assert_eq!(rejection.reason, RejectionReason::UnknownColumn);
        assert_eq!(rejection.detail.as_deref(), Some("mean_temp"));

        assert_eq!(
            reason("SELECT LATITUDE AS lat FROM profiles ORDER BY ABS(lat - 10)"),
            RejectionReason::UnknownColumn
        );
    }

    #[test]
    fn cast_type_names_are_not_columns() {
        validator()
            .validate("SELECT CAST(LATITUDE AS INTEGER) FROM profiles")
            .expect("cast should validate");
    }

    #[test]
    fn cast_to_date_and_null_safe_comparison_validate() {
        validator()
            .validate("SELECT CAST(PROFILE_DATE AS DATE) FROM profiles WHERE PSAL IS NOT DISTINCT FROM TEMP")
            .expect("date casts and IS NOT DISTINCT FROM should validate");
    }

    #[test]
    fn wildcard_projection_is_flagged() {
        let validator = validator();
        assert!(
            validator
                .validate("SELECT * FROM profiles")
                .expect("should validate")
                .has_wildcard()
        );
        assert!(
            validator
                .validate("SELECT p.* FROM profiles p")
                .expect("should validate")
                .has_wildcard()
        );
        assert!(
            !validator
                .validate("SELECT COUNT(*) FROM profiles")
                .expect("should validate")
                .has_wildcard()
        );
    }

    #[test]
    fn body_stops_before_the_top_level_limit() {
        let validated = validator()
            .validate("SELECT LATITUDE FROM profiles LIMIT 900")
            .expect("should validate");
        assert_eq!(validated.body(), "SELECT LATITUDE FROM profiles");

        let validated = validator()
            .validate("SELECT LATITUDE FROM profiles")
            .expect("should validate");
        assert_eq!(validated.body(), "SELECT LATITUDE FROM profiles");
    }

    #[test]
    fn qualified_columns_resolve_through_table_alias() {
        let validated = validator()
            .validate("SELECT p.LATITUDE, p.LONGITUDE FROM profiles AS p WHERE p.N_LEVELS > 10")
            .expect("aliased query should validate");
        assert_eq!(validated.limit_action(), &LimitAction::Appended);

        assert_eq!(
            reason("SELECT q.LATITUDE FROM profiles p"),
            RejectionReason::UnknownTable
        );
    }

    #[test]
    fn subqueries_over_the_same_table_are_allowed() {
        validator()
            .validate(
                "SELECT PLATFORM_NUMBER FROM profiles WHERE CYCLE_NUMBER = (SELECT MAX(CYCLE_NUMBER) FROM profiles) LIMIT 10",
            )
            .expect("same-table subquery should validate");
        assert_eq!(
            reason("SELECT * FROM profiles WHERE rowid IN (SELECT id FROM secrets)"),
            RejectionReason::UnknownTable
        );
    }

    #[test]
    fn limit_offset_forms_cap_the_count() {
        let validated = validator()
            .validate("SELECT * FROM profiles LIMIT 10, 900")
            .expect("comma form should validate");
        assert_eq!(validated.as_str(), "SELECT * FROM profiles LIMIT 10, 200");

        let validated = validator()
            .validate("SELECT * FROM profiles LIMIT 900 OFFSET 5")
            .expect("offset form should validate");
        assert_eq!(validated.as_str(), "SELECT * FROM profiles LIMIT 200 OFFSET 5");
        assert_eq!(validated.limit(), 200);
    }

    #[test]
    fn nested_limits_do_not_count_as_top_level() {
        let validated = validator()
            .validate("SELECT * FROM profiles WHERE rowid IN (SELECT rowid FROM profiles LIMIT 5)")
            .expect("nested limit should validate");
        assert!(validated.as_str().ends_with(") LIMIT 200"));
    }

    #[test]
    fn default_limit_never_exceeds_max() {
        let validator = QueryValidator::new(
            Arc::new(SchemaDescriptor::argo_profiles("profiles")),
            QueryLimits {
                max_limit: 50,
                default_limit: 500,
            },
        );
        assert_eq!(validator.limits().default_limit, 50);
        let validated = validator
            .validate("SELECT LATITUDE FROM profiles")
            .expect("should validate");
        assert_eq!(validated.as_str(), "SELECT LATITUDE FROM profiles LIMIT 50");
    }

    #[test]
    fn rejection_details_carry_reason_code() {
        let rejection = validator()
            .validate("SELECT * FROM profiles; SELECT 2")
            .expect_err("should reject");
        assert_eq!(
            rejection
                .details_json()
                .pointer("/violation/reason")
                .and_then(|value| value.as_str()),
            Some("multi_statement")
        );
    }

    #[test]
    fn fallback_query_is_itself_valid() {
        let fallback = validator().fallback_query().expect("fallback should validate");
        assert_eq!(
            fallback.as_str(),
            "SELECT PLATFORM_NUMBER, CYCLE_NUMBER, LATITUDE, LONGITUDE, PROFILE_DATE, PRES, TEMP, PSAL FROM profiles LIMIT 200"
        );
        assert_eq!(fallback.limit_action(), &LimitAction::Kept);
    }
}
