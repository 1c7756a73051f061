use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use thiserror::Error;

pub const SYNTHESIS_PLACEHOLDERS: &[&str] = &[
    "table",
    "db_schema",
    "context",
    "question",
    "max_limit",
    "default_columns",
];
pub const NARRATION_PLACEHOLDERS: &[&str] = &["table", "db_schema", "context", "question"];

pub const DEFAULT_SYNTHESIS_SYSTEM: &str = "You are an expert translator from English questions to SQL for the ARGO profiles database. \
You are given the database schema and context retrieved from the database. Use them to write one accurate, read-only SQLite query.";

pub const DEFAULT_SYNTHESIS_TEMPLATE: &str = r#"Translate the question about oceanographic ARGO data into a SINGLE read-only SQLite SELECT statement.
Rules:
1. Output exactly one SELECT statement and nothing else: no explanation, no code fences, no comments.
2. Only use the table `{table}`. Never reference another table, never join.
3. Only use columns listed in the schema. For aggregates use AVG, MIN, MAX, COUNT or SUM. An output alias may only be used as a whole ORDER BY term.
4. Never write INSERT, UPDATE, DELETE, DROP, ALTER, ATTACH, DETACH, PRAGMA or WITH.
5. When the question mentions a location, filter with numeric ranges on LATITUDE and LONGITUDE.
6. When the question mentions a date, month, year or period, filter on PROFILE_DATE (stored as 'YYYY-MM-DD').
7. For plotting-friendly requests return the measurement columns that belong together (for example PRES with PSAL).
8. Always end with LIMIT n where n <= {max_limit}, even when the question asks for everything.
9. If unsure, return SELECT {default_columns} FROM {table} WHERE ... LIMIT {max_limit}.
10. For "nearest" floats return PLATFORM_NUMBER, LATITUDE, LONGITUDE ordered by ABS(LATITUDE - lat) + ABS(LONGITUDE - lon).

Database schema:
{db_schema}

Relevant context (semantic retrieval results):
{context}

Question:
{question}

Now produce only the SQL."#;

pub const DEFAULT_NARRATION_SYSTEM: &str =
    "You are an expert assistant helping with Argo float oceanographic data.";

pub const DEFAULT_NARRATION_TEMPLATE: &str = r#"Answer the question using only the context profiles below.
- Summarize the float id, date, latitude/longitude, depth, temperature and salinity that the context mentions.
- Never invent values that are not present in the context.
- If the context is not enough to answer, say politely that you cannot answer with the given data.
- Do not write SQL; queries are handled separately.

Question:
{question}

Context profiles:
{context}"#;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromptTemplateError {
    #[error("prompt template `{template}` is empty")]
    Empty { template: String },

    #[error("prompt template `{template}` uses unknown placeholder {{{placeholder}}}; allowed: {allowed}")]
    UnknownPlaceholder {
        template: String,
        placeholder: String,
        allowed: String,
    },

    #[error("prompt template `{template}` must reference {{{placeholder}}}")]
    MissingPlaceholder {
        template: String,
        placeholder: String,
    },
}

/// A prompt with `{name}` placeholders drawn from a fixed set. Substitution
/// is single-pass, so values containing braces are inserted verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    name: String,
    text: String,
}

impl PromptTemplate {
    pub fn parse(
        name: &str,
        text: &str,
        allowed: &[&str],
        required: &[&str],
    ) -> Result<Self, PromptTemplateError> {
        if text.trim().is_empty() {
            return Err(PromptTemplateError::Empty {
                template: name.to_string(),
            });
        }

        let used = placeholders(text);
        if let Some(unknown) = used.iter().find(|used| !allowed.contains(&used.as_str())) {
            return Err(PromptTemplateError::UnknownPlaceholder {
                template: name.to_string(),
                placeholder: unknown.clone(),
                allowed: allowed.join(", "),
            });
        }
        if let Some(missing) = required
            .iter()
            .find(|required| !used.iter().any(|used| used == *required))
        {
            return Err(PromptTemplateError::MissingPlaceholder {
                template: name.to_string(),
                placeholder: (*missing).to_string(),
            });
        }

        Ok(Self {
            name: name.to_string(),
            text: text.to_string(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn render(&self, values: &BTreeMap<&str, String>) -> String {
        placeholder_regex()
            .replace_all(&self.text, |captures: &Captures<'_>| {
                values
                    .get(&captures[1])
                    .cloned()
                    .unwrap_or_default()
            })
            .into_owned()
    }
}

/// The four prompts a request uses, validated together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSet {
    pub synthesis_system: String,
    pub synthesis: PromptTemplate,
    pub narration_system: String,
    pub narration: PromptTemplate,
}

impl PromptSet {
    pub fn new(
        synthesis_system: &str,
        synthesis_template: &str,
        narration_system: &str,
        narration_template: &str,
    ) -> Result<Self, PromptTemplateError> {
        for (name, text) in [
            ("synthesis_system", synthesis_system),
            ("narration_system", narration_system),
        ] {
            if let Some(placeholder) = placeholders(text).into_iter().next() {
                return Err(PromptTemplateError::UnknownPlaceholder {
                    template: name.to_string(),
                    placeholder,
                    allowed: "(none)".to_string(),
                });
            }
        }

        Ok(Self {
            synthesis_system: synthesis_system.to_string(),
            synthesis: PromptTemplate::parse(
                "synthesis_template",
                synthesis_template,
                SYNTHESIS_PLACEHOLDERS,
                &["question"],
            )?,
            narration_system: narration_system.to_string(),
            narration: PromptTemplate::parse(
                "narration_template",
                narration_template,
                NARRATION_PLACEHOLDERS,
                &["question", "context"],
            )?,
        })
    }
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            synthesis_system: DEFAULT_SYNTHESIS_SYSTEM.to_string(),
            synthesis: PromptTemplate {
                name: "synthesis_template".to_string(),
                text: DEFAULT_SYNTHESIS_TEMPLATE.to_string(),
            },
            narration_system: DEFAULT_NARRATION_SYSTEM.to_string(),
            narration: PromptTemplate {
                name: "narration_template".to_string(),
                text: DEFAULT_NARRATION_TEMPLATE.to_string(),
            },
        }
    }
}

fn placeholders(text: &str) -> Vec<String> {
    let mut names: Vec<String> = placeholder_regex()
        .captures_iter(text)
        .map(|captures| captures[1].to_string())
        .collect();
    names.dedup();
    names
}

fn placeholder_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex")
    })
}
