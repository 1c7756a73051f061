use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::{Captures, Regex};

pub const REDACTION_TOKEN: &str = "[REDACTED]";

struct RedactionMatcher {
    class_name: &'static str,
    regex: fn() -> &'static Regex,
    replacement: for<'a> fn(&Captures<'a>) -> String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRedactionResult {
    pub text: String,
    pub truncated: bool,
    pub redaction_classes: Vec<String>,
}

/// Masks credentials that can end up in questions, prompts or service
/// error bodies, then truncates to `max_chars` (ellipsis included).
#[must_use]
pub fn redact_and_truncate_text(value: &str, max_chars: usize) -> TextRedactionResult {
    let mut classes = BTreeSet::new();
    let mut redacted = value.to_string();

    for matcher in redaction_matcher_catalog() {
        let replaced = (matcher.regex)()
            .replace_all(&redacted, |captures: &Captures<'_>| {
                (matcher.replacement)(captures)
            })
            .into_owned();
        if replaced != redacted {
            classes.insert(matcher.class_name.to_string());
            redacted = replaced;
        }
    }

    let (text, truncated) = truncate_chars(&redacted, max_chars);
    TextRedactionResult {
        text,
        truncated,
        redaction_classes: classes.into_iter().collect(),
    }
}

fn truncate_chars(value: &str, max_chars: usize) -> (String, bool) {
    if value.chars().count() <= max_chars {
        return (value.to_string(), false);
    }
    if max_chars <= 3 {
        return (".".repeat(max_chars), true);
    }

    let prefix = value.chars().take(max_chars - 3).collect::<String>();
    (format!("{prefix}..."), true)
}

fn bearer_token_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._=\-]{8,}")
            .expect("bearer token regex should compile")
    })
}

fn api_token_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"\bsk-[A-Za-z0-9_\-]{8,}").expect("api token regex should compile")
    })
}

fn secret_assignment_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r#"(?i)\b(password|secret|api[_\-]?key|token)\b(\s*[:=]\s*)([^\s,;"']+)"#)
            .expect("secret assignment regex should compile")
    })
}

fn email_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?i)\b[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}\b")
            .expect("email regex should compile")
    })
}

fn replace_with_token(_captures: &Captures<'_>) -> String {
    REDACTION_TOKEN.to_string()
}

fn replace_bearer_token(_captures: &Captures<'_>) -> String {
    format!("Bearer {REDACTION_TOKEN}")
}

fn replace_secret_assignment(captures: &Captures<'_>) -> String {
    format!("{}{}{}", &captures[1], &captures[2], REDACTION_TOKEN)
}

fn redaction_matcher_catalog() -> &'static [RedactionMatcher] {
    static CATALOG: OnceLock<Vec<RedactionMatcher>> = OnceLock::new();
    CATALOG.get_or_init(|| {
        vec![
            RedactionMatcher {
                class_name: "bearer_token",
                regex: bearer_token_regex,
                replacement: replace_bearer_token,
            },
            RedactionMatcher {
                class_name: "api_token",
                regex: api_token_regex,
                replacement: replace_with_token,
            },
            RedactionMatcher {
                class_name: "secret_assignment",
                regex: secret_assignment_regex,
                replacement: replace_secret_assignment,
            },
            RedactionMatcher {
                class_name: "email",
                regex: email_regex,
                replacement: replace_with_token,
            },
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::{REDACTION_TOKEN, redact_and_truncate_text};

    #[test]
    fn masks_keys_in_service_error_bodies() {
        let key = ["sk-", "abcdefghijklmnop"].concat();
        let body = format!("Incorrect API key provided: {key}. Authorization: Bearer {key}");
        let result = redact_and_truncate_text(&body, 400);

        assert!(!result.text.contains(&key));
        assert!(result.text.contains("Bearer [REDACTED]"));
        assert_eq!(
            result.redaction_classes,
            vec!["api_token".to_string(), "bearer_token".to_string()]
        );
    }

    #[test]
    fn keeps_assignment_names_visible() {
        let result = redact_and_truncate_text("api_key = abc123 for floats", 400);
        assert_eq!(result.text, format!("api_key = {REDACTION_TOKEN} for floats"));
    }

    #[test]
    fn truncates_after_redaction() {
        let result = redact_and_truncate_text("temperature near 10N 80E in January 2025", 12);
        assert!(result.truncated);
        assert_eq!(result.text, "temperatu...");
        assert!(result.redaction_classes.is_empty());
    }
}
