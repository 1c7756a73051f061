use std::sync::Once;

use tracing_subscriber::EnvFilter;

use crate::utils::redaction::redact_and_truncate_text;

pub const LOG_ENV_VAR: &str = "FLOATCHAT_LOG";
pub const DEFAULT_DIRECTIVE: &str = "floatchat=info";
pub const LOGGED_TEXT_MAX_CHARS: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

static INIT_ONCE: Once = Once::new();

/// Installs the global subscriber once. Logs go to stderr; stdout carries
/// only the command envelope.
pub fn init(format: LogFormat) {
    INIT_ONCE.call_once(|| {
        let filter = env_filter();
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false);
        // A subscriber installed by a test harness stays in place.
        let _ = match format {
            LogFormat::Human => builder.try_init(),
            LogFormat::Json => builder.json().try_init(),
        };
    });
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Redacted, length-bounded copy of user or model text for log fields.
#[must_use]
pub fn loggable(text: &str) -> String {
    redact_and_truncate_text(text, LOGGED_TEXT_MAX_CHARS).text
}

#[cfg(test)]
mod tests {
    use super::{LOGGED_TEXT_MAX_CHARS, LogFormat, init, loggable};

    #[test]
    fn init_is_idempotent() {
        init(LogFormat::Human);
        init(LogFormat::Json);
    }

    #[test]
    fn loggable_text_is_bounded_and_redacted() {
        let long = "salinity ".repeat(100);
        assert_eq!(loggable(&long).chars().count(), LOGGED_TEXT_MAX_CHARS);
        assert!(!loggable("contact me at someone@example.com").contains("someone@example.com"));
    }
}
