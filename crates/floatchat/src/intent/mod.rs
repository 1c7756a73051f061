use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// Deterministic reading of a question, used to steer synthesis, to check
/// the synthesized query, and to route narration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, schemars::JsonSchema)]
pub struct QuestionIntent {
    /// Coordinates or a named place.
    pub spatial: bool,
    /// A month, year, date or relative period.
    pub temporal: bool,
    /// Explicit aggregate wording (average, count, max, ...).
    pub aggregation: bool,
    /// Anything that needs numeric analysis, including trends and comparisons.
    pub statistical: bool,
    pub nearest: bool,
    /// Mentions a measured quantity or profile concept.
    pub domain: bool,
}

impl QuestionIntent {
    #[must_use]
    pub fn analyze(question: &str) -> Self {
        let aggregation = aggregation_regex().is_match(question);
        Self {
            spatial: coordinate_regex().is_match(question) || place_regex().is_match(question),
            temporal: temporal_regex().is_match(question) || mentions_year(question),
            aggregation,
            statistical: aggregation || statistical_regex().is_match(question),
            nearest: nearest_regex().is_match(question),
            domain: domain_regex().is_match(question),
        }
    }

    /// No hint at all about what to select or filter.
    #[must_use]
    pub fn is_ambiguous(&self) -> bool {
        !(self.spatial
            || self.temporal
            || self.aggregation
            || self.statistical
            || self.nearest
            || self.domain)
    }

    #[must_use]
    pub fn hints(&self) -> Vec<&'static str> {
        let mut hints = Vec::new();
        if self.spatial {
            hints.push("spatial");
        }
        if self.temporal {
            hints.push("temporal");
        }
        if self.aggregation {
            hints.push("aggregation");
        }
        if self.nearest {
            hints.push("nearest");
        }
        hints
    }
}

fn coordinate_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"(?i)\b\d{1,3}(?:\.\d+)?\s*°?\s*(?:[nsew]|north|south|east|west)\b|\b(?:lat|lon|latitude|longitude)\s*[=:]?\s*-?\d",
        )
        .expect("valid coordinate regex")
    })
}

fn place_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:near|around|latitude|longitude|bay|sea|gulf|coast|equator|region|off\s+the)\b",
        )
        .expect("valid place regex")
    })
}

fn temporal_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:january|february|febuary|march|april|june|july|august|september|october|november|december|jan|feb|mar|apr|jun|jul|aug|sep|sept|oct|nov|dec)\b|\bmay\s+\d{4}\b|\b\d{4}-\d{2}(?:-\d{2})?\b|\b(?:today|yesterday|recent|recently|since|last\s+(?:week|month|year)|this\s+(?:week|month|year))\b",
        )
        .expect("valid temporal regex")
    })
}

/// A bare four-digit number is a year only after a period preposition, and
/// never when a depth or distance unit follows (`2000 dbar`).
fn mentions_year(question: &str) -> bool {
    year_regex()
        .captures_iter(question)
        .any(|captures| captures.name("unit").is_none())
}

fn year_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:in|during|since|from|before|after|until|through|of|between|and|to)\s+(?:the\s+)?(?:19|20)\d{2}s?\b(?P<unit>\s*(?:dbar|db|decibars?|m|meters?|metres?|km)\b)?",
        )
        .expect("valid year regex")
    })
}

fn aggregation_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:avg|average|mean|max|maximum|min|minimum|count|how\s+many|number\s+of|sum|total|highest|lowest|median)\b",
        )
        .expect("valid aggregation regex")
    })
}

fn statistical_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:trend|trends|compare|compared|comparison|variance|std|statistics?)\b",
        )
        .expect("valid statistical regex")
    })
}

fn nearest_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(?i)\b(?:nearest|closest)\b").expect("valid nearest regex"))
}

fn domain_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:temperatures?|temp|salinity|psal|pressure|pres|depth|floats?|profiles?|platforms?|cycles?|qc|quality|argo|levels?|data\s+mode|measurements?|wmo)\b",
        )
        .expect("valid domain regex")
    })
}

#[cfg(test)]
mod tests {
    use super::QuestionIntent;

    #[test]
    fn reads_spatial_temporal_and_aggregate_hints() {
        let intent = QuestionIntent::analyze("average temperature near 10N 80E in January 2025");
        assert!(intent.spatial);
        assert!(intent.temporal);
        assert!(intent.aggregation);
        assert!(intent.statistical);
        assert!(!intent.nearest);
        assert!(intent.domain);
        assert_eq!(intent.hints(), vec!["spatial", "temporal", "aggregation"]);
    }

    #[test]
    fn trend_is_statistical_but_not_an_aggregate() {
        let intent = QuestionIntent::analyze("show the salinity trend over the last year");
        assert!(intent.statistical);
        assert!(!intent.aggregation);
        assert!(intent.temporal);
    }

    #[test]
    fn spelled_out_coordinates_count_as_spatial() {
        let intent =
            QuestionIntent::analyze("Show me salinity profiles from floats near 80 east and 90 east");
        assert!(intent.spatial);
        assert!(!intent.temporal);
    }

    #[test]
    fn may_needs_a_year_to_be_a_month() {
        assert!(!QuestionIntent::analyze("may I see some floats").temporal);
        assert!(QuestionIntent::analyze("floats in May 2024").temporal);
    }

    #[test]
    fn depths_are_not_years() {
        assert!(!QuestionIntent::analyze("floats deeper than 2000 dbar").temporal);
        assert!(!QuestionIntent::analyze("temperature from 1000 to 2000 m").temporal);
        assert!(!QuestionIntent::analyze("salinity between 1500 and 2000 meters").temporal);
        assert!(!QuestionIntent::analyze("show 2000 profiles").temporal);

        assert!(QuestionIntent::analyze("floats in 2023").temporal);
        assert!(QuestionIntent::analyze("profiles between 1998 and 2003").temporal);
        assert!(QuestionIntent::analyze("salinity since 2019 at 2000 dbar").temporal);
    }

    #[test]
    fn question_without_hints_is_ambiguous() {
        assert!(QuestionIntent::analyze("tell me something interesting").is_ambiguous());
        assert!(!QuestionIntent::analyze("list some floats").is_ambiguous());
    }
}
