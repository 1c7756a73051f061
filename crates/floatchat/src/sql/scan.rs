//! Token-level checks that must hold before a statement is parsed, plus the
//! location of the top-level LIMIT count so it can be rewritten in place.

use sqlparser::dialect::SQLiteDialect;
use sqlparser::tokenizer::{Location, Token, TokenWithSpan, Tokenizer, Whitespace};

use super::{Rejection, RejectionReason};

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "insert",
    "update",
    "delete",
    "create",
    "alter",
    "drop",
    "replace",
    "truncate",
    "attach",
    "detach",
    "pragma",
    "vacuum",
    "reindex",
    "analyze",
    "begin",
    "commit",
    "rollback",
    "savepoint",
    "release",
    "grant",
    "revoke",
    "into",
    "with",
    "load_extension",
    "randomblob",
    "zeroblob",
];

const COMPOUND_KEYWORDS: &[&str] = &["union", "intersect", "except"];

const JOIN_KEYWORDS: &[&str] = &["join", "natural", "cross"];

/// Byte range and text of the top-level LIMIT count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LimitCount {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StatementScan {
    /// Byte offset of the top-level LIMIT keyword, or the statement length.
    pub body_end: usize,
    pub limit: Option<LimitCount>,
}

pub(crate) fn scan_statement(statement: &str) -> Result<StatementScan, Rejection> {
    let dialect = SQLiteDialect {};
    let tokens = Tokenizer::new(&dialect, statement)
        .tokenize_with_location()
        .map_err(|error| {
            Rejection::new(RejectionReason::Malformed, "query could not be tokenized")
                .with_detail(error.to_string())
        })?;

    check_separators(&tokens)?;
    let significant = tokens
        .iter()
        .filter(|token| !matches!(token.token, Token::Whitespace(_) | Token::EOF))
        .collect::<Vec<_>>();
    check_keywords(&significant)?;
    check_leading_select(&significant)?;
    locate_limit(statement, &significant)
}

fn check_separators(tokens: &[TokenWithSpan]) -> Result<(), Rejection> {
    if tokens.iter().any(|token| token.token == Token::SemiColon) {
        return Err(Rejection::new(
            RejectionReason::MultipleStatements,
            "multiple statements are not allowed; submit exactly one SELECT",
        ));
    }

    for (index, token) in tokens.iter().enumerate() {
        match &token.token {
            Token::Whitespace(Whitespace::SingleLineComment { prefix, .. }) => {
                return Err(comment_rejection(prefix));
            }
            Token::Whitespace(Whitespace::MultiLineComment(_)) => {
                return Err(comment_rejection("/*"));
            }
            Token::Placeholder(placeholder) => {
                return Err(bind_rejection(placeholder.clone()));
            }
            Token::Colon | Token::AtSign => {
                if let Some(Token::Word(word)) = tokens.get(index + 1).map(|next| &next.token) {
                    return Err(bind_rejection(format!("{}{}", token.token, word.value)));
                }
            }
            Token::Word(word) if word.quote_style.is_none() && word.value.starts_with('$') => {
                return Err(bind_rejection(word.value.clone()));
            }
            _ => {}
        }
    }
    Ok(())
}

fn comment_rejection(prefix: &str) -> Rejection {
    Rejection::new(
        RejectionReason::CommentSequence,
        "comments are not allowed in generated queries",
    )
    .with_detail(prefix)
}

fn bind_rejection(parameter: String) -> Rejection {
    Rejection::new(
        RejectionReason::BindParameter,
        "bind parameters are not supported; inline literal values",
    )
    .with_detail(parameter)
}

fn check_keywords(tokens: &[&TokenWithSpan]) -> Result<(), Rejection> {
    for token in tokens {
        let Token::Word(word) = &token.token else {
            continue;
        };
        if word.quote_style.is_some() {
            continue;
        }
        let lowered = word.value.to_ascii_lowercase();
        if FORBIDDEN_KEYWORDS.contains(&lowered.as_str()) {
            return Err(Rejection::new(
                RejectionReason::ForbiddenKeyword,
                format!("keyword `{lowered}` is not allowed in a read-only query"),
            )
            .with_detail(lowered));
        }
        if COMPOUND_KEYWORDS.contains(&lowered.as_str()) {
            return Err(Rejection::new(
                RejectionReason::CompoundSelect,
                "compound SELECT statements are not allowed",
            )
            .with_detail(lowered));
        }
        if JOIN_KEYWORDS.contains(&lowered.as_str()) {
            return Err(Rejection::new(
                RejectionReason::JoinNotAllowed,
                "joins are not allowed; query a single table",
            )
            .with_detail(lowered));
        }
    }
    Ok(())
}

fn check_leading_select(tokens: &[&TokenWithSpan]) -> Result<(), Rejection> {
    let Some(leading) = tokens.first() else {
        return Err(Rejection::new(
            RejectionReason::EmptyStatement,
            "query is empty; expected a single SELECT statement",
        ));
    };
    match &leading.token {
        Token::Word(word) if is_bare_word(word, "select") => Ok(()),
        Token::Word(word) => Err(Rejection::new(
            RejectionReason::UnsupportedStatement,
            "only SELECT statements are allowed",
        )
        .with_detail(word.value.to_ascii_lowercase())),
        other => Err(Rejection::new(
            RejectionReason::UnsupportedStatement,
            "only SELECT statements are allowed",
        )
        .with_detail(other.to_string())),
    }
}

fn locate_limit(statement: &str, tokens: &[&TokenWithSpan]) -> Result<StatementScan, Rejection> {
    let mut depth = 0usize;
    let mut limit_index = None;
    for (index, token) in tokens.iter().enumerate() {
        match &token.token {
            Token::LParen => depth += 1,
            Token::RParen => depth = depth.saturating_sub(1),
            Token::Word(word) if depth == 0 && is_bare_word(word, "limit") => {
                if limit_index.is_some() {
                    return Err(Rejection::new(
                        RejectionReason::Malformed,
                        "query has more than one LIMIT clause",
                    ));
                }
                limit_index = Some(index);
            }
            _ => {}
        }
    }

    let Some(limit_index) = limit_index else {
        return Ok(StatementScan {
            body_end: statement.len(),
            limit: None,
        });
    };

    let operands = &tokens[limit_index + 1..];
    let first = limit_operand(operands.first())?;
    let (count, consumed) = match operands.get(1).map(|token| &token.token) {
        Some(Token::Comma) => (limit_operand(operands.get(2))?, 3),
        Some(Token::Word(word)) if is_bare_word(word, "offset") => {
            limit_operand(operands.get(2))?;
            (first, 3)
        }
        _ => (first, 1),
    };
    if let Some(extra) = operands.get(consumed) {
        return Err(Rejection::new(
            RejectionReason::TrailingTokens,
            "nothing may follow the LIMIT clause",
        )
        .with_detail(extra.token.to_string()));
    }

    let offsets = LineOffsets::new(statement);
    let located = offsets
        .byte_offset(tokens[limit_index].span.start)
        .zip(offsets.byte_offset(count.span.start))
        .zip(offsets.byte_offset(count.span.end));
    let Some(((body_end, start), end)) = located else {
        return Err(unlocatable_limit());
    };
    let Token::Number(text, _) = &count.token else {
        return Err(unlocatable_limit());
    };
    if statement.get(start..end) != Some(text.as_str()) {
        return Err(unlocatable_limit());
    }

    Ok(StatementScan {
        body_end,
        limit: Some(LimitCount {
            start,
            end,
            text: text.clone(),
        }),
    })
}

fn limit_operand<'a>(token: Option<&&'a TokenWithSpan>) -> Result<&'a TokenWithSpan, Rejection> {
    let rejection = || {
        Rejection::new(
            RejectionReason::InvalidLimit,
            "LIMIT requires a non-negative integer",
        )
    };
    let Some(token) = token.copied() else {
        return Err(rejection());
    };
    match &token.token {
        Token::Number(text, _) if text.bytes().all(|byte| byte.is_ascii_digit()) => Ok(token),
        Token::Minus => Err(rejection().with_detail("negative value")),
        other => Err(rejection().with_detail(other.to_string())),
    }
}

fn unlocatable_limit() -> Rejection {
    Rejection::new(
        RejectionReason::Malformed,
        "LIMIT count could not be located in the query text",
    )
}

fn is_bare_word(word: &sqlparser::tokenizer::Word, expected: &str) -> bool {
    word.quote_style.is_none() && word.value.eq_ignore_ascii_case(expected)
}

/// Maps tokenizer locations (1-based line and character column) to byte
/// offsets.
struct LineOffsets<'a> {
    text: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> LineOffsets<'a> {
    fn new(text: &'a str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(text.match_indices('\n').map(|(index, _)| index + 1))
            .collect();
        Self { text, line_starts }
    }

    fn byte_offset(&self, location: Location) -> Option<usize> {
        let line = usize::try_from(location.line).ok()?.checked_sub(1)?;
        let column = usize::try_from(location.column).ok()?.checked_sub(1)?;
        let line_start = *self.line_starts.get(line)?;
        let rest = self.text.get(line_start..)?;
        let within = rest
            .char_indices()
            .nth(column)
            .map_or(rest.len(), |(index, _)| index);
        Some(line_start + within)
    }
}

#[cfg(test)]
mod tests {
    use super::{RejectionReason, scan_statement};

    #[test]
    fn locates_top_level_limit_count() {
        let sql = "SELECT * FROM profiles WHERE rowid IN (SELECT rowid FROM profiles LIMIT 5) LIMIT 40";
        let scan = scan_statement(sql).expect("should scan");
        let limit = scan.limit.expect("limit should be found");
        assert_eq!(&sql[limit.start..limit.end], "40");
        assert_eq!(&sql[..scan.body_end], "SELECT * FROM profiles WHERE rowid IN (SELECT rowid FROM profiles LIMIT 5) ");
    }

    #[test]
    fn offsets_survive_multibyte_text_and_newlines() {
        let sql = "SELECT LATITUDE FROM profiles\nWHERE DATA_MODE = 'é°'\nLIMIT 900";
        let scan = scan_statement(sql).expect("should scan");
        let limit = scan.limit.expect("limit should be found");
        assert_eq!(&sql[limit.start..limit.end], "900");
        assert!(sql[..scan.body_end].ends_with("'é°'\n"));
    }

    #[test]
    fn statement_without_limit_scans_to_the_end() {
        let sql = "SELECT LATITUDE FROM profiles";
        let scan = scan_statement(sql).expect("should scan");
        assert_eq!(scan.body_end, sql.len());
        assert!(scan.limit.is_none());
    }

    #[test]
    fn quoted_keywords_are_identifiers() {
        let rejection = scan_statement("SELECT \"drop\" FROM profiles").err();
        assert!(rejection.is_none());

        let rejection = scan_statement("SELECT * FROM profiles WHERE x = :name")
            .expect_err("named parameter");
        assert_eq!(rejection.reason, RejectionReason::BindParameter);
        assert_eq!(rejection.detail.as_deref(), Some(":name"));
    }
}
