//! Parsed-statement checks: one plain SELECT over the configured table, and
//! every column reference resolving to a described column.

use std::collections::BTreeSet;
use std::ops::ControlFlow;

use sqlparser::ast::{
    Expr, Ident, ObjectName, ObjectNamePart, Query, Select, SelectItem, SetExpr, Statement,
    TableFactor, Visit, Visitor,
};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;

use super::{Rejection, RejectionReason};
use crate::schema::SchemaDescriptor;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TreeSummary {
    /// The top-level projection contains `*` or `table.*`.
    pub wildcard: bool,
}

pub(crate) fn parse_query(body: &str) -> Result<Box<Query>, Rejection> {
    let mut statements = Parser::parse_sql(&SQLiteDialect {}, body).map_err(|error| {
        Rejection::new(RejectionReason::Malformed, "query could not be parsed")
            .with_detail(error.to_string())
    })?;
    if statements.len() != 1 {
        return Err(Rejection::new(
            RejectionReason::MultipleStatements,
            "multiple statements are not allowed; submit exactly one SELECT",
        ));
    }
    match statements.pop() {
        Some(Statement::Query(query)) => Ok(query),
        _ => Err(Rejection::new(
            RejectionReason::UnsupportedStatement,
            "only SELECT statements are allowed",
        )),
    }
}

pub(crate) fn top_level_select(query: &Query) -> Result<&Select, Rejection> {
    match query.body.as_ref() {
        SetExpr::Select(select) => Ok(select.as_ref()),
        SetExpr::SetOperation { .. } => Err(compound_rejection()),
        _ => Err(Rejection::new(
            RejectionReason::UnsupportedStatement,
            "only a plain SELECT ... FROM statement is allowed",
        )),
    }
}

pub(crate) fn check_tree(
    query: &Query,
    descriptor: &SchemaDescriptor,
) -> Result<TreeSummary, Rejection> {
    let select = top_level_select(query)?;
    if select.from.is_empty() {
        return Err(Rejection::new(
            RejectionReason::Malformed,
            format!("query must select FROM `{}`", descriptor.table),
        ));
    }

    let mut sources = SourceCheck {
        descriptor,
        qualifiers: BTreeSet::from([descriptor.table.to_ascii_lowercase()]),
    };
    into_result(query.visit(&mut sources))?;

    // Output aliases are only honoured as whole ORDER BY terms; anywhere else
    // SQLite resolves a bare name against the table first.
    let mut unordered = query.clone();
    unordered.order_by = None;
    let mut columns = ColumnCheck::new(descriptor, &sources.qualifiers, None);
    into_result(unordered.visit(&mut columns))?;

    let aliases = output_aliases(select);
    let mut ordering = ColumnCheck::new(descriptor, &sources.qualifiers, Some(&aliases));
    into_result(query.order_by.visit(&mut ordering))?;

    Ok(TreeSummary {
        wildcard: select.projection.iter().any(|item| {
            matches!(
                item,
                SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..)
            )
        }),
    })
}

/// Lower-cased names introduced with `expr AS name` or `expr name`.
pub(crate) fn output_aliases(select: &Select) -> BTreeSet<String> {
    select
        .projection
        .iter()
        .filter_map(|item| match item {
            SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.to_ascii_lowercase()),
            _ => None,
        })
        .collect()
}

fn into_result(flow: ControlFlow<Rejection>) -> Result<(), Rejection> {
    match flow {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(rejection) => Err(rejection),
    }
}

fn compound_rejection() -> Rejection {
    Rejection::new(
        RejectionReason::CompoundSelect,
        "compound SELECT statements are not allowed",
    )
}

fn join_rejection() -> Rejection {
    Rejection::new(
        RejectionReason::JoinNotAllowed,
        "joins are not allowed; query a single table",
    )
}

fn name_parts(name: &ObjectName) -> Vec<&Ident> {
    name.0
        .iter()
        .filter_map(|part| match part {
            ObjectNamePart::Identifier(ident) => Some(ident),
            _ => None,
        })
        .collect()
}

/// Every query body (subqueries included) reads from the configured table
/// alone, without joins.
struct SourceCheck<'a> {
    descriptor: &'a SchemaDescriptor,
    qualifiers: BTreeSet<String>,
}

impl Visitor for SourceCheck<'_> {
    type Break = Rejection;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if query.with.is_some() {
            return ControlFlow::Break(
                Rejection::new(
                    RejectionReason::ForbiddenKeyword,
                    "common table expressions are not allowed",
                )
                .with_detail("with"),
            );
        }
        match query.body.as_ref() {
            SetExpr::Select(select) => {
                let joined = select.from.len() > 1
                    || select.from.iter().any(|source| !source.joins.is_empty());
                if joined {
                    return ControlFlow::Break(join_rejection());
                }
                ControlFlow::Continue(())
            }
            SetExpr::SetOperation { .. } => ControlFlow::Break(compound_rejection()),
            _ => ControlFlow::Break(Rejection::new(
                RejectionReason::UnsupportedStatement,
                "subqueries must be plain SELECT statements",
            )),
        }
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<Self::Break> {
        let table = &self.descriptor.table;
        let TableFactor::Table {
            name, alias, args, ..
        } = table_factor
        else {
            return ControlFlow::Break(
                Rejection::new(
                    RejectionReason::UnknownTable,
                    format!("FROM must name `{table}` directly"),
                )
                .with_detail(table_factor.to_string()),
            );
        };

        let parts = name_parts(name);
        if name.0.len() > 1 {
            return ControlFlow::Break(
                Rejection::new(
                    RejectionReason::QualifiedTable,
                    format!("schema-qualified table names are not allowed; use `{table}`"),
                )
                .with_detail(name.to_string()),
            );
        }
        let Some(ident) = parts.first().filter(|ident| self.descriptor.is_table(&ident.value))
        else {
            return ControlFlow::Break(
                Rejection::new(
                    RejectionReason::UnknownTable,
                    format!("table `{name}` is not queryable; only `{table}` is allowed"),
                )
                .with_detail(name.to_string()),
            );
        };
        if args.is_some() {
            return ControlFlow::Break(
                Rejection::new(
                    RejectionReason::UnknownTable,
                    "table-valued functions are not queryable",
                )
                .with_detail(ident.value.clone()),
            );
        }

        if let Some(alias) = alias {
            self.qualifiers.insert(alias.name.value.to_ascii_lowercase());
        }
        ControlFlow::Continue(())
    }
}

struct ColumnCheck<'a> {
    descriptor: &'a SchemaDescriptor,
    qualifiers: &'a BTreeSet<String>,
    output_aliases: Option<&'a BTreeSet<String>>,
    query_depth: usize,
    expr_depth: usize,
}

impl<'a> ColumnCheck<'a> {
    fn new(
        descriptor: &'a SchemaDescriptor,
        qualifiers: &'a BTreeSet<String>,
        output_aliases: Option<&'a BTreeSet<String>>,
    ) -> Self {
        Self {
            descriptor,
            qualifiers,
            output_aliases,
            query_depth: 0,
            expr_depth: 0,
        }
    }

    fn is_output_alias(&self, ident: &Ident) -> bool {
        self.output_aliases
            .is_some_and(|aliases| aliases.contains(&ident.value.to_ascii_lowercase()))
    }

    fn check_column(&self, ident: &Ident) -> Result<(), Rejection> {
        if self.descriptor.has_column(&ident.value) {
            return Ok(());
        }
        let mut message = format!(
            "column `{}` is not part of `{}`",
            ident.value, self.descriptor.table
        );
        if ident.quote_style == Some('"') {
            message.push_str("; use single quotes for string literals");
        }
        Err(Rejection::new(RejectionReason::UnknownColumn, message)
            .with_detail(ident.value.clone()))
    }

    fn check_qualified(&self, parts: &[Ident]) -> Result<(), Rejection> {
        let [qualifier, column] = parts else {
            let joined = parts
                .iter()
                .map(|part| part.value.as_str())
                .collect::<Vec<_>>()
                .join(".");
            return Err(Rejection::new(
                RejectionReason::QualifiedTable,
                format!(
                    "schema-qualified column references are not allowed; use `{}`",
                    self.descriptor.table
                ),
            )
            .with_detail(joined));
        };
        if !self
            .qualifiers
            .contains(&qualifier.value.to_ascii_lowercase())
        {
            return Err(Rejection::new(
                RejectionReason::UnknownTable,
                format!(
                    "qualifier `{}` does not refer to `{}`",
                    qualifier.value, self.descriptor.table
                ),
            )
            .with_detail(qualifier.value.clone()));
        }
        self.check_column(column)
    }
}

impl Visitor for ColumnCheck<'_> {
    type Break = Rejection;

    fn pre_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.query_depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.query_depth = self.query_depth.saturating_sub(1);
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        let term_root = self.query_depth == 0 && self.expr_depth == 0;
        self.expr_depth += 1;
        let outcome = match expr {
            Expr::Identifier(ident) if term_root && self.is_output_alias(ident) => Ok(()),
            Expr::Identifier(ident) => self.check_column(ident),
            Expr::CompoundIdentifier(parts) => self.check_qualified(parts),
            _ => Ok(()),
        };
        match outcome {
            Ok(()) => ControlFlow::Continue(()),
            Err(rejection) => ControlFlow::Break(rejection),
        }
    }

    fn post_visit_expr(&mut self, _expr: &Expr) -> ControlFlow<Self::Break> {
        self.expr_depth = self.expr_depth.saturating_sub(1);
        ControlFlow::Continue(())
    }
}
