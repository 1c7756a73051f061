use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;

use sqlparser::ast::{BinaryOperator, Expr, OrderByKind, Query, SelectItem, Visit, Visitor};

use super::tree::{parse_query, top_level_select};
use super::{Rejection, RejectionReason, ValidatedQuery};
use crate::intent::QuestionIntent;
use crate::schema::{ColumnMeaning, SchemaDescriptor};

const AGGREGATE_FUNCTIONS: &[&str] = &["avg", "min", "max", "count", "sum", "total", "group_concat"];

/// Where descriptor columns and aggregates appear in the top level of a
/// validated statement. Subqueries do not contribute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryShape {
    pub projected_columns: BTreeSet<String>,
    pub filtered_columns: BTreeSet<String>,
    /// Filtered columns that sit inside a comparison or BETWEEN.
    pub range_filtered_columns: BTreeSet<String>,
    pub ordered_columns: BTreeSet<String>,
    pub aggregates: BTreeSet<String>,
}

impl QueryShape {
    #[must_use]
    pub fn analyze(query: &ValidatedQuery, descriptor: &SchemaDescriptor) -> Self {
        let mut shape = Self::default();
        // Validated text always parses.
        let Ok(parsed) = parse_query(query.body()) else {
            return shape;
        };
        let Ok(select) = top_level_select(&parsed) else {
            return shape;
        };

        let mut aliased = BTreeMap::new();
        for item in &select.projection {
            let expr = match item {
                SelectItem::UnnamedExpr(expr) => expr,
                SelectItem::ExprWithAlias { expr, alias } => {
                    aliased.insert(alias.value.to_ascii_lowercase(), expr);
                    expr
                }
                _ => continue,
            };
            let found = ClauseColumns::collect(expr, descriptor);
            shape.projected_columns.extend(found.columns);
            shape.aggregates.extend(found.aggregates);
        }

        for expr in select.selection.iter().chain(select.having.iter()) {
            let found = ClauseColumns::collect(expr, descriptor);
            shape.filtered_columns.extend(found.columns);
            shape.range_filtered_columns.extend(found.ranged);
            shape.aggregates.extend(found.aggregates);
        }

        if let Some(OrderByKind::Expressions(terms)) =
            parsed.order_by.as_ref().map(|order_by| &order_by.kind)
        {
            for term in terms {
                let expr = match &term.expr {
                    Expr::Identifier(ident) => aliased
                        .get(&ident.value.to_ascii_lowercase())
                        .copied()
                        .unwrap_or(&term.expr),
                    other => other,
                };
                let found = ClauseColumns::collect(expr, descriptor);
                shape.ordered_columns.extend(found.columns);
            }
        }

        shape
    }
}

/// Descriptor columns and aggregate calls in one expression, ignoring
/// anything inside a subquery.
struct ClauseColumns<'a> {
    descriptor: &'a SchemaDescriptor,
    columns: BTreeSet<String>,
    ranged: BTreeSet<String>,
    aggregates: BTreeSet<String>,
    query_depth: usize,
    range_depth: usize,
}

impl<'a> ClauseColumns<'a> {
    fn collect(expr: &Expr, descriptor: &'a SchemaDescriptor) -> Self {
        let mut found = Self {
            descriptor,
            columns: BTreeSet::new(),
            ranged: BTreeSet::new(),
            aggregates: BTreeSet::new(),
            query_depth: 0,
            range_depth: 0,
        };
        let _ = expr.visit(&mut found);
        found
    }

    fn record(&mut self, name: &str) {
        let Some(column) = self.descriptor.column(name) else {
            return;
        };
        if self.range_depth > 0 {
            self.ranged.insert(column.name.clone());
        }
        self.columns.insert(column.name.clone());
    }
}

fn is_range_condition(expr: &Expr) -> bool {
    match expr {
        Expr::Between { .. } => true,
        Expr::BinaryOp { op, .. } => matches!(
            op,
            BinaryOperator::Gt
                | BinaryOperator::Lt
                | BinaryOperator::GtEq
                | BinaryOperator::LtEq
                | BinaryOperator::Eq
        ),
        _ => false,
    }
}

impl Visitor for ClauseColumns<'_> {
    type Break = ();

    fn pre_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.query_depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.query_depth = self.query_depth.saturating_sub(1);
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if self.query_depth > 0 {
            return ControlFlow::Continue(());
        }
        if is_range_condition(expr) {
            self.range_depth += 1;
        }
        match expr {
            Expr::Identifier(ident) => self.record(&ident.value),
            Expr::CompoundIdentifier(parts) => {
                if let Some(last) = parts.last() {
                    self.record(&last.value);
                }
            }
            Expr::Function(function) => {
                let name = function.name.to_string().to_ascii_lowercase();
                if AGGREGATE_FUNCTIONS.contains(&name.as_str()) {
                    self.aggregates.insert(name);
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn post_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if self.query_depth == 0 && is_range_condition(expr) {
            self.range_depth = self.range_depth.saturating_sub(1);
        }
        ControlFlow::Continue(())
    }
}

/// Checks that a validated statement honours what the question implies:
/// coordinates need latitude/longitude ranges, dates need a date condition,
/// aggregate wording needs an aggregate, "nearest" needs a distance ordering.
/// Checks whose column is missing from the descriptor are skipped.
pub fn check_intent_coverage(
    query: &ValidatedQuery,
    intent: &QuestionIntent,
    descriptor: &SchemaDescriptor,
) -> Result<(), Rejection> {
    let shape = QueryShape::analyze(query, descriptor);
    let latitude = column_name(descriptor, ColumnMeaning::Latitude);
    let longitude = column_name(descriptor, ColumnMeaning::Longitude);

    if intent.nearest {
        let ordered_by_position = [latitude.as_deref(), longitude.as_deref()]
            .into_iter()
            .flatten()
            .any(|name| shape.ordered_columns.contains(name));
        if (latitude.is_some() || longitude.is_some()) && !ordered_by_position {
            return Err(Rejection::new(
                RejectionReason::MissingNearestOrdering,
                "nearest-float questions must ORDER BY a latitude/longitude distance proxy",
            ));
        }
    } else if intent.spatial {
        for name in [latitude.as_deref(), longitude.as_deref()]
            .into_iter()
            .flatten()
        {
            if !shape.range_filtered_columns.contains(name) {
                return Err(Rejection::new(
                    RejectionReason::MissingSpatialFilter,
                    format!("the question names a location; add a numeric range condition on {name}"),
                )
                .with_detail(name));
            }
        }
    }

    if intent.temporal {
        if let Some(name) = column_name(descriptor, ColumnMeaning::ProfileDate) {
            if !shape.filtered_columns.contains(&name) {
                return Err(Rejection::new(
                    RejectionReason::MissingTemporalFilter,
                    format!("the question names a time period; add a condition on {name}"),
                )
                .with_detail(name));
            }
        }
    }

    if intent.aggregation && shape.aggregates.is_empty() {
        return Err(Rejection::new(
            RejectionReason::MissingAggregate,
            "the question asks for an aggregate; use AVG, MIN, MAX, COUNT or SUM",
        ));
    }

    Ok(())
}

fn column_name(descriptor: &SchemaDescriptor, meaning: ColumnMeaning) -> Option<String> {
    descriptor
        .column_with_meaning(meaning)
        .map(|column| column.name.clone())
}
