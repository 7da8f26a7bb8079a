//! Route selection: which vindex constraint in a WHERE clause decides the
//! shards a single-table statement goes to.

use std::sync::Arc;

use crate::sql::ast::{BinaryOp, Expr};
use crate::vindex::Vindex;
use crate::vschema::{Keyspace, Table};

/// Placeholder for the per-shard subset of an IN-routed value list.
pub const ROUTE_LIST_ARG: &str = "__route_values";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RouteOpcode {
    /// The keyspace has exactly one shard.
    Unsharded,
    /// Every column of a unique vindex is pinned to a value.
    EqualUnique,
    /// Equality on a non-unique vindex.
    Equal,
    /// A vindex column is constrained to a value list.
    In,
    Scatter,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RouteValues {
    None,
    /// One value per vindex column.
    Equal(Vec<Expr>),
    /// Candidate values of a single-column vindex.
    In(Vec<Expr>),
}

#[derive(Clone, Debug)]
pub struct Route {
    pub keyspace: Arc<Keyspace>,
    pub opcode: RouteOpcode,
    pub vindex: Option<Arc<Vindex>>,
    pub values: RouteValues,
}

impl Route {
    pub fn unsharded(keyspace: Arc<Keyspace>) -> Self {
        Self {
            keyspace,
            opcode: RouteOpcode::Unsharded,
            vindex: None,
            values: RouteValues::None,
        }
    }

    pub fn scatter(keyspace: Arc<Keyspace>) -> Self {
        Self {
            keyspace,
            opcode: RouteOpcode::Scatter,
            vindex: None,
            values: RouteValues::None,
        }
    }

    /// True when the route can never reach more than one shard.
    pub fn is_single_shard(&self) -> bool {
        matches!(self.opcode, RouteOpcode::Unsharded | RouteOpcode::EqualUnique)
    }
}

/// True when `expr` names `column` of the table known as `reference`.
pub(crate) fn is_column_of(expr: &Expr, column: &str, reference: &str, table: &str) -> bool {
    let Some(col) = expr.as_column() else {
        return false;
    };
    col.name.eq_ignore_ascii_case(column)
        && col.table.as_deref().map_or(true, |t| {
            t.eq_ignore_ascii_case(reference) || t.eq_ignore_ascii_case(table)
        })
}

fn equality_value<'a>(conjunct: &'a Expr, column: &str, reference: &str, table: &str) -> Option<&'a Expr> {
    let Expr::Binary {
        left,
        op: BinaryOp::Eq,
        right,
    } = conjunct
    else {
        return None;
    };
    if is_column_of(left, column, reference, table) && right.is_value() {
        Some(right)
    } else if is_column_of(right, column, reference, table) && left.is_value() {
        Some(left)
    } else {
        None
    }
}

fn in_values<'a>(conjunct: &'a Expr, column: &str, reference: &str, table: &str) -> Option<&'a [Expr]> {
    match conjunct {
        Expr::InList {
            expr,
            list,
            negated: false,
        } if is_column_of(expr, column, reference, table) && list.iter().all(Expr::is_value) => {
            Some(list)
        }
        _ => None,
    }
}

/// Chooses the cheapest route the WHERE clause allows. An IN-routed value
/// list is replaced in `selection` by the `ROUTE_LIST_ARG` placeholder.
pub(crate) fn route_for(
    table: &Table,
    keyspace: Arc<Keyspace>,
    reference: &str,
    selection: Option<&mut Expr>,
) -> Route {
    if !keyspace.sharded {
        return Route::unsharded(keyspace);
    }
    let Some(selection) = selection else {
        return Route::scatter(keyspace);
    };

    let mut best: Option<(RouteOpcode, u32, Arc<Vindex>, RouteValues)> = None;
    {
        let conjuncts = selection.conjuncts();
        for binding in &table.column_vindexes {
            let vindex = &binding.vindex;
            let candidate = if binding.columns.len() == 1 {
                let column = &binding.columns[0];
                let equal = conjuncts
                    .iter()
                    .find_map(|c| equality_value(c, column, reference, &table.name));
                match equal {
                    Some(value) => Some(RouteValues::Equal(vec![value.clone()])),
                    None => conjuncts
                        .iter()
                        .find_map(|c| in_values(c, column, reference, &table.name))
                        .map(|list| RouteValues::In(list.to_vec())),
                }
            } else {
                let values: Option<Vec<Expr>> = binding
                    .columns
                    .iter()
                    .map(|column| {
                        conjuncts
                            .iter()
                            .find_map(|c| equality_value(c, column, reference, &table.name))
                            .cloned()
                    })
                    .collect();
                values.map(RouteValues::Equal)
            };
            let Some(values) = candidate else {
                continue;
            };
            let opcode = match (&values, vindex.is_unique()) {
                (RouteValues::In(_), _) => RouteOpcode::In,
                (_, true) => RouteOpcode::EqualUnique,
                (_, false) => RouteOpcode::Equal,
            };
            let better = best
                .as_ref()
                .map_or(true, |(op, cost, _, _)| (opcode, vindex.cost()) < (*op, *cost));
            if better {
                best = Some((opcode, vindex.cost(), vindex.clone(), values));
            }
        }
    }

    let Some((opcode, _, vindex, values)) = best else {
        return Route::scatter(keyspace);
    };
    if let RouteValues::In(list) = &values {
        let column = vindex_column(table, &vindex);
        let target = list.clone();
        selection.substitute(&mut |expr| match expr {
            Expr::InList {
                expr: inner,
                list,
                negated: false,
            } if *list == target && is_column_of(inner, &column, reference, &table.name) => {
                Some(Expr::InList {
                    expr: inner.clone(),
                    list: vec![Expr::ListArg(ROUTE_LIST_ARG.to_string())],
                    negated: false,
                })
            }
            _ => None,
        });
    }
    Route {
        keyspace,
        opcode,
        vindex: Some(vindex),
        values,
    }
}

fn vindex_column(table: &Table, vindex: &Arc<Vindex>) -> String {
    table
        .column_vindexes
        .iter()
        .find(|b| Arc::ptr_eq(&b.vindex, vindex))
        .and_then(|b| b.columns.first().cloned())
        .unwrap_or_default()
}

/// Replaces the route placeholder with a concrete value list.
pub fn bind_route_values(selection: &mut Option<Expr>, values: &[Expr]) {
    let Some(selection) = selection.as_mut() else {
        return;
    };
    selection.substitute(&mut |expr| match expr {
        Expr::InList {
            expr: inner,
            list,
            negated,
        } if matches!(list.as_slice(), [Expr::ListArg(name)] if name == ROUTE_LIST_ARG) => {
            Some(Expr::InList {
                expr: inner.clone(),
                list: values.to_vec(),
                negated: *negated,
            })
        }
        _ => None,
    });
}
