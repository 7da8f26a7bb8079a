//! Evaluation of a whole SELECT over materialized rows.
//!
//! Covers filtering, grouping with aggregates, HAVING, projection, DISTINCT,
//! ORDER BY and LIMIT/OFFSET. The FROM clause is ignored: callers hand in
//! rows already laid out by a `Scope` (one table, or a router-side join).

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::aggregate::{Accumulator, AggregateKind};
use super::ast::{ColumnRef, Expr, OrderBy, Select, SelectItem};
use super::eval::{eval, eval_const, EvalError, EvalResult, RowContext, Scope, ScopedRow};
use crate::value::{BindVars, CollatedKey, Field, FieldType, QueryResult, Row, Value};

enum Projected {
    Column(usize),
    Expr(Expr),
}

struct OutputColumn {
    name: String,
    alias: Option<String>,
    source: Projected,
}

/// Falls back to projection aliases when a name is not an input column.
struct AliasContext<'a> {
    inner: &'a dyn RowContext,
    outputs: &'a [OutputColumn],
    binds: &'a BindVars,
}

impl RowContext for AliasContext<'_> {
    fn column(&self, column: &ColumnRef) -> EvalResult<Value> {
        match self.inner.column(column) {
            Err(EvalError::UnknownColumn(missing)) if column.table.is_none() => {
                let alias = self.outputs.iter().find(|o| {
                    o.alias
                        .as_deref()
                        .is_some_and(|a| a.eq_ignore_ascii_case(&column.name))
                });
                match alias {
                    Some(OutputColumn {
                        source: Projected::Expr(expr),
                        ..
                    }) => eval(expr, self.inner, self.binds),
                    _ => Err(EvalError::UnknownColumn(missing)),
                }
            }
            other => other,
        }
    }

    fn value_at(&self, idx: usize) -> Option<Value> {
        self.inner.value_at(idx)
    }

    fn precomputed(&self, expr: &Expr) -> Option<Value> {
        self.inner.precomputed(expr)
    }
}

/// One group: its first row stands in for bare columns.
struct GroupContext<'a> {
    scope: &'a Scope,
    first: Option<&'a Row>,
    aggregates: &'a HashMap<String, Value>,
}

impl RowContext for GroupContext<'_> {
    fn column(&self, column: &ColumnRef) -> EvalResult<Value> {
        let idx = self.scope.resolve(column)?;
        Ok(self
            .first
            .and_then(|row| row.get(idx).cloned())
            .unwrap_or(Value::Null))
    }

    fn value_at(&self, idx: usize) -> Option<Value> {
        self.first.and_then(|row| row.get(idx).cloned())
    }

    fn precomputed(&self, expr: &Expr) -> Option<Value> {
        if expr.is_aggregate() {
            self.aggregates.get(&expr.to_string()).cloned()
        } else {
            None
        }
    }
}

/// Evaluates `select` over `rows`. `types` gives the declared type of each
/// scope column and is used for result field typing.
pub fn evaluate_select(
    select: &Select,
    scope: &Scope,
    types: &[FieldType],
    rows: Vec<Row>,
    binds: &BindVars,
) -> EvalResult<QueryResult> {
    let outputs = expand_projection(&select.projection, scope)?;

    let mut filtered = Vec::with_capacity(rows.len());
    for row in rows {
        let keep = match &select.selection {
            Some(predicate) => {
                let ctx = ScopedRow { scope, row: &row };
                eval(predicate, &ctx, binds)?.is_truthy()
            }
            None => true,
        };
        if keep {
            filtered.push(row);
        }
    }

    let aggregates = collect_aggregates(select, &outputs);
    let grouped = !select.group_by.is_empty() || !aggregates.is_empty();

    // (output row, sort keys)
    let mut produced: Vec<(Row, Vec<Value>)> = Vec::new();
    if grouped {
        let mut groups: BTreeMap<CollatedKey, Vec<Row>> = BTreeMap::new();
        for row in filtered {
            let ctx = ScopedRow { scope, row: &row };
            let alias_ctx = AliasContext {
                inner: &ctx,
                outputs: &outputs,
                binds,
            };
            let mut key = Vec::with_capacity(select.group_by.len());
            for expr in &select.group_by {
                key.push(eval(&group_expr(expr, &outputs), &alias_ctx, binds)?);
            }
            groups.entry(CollatedKey(key)).or_default().push(row);
        }
        if groups.is_empty() && select.group_by.is_empty() {
            groups.insert(CollatedKey(Vec::new()), Vec::new());
        }
        for rows in groups.values() {
            let values = compute_aggregates(&aggregates, scope, rows, binds)?;
            let ctx = GroupContext {
                scope,
                first: rows.first(),
                aggregates: &values,
            };
            let alias_ctx = AliasContext {
                inner: &ctx,
                outputs: &outputs,
                binds,
            };
            if let Some(having) = &select.having {
                if !eval(having, &alias_ctx, binds)?.is_truthy() {
                    continue;
                }
            }
            produced.push(project(&outputs, &select.order_by, &ctx, &alias_ctx, binds)?);
        }
    } else {
        if select.having.is_some() {
            return Err(EvalError::Unsupported("HAVING without grouping".to_string()));
        }
        for row in &filtered {
            let ctx = ScopedRow { scope, row };
            let alias_ctx = AliasContext {
                inner: &ctx,
                outputs: &outputs,
                binds,
            };
            produced.push(project(&outputs, &select.order_by, &ctx, &alias_ctx, binds)?);
        }
    }

    if select.distinct {
        let mut seen = BTreeSet::new();
        produced.retain(|(row, _)| seen.insert(CollatedKey(row.clone())));
    }
    if !select.order_by.is_empty() {
        produced.sort_by(|(_, a), (_, b)| compare_keys(a, b, &select.order_by));
    }

    let offset = window_bound(select.offset.as_ref(), binds)?.unwrap_or(0);
    let limit = window_bound(select.limit.as_ref(), binds)?;
    let rows: Vec<Row> = produced
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .map(|(row, _)| row)
        .collect();

    let fields = outputs
        .iter()
        .enumerate()
        .map(|(idx, output)| {
            let field_type = match output.source {
                Projected::Column(col) => types.get(col).copied().unwrap_or(FieldType::VarChar),
                Projected::Expr(Expr::Column(ref column)) => scope
                    .resolve(column)
                    .ok()
                    .and_then(|col| types.get(col).copied())
                    .unwrap_or(FieldType::VarChar),
                Projected::Expr(ref expr) => infer_type(expr, &rows, idx),
            };
            Field::new(output.name.clone(), field_type)
        })
        .collect();

    Ok(QueryResult {
        fields,
        rows,
        rows_affected: 0,
        insert_id: 0,
    })
}

fn expand_projection(items: &[SelectItem], scope: &Scope) -> EvalResult<Vec<OutputColumn>> {
    let mut outputs = Vec::new();
    for item in items {
        match item {
            SelectItem::Wildcard(table) => {
                for idx in scope.wildcard(table.as_deref())? {
                    outputs.push(OutputColumn {
                        name: scope.columns[idx].name.clone(),
                        alias: None,
                        source: Projected::Column(idx),
                    });
                }
            }
            SelectItem::Expr { expr, alias } => {
                let name = alias.clone().unwrap_or_else(|| expr.output_name());
                outputs.push(OutputColumn {
                    name,
                    alias: alias.clone(),
                    source: Projected::Expr(expr.clone()),
                });
            }
        }
    }
    Ok(outputs)
}

/// `GROUP BY 2` refers to the second projected expression.
fn group_expr(expr: &Expr, outputs: &[OutputColumn]) -> Expr {
    if let Expr::Literal(Value::Int(n)) = expr {
        if let Some(OutputColumn {
            source: Projected::Expr(target),
            ..
        }) = usize::try_from(*n).ok().and_then(|n| n.checked_sub(1)).and_then(|i| outputs.get(i))
        {
            return target.clone();
        }
    }
    expr.clone()
}

fn collect_aggregates(select: &Select, outputs: &[OutputColumn]) -> Vec<Expr> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    let mut visit = |expr: &Expr| {
        expr.walk(&mut |node| {
            if node.is_aggregate() && seen.insert(node.to_string()) {
                out.push(node.clone());
            }
        });
    };
    for output in outputs {
        if let Projected::Expr(expr) = &output.source {
            visit(expr);
        }
    }
    if let Some(having) = &select.having {
        visit(having);
    }
    for order in &select.order_by {
        visit(&order.expr);
    }
    out
}

fn compute_aggregates(
    aggregates: &[Expr],
    scope: &Scope,
    rows: &[Row],
    binds: &BindVars,
) -> EvalResult<HashMap<String, Value>> {
    let mut values = HashMap::with_capacity(aggregates.len());
    for expr in aggregates {
        let Some((kind, distinct)) = AggregateKind::of(expr) else {
            continue;
        };
        let mut acc = Accumulator::new(kind, distinct);
        let arg = match expr {
            Expr::Function { args, .. } => args.first(),
            _ => None,
        };
        for row in rows {
            let value = match (kind, arg) {
                (AggregateKind::CountStar, _) => Value::Null,
                (_, Some(arg)) => eval(arg, &ScopedRow { scope, row }, binds)?,
                (_, None) => {
                    return Err(EvalError::Type(format!("{expr} requires an argument")));
                }
            };
            acc.update(&value)?;
        }
        values.insert(expr.to_string(), acc.finish());
    }
    Ok(values)
}

fn project(
    outputs: &[OutputColumn],
    order_by: &[OrderBy],
    ctx: &dyn RowContext,
    alias_ctx: &AliasContext<'_>,
    binds: &BindVars,
) -> EvalResult<(Row, Vec<Value>)> {
    let mut row = Vec::with_capacity(outputs.len());
    for output in outputs {
        let value = match &output.source {
            Projected::Column(idx) => ctx.value_at(*idx).unwrap_or(Value::Null),
            Projected::Expr(expr) => eval(expr, ctx, binds)?,
        };
        row.push(value);
    }
    let mut keys = Vec::with_capacity(order_by.len());
    for order in order_by {
        let key = match &order.expr {
            Expr::Literal(Value::Int(n)) => usize::try_from(*n)
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|idx| row.get(idx).cloned())
                .ok_or_else(|| EvalError::UnknownColumn(n.to_string()))?,
            expr => eval(expr, alias_ctx, binds)?,
        };
        keys.push(key);
    }
    Ok((row, keys))
}

pub fn compare_keys(a: &[Value], b: &[Value], order_by: &[OrderBy]) -> Ordering {
    for ((x, y), order) in a.iter().zip(b.iter()).zip(order_by.iter()) {
        let ord = x.collate_cmp(y);
        let ord = if order.desc { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// LIMIT/OFFSET value; literals or bind variables.
pub fn window_bound(expr: Option<&Expr>, binds: &BindVars) -> EvalResult<Option<usize>> {
    let Some(expr) = expr else {
        return Ok(None);
    };
    let value = eval_const(expr, binds)?;
    let n = value
        .as_i64()
        .filter(|n| *n >= 0)
        .ok_or_else(|| EvalError::Type(format!("invalid LIMIT/OFFSET value: {value}")))?;
    Ok(Some(usize::try_from(n).unwrap_or(usize::MAX)))
}

fn infer_type(expr: &Expr, rows: &[Row], idx: usize) -> FieldType {
    if let Some((AggregateKind::Count | AggregateKind::CountStar, _)) = AggregateKind::of(expr) {
        return FieldType::Int64;
    }
    rows.iter()
        .filter_map(|row| row.get(idx))
        .find(|v| !v.is_null())
        .map(FieldType::of_value)
        .unwrap_or(FieldType::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::ast::Statement;
    use crate::sql::parse::parse_statement;

    fn run(sql: &str, rows: Vec<Row>) -> QueryResult {
        let Statement::Select(select) = parse_statement(sql).expect("parse") else {
            panic!("expected select");
        };
        let scope = Scope::for_table("music", ["id".to_string(), "name".to_string()]);
        evaluate_select(
            &select,
            &scope,
            &[FieldType::Int64, FieldType::VarChar],
            rows,
            &BindVars::new(),
        )
        .expect("evaluate")
    }

    fn sample() -> Vec<Row> {
        vec![
            vec![Value::Int(1), Value::text("b")],
            vec![Value::Int(2), Value::text("A")],
            vec![Value::Int(3), Value::text("a")],
            vec![Value::Int(4), Value::Null],
        ]
    }

    #[test]
    fn filter_order_and_window() {
        let result = run(
            "select id, name as n from music where id > 1 order by n desc, id limit 2 offset 1",
            sample(),
        );
        assert_eq!(result.field_names(), vec!["id", "n"]);
        assert_eq!(result.fields[0].field_type, FieldType::Int64);
        let ids: Vec<Value> = result.rows.iter().map(|r| r[0].clone()).collect();
        assert_eq!(ids, vec![Value::Int(3), Value::Int(4)]);
    }

    #[test]
    fn grouping_uses_case_insensitive_keys() {
        let result = run(
            "select name, count(*) as c from music group by name having c > 1",
            sample(),
        );
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0][1], Value::Int(2));
        assert_eq!(result.fields[1].field_type, FieldType::Int64);
    }

    #[test]
    fn aggregates_without_rows_yield_one_row() {
        let result = run("select count(*), sum(id), max(name) from music", Vec::new());
        assert_eq!(
            result.rows,
            vec![vec![Value::Int(0), Value::Null, Value::Null]]
        );
    }

    #[test]
    fn wildcard_and_distinct() {
        let result = run("select * from music where id < 3", sample());
        assert_eq!(result.field_names(), vec!["id", "name"]);
        assert_eq!(result.rows.len(), 2);
        let result = run("select distinct lower(name) from music where name is not null", sample());
        assert_eq!(result.rows.len(), 2);
    }
}
