//! Row-level expression evaluation.
//!
//! Used wherever rows are computed outside a shard's own engine: router-side
//! joins, post-merge HAVING/ORDER BY, and the in-memory shard endpoint.
//! Booleans are integers (`1`/`0`) and NULL follows SQL three-valued logic.

use std::cmp::Ordering;

use thiserror::Error;

use super::ast::{BinaryOp, ColumnRef, Expr, UnaryOp};
use crate::error::GateError;
use crate::value::{BindVars, Value};

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("Unknown column '{0}'")]
    UnknownColumn(String),
    #[error("Column '{0}' is ambiguous")]
    AmbiguousColumn(String),
    #[error("missing bind var {0}")]
    BindVarMissing(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Type(String),
}

impl From<EvalError> for GateError {
    fn from(err: EvalError) -> Self {
        match err {
            EvalError::UnknownColumn(_) | EvalError::AmbiguousColumn(_) => {
                GateError::Schema(err.to_string())
            }
            EvalError::BindVarMissing(_) => GateError::Syntax(err.to_string()),
            EvalError::Unsupported(message) => GateError::Unsupported(message),
            EvalError::Type(message) => GateError::Internal(message),
        }
    }
}

pub type EvalResult<T> = std::result::Result<T, EvalError>;

/// Column layout of the rows an expression is evaluated against.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Scope {
    pub columns: Vec<ScopeColumn>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeColumn {
    /// Table reference name (alias or table name) the column belongs to.
    pub table: Option<String>,
    pub name: String,
}

impl Scope {
    /// Scope of one table's rows, qualified by `table`.
    pub fn for_table(table: &str, columns: impl IntoIterator<Item = String>) -> Self {
        Self {
            columns: columns
                .into_iter()
                .map(|name| ScopeColumn {
                    table: Some(table.to_string()),
                    name,
                })
                .collect(),
        }
    }

    /// Concatenation of two scopes, used for joined rows.
    pub fn join(&self, other: &Scope) -> Scope {
        let mut columns = self.columns.clone();
        columns.extend(other.columns.iter().cloned());
        Scope { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Position of a column, matched case-insensitively.
    pub fn resolve(&self, column: &ColumnRef) -> EvalResult<usize> {
        let mut found = None;
        for (idx, candidate) in self.columns.iter().enumerate() {
            if !candidate.name.eq_ignore_ascii_case(&column.name) {
                continue;
            }
            if let Some(table) = &column.table {
                match &candidate.table {
                    Some(own) if own.eq_ignore_ascii_case(table) => {}
                    _ => continue,
                }
            }
            if found.is_some() {
                return Err(EvalError::AmbiguousColumn(column.to_string()));
            }
            found = Some(idx);
        }
        found.ok_or_else(|| EvalError::UnknownColumn(column.to_string()))
    }

    /// Positions of every column of `table`, or all columns when `None`.
    pub fn wildcard(&self, table: Option<&str>) -> EvalResult<Vec<usize>> {
        let positions: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| match table {
                None => true,
                Some(t) => c.table.as_deref().is_some_and(|own| own.eq_ignore_ascii_case(t)),
            })
            .map(|(idx, _)| idx)
            .collect();
        if positions.is_empty() {
            if let Some(table) = table {
                return Err(EvalError::UnknownColumn(format!("{table}.*")));
            }
        }
        Ok(positions)
    }
}

/// Source of column values for one evaluation.
pub trait RowContext {
    fn column(&self, column: &ColumnRef) -> EvalResult<Value>;

    /// Value at a scope position, for wildcard projection.
    fn value_at(&self, _idx: usize) -> Option<Value> {
        None
    }

    /// Precomputed value standing in for `expr` (aggregates, `VALUES(col)`).
    fn precomputed(&self, _expr: &Expr) -> Option<Value> {
        None
    }
}

/// A row laid out by a `Scope`.
pub struct ScopedRow<'a> {
    pub scope: &'a Scope,
    pub row: &'a [Value],
}

impl RowContext for ScopedRow<'_> {
    fn column(&self, column: &ColumnRef) -> EvalResult<Value> {
        let idx = self.scope.resolve(column)?;
        Ok(self.row.get(idx).cloned().unwrap_or(Value::Null))
    }

    fn value_at(&self, idx: usize) -> Option<Value> {
        self.row.get(idx).cloned()
    }
}

/// Context without columns, for constant expressions.
pub struct NoRow;

impl RowContext for NoRow {
    fn column(&self, column: &ColumnRef) -> EvalResult<Value> {
        Err(EvalError::UnknownColumn(column.to_string()))
    }
}

/// Evaluates an expression that may only reference literals and bind vars.
pub fn eval_const(expr: &Expr, binds: &BindVars) -> EvalResult<Value> {
    eval(expr, &NoRow, binds)
}

pub fn eval(expr: &Expr, ctx: &dyn RowContext, binds: &BindVars) -> EvalResult<Value> {
    if let Some(value) = ctx.precomputed(expr) {
        return Ok(value);
    }
    match expr {
        Expr::Column(column) => ctx.column(column),
        Expr::Literal(value) => Ok(value.clone()),
        Expr::BindVar(name) => binds
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::BindVarMissing(name.clone())),
        Expr::ListArg(name) => Err(EvalError::Unsupported(format!("unexpanded list ::{name}"))),
        Expr::Binary { left, op, right } => match op {
            BinaryOp::And => {
                let l = truth(&eval(left, ctx, binds)?);
                if l == Some(false) {
                    return Ok(Value::Int(0));
                }
                let r = truth(&eval(right, ctx, binds)?);
                Ok(from_truth(match (l, r) {
                    (_, Some(false)) => Some(false),
                    (Some(true), Some(true)) => Some(true),
                    _ => None,
                }))
            }
            BinaryOp::Or => {
                let l = truth(&eval(left, ctx, binds)?);
                if l == Some(true) {
                    return Ok(Value::Int(1));
                }
                let r = truth(&eval(right, ctx, binds)?);
                Ok(from_truth(match (l, r) {
                    (_, Some(true)) => Some(true),
                    (Some(false), Some(false)) => Some(false),
                    _ => None,
                }))
            }
            _ => {
                let l = eval(left, ctx, binds)?;
                let r = eval(right, ctx, binds)?;
                binary(*op, &l, &r)
            }
        },
        Expr::Unary { op, expr } => {
            let value = eval(expr, ctx, binds)?;
            match op {
                UnaryOp::Not => Ok(from_truth(truth(&value).map(|b| !b))),
                UnaryOp::Neg => match value {
                    Value::Null => Ok(Value::Null),
                    Value::Int(v) => v
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| EvalError::Type("BIGINT value is out of range".into())),
                    other => Ok(other.as_f64().map(|v| Value::Float(-v)).unwrap_or(Value::Float(0.0))),
                },
            }
        }
        Expr::IsNull { expr, negated } => {
            let is_null = eval(expr, ctx, binds)?.is_null();
            Ok(from_truth(Some(is_null != *negated)))
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let needle = eval(expr, ctx, binds)?;
            if needle.is_null() {
                return Ok(Value::Null);
            }
            let mut saw_null = false;
            for item in list {
                let candidate = eval(item, ctx, binds)?;
                match needle.sql_eq(&candidate) {
                    Some(true) => return Ok(from_truth(Some(!*negated))),
                    Some(false) => {}
                    None => saw_null = true,
                }
            }
            if saw_null {
                Ok(Value::Null)
            } else {
                Ok(from_truth(Some(*negated)))
            }
        }
        Expr::InSubquery { .. } => Err(EvalError::Unsupported(
            "subquery in row expression".to_string(),
        )),
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let value = eval(expr, ctx, binds)?;
            let low = eval(low, ctx, binds)?;
            let high = eval(high, ctx, binds)?;
            if value.is_null() || low.is_null() || high.is_null() {
                return Ok(Value::Null);
            }
            let inside = value.collate_cmp(&low) != Ordering::Less
                && value.collate_cmp(&high) != Ordering::Greater;
            Ok(from_truth(Some(inside != *negated)))
        }
        Expr::Like {
            expr,
            pattern,
            negated,
        } => {
            let value = eval(expr, ctx, binds)?;
            let pattern = eval(pattern, ctx, binds)?;
            if value.is_null() || pattern.is_null() {
                return Ok(Value::Null);
            }
            let matched = like_match(&value.to_string(), &pattern.to_string());
            Ok(from_truth(Some(matched != *negated)))
        }
        Expr::Function { name, args, .. } => {
            if expr.is_aggregate() {
                return Err(EvalError::Unsupported(format!(
                    "aggregate {expr} outside a grouped query"
                )));
            }
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, ctx, binds)?);
            }
            scalar_function(name, values)
        }
        Expr::Tuple(_) => Err(EvalError::Unsupported("row constructor".to_string())),
    }
}

/// True only when the predicate evaluates to a true value.
pub fn eval_predicate(expr: &Expr, ctx: &dyn RowContext, binds: &BindVars) -> EvalResult<bool> {
    Ok(eval(expr, ctx, binds)?.is_truthy())
}

fn truth(value: &Value) -> Option<bool> {
    if value.is_null() {
        None
    } else {
        Some(value.is_truthy())
    }
}

fn from_truth(value: Option<bool>) -> Value {
    match value {
        Some(true) => Value::Int(1),
        Some(false) => Value::Int(0),
        None => Value::Null,
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> EvalResult<Value> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    let cmp = || l.collate_cmp(r);
    Ok(match op {
        BinaryOp::Eq => from_truth(Some(cmp() == Ordering::Equal)),
        BinaryOp::NotEq => from_truth(Some(cmp() != Ordering::Equal)),
        BinaryOp::Lt => from_truth(Some(cmp() == Ordering::Less)),
        BinaryOp::LtEq => from_truth(Some(cmp() != Ordering::Greater)),
        BinaryOp::Gt => from_truth(Some(cmp() == Ordering::Greater)),
        BinaryOp::GtEq => from_truth(Some(cmp() != Ordering::Less)),
        BinaryOp::Plus | BinaryOp::Minus | BinaryOp::Multiply | BinaryOp::Modulo => {
            arithmetic(op, l, r)?
        }
        BinaryOp::Divide => {
            let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
                return Ok(Value::Null);
            };
            if b == 0.0 {
                Value::Null
            } else {
                Value::Float(a / b)
            }
        }
        BinaryOp::And | BinaryOp::Or => {
            return Err(EvalError::Type("logical operator in arithmetic position".into()))
        }
    })
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> EvalResult<Value> {
    let ints = match (l, r) {
        (Value::Float(_), _) | (_, Value::Float(_)) => None,
        _ => l.as_i64().zip(r.as_i64()),
    };
    if let Some((a, b)) = ints {
        let out = match op {
            BinaryOp::Plus => a.checked_add(b),
            BinaryOp::Minus => a.checked_sub(b),
            BinaryOp::Multiply => a.checked_mul(b),
            BinaryOp::Modulo => {
                if b == 0 {
                    return Ok(Value::Null);
                }
                a.checked_rem(b)
            }
            _ => None,
        };
        return out
            .map(Value::Int)
            .ok_or_else(|| EvalError::Type(format!("BIGINT value is out of range in {a} {op:?} {b}")));
    }
    let a = l.as_f64().unwrap_or(0.0);
    let b = r.as_f64().unwrap_or(0.0);
    Ok(match op {
        BinaryOp::Plus => Value::Float(a + b),
        BinaryOp::Minus => Value::Float(a - b),
        BinaryOp::Multiply => Value::Float(a * b),
        BinaryOp::Modulo if b == 0.0 => Value::Null,
        BinaryOp::Modulo => Value::Float(a % b),
        _ => Value::Null,
    })
}

fn scalar_function(name: &str, args: Vec<Value>) -> EvalResult<Value> {
    let arity = |n: usize| -> EvalResult<()> {
        if args.len() == n {
            Ok(())
        } else {
            Err(EvalError::Type(format!(
                "Incorrect parameter count in the call to native function '{name}'"
            )))
        }
    };
    match name {
        "lower" | "lcase" => {
            arity(1)?;
            Ok(map_text(&args[0], |s| s.to_lowercase()))
        }
        "upper" | "ucase" => {
            arity(1)?;
            Ok(map_text(&args[0], |s| s.to_uppercase()))
        }
        "length" | "char_length" => {
            arity(1)?;
            Ok(match &args[0] {
                Value::Null => Value::Null,
                Value::Bytes(b) => Value::Int(b.len() as i64),
                other if name == "length" => Value::Int(other.to_string().len() as i64),
                other => Value::Int(other.to_string().chars().count() as i64),
            })
        }
        "abs" => {
            arity(1)?;
            Ok(match &args[0] {
                Value::Null => Value::Null,
                Value::Int(v) => Value::Int(v.wrapping_abs()),
                other => Value::Float(other.as_f64().unwrap_or(0.0).abs()),
            })
        }
        "concat" => {
            if args.iter().any(Value::is_null) {
                return Ok(Value::Null);
            }
            Ok(Value::Text(args.iter().map(Value::to_string).collect()))
        }
        "coalesce" => Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null)),
        "ifnull" => {
            arity(2)?;
            let mut args = args;
            let fallback = args.pop().unwrap_or(Value::Null);
            let first = args.pop().unwrap_or(Value::Null);
            Ok(if first.is_null() { fallback } else { first })
        }
        // The in-memory shard awaits the delay itself before evaluating rows.
        "sleep" => Ok(Value::Int(0)),
        other => Err(EvalError::Unsupported(format!("function {other}"))),
    }
}

fn map_text(value: &Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::Null => Value::Null,
        other => Value::Text(f(&other.to_string())),
    }
}

/// SQL `LIKE` under the case-insensitive collation. `%` matches any run of
/// characters, `_` exactly one, and `\` escapes the next character.
pub fn like_match(value: &str, pattern: &str) -> bool {
    let value: Vec<char> = value.chars().flat_map(char::to_lowercase).collect();
    let pattern: Vec<char> = pattern.chars().flat_map(char::to_lowercase).collect();
    like_from(&value, &pattern)
}

fn like_from(value: &[char], pattern: &[char]) -> bool {
    let Some((&head, rest)) = pattern.split_first() else {
        return value.is_empty();
    };
    match head {
        '%' => (0..=value.len()).any(|skip| like_from(&value[skip..], rest)),
        '_' => !value.is_empty() && like_from(&value[1..], rest),
        '\\' if !rest.is_empty() => {
            value.first() == Some(&rest[0]) && like_from(&value[1..], &rest[1..])
        }
        literal => value.first() == Some(&literal) && like_from(&value[1..], rest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::parse::parse_statement;
    use crate::sql::ast::Statement;

    fn where_clause(sql: &str) -> Expr {
        match parse_statement(sql).expect("parse") {
            Statement::Select(select) => select.selection.expect("where clause"),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn user_scope() -> Scope {
        Scope::for_table("user", ["id".to_string(), "name".to_string()])
    }

    #[test]
    fn predicates_follow_three_valued_logic() {
        let scope = user_scope();
        let row = vec![Value::Int(3), Value::Null];
        let ctx = ScopedRow {
            scope: &scope,
            row: &row,
        };
        let binds = BindVars::new();
        let expr = where_clause("select * from user where id = 3 and name = 'a'");
        assert_eq!(eval(&expr, &ctx, &binds).expect("eval"), Value::Null);
        let expr = where_clause("select * from user where id = 3 or name = 'a'");
        assert_eq!(eval(&expr, &ctx, &binds).expect("eval"), Value::Int(1));
        let expr = where_clause("select * from user where id not in (1, 2)");
        assert!(eval_predicate(&expr, &ctx, &binds).expect("eval"));
        let expr = where_clause("select * from user where name is null and id between 1 and 3");
        assert!(eval_predicate(&expr, &ctx, &binds).expect("eval"));
    }

    #[test]
    fn qualified_and_ambiguous_columns() {
        let scope = user_scope().join(&Scope::for_table("extra", ["id".to_string()]));
        assert_eq!(
            scope
                .resolve(&ColumnRef {
                    table: Some("EXTRA".into()),
                    name: "ID".into()
                })
                .expect("resolve"),
            2
        );
        assert!(matches!(
            scope.resolve(&ColumnRef {
                table: None,
                name: "id".into()
            }),
            Err(EvalError::AmbiguousColumn(_))
        ));
        assert!(matches!(
            scope.resolve(&ColumnRef {
                table: None,
                name: "bad".into()
            }),
            Err(EvalError::UnknownColumn(_))
        ));
    }

    #[test]
    fn bind_vars_and_arithmetic() {
        let mut binds = BindVars::new();
        binds.insert("x".into(), Value::Int(7));
        let expr = where_clause("select * from t where :x + 1 = 8");
        assert!(eval_predicate(&expr, &NoRow, &binds).expect("eval"));
        let expr = where_clause("select * from t where 7 / 0 is null");
        assert!(eval_predicate(&expr, &NoRow, &binds).expect("eval"));
        let expr = where_clause("select * from t where :missing = 1");
        assert_eq!(
            eval(&expr, &NoRow, &binds),
            Err(EvalError::BindVarMissing("missing".into()))
        );
    }

    #[test]
    fn like_is_case_insensitive() {
        assert!(like_match("Hello World", "hello%"));
        assert!(like_match("abc", "a_c"));
        assert!(!like_match("abc", "a_"));
        assert!(like_match("50%", "50\\%"));
        assert!(!like_match("500", "50\\%"));
    }
}
