//! Statement evaluation over in-memory tables.
//!
//! Every function works on a table the caller owns exclusively; the caller
//! decides whether the mutated copy is kept (statement atomicity) and under
//! which transaction it becomes visible.

use std::cmp::Ordering;

use crate::error::{ShardError, ER_BAD_FIELD_ERROR, ER_DUP_ENTRY, ER_UNKNOWN_ERROR};
use crate::sql::ast::{Assignment, ColumnRef, Delete, Expr, Insert, Select, Update};
use crate::sql::eval::{eval, eval_const, EvalError, RowContext, Scope, ScopedRow};
use crate::sql::query::{compare_keys, evaluate_select, window_bound};
use crate::value::{BindVars, FieldType, QueryResult, Row, Value};

/// Declared shape of a table hosted by a `MemShard`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<(String, FieldType)>,
    pub primary_key: Vec<String>,
    pub unique_keys: Vec<Vec<String>>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            unique_keys: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.columns.push((name.into(), field_type));
        self
    }

    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn unique_key(mut self, columns: &[&str]) -> Self {
        self.unique_keys
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Backing table of a sequence: `(id, next_id, cache)` keyed by `id`.
    pub fn sequence(name: impl Into<String>) -> Self {
        Self::new(name)
            .column("id", FieldType::Int64)
            .column("next_id", FieldType::Int64)
            .column("cache", FieldType::Int64)
            .primary_key(&["id"])
    }
}

#[derive(Clone, Debug)]
pub(crate) struct MemTable {
    pub name: String,
    pub columns: Vec<String>,
    pub types: Vec<FieldType>,
    /// Unique keys as (key name, column positions); `PRIMARY` first.
    pub keys: Vec<(String, Vec<usize>)>,
    pub rows: Vec<Row>,
}

impl MemTable {
    pub fn from_def(def: &TableDef) -> Result<Self, ShardError> {
        let columns: Vec<String> = def.columns.iter().map(|(n, _)| n.clone()).collect();
        let types = def.columns.iter().map(|(_, t)| *t).collect();
        let position = |name: &String| {
            columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(name))
                .ok_or_else(|| {
                    ShardError::new(
                        ER_BAD_FIELD_ERROR,
                        format!("Key column '{name}' doesn't exist in table"),
                    )
                })
        };
        let mut keys = Vec::new();
        if !def.primary_key.is_empty() {
            let cols = def.primary_key.iter().map(position).collect::<Result<_, _>>()?;
            keys.push(("PRIMARY".to_string(), cols));
        }
        for (idx, key) in def.unique_keys.iter().enumerate() {
            let cols = key.iter().map(position).collect::<Result<_, _>>()?;
            keys.push((format!("uk_{idx}"), cols));
        }
        Ok(Self {
            name: def.name.clone(),
            columns,
            types,
            keys,
            rows: Vec::new(),
        })
    }

    fn scope(&self, reference: &str) -> Scope {
        Scope::for_table(reference, self.columns.iter().cloned())
    }

    fn column_index(&self, name: &str) -> Result<usize, ShardError> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                ShardError::new(
                    ER_BAD_FIELD_ERROR,
                    format!("Unknown column '{name}' in 'field list'"),
                )
            })
    }

    /// Row index conflicting with `row` on any unique key, skipping `skip`.
    fn conflict(&self, row: &Row, skip: Option<usize>) -> Option<(usize, &str)> {
        for (name, cols) in &self.keys {
            if cols.iter().any(|c| row[*c].is_null()) {
                continue;
            }
            let hit = self.rows.iter().enumerate().find(|(idx, existing)| {
                Some(*idx) != skip
                    && cols
                        .iter()
                        .all(|c| existing[*c].collate_cmp(&row[*c]) == Ordering::Equal)
            });
            if let Some((idx, _)) = hit {
                return Some((idx, name.as_str()));
            }
        }
        None
    }

    fn duplicate(&self, row: &Row, key: &str) -> ShardError {
        let shown = self
            .keys
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, cols)| {
                cols.iter()
                    .map(|c| row[*c].to_string())
                    .collect::<Vec<_>>()
                    .join("-")
            })
            .unwrap_or_default();
        ShardError::new(
            ER_DUP_ENTRY,
            format!("Duplicate entry '{shown}' for key '{}.{key}'", self.name),
        )
    }
}

pub(crate) fn eval_error(err: EvalError) -> ShardError {
    match err {
        EvalError::UnknownColumn(column) => ShardError::new(
            ER_BAD_FIELD_ERROR,
            format!("Unknown column '{column}' in 'where clause'"),
        ),
        EvalError::AmbiguousColumn(column) => {
            ShardError::new(1052, format!("Column '{column}' in where clause is ambiguous"))
        }
        other => ShardError::new(ER_UNKNOWN_ERROR, other.to_string()),
    }
}

/// Stores values the way the column type does.
fn coerce(value: Value, field_type: FieldType) -> Value {
    match (field_type, value) {
        (FieldType::Int64, Value::Text(s)) => match s.trim().parse::<i64>() {
            Ok(v) => Value::Int(v),
            Err(_) => Value::Text(s),
        },
        (FieldType::Int64, Value::Float(f)) if f.fract() == 0.0 => Value::Int(f as i64),
        (FieldType::Float64, Value::Int(v)) => Value::Float(v as f64),
        (FieldType::VarBinary, Value::Text(s)) => Value::Bytes(s.into_bytes()),
        (FieldType::VarChar, Value::Int(v)) => Value::Text(v.to_string()),
        (_, other) => other,
    }
}

pub(crate) fn run_select(
    table: Option<&MemTable>,
    select: &Select,
    binds: &BindVars,
) -> Result<QueryResult, ShardError> {
    let Some(table) = table else {
        // Table-less select: one empty input row.
        return evaluate_select(select, &Scope::default(), &[], vec![Vec::new()], binds)
            .map_err(eval_error);
    };
    let reference = select
        .from
        .first()
        .map(|t| t.reference_name().to_string())
        .unwrap_or_else(|| table.name.clone());
    let scope = table.scope(&reference);
    evaluate_select(select, &scope, &table.types, table.rows.clone(), binds).map_err(eval_error)
}

/// Existing row plus the `VALUES(col)` of the row being inserted.
struct UpsertContext<'a> {
    existing: ScopedRow<'a>,
    scope: &'a Scope,
    inserted: &'a Row,
}

impl RowContext for UpsertContext<'_> {
    fn column(&self, column: &ColumnRef) -> Result<Value, EvalError> {
        self.existing.column(column)
    }

    fn precomputed(&self, expr: &Expr) -> Option<Value> {
        let Expr::Function { name, args, .. } = expr else {
            return None;
        };
        if name != "values" {
            return None;
        }
        let column = args.first()?.as_column()?;
        let idx = self.scope.resolve(column).ok()?;
        self.inserted.get(idx).cloned()
    }
}

pub(crate) fn run_insert(
    table: &mut MemTable,
    insert: &Insert,
    binds: &BindVars,
) -> Result<QueryResult, ShardError> {
    let positions: Vec<usize> = if insert.columns.is_empty() {
        (0..table.columns.len()).collect()
    } else {
        insert
            .columns
            .iter()
            .map(|c| table.column_index(c))
            .collect::<Result<_, _>>()?
    };
    let scope = table.scope(&table.name.clone());
    let mut affected = 0u64;
    for values in &insert.rows {
        if values.len() != positions.len() {
            return Err(ShardError::new(
                1136,
                "Column count doesn't match value count at row 1",
            ));
        }
        let mut row: Row = vec![Value::Null; table.columns.len()];
        for (expr, idx) in values.iter().zip(&positions) {
            let value = eval_const(expr, binds).map_err(eval_error)?;
            row[*idx] = coerce(value, table.types[*idx]);
        }
        match table.conflict(&row, None) {
            None => {
                table.rows.push(row);
                affected += 1;
            }
            Some(_) if insert.ignore && insert.on_duplicate.is_empty() => {}
            Some((idx, _)) if !insert.on_duplicate.is_empty() => {
                let updated = {
                    let ctx = UpsertContext {
                        existing: ScopedRow {
                            scope: &scope,
                            row: &table.rows[idx],
                        },
                        scope: &scope,
                        inserted: &row,
                    };
                    apply_to(table, &insert.on_duplicate, &ctx, binds)?
                };
                if updated != table.rows[idx] {
                    if let Some((_, key)) = table.conflict(&updated, Some(idx)) {
                        return Err(table.duplicate(&updated, key));
                    }
                    table.rows[idx] = updated;
                    affected += 2;
                }
            }
            Some((_, key)) => return Err(table.duplicate(&row, key)),
        }
    }
    Ok(QueryResult::affected(affected))
}

/// Current row with `assignments` applied.
fn apply_to(
    table: &MemTable,
    assignments: &[Assignment],
    ctx: &dyn RowContext,
    binds: &BindVars,
) -> Result<Row, ShardError> {
    let mut row = Vec::with_capacity(table.columns.len());
    for name in &table.columns {
        row.push(
            ctx.column(&ColumnRef {
                table: None,
                name: name.clone(),
            })
            .map_err(eval_error)?,
        );
    }
    for assignment in assignments {
        let idx = table.column_index(&assignment.column)?;
        let value = eval(&assignment.value, ctx, binds).map_err(eval_error)?;
        row[idx] = coerce(value, table.types[idx]);
    }
    Ok(row)
}

fn matching_rows(
    table: &MemTable,
    selection: Option<&Expr>,
    binds: &BindVars,
) -> Result<Vec<usize>, ShardError> {
    let scope = table.scope(&table.name);
    let mut out = Vec::new();
    for (idx, row) in table.rows.iter().enumerate() {
        let keep = match selection {
            Some(predicate) => eval(predicate, &ScopedRow { scope: &scope, row }, binds)
                .map_err(eval_error)?
                .is_truthy(),
            None => true,
        };
        if keep {
            out.push(idx);
        }
    }
    Ok(out)
}

pub(crate) fn run_update(
    table: &mut MemTable,
    update: &Update,
    binds: &BindVars,
) -> Result<QueryResult, ShardError> {
    let scope = table.scope(&table.name);
    let mut changed = 0u64;
    for idx in matching_rows(table, update.selection.as_ref(), binds)? {
        let updated = {
            let ctx = ScopedRow {
                scope: &scope,
                row: &table.rows[idx],
            };
            apply_to(table, &update.assignments, &ctx, binds)?
        };
        if updated == table.rows[idx] {
            continue;
        }
        if let Some((_, key)) = table.conflict(&updated, Some(idx)) {
            return Err(table.duplicate(&updated, key));
        }
        table.rows[idx] = updated;
        changed += 1;
    }
    Ok(QueryResult::affected(changed))
}

pub(crate) fn run_delete(
    table: &mut MemTable,
    delete: &Delete,
    binds: &BindVars,
) -> Result<QueryResult, ShardError> {
    let mut victims = matching_rows(table, delete.selection.as_ref(), binds)?;
    if !delete.order_by.is_empty() {
        let scope = table.scope(&table.name);
        let mut keyed = Vec::with_capacity(victims.len());
        for idx in victims {
            let row = &table.rows[idx];
            let mut keys = Vec::with_capacity(delete.order_by.len());
            for order in &delete.order_by {
                keys.push(
                    eval(&order.expr, &ScopedRow { scope: &scope, row }, binds).map_err(eval_error)?,
                );
            }
            keyed.push((idx, keys));
        }
        keyed.sort_by(|(_, a), (_, b)| compare_keys(a, b, &delete.order_by));
        victims = keyed.into_iter().map(|(idx, _)| idx).collect();
    }
    if let Some(limit) = window_bound(delete.limit.as_ref(), binds).map_err(eval_error)? {
        victims.truncate(limit);
    }
    victims.sort_unstable();
    let removed = victims.len() as u64;
    for idx in victims.into_iter().rev() {
        table.rows.remove(idx);
    }
    Ok(QueryResult::affected(removed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::ast::Statement;
    use crate::sql::parse::parse_statement;

    fn users() -> MemTable {
        let def = TableDef::new("user")
            .column("id", FieldType::Int64)
            .column("name", FieldType::VarChar)
            .primary_key(&["id"]);
        MemTable::from_def(&def).expect("table")
    }

    fn exec(table: &mut MemTable, sql: &str) -> Result<QueryResult, ShardError> {
        let binds = BindVars::new();
        match parse_statement(sql).expect("parse") {
            Statement::Select(select) => run_select(Some(table), &select, &binds),
            Statement::Insert(insert) => run_insert(table, &insert, &binds),
            Statement::Update(update) => run_update(table, &update, &binds),
            Statement::Delete(delete) => run_delete(table, &delete, &binds),
            other => panic!("unexpected statement {other:?}"),
        }
    }

    #[test]
    fn insert_detects_duplicates_and_honors_ignore() {
        let mut table = users();
        exec(&mut table, "insert into user (id, name) values (1, 'a'), (2, 'b')").expect("insert");
        let err = exec(&mut table, "insert into user (id, name) values (1, 'x')").expect_err("dup");
        assert_eq!(err.code, ER_DUP_ENTRY);
        let res = exec(&mut table, "insert ignore into user (id, name) values (1, 'x'), (3, 'c')")
            .expect("ignore");
        assert_eq!(res.rows_affected, 1);
        assert_eq!(table.rows.len(), 3);
    }

    #[test]
    fn upsert_updates_existing_row_with_values_reference() {
        let mut table = users();
        exec(&mut table, "insert into user (id, name) values (1, 'a')").expect("insert");
        let res = exec(
            &mut table,
            "insert into user (id, name) values (1, 'z') on duplicate key update name = values(name)",
        )
        .expect("upsert");
        assert_eq!(res.rows_affected, 2);
        assert_eq!(table.rows[0][1], Value::text("z"));
    }

    #[test]
    fn update_counts_changed_rows_only() {
        let mut table = users();
        exec(&mut table, "insert into user (id, name) values (1, 'a'), (2, 'b')").expect("insert");
        let res = exec(&mut table, "update user set name = 'a' where id in (1, 2)").expect("update");
        assert_eq!(res.rows_affected, 1);
        let err = exec(&mut table, "update user set id = 1 where id = 2").expect_err("dup");
        assert_eq!(err.code, ER_DUP_ENTRY);
    }

    #[test]
    fn delete_applies_order_and_limit() {
        let mut table = users();
        exec(&mut table, "insert into user (id, name) values (1, 'a'), (2, 'b'), (3, 'c')")
            .expect("insert");
        let res = exec(&mut table, "delete from user order by id desc limit 2").expect("delete");
        assert_eq!(res.rows_affected, 2);
        assert_eq!(table.rows, vec![vec![Value::Int(1), Value::text("a")]]);
    }

    #[test]
    fn select_reports_unknown_columns() {
        let mut table = users();
        let err = exec(&mut table, "select bad from user").expect_err("unknown");
        assert_eq!(err.code, ER_BAD_FIELD_ERROR);
        let res = exec(&mut table, "select count(*) from user").expect("count");
        assert_eq!(res.rows, vec![vec![Value::Int(0)]]);
    }
}
