//! Lookup vindex maintenance.
//!
//! A lookup vindex keeps `from -> to` rows in an ordinary table, usually in
//! an unsharded keyspace. The adapter reads and writes that table with
//! planned statements that go back through the executor, so lookup writes
//! join the session's transaction like any other DML.

use std::cmp::Ordering;

use tracing::debug;

use crate::error::{GateError, GateResult};
use crate::executor::{Access, Ctx, Executor};
use crate::key::KeyspaceId;
use crate::planner::plan;
use crate::session::Session;
use crate::sql::ast::{BinaryOp, Delete, Expr, Insert, Select, SelectItem, Statement};
use crate::value::{BindVars, Value};
use crate::vindex::{LookupParams, Vindex};

/// One lookup row: the `from` values and the keyspace id they name.
pub(crate) type LookupEntry = (Vec<Value>, KeyspaceId);

pub(crate) struct LookupAdapter<'a> {
    exec: &'a Executor,
    ctx: &'a Ctx,
}

impl<'a> LookupAdapter<'a> {
    pub(crate) fn new(exec: &'a Executor, ctx: &'a Ctx) -> Self {
        Self { exec, ctx }
    }

    /// Stored `to` values for each key. Keys containing NULL map to nothing.
    pub(crate) async fn lookup(
        &self,
        session: &mut Session,
        vindex: &Vindex,
        keys: &[Vec<Value>],
    ) -> GateResult<Vec<Vec<Value>>> {
        let params = params(vindex)?;
        let live: Vec<&Vec<Value>> = keys
            .iter()
            .filter(|key| key.len() == params.from.len() && key.iter().all(|v| !v.is_null()))
            .collect();
        if live.is_empty() {
            return Ok(vec![Vec::new(); keys.len()]);
        }

        let selection = if params.from.len() == 1 {
            let mut list: Vec<Expr> = Vec::with_capacity(live.len());
            for key in &live {
                let literal = Expr::Literal(key[0].clone());
                if !list.contains(&literal) {
                    list.push(literal);
                }
            }
            Expr::in_list(Expr::column(params.from[0].clone()), list)
        } else {
            live.iter()
                .filter_map(|key| key_predicate(params, key))
                .reduce(|acc, part| Expr::binary(acc, BinaryOp::Or, part))
                .unwrap_or_else(Expr::always_false)
        };
        let mut projection: Vec<SelectItem> = params
            .from
            .iter()
            .map(|c| SelectItem::column(c.clone()))
            .collect();
        projection.push(SelectItem::column(params.to.clone()));
        let mut select = Select::simple(projection, params.table.clone());
        select.selection = Some(selection);

        let result = self
            .run(session, Statement::Select(Box::new(select)), Access::IfParticipant)
            .await?;
        let width = params.from.len();
        let out = keys
            .iter()
            .map(|key| {
                result
                    .rows
                    .iter()
                    .filter(|row| {
                        key.len() == width
                            && key
                                .iter()
                                .zip(row.iter())
                                .all(|(a, b)| !a.is_null() && a.collate_cmp(b) == Ordering::Equal)
                    })
                    .filter_map(|row| row.get(width).cloned())
                    .collect()
            })
            .collect();
        Ok(out)
    }

    /// Inserts one row per entry. With `ignore` duplicates are skipped,
    /// otherwise a duplicate fails the statement.
    pub(crate) async fn create(
        &self,
        session: &mut Session,
        vindex: &Vindex,
        entries: &[LookupEntry],
        ignore: bool,
    ) -> GateResult<()> {
        let params = params(vindex)?;
        let rows: Vec<Vec<Expr>> = entries
            .iter()
            .filter(|(values, _)| values.iter().all(|v| !v.is_null()))
            .map(|(values, ksid)| {
                let mut row: Vec<Expr> = values.iter().cloned().map(Expr::Literal).collect();
                row.push(Expr::Literal(vindex.stored_value(ksid)));
                row
            })
            .collect();
        if rows.is_empty() {
            return Ok(());
        }
        debug!(vindex = %vindex.name, rows = rows.len(), ignore, "creating lookup entries");
        let mut columns = params.from.clone();
        columns.push(params.to.clone());
        let insert = Insert {
            table: params.table.clone(),
            columns,
            rows,
            ignore,
            on_duplicate: Vec::new(),
        };
        self.run(session, Statement::Insert(insert), Access::Default)
            .await
            .map(|_| ())
    }

    /// Removes the rows naming exactly these entries.
    pub(crate) async fn delete(
        &self,
        session: &mut Session,
        vindex: &Vindex,
        entries: &[LookupEntry],
    ) -> GateResult<()> {
        let params = params(vindex)?;
        for (values, ksid) in entries {
            let Some(key) = key_predicate(params, values) else {
                continue;
            };
            let selection = Expr::binary(
                key,
                BinaryOp::And,
                Expr::eq(
                    Expr::column(params.to.clone()),
                    Expr::Literal(vindex.stored_value(ksid)),
                ),
            );
            let delete = Delete {
                table: params.table.clone(),
                selection: Some(selection),
                order_by: Vec::new(),
                limit: None,
            };
            debug!(vindex = %vindex.name, ksid = %ksid, "deleting lookup entry");
            self.run(session, Statement::Delete(delete), Access::Default)
                .await?;
        }
        Ok(())
    }

    /// Whether each entry's `from` values map to its keyspace id.
    pub(crate) async fn verify(
        &self,
        session: &mut Session,
        vindex: &Vindex,
        entries: &[LookupEntry],
    ) -> GateResult<Vec<bool>> {
        let keys: Vec<Vec<Value>> = entries.iter().map(|(values, _)| values.clone()).collect();
        let stored = self.lookup(session, vindex, &keys).await?;
        Ok(entries
            .iter()
            .zip(stored)
            .map(|((_, ksid), stored)| {
                stored
                    .iter()
                    .any(|value| vindex.ksid_from_stored(value).as_ref() == Some(ksid))
            })
            .collect())
    }

    async fn run(
        &self,
        session: &mut Session,
        statement: Statement,
        access: Access,
    ) -> GateResult<crate::value::QueryResult> {
        let plan = plan(&statement, &self.ctx.vschema, None)?;
        self.exec
            .execute_plan(session, self.ctx, &plan, &BindVars::new(), access)
            .await
    }
}

fn params(vindex: &Vindex) -> GateResult<&LookupParams> {
    vindex
        .lookup()
        .ok_or_else(|| GateError::Internal(format!("vindex {} is not a lookup vindex", vindex.name)))
}

/// `from1 = v1 and from2 = v2 ...`; `None` when a value is NULL.
fn key_predicate(params: &LookupParams, values: &[Value]) -> Option<Expr> {
    if values.len() != params.from.len() || values.iter().any(Value::is_null) {
        return None;
    }
    Expr::conjoin(
        params
            .from
            .iter()
            .zip(values)
            .map(|(column, value)| Expr::eq(Expr::column(column.clone()), Expr::Literal(value.clone())))
            .collect(),
    )
}
