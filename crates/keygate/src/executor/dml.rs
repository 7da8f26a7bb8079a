//! INSERT, UPDATE and DELETE execution, including lookup vindex upkeep.
//!
//! All writes here run inside the session transaction; `execute_plan` opens
//! an implicit one when the session has none.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::resolve::display_values;
use super::{shard_index, Access, Ctx, Executor, RoutedShard, ShardQuery};
use crate::error::{GateError, GateResult};
use crate::key::KeyspaceId;
use crate::lookup::{LookupAdapter, LookupEntry};
use crate::planner::route::bind_route_values;
use crate::planner::{DeletePlan, InsertPlan, UpdatePlan};
use crate::session::Session;
use crate::shard::ShardTarget;
use crate::sql::ast::{Expr, LockMode, Select, SelectItem, TableName};
use crate::sql::eval::{eval, eval_const, Scope, ScopedRow};
use crate::value::{BindVars, QueryResult, Row, Value};
use crate::vschema::{ColumnVindex, Keyspace, Table};

impl Executor {
    pub(super) async fn execute_insert(
        &self,
        session: &mut Session,
        ctx: &Ctx,
        plan: &InsertPlan,
        binds: &BindVars,
    ) -> GateResult<QueryResult> {
        let mut insert = plan.insert.clone();
        let mut rows: Vec<Row> = Vec::with_capacity(insert.rows.len());
        for row in &insert.rows {
            rows.push(
                row.iter()
                    .map(|expr| eval_const(expr, binds))
                    .collect::<Result<Vec<_>, _>>()?,
            );
        }
        let insert_id = self
            .fill_auto_increment(ctx, &plan.table, &mut insert.columns, &mut rows)
            .await?;

        if !plan.keyspace.sharded {
            insert.rows = literal_rows(&rows);
            let target = ShardTarget::new(plan.keyspace.name.clone(), first_shard_name(&plan.keyspace)?);
            let mut results = self
                .dispatch(
                    session,
                    ctx,
                    vec![ShardQuery {
                        target,
                        sql: insert.to_string(),
                        binds: binds.clone(),
                    }],
                    true,
                    Access::Default,
                )
                .await?;
            let mut result = results.pop().unwrap_or_default();
            if let Some(id) = insert_id {
                result.insert_id = id;
            }
            return Ok(result);
        }

        let table = &plan.table;
        let primary = table.primary().ok_or_else(|| {
            GateError::schema(format!("table {} has no primary vindex", table.name))
        })?;
        // Upserts may hit existing rows, so their lookup writes tolerate duplicates.
        let ignore = insert.ignore || !insert.on_duplicate.is_empty();

        let primary_inputs: Vec<Vec<Value>> = rows
            .iter()
            .map(|row| column_values(&insert.columns, row, &primary.columns))
            .collect();
        let mapped = self
            .map_vindex(session, ctx, &primary.vindex, &primary_inputs)
            .await?;
        let mut keep: Vec<Option<KeyspaceId>> = Vec::with_capacity(rows.len());
        for (input, ksids) in primary_inputs.iter().zip(mapped) {
            match ksids.first() {
                Some(ksid) => keep.push(Some(*ksid)),
                None if ignore => {
                    debug!(table = %table.name, values = %display_values(input), "skipping unmappable row");
                    keep.push(None);
                }
                None => {
                    return Err(GateError::vindex(format!(
                        "could not map {} to a keyspace id",
                        display_values(input)
                    )))
                }
            }
        }

        // Reversible functional vindex columns left out of the statement are
        // derived from the keyspace id.
        for binding in table.column_vindexes.iter().skip(1) {
            let [column] = binding.columns.as_slice() else {
                continue;
            };
            if !binding.vindex.is_reversible() || position(&insert.columns, column).is_some() {
                continue;
            }
            insert.columns.push(column.clone());
            for (row, ksid) in rows.iter_mut().zip(&keep) {
                row.push(
                    ksid.and_then(|ksid| binding.vindex.reverse_map(&ksid))
                        .unwrap_or(Value::Null),
                );
            }
        }

        // Unowned vindexes are checked first so that rows they drop never
        // get owned entries.
        for binding in table.column_vindexes.iter().skip(1) {
            if binding.is_owned_by(&table.name)
                || binding.columns.iter().any(|c| position(&insert.columns, c).is_none())
            {
                continue;
            }
            let entries = entries_for(&insert.columns, &rows, &keep, binding);
            if entries.is_empty() {
                continue;
            }
            let verified = self
                .verify_vindex(session, ctx, &binding.vindex, &entries)
                .await?;
            if ignore {
                drop_unverified(&insert.columns, &rows, &mut keep, binding, &entries, &verified);
                continue;
            }
            if let Some(((values, ksid), _)) =
                entries.iter().zip(&verified).find(|(_, ok)| !**ok)
            {
                return Err(GateError::vindex(format!(
                    "values {} for column {} do not map to keyspace id {ksid}",
                    display_values(values),
                    binding.columns.join(", ")
                )));
            }
        }

        if ignore {
            self.create_owned_tolerant(session, ctx, table, &insert.columns, &rows, &mut keep)
                .await?;
        } else {
            for binding in table.owned_vindexes() {
                let entries = entries_for(&insert.columns, &rows, &keep, binding);
                if entries.is_empty() {
                    continue;
                }
                LookupAdapter::new(self, ctx)
                    .create(session, &binding.vindex, &entries, false)
                    .await?;
            }
        }

        let mut per_shard: BTreeMap<usize, Vec<Row>> = BTreeMap::new();
        for (row, ksid) in rows.into_iter().zip(keep) {
            if let Some(ksid) = ksid {
                per_shard
                    .entry(shard_index(&plan.keyspace, &ksid)?)
                    .or_default()
                    .push(row);
            }
        }
        if per_shard.is_empty() {
            return Ok(QueryResult {
                insert_id: insert_id.unwrap_or_default(),
                ..QueryResult::default()
            });
        }
        let queries = per_shard
            .into_iter()
            .map(|(idx, rows)| {
                let mut shard_insert = insert.clone();
                shard_insert.rows = literal_rows(&rows);
                ShardQuery {
                    target: ShardTarget::new(
                        plan.keyspace.name.clone(),
                        plan.keyspace.shards[idx].name.clone(),
                    ),
                    sql: shard_insert.to_string(),
                    binds: binds.clone(),
                }
            })
            .collect();
        let results = self
            .dispatch(session, ctx, queries, true, Access::Default)
            .await?;
        Ok(QueryResult {
            rows_affected: results.iter().map(|r| r.rows_affected).sum(),
            insert_id: insert_id.unwrap_or_default(),
            ..QueryResult::default()
        })
    }

    /// Owned lookup upkeep for INSERT IGNORE and upserts.
    ///
    /// A row whose unique owned entry already names another keyspace id is
    /// dropped before anything is written. Entries are then created for the
    /// remaining rows; a row that still fails verification afterwards is
    /// dropped and the entries this statement wrote for it are deleted.
    async fn create_owned_tolerant(
        &self,
        session: &mut Session,
        ctx: &Ctx,
        table: &Table,
        columns: &[String],
        rows: &[Row],
        keep: &mut [Option<KeyspaceId>],
    ) -> GateResult<()> {
        let owned: Vec<&ColumnVindex> = table.owned_vindexes().collect();
        for binding in owned.iter().filter(|b| b.vindex.is_unique()) {
            let entries = entries_for(columns, rows, keep, binding);
            if entries.is_empty() {
                continue;
            }
            let keys: Vec<Vec<Value>> = entries.iter().map(|(values, _)| values.clone()).collect();
            let existing = self.map_vindex(session, ctx, &binding.vindex, &keys).await?;
            let free: Vec<bool> = entries
                .iter()
                .zip(&existing)
                .map(|((_, ksid), ksids)| ksids.is_empty() || ksids.contains(ksid))
                .collect();
            drop_unverified(columns, rows, keep, binding, &entries, &free);
        }

        let adapter = LookupAdapter::new(self, ctx);
        let mut written: Vec<Vec<LookupEntry>> = Vec::with_capacity(owned.len());
        for binding in &owned {
            let entries = entries_for(columns, rows, keep, binding);
            let present = if entries.is_empty() {
                Vec::new()
            } else {
                self.verify_vindex(session, ctx, &binding.vindex, &entries)
                    .await?
            };
            let fresh: Vec<LookupEntry> = entries
                .into_iter()
                .zip(present)
                .filter(|(_, present)| !present)
                .map(|(entry, _)| entry)
                .collect();
            if !fresh.is_empty() {
                adapter.create(session, &binding.vindex, &fresh, true).await?;
            }
            written.push(fresh);
        }

        let before: Vec<Option<KeyspaceId>> = keep.to_vec();
        for binding in &owned {
            let entries = entries_for(columns, rows, keep, binding);
            if entries.is_empty() {
                continue;
            }
            let verified = self
                .verify_vindex(session, ctx, &binding.vindex, &entries)
                .await?;
            drop_unverified(columns, rows, keep, binding, &entries, &verified);
        }
        let dropped: Vec<Option<KeyspaceId>> = before
            .iter()
            .zip(keep.iter())
            .map(|(was, now)| if now.is_none() { *was } else { None })
            .collect();
        if dropped.iter().all(Option::is_none) {
            return Ok(());
        }
        for (binding, fresh) in owned.iter().zip(&written) {
            let orphans: Vec<LookupEntry> = entries_for(columns, rows, &dropped, binding)
                .into_iter()
                .filter(|entry| fresh.contains(entry))
                .collect();
            if !orphans.is_empty() {
                debug!(vindex = %binding.vindex.name, entries = orphans.len(), "removing entries of skipped rows");
                adapter.delete(session, &binding.vindex, &orphans).await?;
            }
        }
        Ok(())
    }

    /// Fills NULL or missing auto-increment values from the table's sequence.
    /// Returns the first generated id.
    async fn fill_auto_increment(
        &self,
        ctx: &Ctx,
        table: &Table,
        columns: &mut Vec<String>,
        rows: &mut [Row],
    ) -> GateResult<Option<u64>> {
        let Some(auto) = &table.auto_increment else {
            return Ok(None);
        };
        let idx = match position(columns, &auto.column) {
            Some(idx) => idx,
            None => {
                columns.push(auto.column.clone());
                for row in rows.iter_mut() {
                    row.push(Value::Null);
                }
                columns.len() - 1
            }
        };
        let missing = rows.iter().filter(|row| row[idx].is_null()).count();
        if missing == 0 {
            return Ok(None);
        }
        let first = self
            .sequences
            .next(&ctx.vschema, &auto.sequence, missing as i64)
            .await?;
        let mut next = first;
        for row in rows.iter_mut().filter(|row| row[idx].is_null()) {
            row[idx] = Value::Int(next);
            next += 1;
        }
        Ok(u64::try_from(first).ok())
    }

    pub(super) async fn execute_update(
        &self,
        session: &mut Session,
        ctx: &Ctx,
        plan: &UpdatePlan,
        binds: &BindVars,
    ) -> GateResult<QueryResult> {
        let shards = self.route_shards(session, ctx, &plan.route, binds).await?;
        if shards.is_empty() {
            return Ok(QueryResult::affected(0));
        }
        if !plan.changed_owned.is_empty() {
            let (scope, rows) = self
                .read_for_write(session, ctx, &plan.route.keyspace, &plan.table, &shards, &plan.update.selection, binds)
                .await?;
            let ksids = self.row_ksids(session, ctx, &plan.table, &scope, &rows).await?;
            let adapter = LookupAdapter::new(self, ctx);
            for binding in &plan.changed_owned {
                let mut old = Vec::new();
                let mut new = Vec::new();
                for (row, ksid) in rows.iter().zip(&ksids) {
                    let Some(ksid) = ksid else {
                        continue;
                    };
                    let ctx_row = ScopedRow { scope: &scope, row };
                    let mut before = Vec::with_capacity(binding.columns.len());
                    let mut after = Vec::with_capacity(binding.columns.len());
                    for column in &binding.columns {
                        let current = position_in_scope(&scope, column)
                            .and_then(|idx| row.get(idx).cloned())
                            .unwrap_or(Value::Null);
                        let assigned = plan
                            .update
                            .assignments
                            .iter()
                            .find(|a| a.column.eq_ignore_ascii_case(column));
                        let next = match assigned {
                            Some(assignment) => eval(&assignment.value, &ctx_row, binds)?,
                            None => current.clone(),
                        };
                        before.push(current);
                        after.push(next);
                    }
                    old.push((before, *ksid));
                    new.push((after, *ksid));
                }
                adapter.delete(session, &binding.vindex, &old).await?;
                adapter.create(session, &binding.vindex, &new, false).await?;
            }
        }

        let queries = routed_queries(&plan.route.keyspace, shards, binds, |values| {
            let mut update = plan.update.clone();
            if let Some(values) = values {
                bind_route_values(&mut update.selection, values);
            }
            update.to_string()
        });
        let results = self
            .dispatch(session, ctx, queries, true, Access::Default)
            .await?;
        Ok(QueryResult::affected(results.iter().map(|r| r.rows_affected).sum()))
    }

    pub(super) async fn execute_delete(
        &self,
        session: &mut Session,
        ctx: &Ctx,
        plan: &DeletePlan,
        binds: &BindVars,
    ) -> GateResult<QueryResult> {
        let shards = self.route_shards(session, ctx, &plan.route, binds).await?;
        if shards.is_empty() {
            return Ok(QueryResult::affected(0));
        }
        if !plan.owned.is_empty() {
            let (scope, rows) = self
                .read_for_write(session, ctx, &plan.route.keyspace, &plan.table, &shards, &plan.delete.selection, binds)
                .await?;
            let ksids = self.row_ksids(session, ctx, &plan.table, &scope, &rows).await?;
            let adapter = LookupAdapter::new(self, ctx);
            for binding in &plan.owned {
                let entries: Vec<LookupEntry> = rows
                    .iter()
                    .zip(&ksids)
                    .filter_map(|(row, ksid)| {
                        let ksid = (*ksid)?;
                        let values = binding
                            .columns
                            .iter()
                            .map(|c| {
                                position_in_scope(&scope, c)
                                    .and_then(|idx| row.get(idx).cloned())
                                    .unwrap_or(Value::Null)
                            })
                            .collect();
                        Some((values, ksid))
                    })
                    .collect();
                adapter.delete(session, &binding.vindex, &entries).await?;
            }
        }

        let queries = routed_queries(&plan.route.keyspace, shards, binds, |values| {
            let mut delete = plan.delete.clone();
            if let Some(values) = values {
                bind_route_values(&mut delete.selection, values);
            }
            delete.to_string()
        });
        let results = self
            .dispatch(session, ctx, queries, true, Access::Default)
            .await?;
        Ok(QueryResult::affected(results.iter().map(|r| r.rows_affected).sum()))
    }

    /// Locks and reads the rows a DML statement is about to change.
    #[allow(clippy::too_many_arguments)]
    async fn read_for_write(
        &self,
        session: &mut Session,
        ctx: &Ctx,
        keyspace: &Keyspace,
        table: &Table,
        shards: &[RoutedShard],
        selection: &Option<Expr>,
        binds: &BindVars,
    ) -> GateResult<(Scope, Vec<Row>)> {
        let mut select = Select::simple(
            vec![SelectItem::Wildcard(None)],
            TableName::new(table.name.clone()),
        );
        select.selection = selection.clone();
        select.lock = Some(LockMode::Update);
        let queries = routed_queries(keyspace, shards.to_vec(), binds, |values| {
            let mut select = select.clone();
            if let Some(values) = values {
                bind_route_values(&mut select.selection, values);
            }
            select.to_string()
        });
        let results = self
            .dispatch(session, ctx, queries, true, Access::Default)
            .await?;
        let names = results
            .first()
            .map(|r| r.fields.iter().map(|f| f.name.clone()).collect::<Vec<_>>())
            .unwrap_or_default();
        let scope = Scope::for_table(&table.name, names);
        let rows = results.into_iter().flat_map(|r| r.rows).collect();
        Ok((scope, rows))
    }

    /// Keyspace id of each row, from its primary vindex columns.
    async fn row_ksids(
        &self,
        session: &mut Session,
        ctx: &Ctx,
        table: &Arc<Table>,
        scope: &Scope,
        rows: &[Row],
    ) -> GateResult<Vec<Option<KeyspaceId>>> {
        let primary = table.primary().ok_or_else(|| {
            GateError::schema(format!("table {} has no primary vindex", table.name))
        })?;
        let inputs: Vec<Vec<Value>> = rows
            .iter()
            .map(|row| {
                primary
                    .columns
                    .iter()
                    .map(|c| {
                        position_in_scope(scope, c)
                            .and_then(|idx| row.get(idx).cloned())
                            .unwrap_or(Value::Null)
                    })
                    .collect()
            })
            .collect();
        let mapped = self.map_vindex(session, ctx, &primary.vindex, &inputs).await?;
        Ok(mapped.into_iter().map(|ksids| ksids.first().copied()).collect())
    }
}

fn first_shard_name(keyspace: &Keyspace) -> GateResult<String> {
    keyspace
        .shards
        .first()
        .map(|s| s.name.clone())
        .ok_or_else(|| GateError::schema(format!("keyspace {} has no shards", keyspace.name)))
}

fn routed_queries(
    keyspace: &Keyspace,
    shards: Vec<RoutedShard>,
    binds: &BindVars,
    render: impl Fn(Option<&[Expr]>) -> String,
) -> Vec<ShardQuery> {
    shards
        .into_iter()
        .map(|shard| ShardQuery {
            sql: render(shard.values.as_deref()),
            target: ShardTarget::new(keyspace.name.clone(), shard.name),
            binds: binds.clone(),
        })
        .collect()
}

fn literal_rows(rows: &[Row]) -> Vec<Vec<Expr>> {
    rows.iter()
        .map(|row| row.iter().cloned().map(Expr::Literal).collect())
        .collect()
}

fn position(columns: &[String], column: &str) -> Option<usize> {
    columns.iter().position(|c| c.eq_ignore_ascii_case(column))
}

fn position_in_scope(scope: &Scope, column: &str) -> Option<usize> {
    scope
        .columns
        .iter()
        .position(|c| c.name.eq_ignore_ascii_case(column))
}

/// Values of `wanted` in `row`; absent columns are NULL.
fn column_values(columns: &[String], row: &[Value], wanted: &[String]) -> Vec<Value> {
    wanted
        .iter()
        .map(|column| {
            position(columns, column)
                .and_then(|idx| row.get(idx).cloned())
                .unwrap_or(Value::Null)
        })
        .collect()
}

/// Lookup entries of the rows still kept, skipping NULL values.
fn entries_for(
    columns: &[String],
    rows: &[Row],
    keep: &[Option<KeyspaceId>],
    binding: &ColumnVindex,
) -> Vec<LookupEntry> {
    rows.iter()
        .zip(keep)
        .filter_map(|(row, ksid)| {
            let ksid = (*ksid)?;
            let values = column_values(columns, row, &binding.columns);
            if values.iter().any(Value::is_null) {
                return None;
            }
            Some((values, ksid))
        })
        .collect()
}

/// Drops kept rows whose entry failed verification.
fn drop_unverified(
    columns: &[String],
    rows: &[Row],
    keep: &mut [Option<KeyspaceId>],
    binding: &ColumnVindex,
    entries: &[LookupEntry],
    verified: &[bool],
) {
    let failed: Vec<&LookupEntry> = entries
        .iter()
        .zip(verified)
        .filter(|(_, ok)| !**ok)
        .map(|(entry, _)| entry)
        .collect();
    if failed.is_empty() {
        return;
    }
    for (row, slot) in rows.iter().zip(keep.iter_mut()) {
        let Some(ksid) = *slot else {
            continue;
        };
        let values = column_values(columns, row, &binding.columns);
        if failed.iter().any(|(v, k)| *k == ksid && *v == values) {
            debug!(values = %display_values(&values), "skipping row whose vindex entry belongs elsewhere");
            *slot = None;
        }
    }
}
