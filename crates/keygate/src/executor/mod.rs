//! Plan execution.
//!
//! The executor turns a `Plan` into per-shard statements, fans them out
//! concurrently, merges what comes back, and performs the lookup-vindex
//! side effects of DML inside the session's transaction. Recursive work
//! (lookup reads and writes, join legs, subqueries) re-enters through
//! `execute_plan`.

mod dml;
mod join;
mod merge;
mod resolve;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{self, FuturesUnordered, StreamExt};
use keygate_twopc::twopc::Coordinator;
use tracing::{debug, warn};

use crate::config::GateConfig;
use crate::error::{GateError, GateResult, ShardError, Warning, ER_QUERY_INTERRUPTED};
use crate::key::KeyspaceId;
use crate::metrics::GateMetrics;
use crate::planner::route::bind_route_values;
use crate::planner::{Merge, Plan, Route, RouteOpcode, RouteValues, SelectPlan, VindexColumn, VindexFuncPlan};
use crate::sequence::SequenceAllocator;
use crate::session::Session;
use crate::shard::{ShardRowStream, ShardTarget};
use crate::sql::ast::{Expr, Statement, TableName};
use crate::sql::eval::eval_const;
use crate::sql::parse::Directives;
use crate::sql::query::window_bound;
use crate::topology::{TabletRole, Topology};
use crate::value::{BindVars, Field, FieldType, QueryResult, Value};
use crate::vschema::{Keyspace, VSchema};

pub(crate) use merge::merge_results;

/// Per-statement inputs shared by every step of one execution.
pub(crate) struct Ctx {
    pub vschema: Arc<VSchema>,
    pub directives: Directives,
}

/// How a read picks its connection inside a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Access {
    /// Reads inside a transaction join it.
    Default,
    /// Reads use the transaction only on shards that already participate.
    IfParticipant,
}

/// One statement bound for one shard.
#[derive(Clone, Debug)]
pub(crate) struct ShardQuery {
    pub target: ShardTarget,
    pub sql: String,
    pub binds: BindVars,
}

/// A shard chosen by routing; `values` is its share of an IN-routed list.
#[derive(Clone, Debug)]
pub(crate) struct RoutedShard {
    pub name: String,
    pub values: Option<Vec<Expr>>,
}

pub struct Executor {
    topology: Arc<dyn Topology>,
    sequences: SequenceAllocator,
    coordinator: Arc<Coordinator>,
    metrics: Arc<GateMetrics>,
    config: GateConfig,
}

impl Executor {
    pub fn new(
        topology: Arc<dyn Topology>,
        coordinator: Arc<Coordinator>,
        metrics: Arc<GateMetrics>,
        config: GateConfig,
    ) -> Self {
        Self {
            sequences: SequenceAllocator::new(topology.clone()),
            topology,
            coordinator,
            metrics,
            config,
        }
    }

    /// Runs `plan`. Writes outside a transaction get an implicit one that is
    /// committed on success and rolled back on failure.
    pub(crate) fn execute_plan<'a>(
        &'a self,
        session: &'a mut Session,
        ctx: &'a Ctx,
        plan: &'a Plan,
        binds: &'a BindVars,
        access: Access,
    ) -> BoxFuture<'a, GateResult<QueryResult>> {
        async move {
            if plan.is_write() && !session.txn.is_active() {
                session.txn.begin();
                return match self.run_plan(session, ctx, plan, binds, access).await {
                    Ok(result) => {
                        self.commit(session).await?;
                        Ok(result)
                    }
                    Err(err) => {
                        session.txn.rollback().await;
                        Err(err)
                    }
                };
            }
            self.run_plan(session, ctx, plan, binds, access).await
        }
        .boxed()
    }

    async fn run_plan(
        &self,
        session: &mut Session,
        ctx: &Ctx,
        plan: &Plan,
        binds: &BindVars,
        access: Access,
    ) -> GateResult<QueryResult> {
        match plan {
            Plan::Select(select) => self.execute_select(session, ctx, select, binds, access).await,
            Plan::Dual { keyspace, query } => {
                let queries = vec![ShardQuery {
                    target: ShardTarget::new(keyspace.name.clone(), first_shard(keyspace)?),
                    sql: query.to_string(),
                    binds: binds.clone(),
                }];
                // A shard downgraded to a warning leaves no result at all.
                let mut results = self.dispatch(session, ctx, queries, false, access).await?;
                Ok(results.pop().unwrap_or_default())
            }
            Plan::Join(join) => self.execute_join(session, ctx, join, binds).await,
            Plan::Subquery(subquery) => {
                self.execute_subquery(session, ctx, subquery, binds, access)
                    .await
            }
            Plan::VindexFunc(func) => self.execute_vindex_func(session, ctx, func, binds).await,
            Plan::NextValues { sequence, count } => {
                let count = eval_const(count, binds)?;
                let count = count
                    .as_i64()
                    .ok_or_else(|| GateError::Syntax(format!("invalid sequence count {count}")))?;
                let first = self.sequences.next(&ctx.vschema, sequence, count).await?;
                Ok(QueryResult {
                    fields: vec![Field::new("nextval", FieldType::Int64)],
                    rows: vec![vec![Value::Int(first)]],
                    ..QueryResult::default()
                })
            }
            Plan::Insert(insert) => self.execute_insert(session, ctx, insert, binds).await,
            Plan::Update(update) => self.execute_update(session, ctx, update, binds).await,
            Plan::Delete(delete) => self.execute_delete(session, ctx, delete, binds).await,
            Plan::Truncate { keyspace, table } => {
                let sql = Statement::Truncate(TableName::new(table.clone())).to_string();
                let queries = keyspace
                    .shards
                    .iter()
                    .map(|shard| ShardQuery {
                        target: ShardTarget::new(keyspace.name.clone(), shard.name.clone()),
                        sql: sql.clone(),
                        binds: binds.clone(),
                    })
                    .collect();
                let results = self.dispatch(session, ctx, queries, true, access).await?;
                Ok(QueryResult::affected(
                    results.iter().map(|r| r.rows_affected).sum(),
                ))
            }
            Plan::Begin => {
                // MySQL semantics: BEGIN inside a transaction commits it first.
                if session.txn.is_active() {
                    self.commit(session).await?;
                }
                session.txn.begin();
                Ok(QueryResult::default())
            }
            Plan::Commit => {
                self.commit(session).await?;
                Ok(QueryResult::default())
            }
            Plan::Rollback => {
                session.txn.rollback().await;
                Ok(QueryResult::default())
            }
            Plan::Use { keyspace, role } => {
                session.target_keyspace = keyspace.clone();
                session.role = role.unwrap_or_default();
                Ok(QueryResult::default())
            }
        }
    }

    /// Commits the session transaction, keeping any commit warnings.
    pub(crate) async fn commit(&self, session: &mut Session) -> GateResult<()> {
        let mode = session.transaction_mode;
        let warnings = session.txn.commit(mode, &self.coordinator).await?;
        session.warnings.extend(warnings);
        Ok(())
    }

    async fn execute_select(
        &self,
        session: &mut Session,
        ctx: &Ctx,
        plan: &SelectPlan,
        binds: &BindVars,
        access: Access,
    ) -> GateResult<QueryResult> {
        let shards = self.route_shards(session, ctx, &plan.route, binds).await?;
        let mut query = plan.query.clone();
        if let Merge::Ordered {
            limit: Some(limit),
            offset,
            ..
        } = &plan.merge
        {
            let limit = window_bound(Some(limit), binds)?.unwrap_or(0);
            let offset = window_bound(offset.as_ref(), binds)?.unwrap_or(0);
            let window = i64::try_from(limit.saturating_add(offset)).unwrap_or(i64::MAX);
            query.limit = Some(Expr::Literal(Value::Int(window)));
        }

        let queries = if shards.is_empty() {
            // Nothing can match; one shard still answers with the result shape.
            let shard = first_shard(&plan.route.keyspace)?;
            query.selection = Some(Expr::always_false());
            vec![ShardQuery {
                target: ShardTarget::new(plan.route.keyspace.name.clone(), shard),
                sql: query.to_string(),
                binds: binds.clone(),
            }]
        } else {
            shards
                .into_iter()
                .map(|shard| {
                    let mut routed = query.clone();
                    if let Some(values) = &shard.values {
                        bind_route_values(&mut routed.selection, values);
                    }
                    ShardQuery {
                        target: ShardTarget::new(plan.route.keyspace.name.clone(), shard.name),
                        sql: routed.to_string(),
                        binds: binds.clone(),
                    }
                })
                .collect()
        };
        debug!(
            keyspace = %plan.route.keyspace.name,
            shards = queries.len(),
            opcode = ?plan.route.opcode,
            "routing select"
        );
        let results = self.dispatch(session, ctx, queries, false, access).await?;
        merge_results(plan, results, binds)
    }

    /// Shards a route reaches. Vindex values are resolved here, through the
    /// lookup tables when the vindex is not functional.
    pub(crate) async fn route_shards(
        &self,
        session: &mut Session,
        ctx: &Ctx,
        route: &Route,
        binds: &BindVars,
    ) -> GateResult<Vec<RoutedShard>> {
        let keyspace = &route.keyspace;
        let all = || {
            keyspace
                .shards
                .iter()
                .map(|s| RoutedShard {
                    name: s.name.clone(),
                    values: None,
                })
                .collect::<Vec<_>>()
        };
        let vindex = || {
            route
                .vindex
                .clone()
                .ok_or_else(|| GateError::Internal("vindex route without a vindex".to_string()))
        };
        match (route.opcode, &route.values) {
            (RouteOpcode::Unsharded, _) => Ok(vec![RoutedShard {
                name: first_shard(keyspace)?,
                values: None,
            }]),
            (RouteOpcode::Scatter, _) => Ok(all()),
            (RouteOpcode::EqualUnique | RouteOpcode::Equal, RouteValues::Equal(exprs)) => {
                let vindex = vindex()?;
                let values = exprs
                    .iter()
                    .map(|e| eval_const(e, binds))
                    .collect::<Result<Vec<_>, _>>()?;
                let ksids = self
                    .map_vindex(session, ctx, &vindex, &[values])
                    .await?
                    .pop()
                    .unwrap_or_default();
                let mut positions = Vec::with_capacity(ksids.len());
                for ksid in &ksids {
                    positions.push(shard_index(keyspace, ksid)?);
                }
                positions.sort_unstable();
                positions.dedup();
                Ok(positions
                    .into_iter()
                    .map(|idx| RoutedShard {
                        name: keyspace.shards[idx].name.clone(),
                        values: None,
                    })
                    .collect())
            }
            (RouteOpcode::In, RouteValues::In(exprs)) => {
                let vindex = vindex()?;
                let values = exprs
                    .iter()
                    .map(|e| eval_const(e, binds))
                    .collect::<Result<Vec<_>, _>>()?;
                let inputs: Vec<Vec<Value>> = values.iter().map(|v| vec![v.clone()]).collect();
                let mapped = self.map_vindex(session, ctx, &vindex, &inputs).await?;
                let mut per_shard: BTreeMap<usize, Vec<Expr>> = BTreeMap::new();
                for (value, ksids) in values.into_iter().zip(mapped) {
                    for ksid in &ksids {
                        let list = per_shard.entry(shard_index(keyspace, ksid)?).or_default();
                        let literal = Expr::Literal(value.clone());
                        if !list.contains(&literal) {
                            list.push(literal);
                        }
                    }
                }
                Ok(per_shard
                    .into_iter()
                    .map(|(idx, values)| RoutedShard {
                        name: keyspace.shards[idx].name.clone(),
                        values: Some(values),
                    })
                    .collect())
            }
            (opcode, values) => Err(GateError::Internal(format!(
                "route {opcode:?} carries mismatched values {values:?}"
            ))),
        }
    }

    /// Sends each query to its shard concurrently and collects the results
    /// in query order.
    ///
    /// Writes, and reads inside a transaction, run on the transaction's
    /// sub-transaction for the shard. Under `SCATTER_ERRORS_AS_WARNINGS` a
    /// failed read becomes a session warning and contributes no rows.
    pub(crate) async fn dispatch(
        &self,
        session: &mut Session,
        ctx: &Ctx,
        queries: Vec<ShardQuery>,
        write: bool,
        access: Access,
    ) -> GateResult<Vec<QueryResult>> {
        let in_tx = session.txn.is_active();
        if write && !in_tx {
            return Err(GateError::Internal(
                "write dispatched outside a transaction".to_string(),
            ));
        }
        let mode = session.transaction_mode;
        let mut calls = Vec::with_capacity(queries.len());
        for query in queries {
            let (conn, tx) = if write || (in_tx && access == Access::Default) {
                let (conn, tx) = session
                    .txn
                    .join(&query.target, self.topology.as_ref(), mode)
                    .await?;
                (conn, Some(tx))
            } else if let Some(existing) = session.txn.find(&query.target).filter(|_| in_tx) {
                (existing.conn.clone(), Some(existing.tx))
            } else {
                let role = match access {
                    Access::Default => session.role,
                    Access::IfParticipant => TabletRole::Primary,
                };
                let conn =
                    self.topology
                        .resolve(&query.target.keyspace, &query.target.shard, role)?;
                (conn, None)
            };
            calls.push((query, conn, tx));
        }

        let timeout = self.shard_timeout(ctx);
        let warnings_mode = ctx.directives.scatter_errors_as_warnings && !write;
        let mut futs = FuturesUnordered::new();
        for (idx, (query, conn, tx)) in calls.into_iter().enumerate() {
            futs.push(async move {
                debug!(target = %query.target, sql = %query.sql, tx = ?tx, "shard query");
                let result =
                    match tokio::time::timeout(timeout, conn.execute(&query.sql, &query.binds, tx))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(ShardError::interrupted()),
                    };
                (idx, query.target, result)
            });
        }

        let mut results = Vec::with_capacity(futs.len());
        let mut failure = None;
        while let Some((idx, target, result)) = futs.next().await {
            match result {
                Ok(result) => results.push((idx, result)),
                Err(err) => self.fold_shard_error(session, warnings_mode, &target, err, &mut failure),
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }
        results.sort_by_key(|(idx, _)| *idx);
        Ok(results.into_iter().map(|(_, result)| result).collect())
    }

    /// Opens an autocommit stream on each query's shard concurrently.
    ///
    /// Opening is guarded like `dispatch`: the shard timeout covers the
    /// whole stream and, under `SCATTER_ERRORS_AS_WARNINGS`, a shard that
    /// fails to open becomes a warning. A failure after rows started
    /// flowing ends the stream with that error.
    pub(crate) async fn open_streams(
        &self,
        session: &mut Session,
        ctx: &Ctx,
        queries: Vec<ShardQuery>,
    ) -> GateResult<Vec<(Vec<Field>, ShardRowStream)>> {
        let mut calls = Vec::with_capacity(queries.len());
        for query in queries {
            let conn = self
                .topology
                .resolve(&query.target.keyspace, &query.target.shard, session.role)?;
            calls.push((query, conn));
        }

        let deadline = tokio::time::Instant::now() + self.shard_timeout(ctx);
        let warnings_mode = ctx.directives.scatter_errors_as_warnings;
        let mut futs = FuturesUnordered::new();
        for (idx, (query, conn)) in calls.into_iter().enumerate() {
            futs.push(async move {
                debug!(target = %query.target, sql = %query.sql, "shard stream");
                let opened = match tokio::time::timeout_at(
                    deadline,
                    conn.stream_execute(&query.sql, &query.binds),
                )
                .await
                {
                    Ok(opened) => opened,
                    Err(_) => Err(ShardError::interrupted()),
                };
                (idx, query.target, opened)
            });
        }

        let mut streams = Vec::with_capacity(futs.len());
        let mut failure = None;
        while let Some((idx, target, opened)) = futs.next().await {
            match opened {
                Ok((fields, rows)) => streams.push((idx, (fields, rows_until(rows, deadline)))),
                Err(err) => self.fold_shard_error(session, warnings_mode, &target, err, &mut failure),
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }
        streams.sort_by_key(|(idx, _)| *idx);
        Ok(streams.into_iter().map(|(_, stream)| stream).collect())
    }

    fn shard_timeout(&self, ctx: &Ctx) -> Duration {
        ctx.directives
            .query_timeout
            .unwrap_or(self.config.query_timeout)
    }

    /// Records a failed shard call as a session warning or as the
    /// statement's first error.
    fn fold_shard_error(
        &self,
        session: &mut Session,
        warnings_mode: bool,
        target: &ShardTarget,
        err: ShardError,
        failure: &mut Option<GateError>,
    ) {
        let shard = target.to_string();
        self.metrics
            .record_shard_error(err.code == ER_QUERY_INTERRUPTED, warnings_mode);
        if warnings_mode {
            warn!(shard = %shard, code = err.code, error = %err.message, "shard error downgraded to warning");
            session.warnings.push(Warning::from_shard_error(&shard, &err));
        } else if failure.is_none() {
            *failure = Some(GateError::from_shard(&shard, err));
        }
    }

    async fn execute_vindex_func(
        &self,
        session: &mut Session,
        ctx: &Ctx,
        plan: &VindexFuncPlan,
        binds: &BindVars,
    ) -> GateResult<QueryResult> {
        let values = plan
            .values
            .iter()
            .map(|e| eval_const(e, binds))
            .collect::<Result<Vec<_>, _>>()?;
        let inputs: Vec<Vec<Value>> = values.iter().map(|v| vec![v.clone()]).collect();
        let mapped = self.map_vindex(session, ctx, &plan.vindex, &inputs).await?;

        let mut result = QueryResult::with_fields(
            plan.columns
                .iter()
                .map(|(name, _)| Field::new(name.clone(), FieldType::VarBinary))
                .collect(),
        );
        for (value, ksids) in values.iter().zip(mapped) {
            for ksid in ksids {
                result.rows.push(
                    plan.columns
                        .iter()
                        .map(|(_, column)| match column {
                            VindexColumn::Id => Value::Bytes(value.to_bytes()),
                            VindexColumn::KeyspaceId => Value::Bytes(ksid.as_bytes().to_vec()),
                        })
                        .collect(),
                );
            }
        }
        Ok(result)
    }
}

/// Ends `rows` with a deadline error once `deadline` passes.
fn rows_until(rows: ShardRowStream, deadline: tokio::time::Instant) -> ShardRowStream {
    stream::unfold(Some(rows), move |state| async move {
        let mut rows = state?;
        match tokio::time::timeout_at(deadline, rows.next()).await {
            Ok(Some(row)) => Some((row, Some(rows))),
            Ok(None) => None,
            Err(_) => Some((Err(ShardError::interrupted()), None)),
        }
    })
    .boxed()
}

fn first_shard(keyspace: &Keyspace) -> GateResult<String> {
    keyspace
        .shards
        .first()
        .map(|s| s.name.clone())
        .ok_or_else(|| GateError::schema(format!("keyspace {} has no shards", keyspace.name)))
}

/// Position of the shard owning `ksid`.
pub(crate) fn shard_index(keyspace: &Keyspace, ksid: &KeyspaceId) -> GateResult<usize> {
    keyspace
        .shards
        .iter()
        .position(|s| s.key_range.contains(ksid))
        .ok_or_else(|| {
            GateError::vindex(format!(
                "no shard of keyspace {} owns keyspace id {ksid}",
                keyspace.name
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stalled_stream_ends_with_an_interruption() {
        let rows: ShardRowStream = stream::iter(vec![Ok(vec![Value::Int(1)])])
            .chain(stream::pending())
            .boxed();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(20);
        let seen: Vec<_> = rows_until(rows, deadline).collect().await;

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].as_ref().ok(), Some(&vec![Value::Int(1)]));
        let err = seen[1].as_ref().expect_err("deadline passed");
        assert_eq!(err.code, ER_QUERY_INTERRUPTED);
    }

    #[tokio::test]
    async fn finished_stream_is_left_alone() {
        let rows: ShardRowStream = stream::iter(vec![Ok(vec![Value::Int(1)]), Ok(vec![Value::Int(2)])]).boxed();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let seen: Vec<_> = rows_until(rows, deadline).collect().await;
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(Result::is_ok));
    }
}
