//! The router front door.
//!
//! `Gate` owns the current schema snapshot, the executor and the background
//! tasks (schema watcher and two-phase commit recovery). Sessions are owned
//! by callers and passed `&mut` into every call.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{self, StreamExt};
use keygate_twopc::twopc::{spawn_recovery_loop, Coordinator, RecoveryReport};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::GateConfig;
use crate::error::{GateError, GateResult};
use crate::executor::{shard_index, Access, Ctx, Executor, ShardQuery};
use crate::key::{KeyRange, KeyspaceId};
use crate::metrics::{GateMetrics, GateMetricsSnapshot};
use crate::planner::route::bind_route_values;
use crate::planner::{self, shard_table_name, Merge, Plan};
use crate::session::Session;
use crate::shard::{ShardRowStream, ShardTarget};
use crate::split::{split_query, QuerySplit, SplitOptions};
use crate::sql::ast::{Expr, Statement};
use crate::sql::parse::{parse, Directives, ParsedStatement};
use crate::topology::Topology;
use crate::txn::TopologyDirectory;
use crate::value::{BindVars, Field, QueryResult, Value};
use crate::vindex::Vindex;
use crate::vschema::{VSchema, VSchemaSource};

pub struct Gate {
    vschema: Arc<RwLock<Arc<VSchema>>>,
    topology: Arc<dyn Topology>,
    executor: Executor,
    coordinator: Arc<Coordinator>,
    metrics: Arc<GateMetrics>,
    config: GateConfig,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gate {
    /// Builds the router over `topology` with the initial schema `source`.
    /// Background tasks are not running until `start`.
    pub fn new(
        topology: Arc<dyn Topology>,
        source: VSchemaSource,
        config: GateConfig,
    ) -> GateResult<Self> {
        let vschema = build_vschema(topology.as_ref(), Arc::new(source))?;
        let coordinator = Arc::new(Coordinator::new(
            Arc::new(TopologyDirectory::new(topology.clone())),
            config.twopc.clone(),
        ));
        let metrics = Arc::new(GateMetrics::default());
        let executor = Executor::new(
            topology.clone(),
            coordinator.clone(),
            metrics.clone(),
            config.clone(),
        );
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            vschema: Arc::new(RwLock::new(Arc::new(vschema))),
            topology,
            executor,
            coordinator,
            metrics,
            config,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the schema watcher and the recovery loop.
    pub fn start(&self) {
        let watcher = spawn_schema_watcher(
            self.topology.clone(),
            self.vschema.clone(),
            self.metrics.clone(),
            self.config.schema_watch_interval,
            self.shutdown_tx.subscribe(),
        );
        let recovery = spawn_recovery_loop(self.coordinator.clone(), self.shutdown_tx.subscribe());
        self.tasks.lock().extend([watcher, recovery]);
        info!(
            transaction_mode = %self.config.transaction_mode,
            query_timeout_ms = self.config.query_timeout.as_millis() as u64,
            "router started"
        );
    }

    /// Signals the background tasks and waits for them to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
    }

    pub fn new_session(&self) -> Session {
        Session::new(self.config.transaction_mode)
    }

    /// Current schema snapshot.
    pub fn vschema(&self) -> Arc<VSchema> {
        self.vschema.read().clone()
    }

    /// Replaces the schema document. The old snapshot stays in place when
    /// the new one does not validate.
    pub fn reload_schema(&self, source: VSchemaSource) -> GateResult<()> {
        let vschema = match build_vschema(self.topology.as_ref(), Arc::new(source)) {
            Ok(vschema) => vschema,
            Err(err) => {
                self.metrics.record_schema_watch_error();
                return Err(err);
            }
        };
        *self.vschema.write() = Arc::new(vschema);
        self.metrics.record_schema_reload();
        info!("schema reloaded");
        Ok(())
    }

    pub fn metrics(&self) -> GateMetricsSnapshot {
        self.metrics.snapshot(self.coordinator.stats())
    }

    /// Runs one two-phase commit recovery pass immediately.
    pub async fn recover_once(&self) -> GateResult<RecoveryReport> {
        Ok(self.coordinator.recover_once().await?)
    }

    /// Executes one statement. Warnings of the previous statement are
    /// cleared first.
    pub async fn execute(
        &self,
        session: &mut Session,
        sql: &str,
        binds: &BindVars,
    ) -> GateResult<QueryResult> {
        session.warnings.clear();
        let (ctx, plan) = self.prepare(session, sql)?;
        let kind = plan.kind().as_str();
        let started = Instant::now();
        let result = self
            .executor
            .execute_plan(session, &ctx, &plan, binds, Access::Default)
            .instrument(info_span!("execute", plan = kind))
            .await;
        self.metrics.record_query(kind, result.is_ok(), started.elapsed());
        match &result {
            Ok(result) => debug!(plan = kind, rows = result.row_count(), "statement done"),
            Err(err) => debug!(plan = kind, code = err.code(), error = %err, "statement failed"),
        }
        result
    }

    /// Executes a read and yields its rows lazily. Unordered scatter reads
    /// outside a transaction stream straight from the shards; everything
    /// else is computed first.
    pub async fn stream_execute(
        &self,
        session: &mut Session,
        sql: &str,
        binds: &BindVars,
    ) -> GateResult<(Vec<Field>, ShardRowStream)> {
        session.warnings.clear();
        let (ctx, plan) = self.prepare(session, sql)?;
        let streamable = match &plan {
            Plan::Select(select) => {
                matches!(select.merge, Merge::Pass | Merge::Concat) && !session.in_transaction()
            }
            _ => false,
        };
        if !streamable {
            let result = self
                .executor
                .execute_plan(session, &ctx, &plan, binds, Access::Default)
                .await?;
            let rows = stream::iter(result.rows.into_iter().map(Ok)).boxed();
            return Ok((result.fields, rows));
        }
        let Plan::Select(select) = &plan else {
            return Err(GateError::Internal("streaming a non-select plan".to_string()));
        };

        let shards = self
            .executor
            .route_shards(session, &ctx, &select.route, binds)
            .await?;
        if shards.is_empty() {
            let result = self
                .executor
                .execute_plan(session, &ctx, &plan, binds, Access::Default)
                .await?;
            return Ok((result.fields, stream::empty().boxed()));
        }
        let keyspace = &select.route.keyspace.name;
        let queries = shards
            .into_iter()
            .map(|shard| {
                let mut query = select.query.clone();
                if let Some(values) = &shard.values {
                    bind_route_values(&mut query.selection, values);
                }
                ShardQuery {
                    target: ShardTarget::new(keyspace.clone(), shard.name),
                    sql: query.to_string(),
                    binds: binds.clone(),
                }
            })
            .collect();
        let opened = self.executor.open_streams(session, &ctx, queries).await?;
        let fields = opened
            .iter()
            .map(|(fields, _)| fields)
            .find(|fields| !fields.is_empty())
            .cloned()
            .unwrap_or_default();
        debug!(keyspace = %keyspace, shards = opened.len(), "streaming scatter");
        let streams = opened.into_iter().map(|(_, rows)| rows);
        Ok((fields, stream::select_all(streams).boxed()))
    }

    pub async fn begin(&self, session: &mut Session) -> GateResult<()> {
        self.run_session_plan(session, Plan::Begin).await
    }

    pub async fn commit(&self, session: &mut Session) -> GateResult<()> {
        self.run_session_plan(session, Plan::Commit).await
    }

    pub async fn rollback(&self, session: &mut Session) -> GateResult<()> {
        self.run_session_plan(session, Plan::Rollback).await
    }

    /// Splits a full-scan SELECT into `opts.split_count` range queries.
    pub fn split_query(
        &self,
        session: &Session,
        sql: &str,
        binds: &BindVars,
        opts: &SplitOptions,
    ) -> GateResult<Vec<QuerySplit>> {
        let parsed = self.parse(sql)?;
        split_query(
            &self.vschema(),
            &parsed.statement,
            binds,
            session.target_keyspace.as_deref(),
            opts,
        )
    }

    /// Sends `sql` to the shards owning the given entities, restricting
    /// each shard to its own entity values.
    pub async fn execute_entity_ids(
        &self,
        session: &mut Session,
        sql: &str,
        binds: &BindVars,
        keyspace: &str,
        entity_column: &str,
        entities: &[(Value, KeyspaceId)],
    ) -> GateResult<QueryResult> {
        session.warnings.clear();
        let parsed = self.parse(sql)?;
        let ctx = Ctx {
            vschema: self.vschema(),
            directives: parsed.directives,
        };
        let keyspace = ctx.vschema.keyspace(keyspace)?;
        let mut per_shard: BTreeMap<usize, Vec<Expr>> = BTreeMap::new();
        for (value, ksid) in entities {
            let list = per_shard.entry(shard_index(&keyspace, ksid)?).or_default();
            let literal = Expr::Literal(value.clone());
            if !list.contains(&literal) {
                list.push(literal);
            }
        }

        let write = parsed.statement.is_dml();
        let mut queries = Vec::with_capacity(per_shard.len());
        for (idx, values) in per_shard {
            let filter = Expr::in_list(Expr::column(entity_column), values);
            let statement = restrict(&parsed.statement, filter)?;
            queries.push(ShardQuery {
                target: ShardTarget::new(keyspace.name.clone(), keyspace.shards[idx].name.clone()),
                sql: statement.to_string(),
                binds: binds.clone(),
            });
        }
        let results = self.dispatch_direct(session, &ctx, queries, write).await?;
        Ok(combine(results, write))
    }

    /// Sends `sql` to every shard overlapping `ranges`. Rows of partially
    /// covered shards are filtered by their primary vindex keyspace id.
    pub async fn execute_key_ranges(
        &self,
        session: &mut Session,
        sql: &str,
        binds: &BindVars,
        keyspace: &str,
        ranges: &[KeyRange],
    ) -> GateResult<QueryResult> {
        session.warnings.clear();
        let parsed = self.parse(sql)?;
        let ctx = Ctx {
            vschema: self.vschema(),
            directives: parsed.directives,
        };
        let keyspace = ctx.vschema.keyspace(keyspace)?;
        let write = parsed.statement.is_dml();
        let statement = strip_qualifiers(&parsed.statement);

        let mut targets = Vec::new();
        let mut partial = Vec::new();
        for shard in &keyspace.shards {
            if !ranges.iter().any(|r| r.overlaps(&shard.key_range)) {
                continue;
            }
            let covered = !keyspace.sharded || ranges.iter().any(|r| r.covers(&shard.key_range));
            targets.push(ShardQuery {
                target: ShardTarget::new(keyspace.name.clone(), shard.name.clone()),
                sql: statement.to_string(),
                binds: binds.clone(),
            });
            partial.push(!covered);
        }
        let filter = if partial.iter().any(|p| *p) {
            if write {
                return Err(GateError::unsupported(
                    "DML on a key range that covers part of a shard",
                ));
            }
            Some(self.row_filter(&ctx.vschema, &parsed.statement, session.target_keyspace.as_deref())?)
        } else {
            None
        };

        let mut results = self.dispatch_direct(session, &ctx, targets, write).await?;
        if let Some((column, vindex)) = filter {
            for (result, partial) in results.iter_mut().zip(&partial) {
                if !partial {
                    continue;
                }
                let idx = result.column_index(&column).ok_or_else(|| {
                    GateError::unsupported(format!(
                        "key range filtering needs column {column} in the select list"
                    ))
                })?;
                let mut kept = Vec::with_capacity(result.rows.len());
                for row in std::mem::take(&mut result.rows) {
                    let value = row.get(idx).cloned().unwrap_or(Value::Null);
                    if let Some(ksid) = vindex.map_functional(&value)? {
                        if ranges.iter().any(|r| r.contains(&ksid)) {
                            kept.push(row);
                        }
                    }
                }
                result.rows = kept;
            }
        }
        Ok(combine(results, write))
    }

    fn parse(&self, sql: &str) -> GateResult<ParsedStatement> {
        parse(sql).inspect_err(|err| {
            self.metrics.record_parse_error();
            debug!(error = %err, "parse failed");
        })
    }

    fn prepare(&self, session: &Session, sql: &str) -> GateResult<(Ctx, Plan)> {
        let parsed = self.parse(sql)?;
        let ctx = Ctx {
            vschema: self.vschema(),
            directives: parsed.directives,
        };
        let plan = planner::plan(
            &parsed.statement,
            &ctx.vschema,
            session.target_keyspace.as_deref(),
        )?;
        Ok((ctx, plan))
    }

    async fn run_session_plan(&self, session: &mut Session, plan: Plan) -> GateResult<()> {
        let ctx = Ctx {
            vschema: self.vschema(),
            directives: Directives::default(),
        };
        self.executor
            .execute_plan(session, &ctx, &plan, &BindVars::new(), Access::Default)
            .await
            .map(|_| ())
    }

    /// Dispatches prepared shard statements, wrapping writes outside a
    /// transaction in an implicit one.
    async fn dispatch_direct(
        &self,
        session: &mut Session,
        ctx: &Ctx,
        queries: Vec<ShardQuery>,
        write: bool,
    ) -> GateResult<Vec<QueryResult>> {
        let implicit = write && !session.in_transaction();
        if implicit {
            session.txn.begin();
        }
        let result = self
            .executor
            .dispatch(session, ctx, queries, write, Access::Default)
            .await;
        if implicit {
            match &result {
                Ok(_) => self.executor.commit(session).await?,
                Err(_) => session.txn.rollback().await,
            }
        }
        result
    }

    /// Primary vindex column and vindex used to filter key-range reads.
    fn row_filter(
        &self,
        vschema: &VSchema,
        statement: &Statement,
        target: Option<&str>,
    ) -> GateResult<(String, Arc<Vindex>)> {
        let Statement::Select(select) = statement else {
            return Err(GateError::unsupported("key range filtering of this statement"));
        };
        let [from] = select.from.as_slice() else {
            return Err(GateError::unsupported("key range filtering of a join"));
        };
        let table = vschema.resolve_table(&from.table, target)?;
        let primary = table.primary().ok_or_else(|| {
            GateError::schema(format!("table {} has no primary vindex", table.name))
        })?;
        let [column] = primary.columns.as_slice() else {
            return Err(GateError::unsupported("key range filtering on a multi-column vindex"));
        };
        if !primary.vindex.is_functional() {
            return Err(GateError::unsupported(format!(
                "key range filtering through lookup vindex {}",
                primary.vindex.name
            )));
        }
        Ok((column.clone(), primary.vindex.clone()))
    }
}

fn build_vschema(topology: &dyn Topology, source: Arc<VSchemaSource>) -> GateResult<VSchema> {
    VSchema::build(source, &|keyspace: &str| topology.shard_names(keyspace))
}

/// Shard names per keyspace, for change detection.
fn shard_map(vschema: &VSchema) -> Vec<(String, Vec<String>)> {
    vschema
        .keyspaces()
        .map(|ks| (ks.name.clone(), ks.shard_names()))
        .collect()
}

/// Swaps in a new snapshot for every published schema document, and
/// rebuilds the current one when the shard map changes.
fn spawn_schema_watcher(
    topology: Arc<dyn Topology>,
    vschema: Arc<RwLock<Arc<VSchema>>>,
    metrics: Arc<GateMetrics>,
    interval: std::time::Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut updates = topology.watch();
        let _ = updates.borrow_and_update();
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }
                changed = updates.changed() => {
                    if changed.is_err() {
                        warn!("schema watch closed");
                        return;
                    }
                    let update = updates.borrow_and_update().clone();
                    match build_vschema(topology.as_ref(), update.source) {
                        Ok(next) => {
                            *vschema.write() = Arc::new(next);
                            metrics.record_schema_reload();
                            info!(generation = update.generation, "applied schema update");
                        }
                        Err(err) => {
                            metrics.record_schema_watch_error();
                            warn!(generation = update.generation, error = %err, "rejected schema update");
                        }
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    let current = vschema.read().clone();
                    match build_vschema(topology.as_ref(), current.source.clone()) {
                        Ok(next) if shard_map(&next) != shard_map(&current) => {
                            *vschema.write() = Arc::new(next);
                            metrics.record_schema_reload();
                            info!("shard map changed; schema rebuilt");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            metrics.record_schema_watch_error();
                            warn!(error = %err, "shard map refresh failed");
                        }
                    }
                }
            }
        }
    })
}

/// Copy of a statement with the keyspace qualifier removed from its tables.
fn strip_qualifiers(statement: &Statement) -> Statement {
    let mut statement = statement.clone();
    match &mut statement {
        Statement::Select(select) => {
            for from in &mut select.from {
                from.table = shard_table_name(&from.table);
            }
        }
        Statement::Insert(insert) => insert.table = shard_table_name(&insert.table),
        Statement::Update(update) => update.table = shard_table_name(&update.table),
        Statement::Delete(delete) => delete.table = shard_table_name(&delete.table),
        Statement::Truncate(table) => *table = shard_table_name(table),
        _ => {}
    }
    statement
}

/// Conjoins `filter` onto the statement's WHERE clause.
fn restrict(statement: &Statement, filter: Expr) -> GateResult<Statement> {
    let mut statement = strip_qualifiers(statement);
    let selection = match &mut statement {
        Statement::Select(select) => &mut select.selection,
        Statement::Update(update) => &mut update.selection,
        Statement::Delete(delete) => &mut delete.selection,
        _ => {
            return Err(GateError::unsupported(
                "entity id routing needs a SELECT, UPDATE or DELETE",
            ))
        }
    };
    *selection = Some(Expr::and_opt(selection.take(), filter));
    Ok(statement)
}

fn combine(results: Vec<QueryResult>, write: bool) -> QueryResult {
    if write {
        return QueryResult::affected(results.iter().map(|r| r.rows_affected).sum());
    }
    let mut out = QueryResult::with_fields(
        results
            .first()
            .map(|r| r.fields.clone())
            .unwrap_or_default(),
    );
    for result in results {
        out.rows.extend(result.rows);
    }
    out
}
