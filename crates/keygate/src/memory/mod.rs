//! In-process shard endpoint.
//!
//! `MemShard` implements `ShardConn` over in-memory tables: statement
//! atomicity, table-level write locks held until commit, prepared
//! transactions and a coordinator log. Faults can be injected at each
//! protocol step, which is how partial-failure behavior is exercised.

mod engine;

pub use engine::TableDef;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use keygate_twopc::twopc::{DecisionState, Dtid, TransactionRecord};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{
    ShardError, ER_LOCK_WAIT_TIMEOUT, ER_NOT_SUPPORTED_YET, ER_NO_SUCH_TABLE, ER_PARSE_ERROR,
    ER_UNKNOWN_ERROR,
};
use crate::shard::{ShardConn, ShardRowStream, TxId};
use crate::sql::ast::{Expr, SelectItem, Statement, TableName};
use crate::sql::eval::eval_const;
use crate::sql::parse::parse_statement;
use crate::value::{BindVars, Field, QueryResult, Row};

use engine::{eval_error, run_delete, run_insert, run_select, run_update, MemTable};

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

/// Protocol step a fault can be injected at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Execute,
    Begin,
    Commit,
    Prepare,
    CommitPrepared,
    RollbackPrepared,
    Decide,
}

#[derive(Default)]
struct Faults {
    once: HashMap<FaultPoint, ShardError>,
    unavailable: bool,
    delay: Option<Duration>,
    prepare_delay: Option<Duration>,
}

#[derive(Default)]
struct OpenTx {
    /// Tables modified by the transaction, visible only to it.
    staged: BTreeMap<String, MemTable>,
    dtid: Option<String>,
}

#[derive(Default)]
struct ShardState {
    tables: BTreeMap<String, MemTable>,
    txs: HashMap<TxId, OpenTx>,
    /// Table write locks by holder.
    locks: HashMap<String, TxId>,
    prepared: HashMap<String, TxId>,
    records: BTreeMap<String, TransactionRecord>,
}

impl ShardState {
    fn table(&self, tx: Option<TxId>, name: &str) -> Option<&MemTable> {
        tx.and_then(|id| self.txs.get(&id))
            .and_then(|open| open.staged.get(name))
            .or_else(|| self.tables.get(name))
    }

    fn release(&mut self, tx: TxId) {
        self.locks.retain(|_, holder| *holder != tx);
    }

    fn apply(&mut self, staged: BTreeMap<String, MemTable>) {
        for (name, table) in staged {
            self.tables.insert(name, table);
        }
    }
}

pub struct MemShard {
    target: String,
    state: Mutex<ShardState>,
    lock_released: Notify,
    next_tx: AtomicU64,
    lock_wait_timeout: Duration,
    faults: Mutex<Faults>,
    queries: Mutex<Vec<String>>,
}

impl MemShard {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            state: Mutex::new(ShardState::default()),
            lock_released: Notify::new(),
            next_tx: AtomicU64::new(1),
            lock_wait_timeout: DEFAULT_LOCK_WAIT,
            faults: Mutex::new(Faults::default()),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    pub fn with_table(self, def: TableDef) -> Result<Self, ShardError> {
        self.create_table(def)?;
        Ok(self)
    }

    /// Creates (or replaces with an empty) table.
    pub fn create_table(&self, def: TableDef) -> Result<(), ShardError> {
        let table = MemTable::from_def(&def)?;
        self.state
            .lock()
            .tables
            .insert(def.name.to_ascii_lowercase(), table);
        Ok(())
    }

    /// Committed rows of a table, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .tables
            .get(&table.to_ascii_lowercase())
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Every statement received through `execute`, in arrival order.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    pub fn clear_queries(&self) {
        self.queries.lock().clear();
    }

    /// Open sub-transactions, prepared ones included.
    pub fn open_transactions(&self) -> usize {
        self.state.lock().txs.len()
    }

    pub fn prepared_dtids(&self) -> Vec<String> {
        let mut dtids: Vec<String> = self.state.lock().prepared.keys().cloned().collect();
        dtids.sort();
        dtids
    }

    pub fn transaction_records(&self) -> Vec<TransactionRecord> {
        self.state.lock().records.values().cloned().collect()
    }

    /// Fails the next call reaching `point` with `err`.
    pub fn fail_once(&self, point: FaultPoint, err: ShardError) {
        self.faults.lock().once.insert(point, err);
    }

    /// Makes every call fail as if the endpoint were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().unavailable = unavailable;
    }

    /// Delays every statement by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.faults.lock().delay = delay;
    }

    /// Delays every prepare by `delay` before it takes effect.
    pub fn set_prepare_delay(&self, delay: Option<Duration>) {
        self.faults.lock().prepare_delay = delay;
    }

    fn check(&self, point: FaultPoint) -> Result<(), ShardError> {
        let mut faults = self.faults.lock();
        if faults.unavailable {
            return Err(ShardError::unavailable(format!(
                "{}: connection refused",
                self.target
            )));
        }
        match faults.once.remove(&point) {
            Some(err) => {
                debug!(target = %self.target, ?point, "injected shard fault");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn allocate_tx(&self) -> TxId {
        self.next_tx.fetch_add(1, Ordering::Relaxed)
    }

    /// Takes the write lock of `table` for `owner`, waiting for the holder
    /// to finish up to the lock wait timeout.
    async fn lock_table(&self, table: &str, owner: TxId) -> Result<(), ShardError> {
        let deadline = Instant::now() + self.lock_wait_timeout;
        loop {
            let notified = self.lock_released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                match state.locks.get(table) {
                    Some(holder) if *holder != owner => {}
                    _ => {
                        state.locks.insert(table.to_string(), owner);
                        return Ok(());
                    }
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ShardError::new(
                    ER_LOCK_WAIT_TIMEOUT,
                    "Lock wait timeout exceeded; try restarting transaction",
                ));
            }
        }
    }

    fn unlock(&self, tx: TxId) {
        self.state.lock().release(tx);
        self.lock_released.notify_waiters();
    }

    fn require_tx(&self, state: &ShardState, tx: TxId) -> Result<(), ShardError> {
        match state.txs.get(&tx) {
            Some(open) if open.dtid.is_some() => Err(ShardError::new(
                ER_UNKNOWN_ERROR,
                format!("transaction {tx} is prepared"),
            )),
            Some(_) => Ok(()),
            None => Err(ShardError::new(
                ER_UNKNOWN_ERROR,
                format!("transaction {tx}: not found"),
            )),
        }
    }

    async fn run_statement(
        &self,
        statement: Statement,
        binds: &BindVars,
        tx: Option<TxId>,
    ) -> Result<QueryResult, ShardError> {
        match statement {
            Statement::Select(select) => {
                if select.from.len() > 1 {
                    return Err(ShardError::new(
                        ER_NOT_SUPPORTED_YET,
                        "joins are not supported by this endpoint",
                    ));
                }
                pause_for_sleep(&select.projection, binds).await?;
                let name = select.from.first().map(|t| table_key(&t.table));
                if let (Some(name), Some(owner), Some(_)) = (&name, tx, select.lock) {
                    self.require_tx(&self.state.lock(), owner)?;
                    self.lock_table(name, owner).await?;
                }
                let state = self.state.lock();
                if let Some(owner) = tx {
                    self.require_tx(&state, owner)?;
                }
                match &name {
                    Some(name) => {
                        let table = state.table(tx, name).ok_or_else(|| no_such_table(name))?;
                        run_select(Some(table), &select, binds)
                    }
                    None => run_select(None, &select, binds),
                }
            }
            Statement::Insert(_)
            | Statement::Update(_)
            | Statement::Delete(_)
            | Statement::Truncate(_) => match tx {
                Some(owner) => self.write(&statement, binds, owner).await,
                None => {
                    let owner = self.allocate_tx();
                    self.state.lock().txs.insert(owner, OpenTx::default());
                    let result = self.write(&statement, binds, owner).await;
                    let open = self.state.lock().txs.remove(&owner);
                    if let (Ok(_), Some(open)) = (&result, open) {
                        self.state.lock().apply(open.staged);
                    }
                    self.unlock(owner);
                    result
                }
            },
            other => Err(ShardError::new(
                ER_NOT_SUPPORTED_YET,
                format!("statement not supported by shard endpoint: {other}"),
            )),
        }
    }

    async fn write(
        &self,
        statement: &Statement,
        binds: &BindVars,
        owner: TxId,
    ) -> Result<QueryResult, ShardError> {
        let name = match statement {
            Statement::Insert(insert) => table_key(&insert.table),
            Statement::Update(update) => table_key(&update.table),
            Statement::Delete(delete) => table_key(&delete.table),
            Statement::Truncate(table) => table_key(table),
            _ => return Err(ShardError::new(ER_UNKNOWN_ERROR, "not a write statement")),
        };
        self.require_tx(&self.state.lock(), owner)?;
        self.lock_table(&name, owner).await?;

        let mut state = self.state.lock();
        let mut table = state
            .table(Some(owner), &name)
            .cloned()
            .ok_or_else(|| no_such_table(&name))?;
        let result = match statement {
            Statement::Insert(insert) => run_insert(&mut table, insert, binds)?,
            Statement::Update(update) => run_update(&mut table, update, binds)?,
            Statement::Delete(delete) => run_delete(&mut table, delete, binds)?,
            _ => {
                let removed = table.rows.len() as u64;
                table.rows.clear();
                QueryResult::affected(removed)
            }
        };
        // Only a statement that succeeded as a whole becomes visible.
        if let Some(open) = state.txs.get_mut(&owner) {
            open.staged.insert(name, table);
        }
        Ok(result)
    }
}

fn table_key(table: &TableName) -> String {
    table.name.to_ascii_lowercase()
}

fn no_such_table(name: &str) -> ShardError {
    ShardError::new(ER_NO_SUCH_TABLE, format!("Table '{name}' doesn't exist"))
}

/// Honors `sleep(n)` in a projection before the statement runs.
async fn pause_for_sleep(projection: &[SelectItem], binds: &BindVars) -> Result<(), ShardError> {
    let mut seconds = 0.0f64;
    let mut failure = None;
    for item in projection {
        let SelectItem::Expr { expr, .. } = item else {
            continue;
        };
        expr.walk(&mut |node| {
            if let Expr::Function { name, args, .. } = node {
                if name == "sleep" {
                    match args.first().map(|arg| eval_const(arg, binds)) {
                        Some(Ok(value)) => seconds += value.as_f64().unwrap_or(0.0),
                        Some(Err(err)) => failure = Some(err),
                        None => {}
                    }
                }
            }
        });
    }
    if let Some(err) = failure {
        return Err(eval_error(err));
    }
    if seconds > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
    }
    Ok(())
}

#[async_trait]
impl ShardConn for MemShard {
    fn target(&self) -> &str {
        &self.target
    }

    async fn execute(
        &self,
        sql: &str,
        binds: &BindVars,
        tx: Option<TxId>,
    ) -> Result<QueryResult, ShardError> {
        self.check(FaultPoint::Execute)?;
        let delay = self.faults.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.queries.lock().push(sql.to_string());
        let statement =
            parse_statement(sql).map_err(|err| ShardError::new(ER_PARSE_ERROR, err.to_string()))?;
        self.run_statement(statement, binds, tx).await
    }

    async fn stream_execute(
        &self,
        sql: &str,
        binds: &BindVars,
    ) -> Result<(Vec<Field>, ShardRowStream), ShardError> {
        let result = self.execute(sql, binds, None).await?;
        let rows = futures_util::stream::iter(result.rows.into_iter().map(Ok)).boxed();
        Ok((result.fields, rows))
    }

    async fn begin(&self) -> Result<TxId, ShardError> {
        self.check(FaultPoint::Begin)?;
        let tx = self.allocate_tx();
        self.state.lock().txs.insert(tx, OpenTx::default());
        Ok(tx)
    }

    async fn commit(&self, tx: TxId) -> Result<(), ShardError> {
        self.check(FaultPoint::Commit)?;
        {
            let mut state = self.state.lock();
            self.require_tx(&state, tx)?;
            if let Some(open) = state.txs.remove(&tx) {
                state.apply(open.staged);
            }
        }
        self.unlock(tx);
        Ok(())
    }

    async fn rollback(&self, tx: TxId) -> Result<(), ShardError> {
        {
            let mut state = self.state.lock();
            if let Some(dtid) = state.txs.get(&tx).and_then(|open| open.dtid.clone()) {
                return Err(ShardError::new(
                    ER_UNKNOWN_ERROR,
                    format!("transaction {tx} is prepared as {dtid}"),
                ));
            }
            state.txs.remove(&tx);
        }
        self.unlock(tx);
        Ok(())
    }

    async fn prepare(&self, tx: TxId, dtid: &str) -> Result<(), ShardError> {
        self.check(FaultPoint::Prepare)?;
        let delay = self.faults.lock().prepare_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        self.require_tx(&state, tx)?;
        if let Some(open) = state.txs.get_mut(&tx) {
            open.dtid = Some(dtid.to_string());
        }
        state.prepared.insert(dtid.to_string(), tx);
        debug!(target = %self.target, dtid, "prepared transaction");
        Ok(())
    }

    async fn commit_prepared(&self, dtid: &str) -> Result<(), ShardError> {
        self.check(FaultPoint::CommitPrepared)?;
        let tx = {
            let mut state = self.state.lock();
            let Some(tx) = state.prepared.remove(dtid) else {
                return Ok(());
            };
            if let Some(open) = state.txs.remove(&tx) {
                state.apply(open.staged);
            }
            tx
        };
        self.unlock(tx);
        Ok(())
    }

    async fn rollback_prepared(&self, dtid: &str) -> Result<(), ShardError> {
        self.check(FaultPoint::RollbackPrepared)?;
        let tx = {
            let mut state = self.state.lock();
            let Some(tx) = state.prepared.remove(dtid) else {
                return Ok(());
            };
            state.txs.remove(&tx);
            tx
        };
        self.unlock(tx);
        Ok(())
    }

    async fn create_transaction(&self, record: &TransactionRecord) -> Result<(), ShardError> {
        self.check(FaultPoint::Execute)?;
        self.state
            .lock()
            .records
            .insert(record.dtid.to_string(), record.clone());
        Ok(())
    }

    async fn decide_transaction(
        &self,
        dtid: &Dtid,
        decision: DecisionState,
    ) -> Result<Option<DecisionState>, ShardError> {
        self.check(FaultPoint::Decide)?;
        let mut shard = self.state.lock();
        let Some(record) = shard.records.get_mut(&dtid.to_string()) else {
            debug!(target = %self.target, %dtid, "transaction record already concluded");
            return Ok(None);
        };
        if record.state == DecisionState::Prepare {
            record.state = decision;
        } else if record.state != decision {
            warn!(
                target = %self.target,
                %dtid,
                held = record.state.as_str(),
                wanted = decision.as_str(),
                "transaction record already decided"
            );
        }
        Ok(Some(record.state))
    }

    async fn conclude_transaction(&self, dtid: &Dtid) -> Result<(), ShardError> {
        self.check(FaultPoint::Execute)?;
        self.state.lock().records.remove(&dtid.to_string());
        Ok(())
    }

    async fn read_transaction(&self, dtid: &Dtid) -> Result<Option<TransactionRecord>, ShardError> {
        self.check(FaultPoint::Execute)?;
        Ok(self.state.lock().records.get(&dtid.to_string()).cloned())
    }

    async fn unresolved_transactions(
        &self,
        created_before_unix_ms: u64,
    ) -> Result<Vec<TransactionRecord>, ShardError> {
        self.check(FaultPoint::Execute)?;
        Ok(self
            .state
            .lock()
            .records
            .values()
            .filter(|r| r.created_unix_ms <= created_before_unix_ms)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{FieldType, Value};
    use futures_util::TryStreamExt;

    fn shard() -> MemShard {
        MemShard::new("ks/0")
            .with_lock_wait_timeout(Duration::from_millis(50))
            .with_table(
                TableDef::new("t")
                    .column("id", FieldType::Int64)
                    .column("v", FieldType::VarChar)
                    .primary_key(&["id"]),
            )
            .expect("table")
    }

    #[tokio::test]
    async fn failed_statement_leaves_transaction_state_untouched() {
        let shard = shard();
        let binds = BindVars::new();
        let tx = shard.begin().await.expect("begin");
        shard
            .execute("insert into t (id, v) values (1, 'a')", &binds, Some(tx))
            .await
            .expect("insert");
        let err = shard
            .execute("insert into t (id, v) values (2, 'b'), (1, 'dup')", &binds, Some(tx))
            .await
            .expect_err("duplicate");
        assert_eq!(err.code, crate::error::ER_DUP_ENTRY);

        let own = shard
            .execute("select id from t", &binds, Some(tx))
            .await
            .expect("read own writes");
        assert_eq!(own.rows, vec![vec![Value::Int(1)]]);
        assert!(shard.rows("t").is_empty());

        shard.commit(tx).await.expect("commit");
        assert_eq!(shard.rows("t").len(), 1);
        assert_eq!(shard.open_transactions(), 0);
    }

    #[tokio::test]
    async fn writers_wait_for_lock_holder() {
        let shard = shard();
        let binds = BindVars::new();
        let tx = shard.begin().await.expect("begin");
        shard
            .execute("update t set v = 'x' where id = 1", &binds, Some(tx))
            .await
            .expect("update");
        let err = shard
            .execute("insert into t (id, v) values (5, 'e')", &binds, None)
            .await
            .expect_err("lock wait");
        assert_eq!(err.code, ER_LOCK_WAIT_TIMEOUT);
        shard.rollback(tx).await.expect("rollback");
        shard
            .execute("insert into t (id, v) values (5, 'e')", &binds, None)
            .await
            .expect("insert after release");
    }

    #[tokio::test]
    async fn prepared_transactions_survive_until_resolved() {
        let shard = shard();
        let binds = BindVars::new();
        let tx = shard.begin().await.expect("begin");
        shard
            .execute("insert into t (id, v) values (7, 'g')", &binds, Some(tx))
            .await
            .expect("insert");
        shard.prepare(tx, "c:1:1").await.expect("prepare");
        assert!(shard.rollback(tx).await.is_err());
        assert_eq!(shard.prepared_dtids(), vec!["c:1:1".to_string()]);

        shard.fail_once(FaultPoint::CommitPrepared, ShardError::unavailable("down"));
        assert!(shard.commit_prepared("c:1:1").await.is_err());
        assert!(shard.rows("t").is_empty());

        shard.commit_prepared("c:1:1").await.expect("commit prepared");
        shard.commit_prepared("c:1:1").await.expect("idempotent");
        assert_eq!(shard.rows("t"), vec![vec![Value::Int(7), Value::text("g")]]);
        assert!(shard.prepared_dtids().is_empty());
    }

    #[tokio::test]
    async fn streams_rows_and_reports_unavailability() {
        let shard = shard();
        let binds = BindVars::new();
        shard
            .execute("insert into t (id, v) values (1, 'a'), (2, 'b')", &binds, None)
            .await
            .expect("insert");
        let (fields, stream) = shard
            .stream_execute("select id from t order by id", &binds)
            .await
            .expect("stream");
        assert_eq!(fields.len(), 1);
        let rows: Vec<Row> = stream.try_collect().await.expect("rows");
        assert_eq!(rows.len(), 2);

        shard.set_unavailable(true);
        let err = shard
            .execute("select id from t", &binds, None)
            .await
            .expect_err("down");
        assert!(err.is_unavailable());
        assert_eq!(shard.queries().len(), 2);
    }
}
