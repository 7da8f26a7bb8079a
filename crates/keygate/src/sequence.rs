//! Cluster-wide monotonic id allocation.
//!
//! Each sequence is a single row `(id = 0, next_id, cache)` in an unsharded
//! keyspace. The allocator hands out ids from an in-memory block and refills
//! it with one locked read-modify-write of that row. A block that is only
//! partly consumed when the process stops is lost, never reissued.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{GateError, GateResult};
use crate::shard::{ShardConn, TxId};
use crate::sql::ast::TableName;
use crate::topology::{TabletRole, Topology};
use crate::value::BindVars;
use crate::vschema::VSchema;

/// Locally cached block `[cursor, limit)`.
#[derive(Debug, Default)]
struct SeqState {
    cursor: i64,
    limit: i64,
}

pub struct SequenceAllocator {
    topology: Arc<dyn Topology>,
    states: Mutex<HashMap<String, Arc<tokio::sync::Mutex<SeqState>>>>,
}

impl SequenceAllocator {
    pub fn new(topology: Arc<dyn Topology>) -> Self {
        Self {
            topology,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// First id of a contiguous block of `count` ids.
    pub async fn next(&self, vschema: &VSchema, sequence: &TableName, count: i64) -> GateResult<i64> {
        if count < 1 {
            return Err(GateError::Syntax(format!("invalid sequence count {count}")));
        }
        let table = vschema.resolve_table(sequence, None)?;
        let key = format!("{}.{}", table.keyspace, table.name).to_ascii_lowercase();
        let state = self.states.lock().entry(key).or_default().clone();
        let mut state = state.lock().await;

        if state.limit - state.cursor >= count {
            let first = state.cursor;
            state.cursor += count;
            return Ok(first);
        }

        let keyspace = vschema.keyspace(&table.keyspace)?;
        let shard = keyspace.shards.first().ok_or_else(|| {
            GateError::schema(format!("keyspace {} has no shards", keyspace.name))
        })?;
        let target = format!("{}/{}", keyspace.name, shard.name);
        let conn = self
            .topology
            .resolve(&keyspace.name, &shard.name, TabletRole::Primary)?;
        let tx = conn
            .begin()
            .await
            .map_err(|err| GateError::from_shard(&target, err))?;

        match reserve(conn.as_ref(), tx, &target, &table.name, count).await {
            Ok((start, end)) => {
                conn.commit(tx)
                    .await
                    .map_err(|err| GateError::from_shard(&target, err))?;
                debug!(sequence = %table.name, start, end, "reserved sequence block");
                // The previous remainder is forfeited so the block stays contiguous.
                state.cursor = start + count;
                state.limit = end;
                Ok(start)
            }
            Err(err) => {
                if let Err(rollback) = conn.rollback(tx).await {
                    warn!(target = %target, error = %rollback, "sequence rollback failed");
                }
                Err(err)
            }
        }
    }
}

/// Advances the backing row by `max(cache, count)` and returns the reserved
/// range.
async fn reserve(
    conn: &dyn ShardConn,
    tx: TxId,
    target: &str,
    table: &str,
    count: i64,
) -> GateResult<(i64, i64)> {
    let name = TableName::new(table);
    let binds = BindVars::new();
    let read = conn
        .execute(
            &format!("select next_id, cache from {name} where id = 0 for update"),
            &binds,
            Some(tx),
        )
        .await
        .map_err(|err| GateError::from_shard(target, err))?;
    let row = read
        .rows
        .first()
        .ok_or_else(|| GateError::schema(format!("sequence {table} is not initialized")))?;
    let next_id = row
        .first()
        .and_then(|v| v.as_i64())
        .ok_or_else(|| GateError::schema(format!("sequence {table} has an invalid next_id")))?;
    // Decision: a cache below one behaves like one.
    let cache = row.get(1).and_then(|v| v.as_i64()).unwrap_or(1).max(1);
    let end = next_id
        .checked_add(cache.max(count))
        .ok_or_else(|| GateError::schema(format!("sequence {table} is exhausted")))?;
    conn.execute(
        &format!("update {name} set next_id = {end} where id = 0"),
        &binds,
        Some(tx),
    )
    .await
    .map_err(|err| GateError::from_shard(target, err))?;
    Ok((next_id, end))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use futures_util::future::join_all;

    use super::*;
    use crate::memory::{MemShard, TableDef};
    use crate::topology::StaticTopology;
    use crate::vschema::VSchemaSource;

    async fn setup(cache: i64) -> (Arc<SequenceAllocator>, Arc<VSchema>, Arc<MemShard>) {
        let source = VSchemaSource::from_json(
            r#"{"keyspaces": {"main": {"tables": {"user_seq": {"type": "sequence"}}}}}"#,
        )
        .expect("vschema");
        let topology = Arc::new(StaticTopology::new(source.clone()));
        let shard = Arc::new(
            MemShard::new("main/0")
                .with_table(TableDef::sequence("user_seq"))
                .expect("table"),
        );
        shard
            .execute(
                &format!("insert into user_seq (id, next_id, cache) values (0, 1, {cache})"),
                &BindVars::new(),
                None,
            )
            .await
            .expect("seed");
        topology.add_shard("main", "0", shard.clone());
        let vschema = VSchema::build(Arc::new(source), &|ks: &str| topology.shard_names(ks))
            .expect("build");
        (
            Arc::new(SequenceAllocator::new(topology)),
            Arc::new(vschema),
            shard,
        )
    }

    #[tokio::test]
    async fn concurrent_allocations_are_unique_and_dense() {
        let (alloc, vschema, _shard) = setup(1).await;
        let name = TableName::new("user_seq");
        let calls = (0..20).map(|_| alloc.next(&vschema, &name, 1));
        let ids: Vec<i64> = join_all(calls)
            .await
            .into_iter()
            .map(|r| r.expect("next"))
            .collect();
        let unique: BTreeSet<i64> = ids.iter().copied().collect();
        assert_eq!(unique, (1..=20).collect::<BTreeSet<i64>>());
    }

    #[tokio::test]
    async fn blocks_come_from_the_cache_and_oversized_requests_refill() {
        let (alloc, vschema, shard) = setup(10).await;
        let name = TableName::new("user_seq");
        assert_eq!(alloc.next(&vschema, &name, 3).await.expect("next"), 1);
        assert_eq!(alloc.next(&vschema, &name, 2).await.expect("next"), 4);
        // Only the first call touched the backing row.
        assert_eq!(shard.rows("user_seq")[0][1].as_i64(), Some(11));

        // Does not fit in the remaining [6, 11): a new block is reserved.
        assert_eq!(alloc.next(&vschema, &name, 15).await.expect("next"), 11);
        assert_eq!(shard.rows("user_seq")[0][1].as_i64(), Some(26));
        assert_eq!(alloc.next(&vschema, &name, 1).await.expect("next"), 26);
    }

    #[tokio::test]
    async fn missing_row_is_reported() {
        let (alloc, vschema, shard) = setup(1).await;
        shard
            .execute("delete from user_seq", &BindVars::new(), None)
            .await
            .expect("delete");
        let err = alloc
            .next(&vschema, &TableName::new("user_seq"), 1)
            .await
            .expect_err("uninitialized");
        assert_eq!(err.to_string(), "sequence user_seq is not initialized");
        assert_eq!(shard.open_transactions(), 0);
    }
}
