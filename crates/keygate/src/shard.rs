//! Contract of one shard endpoint.
//!
//! A shard behaves as an ordinary transactional SQL server that also keeps
//! prepared transactions and a coordinator log for two-phase commit. The
//! router only ever talks to shards through `ShardConn`.

use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use keygate_twopc::twopc::{DecisionState, Dtid, TransactionRecord};

use crate::error::ShardError;
use crate::value::{BindVars, Field, QueryResult, Row};

/// Handle of an open sub-transaction on one shard.
pub type TxId = u64;

/// Lazily consumed rows of a streaming read.
pub type ShardRowStream = BoxStream<'static, Result<Row, ShardError>>;

/// Fully qualified shard address, `keyspace/shard`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardTarget {
    pub keyspace: String,
    pub shard: String,
}

impl ShardTarget {
    pub fn new(keyspace: impl Into<String>, shard: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            shard: shard.into(),
        }
    }

    /// Parses the `keyspace/shard` form used as a participant id.
    pub fn parse(raw: &str) -> Option<Self> {
        let (keyspace, shard) = raw.split_once('/')?;
        if keyspace.is_empty() || shard.is_empty() {
            return None;
        }
        Some(Self::new(keyspace, shard))
    }
}

impl fmt::Display for ShardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.keyspace, self.shard)
    }
}

/// Connection to one shard endpoint (primary or read-only).
///
/// Statements arrive as SQL text plus named bind variables. `tx` selects an
/// open sub-transaction; `None` runs the statement in autocommit mode.
#[async_trait]
pub trait ShardConn: Send + Sync {
    /// `keyspace/shard` this endpoint serves.
    fn target(&self) -> &str;

    async fn execute(
        &self,
        sql: &str,
        binds: &BindVars,
        tx: Option<TxId>,
    ) -> Result<QueryResult, ShardError>;

    /// Autocommit read whose rows are produced lazily.
    async fn stream_execute(
        &self,
        sql: &str,
        binds: &BindVars,
    ) -> Result<(Vec<Field>, ShardRowStream), ShardError>;

    async fn begin(&self) -> Result<TxId, ShardError>;

    async fn commit(&self, tx: TxId) -> Result<(), ShardError>;

    async fn rollback(&self, tx: TxId) -> Result<(), ShardError>;

    /// Durably parks the sub-transaction under `dtid`; it survives the
    /// session that opened it and keeps its locks.
    async fn prepare(&self, tx: TxId, dtid: &str) -> Result<(), ShardError>;

    /// Applies a prepared transaction. Unknown dtids are a no-op.
    async fn commit_prepared(&self, dtid: &str) -> Result<(), ShardError>;

    /// Discards a prepared transaction. Unknown dtids are a no-op.
    async fn rollback_prepared(&self, dtid: &str) -> Result<(), ShardError>;

    async fn create_transaction(&self, record: &TransactionRecord) -> Result<(), ShardError>;

    /// Compare-and-set of a coordinator-log record from `Prepare` to
    /// `decision`. Returns the record's state afterwards, `None` when no
    /// record exists.
    async fn decide_transaction(
        &self,
        dtid: &Dtid,
        decision: DecisionState,
    ) -> Result<Option<DecisionState>, ShardError>;

    async fn conclude_transaction(&self, dtid: &Dtid) -> Result<(), ShardError>;

    async fn read_transaction(&self, dtid: &Dtid) -> Result<Option<TransactionRecord>, ShardError>;

    /// Coordinator-log records created at or before the cutoff.
    async fn unresolved_transactions(
        &self,
        created_before_unix_ms: u64,
    ) -> Result<Vec<TransactionRecord>, ShardError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_round_trips_through_participant_id() {
        let target = ShardTarget::new("user", "-80");
        assert_eq!(target.to_string(), "user/-80");
        assert_eq!(ShardTarget::parse("user/-80"), Some(target));
        assert_eq!(ShardTarget::parse("user"), None);
        assert_eq!(ShardTarget::parse("/0"), None);
    }
}
