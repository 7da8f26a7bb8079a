//! Session transactions.
//!
//! A `Transaction` collects one sub-transaction per shard it touches and
//! commits them according to the session's `TransactionMode`. The two-phase
//! path hands the participants to `keygate_twopc::twopc::Coordinator`; the
//! adapters at the bottom of this module let that crate reach shards through
//! the router's topology.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use keygate_twopc::twopc::{
    CommitOutcome, Coordinator, CoordinatorLog, DecisionState, Dtid, Participant,
    ParticipantDirectory, TransactionRecord,
};
use tracing::{debug, info, warn};

use crate::config::TransactionMode;
use crate::error::{GateError, GateResult, Warning};
use crate::shard::{ShardConn, ShardTarget, TxId};
use crate::topology::{TabletRole, Topology};

/// Lifecycle of a session transaction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TxnState {
    #[default]
    Idle,
    Active,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

/// Open sub-transaction on one shard's primary.
#[derive(Clone)]
pub(crate) struct ShardSession {
    pub target: ShardTarget,
    pub conn: Arc<dyn ShardConn>,
    pub tx: TxId,
}

#[derive(Default)]
pub struct Transaction {
    state: TxnState,
    participants: Vec<ShardSession>,
}

impl Transaction {
    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    /// Participating shards in the order they joined.
    pub fn participants(&self) -> Vec<ShardTarget> {
        self.participants.iter().map(|p| p.target.clone()).collect()
    }

    pub(crate) fn begin(&mut self) {
        self.state = TxnState::Active;
        self.participants.clear();
    }

    pub(crate) fn find(&self, target: &ShardTarget) -> Option<&ShardSession> {
        self.participants.iter().find(|p| &p.target == target)
    }

    /// Sub-transaction on `target`, opened on first use.
    ///
    /// Under SINGLE a second participant is refused; the transaction stays
    /// open with its existing participant.
    pub(crate) async fn join(
        &mut self,
        target: &ShardTarget,
        topology: &dyn Topology,
        mode: TransactionMode,
    ) -> GateResult<(Arc<dyn ShardConn>, TxId)> {
        if let Some(existing) = self.find(target) {
            return Ok((existing.conn.clone(), existing.tx));
        }
        if mode == TransactionMode::Single {
            if let Some(first) = self.participants.first() {
                return Err(GateError::TransactionModeViolation(format!(
                    "multi-db transaction attempted: {} and {target}",
                    first.target
                )));
            }
        }
        let conn = topology.resolve(&target.keyspace, &target.shard, TabletRole::Primary)?;
        let tx = conn
            .begin()
            .await
            .map_err(|err| GateError::from_shard(&target.to_string(), err))?;
        debug!(target = %target, tx, "opened shard sub-transaction");
        self.participants.push(ShardSession {
            target: target.clone(),
            conn: conn.clone(),
            tx,
        });
        Ok((conn, tx))
    }

    /// Commits every participant. Returns the warnings the commit produced.
    pub(crate) async fn commit(
        &mut self,
        mode: TransactionMode,
        coordinator: &Coordinator,
    ) -> GateResult<Vec<Warning>> {
        if self.state != TxnState::Active {
            return Ok(Vec::new());
        }
        self.state = TxnState::Committing;
        let participants = std::mem::take(&mut self.participants);

        let result = match mode {
            TransactionMode::Single if participants.len() > 1 => {
                rollback_all(&participants).await;
                Err(GateError::TransactionModeViolation(format!(
                    "multi-db transaction attempted across {} shards",
                    participants.len()
                )))
            }
            TransactionMode::TwoPc if participants.len() > 1 => {
                commit_twopc(participants, coordinator).await
            }
            // Decision: a two-phase transaction with one participant commits directly.
            _ => commit_sequential(&participants).await.map(|()| Vec::new()),
        };
        self.state = match &result {
            Ok(_) => TxnState::Committed,
            Err(_) => TxnState::Aborted,
        };
        result
    }

    /// Releases every participant without applying anything.
    pub(crate) async fn rollback(&mut self) {
        if self.state != TxnState::Active {
            return;
        }
        self.state = TxnState::Aborting;
        let participants = std::mem::take(&mut self.participants);
        rollback_all(&participants).await;
        self.state = TxnState::Aborted;
    }
}

async fn rollback_all(participants: &[ShardSession]) {
    for participant in participants {
        if let Err(err) = participant.conn.rollback(participant.tx).await {
            warn!(target = %participant.target, error = %err, "rollback sub-transaction failed");
        }
    }
}

/// Commits one participant at a time; a failure leaves the earlier ones
/// committed and rolls back the rest.
async fn commit_sequential(participants: &[ShardSession]) -> GateResult<()> {
    for (idx, participant) in participants.iter().enumerate() {
        if let Err(err) = participant.conn.commit(participant.tx).await {
            warn!(
                target = %participant.target,
                committed = idx,
                error = %err,
                "commit failed; rolling back remaining participants"
            );
            rollback_all(&participants[idx + 1..]).await;
            return Err(GateError::from_shard(&participant.target.to_string(), err));
        }
    }
    Ok(())
}

async fn commit_twopc(
    participants: Vec<ShardSession>,
    coordinator: &Coordinator,
) -> GateResult<Vec<Warning>> {
    let voters: Vec<Arc<dyn Participant>> = participants
        .into_iter()
        .map(|p| {
            Arc::new(ShardParticipant {
                id: p.target.to_string(),
                conn: p.conn,
                tx: p.tx,
            }) as Arc<dyn Participant>
        })
        .collect();
    match coordinator.commit(&voters).await? {
        CommitOutcome::Committed { dtid } => {
            info!(dtid = %dtid, participants = voters.len(), "distributed transaction committed");
            Ok(Vec::new())
        }
        CommitOutcome::CommitPending { dtid, pending } => {
            let err = GateError::PartialCommitFailure {
                dtid: dtid.to_string(),
                pending: pending.iter().map(|(id, _)| id.clone()).collect(),
            };
            Ok(pending
                .into_iter()
                .map(|(id, reason)| Warning {
                    shard: id,
                    code: err.code(),
                    message: format!("{err}: {reason}"),
                })
                .collect())
        }
        CommitOutcome::Aborted {
            dtid,
            participant,
            reason,
        } => Err(GateError::PrepareFailure {
            dtid: dtid.to_string(),
            participant,
            message: reason,
        }),
    }
}

/// Open sub-transaction voting in a two-phase commit.
struct ShardParticipant {
    id: String,
    conn: Arc<dyn ShardConn>,
    tx: TxId,
}

#[async_trait]
impl Participant for ShardParticipant {
    fn id(&self) -> &str {
        &self.id
    }

    async fn prepare(&self, dtid: &Dtid) -> Result<()> {
        self.conn
            .prepare(self.tx, &dtid.to_string())
            .await
            .with_context(|| format!("prepare {dtid} on {}", self.id))
    }

    async fn rollback(&self) -> Result<()> {
        self.conn
            .rollback(self.tx)
            .await
            .with_context(|| format!("rollback on {}", self.id))
    }
}

/// Coordinator log kept by a shard's primary.
struct ShardCoordinatorLog {
    name: String,
    conn: Arc<dyn ShardConn>,
}

#[async_trait]
impl CoordinatorLog for ShardCoordinatorLog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_record(&self, record: TransactionRecord) -> Result<()> {
        self.conn
            .create_transaction(&record)
            .await
            .with_context(|| format!("create transaction record on {}", self.name))
    }

    async fn decide(&self, dtid: &Dtid, decision: DecisionState) -> Result<Option<DecisionState>> {
        self.conn
            .decide_transaction(dtid, decision)
            .await
            .with_context(|| format!("decide {} for {dtid} on {}", decision.as_str(), self.name))
    }

    async fn conclude(&self, dtid: &Dtid) -> Result<()> {
        self.conn
            .conclude_transaction(dtid)
            .await
            .with_context(|| format!("conclude {dtid} on {}", self.name))
    }

    async fn read_record(&self, dtid: &Dtid) -> Result<Option<TransactionRecord>> {
        self.conn
            .read_transaction(dtid)
            .await
            .with_context(|| format!("read {dtid} on {}", self.name))
    }

    async fn unresolved(&self, created_before_unix_ms: u64) -> Result<Vec<TransactionRecord>> {
        self.conn
            .unresolved_transactions(created_before_unix_ms)
            .await
            .with_context(|| format!("scan coordinator log on {}", self.name))
    }
}

/// Reaches participants by `keyspace/shard` id through the topology.
pub(crate) struct TopologyDirectory {
    topology: Arc<dyn Topology>,
}

impl TopologyDirectory {
    pub(crate) fn new(topology: Arc<dyn Topology>) -> Self {
        Self { topology }
    }

    fn primary(&self, participant: &str) -> Result<Arc<dyn ShardConn>> {
        let target = ShardTarget::parse(participant)
            .with_context(|| format!("malformed participant id {participant}"))?;
        self.topology
            .resolve(&target.keyspace, &target.shard, TabletRole::Primary)
            .with_context(|| format!("resolve participant {participant}"))
    }
}

#[async_trait]
impl ParticipantDirectory for TopologyDirectory {
    async fn commit_prepared(&self, participant: &str, dtid: &Dtid) -> Result<()> {
        self.primary(participant)?
            .commit_prepared(&dtid.to_string())
            .await
            .with_context(|| format!("commit prepared {dtid} on {participant}"))
    }

    async fn rollback_prepared(&self, participant: &str, dtid: &Dtid) -> Result<()> {
        self.primary(participant)?
            .rollback_prepared(&dtid.to_string())
            .await
            .with_context(|| format!("rollback prepared {dtid} on {participant}"))
    }

    fn coordinator_log(&self, participant: &str) -> Result<Arc<dyn CoordinatorLog>> {
        let conn = self.primary(participant)?;
        Ok(Arc::new(ShardCoordinatorLog {
            name: participant.to_string(),
            conn,
        }))
    }

    fn coordinator_logs(&self) -> Vec<Arc<dyn CoordinatorLog>> {
        self.topology
            .primaries()
            .into_iter()
            .map(|(target, conn)| {
                Arc::new(ShardCoordinatorLog {
                    name: target.to_string(),
                    conn,
                }) as Arc<dyn CoordinatorLog>
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FaultPoint, MemShard, TableDef};
    use crate::error::ShardError;
    use crate::topology::StaticTopology;
    use crate::value::{BindVars, FieldType};
    use crate::vschema::VSchemaSource;
    use keygate_twopc::twopc::TwoPcConfig;
    use std::time::Duration;

    struct Fixture {
        topology: Arc<StaticTopology>,
        shards: Vec<Arc<MemShard>>,
        coordinator: Coordinator,
    }

    fn fixture() -> Fixture {
        let topology = Arc::new(StaticTopology::new(VSchemaSource::default()));
        let mut shards = Vec::new();
        for name in ["-80", "80-"] {
            let shard = Arc::new(
                MemShard::new(&format!("user/{name}"))
                    .with_table(
                        TableDef::new("t")
                            .column("id", FieldType::Int64)
                            .primary_key(&["id"]),
                    )
                    .expect("table"),
            );
            topology.add_shard("user", name, shard.clone());
            shards.push(shard);
        }
        let coordinator = Coordinator::new(
            Arc::new(TopologyDirectory::new(topology.clone())),
            TwoPcConfig {
                abandon_age: Duration::ZERO,
                recovery_interval: Duration::from_millis(10),
            },
        );
        Fixture {
            topology,
            shards,
            coordinator,
        }
    }

    async fn write_both(txn: &mut Transaction, fx: &Fixture, mode: TransactionMode) {
        txn.begin();
        for (idx, shard) in ["-80", "80-"].iter().enumerate() {
            let target = ShardTarget::new("user", *shard);
            let (conn, tx) = txn
                .join(&target, fx.topology.as_ref(), mode)
                .await
                .expect("join");
            conn.execute(
                &format!("insert into t (id) values ({idx})"),
                &BindVars::new(),
                Some(tx),
            )
            .await
            .expect("insert");
        }
    }

    #[tokio::test]
    async fn single_mode_rejects_second_participant() {
        let fx = fixture();
        let mut txn = Transaction::default();
        txn.begin();
        txn.join(&ShardTarget::new("user", "-80"), fx.topology.as_ref(), TransactionMode::Single)
            .await
            .expect("first participant");
        let err = txn
            .join(&ShardTarget::new("user", "80-"), fx.topology.as_ref(), TransactionMode::Single)
            .await
            .err()
            .expect("second participant");
        assert!(matches!(err, GateError::TransactionModeViolation(_)));
        assert!(txn.is_active());
        assert_eq!(txn.participants().len(), 1);
        txn.rollback().await;
        assert_eq!(txn.state(), TxnState::Aborted);
        assert_eq!(fx.shards[0].open_transactions(), 0);
    }

    #[tokio::test]
    async fn multi_commit_failure_keeps_earlier_participants() {
        let fx = fixture();
        let mut txn = Transaction::default();
        write_both(&mut txn, &fx, TransactionMode::Multi).await;
        fx.shards[1].fail_once(FaultPoint::Commit, ShardError::new(1105, "disk full"));
        let err = txn
            .commit(TransactionMode::Multi, &fx.coordinator)
            .await
            .expect_err("second commit fails");
        assert_eq!(err.shard(), Some("user/80-"));
        assert_eq!(fx.shards[0].rows("t").len(), 1);
        assert!(fx.shards[1].rows("t").is_empty());
    }

    #[tokio::test]
    async fn twopc_commit_reports_pending_participants_as_warnings() {
        let fx = fixture();
        let mut txn = Transaction::default();
        write_both(&mut txn, &fx, TransactionMode::TwoPc).await;
        fx.shards[1].fail_once(FaultPoint::CommitPrepared, ShardError::unavailable("gone"));
        let warnings = txn
            .commit(TransactionMode::TwoPc, &fx.coordinator)
            .await
            .expect("decision recorded");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].shard, "user/80-");
        assert!(fx.shards[1].rows("t").is_empty());

        let report = fx.coordinator.recover_once().await.expect("recover");
        assert_eq!(report.committed, 1);
        assert_eq!(fx.shards[1].rows("t").len(), 1);
        assert!(fx.shards[0].transaction_records().is_empty());
    }

    #[tokio::test]
    async fn twopc_prepare_failure_applies_nothing() {
        let fx = fixture();
        let mut txn = Transaction::default();
        write_both(&mut txn, &fx, TransactionMode::TwoPc).await;
        fx.shards[1].fail_once(FaultPoint::Prepare, ShardError::new(1105, "refused"));
        let err = txn
            .commit(TransactionMode::TwoPc, &fx.coordinator)
            .await
            .expect_err("prepare failure");
        assert!(matches!(err, GateError::PrepareFailure { .. }));
        for shard in &fx.shards {
            assert!(shard.rows("t").is_empty());
            assert!(shard.prepared_dtids().is_empty());
            assert_eq!(shard.open_transactions(), 0);
        }
    }
}
