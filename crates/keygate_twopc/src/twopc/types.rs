//! Shared types for the two-phase commit protocol.
//!
//! These types are kept dependency-light because they are used by the
//! coordinator, the recovery loop, and the shard layer that implements the
//! participant and log contracts.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

/// Stable participant identifier, `keyspace/shard`.
pub type ParticipantId = String;

/// Distributed transaction id.
///
/// The id embeds the participant whose coordinator log holds the durable
/// record, so any process can locate the record from the id alone.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dtid {
    coordinator: ParticipantId,
    counter: u64,
    epoch_ms: u64,
}

impl Dtid {
    pub fn new(coordinator: impl Into<ParticipantId>, epoch_ms: u64, counter: u64) -> Self {
        Self {
            coordinator: coordinator.into(),
            counter,
            epoch_ms,
        }
    }

    /// Participant owning the coordinator log for this transaction.
    pub fn coordinator(&self) -> &str {
        &self.coordinator
    }

    /// Parses the textual form produced by `Display`.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut parts = raw.rsplitn(3, ':');
        let (Some(counter), Some(epoch), Some(coordinator)) =
            (parts.next(), parts.next(), parts.next())
        else {
            anyhow::bail!("malformed dtid: {raw}");
        };
        let epoch_ms = epoch
            .parse::<u64>()
            .map_err(|err| anyhow::anyhow!("malformed dtid epoch in {raw}: {err}"))?;
        let counter = counter
            .parse::<u64>()
            .map_err(|err| anyhow::anyhow!("malformed dtid counter in {raw}: {err}"))?;
        Ok(Self::new(coordinator, epoch_ms, counter))
    }
}

impl fmt::Display for Dtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.coordinator, self.epoch_ms, self.counter)
    }
}

/// Durable state of a transaction record.
///
/// `Prepare` means no decision has been made yet: a record found in this
/// state by recovery is aborted. `Commit` is the durable commit decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionState {
    Prepare,
    Commit,
    Rollback,
}

impl DecisionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionState::Prepare => "PREPARE",
            DecisionState::Commit => "COMMIT",
            DecisionState::Rollback => "ROLLBACK",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "PREPARE" => Some(DecisionState::Prepare),
            "COMMIT" => Some(DecisionState::Commit),
            "ROLLBACK" => Some(DecisionState::Rollback),
            _ => None,
        }
    }
}

/// Metadata record naming every participant of one distributed transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionRecord {
    pub dtid: Dtid,
    pub state: DecisionState,
    pub participants: Vec<ParticipantId>,
    pub created_unix_ms: u64,
}

/// Coordinator tuning.
#[derive(Clone, Debug)]
pub struct TwoPcConfig {
    /// Records younger than this are left alone by recovery so that
    /// in-flight commits are not raced.
    pub abandon_age: Duration,
    /// Spacing between background recovery passes.
    pub recovery_interval: Duration,
}

impl Default for TwoPcConfig {
    fn default() -> Self {
        Self {
            abandon_age: Duration::from_secs(2),
            recovery_interval: Duration::from_secs(1),
        }
    }
}

/// One open sub-transaction taking part in a distributed commit.
#[async_trait]
pub trait Participant: Send + Sync {
    fn id(&self) -> &str;

    /// Durably records the sub-transaction under `dtid` and votes yes.
    async fn prepare(&self, dtid: &Dtid) -> anyhow::Result<()>;

    /// Abandons the (unprepared) sub-transaction.
    async fn rollback(&self) -> anyhow::Result<()>;
}

/// Durable coordinator log holding transaction records.
///
/// Implementations must make every call durable before returning. All
/// operations must be idempotent: concluding an unknown dtid is not an error.
#[async_trait]
pub trait CoordinatorLog: Send + Sync {
    fn name(&self) -> &str;

    async fn create_record(&self, record: TransactionRecord) -> anyhow::Result<()>;

    /// Moves a `Prepare` record to `decision` (`Commit` or `Rollback`).
    ///
    /// A record that already left `Prepare` keeps its state. Returns the
    /// state the record holds afterwards, or `None` once it is concluded,
    /// so the caller learns whether its own decision won.
    async fn decide(&self, dtid: &Dtid, decision: DecisionState)
        -> anyhow::Result<Option<DecisionState>>;

    async fn conclude(&self, dtid: &Dtid) -> anyhow::Result<()>;

    async fn read_record(&self, dtid: &Dtid) -> anyhow::Result<Option<TransactionRecord>>;

    /// Records created at or before `created_before_unix_ms`.
    async fn unresolved(&self, created_before_unix_ms: u64)
        -> anyhow::Result<Vec<TransactionRecord>>;
}

/// Reaches participants by id, independent of any session.
///
/// Recovery only ever sees durable records, so it needs a way to address a
/// prepared sub-transaction without holding the session that opened it.
#[async_trait]
pub trait ParticipantDirectory: Send + Sync + 'static {
    async fn commit_prepared(&self, participant: &str, dtid: &Dtid) -> anyhow::Result<()>;

    async fn rollback_prepared(&self, participant: &str, dtid: &Dtid) -> anyhow::Result<()>;

    fn coordinator_log(&self, participant: &str) -> anyhow::Result<Arc<dyn CoordinatorLog>>;

    /// Every coordinator log the recovery loop should scan.
    fn coordinator_logs(&self) -> Vec<Arc<dyn CoordinatorLog>>;
}

/// Wall-clock milliseconds since the Unix epoch, saturating on clock skew.
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtid_round_trips_through_text() {
        let dtid = Dtid::new("user/-80", 1_700_000_000_000, 42);
        let text = dtid.to_string();
        assert_eq!(text, "user/-80:1700000000000:42");
        assert_eq!(Dtid::parse(&text).expect("parse dtid"), dtid);
        assert_eq!(dtid.coordinator(), "user/-80");
    }

    #[test]
    fn dtid_parse_rejects_garbage() {
        assert!(Dtid::parse("no-separators").is_err());
        assert!(Dtid::parse("a:b:c").is_err());
    }

    #[test]
    fn decision_state_parses_case_insensitively() {
        assert_eq!(DecisionState::parse("commit"), Some(DecisionState::Commit));
        assert_eq!(DecisionState::parse("PREPARE"), Some(DecisionState::Prepare));
        assert_eq!(DecisionState::parse("other"), None);
        assert_eq!(DecisionState::Rollback.as_str(), "ROLLBACK");
    }
}
