//! Two-phase commit module wiring.
//!
//! `coordinator` runs the prepare/decide/commit protocol, `recovery` drives
//! abandoned transactions to completion in the background, and `types`
//! defines the durable record and the trait contracts (participant,
//! directory, coordinator log).

mod coordinator;
mod recovery;
mod types;

pub use coordinator::{CommitOutcome, Coordinator, CoordinatorStats, Resolution};
pub use recovery::{spawn_recovery_loop, RecoveryReport};
pub use types::{
    now_unix_ms, CoordinatorLog, DecisionState, Dtid, Participant, ParticipantDirectory,
    ParticipantId, TransactionRecord, TwoPcConfig,
};
