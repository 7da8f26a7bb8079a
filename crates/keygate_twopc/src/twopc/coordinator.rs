//! Two-phase commit driver.
//!
//! The protocol for one distributed transaction:
//!
//! 1. create the record `{dtid, PREPARE, participants}` in the coordinator log
//!    owned by the first participant,
//! 2. prepare every participant (phase 1),
//! 3. move the record from `PREPARE` to `COMMIT`; this compare-and-set is
//!    the commit decision and loses to a rollback recovery already wrote,
//! 4. commit every prepared participant (phase 2),
//! 5. conclude (delete) the record.
//!
//! A failure before step 3 aborts the transaction. A failure after step 3
//! never aborts it: unreachable participants are left to the recovery loop,
//! which replays step 4 from the durable record.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::types::{
    now_unix_ms, CoordinatorLog, DecisionState, Dtid, Participant, ParticipantDirectory,
    ParticipantId, TransactionRecord, TwoPcConfig,
};

/// Result of one distributed commit attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Every participant committed and the record was concluded.
    Committed { dtid: Dtid },
    /// The commit decision is durable but some participants did not
    /// acknowledge phase 2; recovery will finish them.
    CommitPending {
        dtid: Dtid,
        pending: Vec<(ParticipantId, String)>,
    },
    /// A participant failed to prepare; nothing was applied anywhere.
    Aborted {
        dtid: Dtid,
        participant: ParticipantId,
        reason: String,
    },
}

impl CommitOutcome {
    pub fn dtid(&self) -> &Dtid {
        match self {
            CommitOutcome::Committed { dtid }
            | CommitOutcome::CommitPending { dtid, .. }
            | CommitOutcome::Aborted { dtid, .. } => dtid,
        }
    }
}

/// Point-in-time copy of coordinator counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub commits: u64,
    pub aborts: u64,
    pub pending_commits: u64,
    pub recovered_commits: u64,
    pub recovered_rollbacks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    commits: AtomicU64,
    aborts: AtomicU64,
    pending_commits: AtomicU64,
    recovered_commits: AtomicU64,
    recovered_rollbacks: AtomicU64,
}

/// What one resolution attempt did with a durable record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Committed,
    RolledBack,
    /// Some participant is still unreachable; the record stays.
    Pending,
    /// The record belongs to a commit still in progress.
    Skipped,
}

/// Drives distributed commits and resolves abandoned records.
pub struct Coordinator {
    directory: Arc<dyn ParticipantDirectory>,
    config: TwoPcConfig,
    epoch_ms: u64,
    next_counter: AtomicU64,
    counters: Counters,
    /// Transactions this coordinator is driving right now.
    in_flight: Mutex<HashSet<Dtid>>,
}

/// Keeps a dtid in the in-flight set until dropped.
struct Driving<'a> {
    in_flight: &'a Mutex<HashSet<Dtid>>,
    dtid: Dtid,
}

impl Drop for Driving<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.dtid);
    }
}

impl Coordinator {
    pub fn new(directory: Arc<dyn ParticipantDirectory>, config: TwoPcConfig) -> Self {
        Self {
            directory,
            config,
            epoch_ms: now_unix_ms(),
            next_counter: AtomicU64::new(1),
            counters: Counters::default(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &TwoPcConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<dyn ParticipantDirectory> {
        &self.directory
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            commits: self.counters.commits.load(Ordering::Relaxed),
            aborts: self.counters.aborts.load(Ordering::Relaxed),
            pending_commits: self.counters.pending_commits.load(Ordering::Relaxed),
            recovered_commits: self.counters.recovered_commits.load(Ordering::Relaxed),
            recovered_rollbacks: self.counters.recovered_rollbacks.load(Ordering::Relaxed),
        }
    }

    /// True while `commit` is still driving `dtid`.
    pub fn is_in_flight(&self, dtid: &Dtid) -> bool {
        self.in_flight.lock().contains(dtid)
    }

    fn next_dtid(&self, coordinator: &str) -> Dtid {
        let counter = self.next_counter.fetch_add(1, Ordering::Relaxed);
        Dtid::new(coordinator, self.epoch_ms, counter)
    }

    fn drive(&self, dtid: &Dtid) -> Driving<'_> {
        self.in_flight.lock().insert(dtid.clone());
        Driving {
            in_flight: &self.in_flight,
            dtid: dtid.clone(),
        }
    }

    /// Atomically commits every participant.
    ///
    /// `Err` is returned only when the coordinator log could not be written
    /// and the outcome is unknown; recovery then decides it from whatever
    /// state the record reached.
    pub async fn commit(&self, participants: &[Arc<dyn Participant>]) -> Result<CommitOutcome> {
        let Some(first) = participants.first() else {
            anyhow::bail!("two-phase commit requires at least one participant");
        };
        let dtid = self.next_dtid(first.id());
        let _driving = self.drive(&dtid);
        let log = self
            .directory
            .coordinator_log(first.id())
            .with_context(|| format!("locate coordinator log for {}", first.id()))?;
        let record = TransactionRecord {
            dtid: dtid.clone(),
            state: DecisionState::Prepare,
            participants: participants.iter().map(|p| p.id().to_string()).collect(),
            created_unix_ms: now_unix_ms(),
        };

        if let Err(err) = log.create_record(record).await {
            // Decision: no record exists, so nothing may be prepared; plain rollback is final.
            rollback_unprepared(participants).await;
            self.counters.aborts.fetch_add(1, Ordering::Relaxed);
            return Err(err).with_context(|| format!("create transaction record {dtid}"));
        }

        let mut prepared: Vec<ParticipantId> = Vec::with_capacity(participants.len());
        let mut failure: Option<(ParticipantId, String)> = None;
        let mut futs = FuturesUnordered::new();
        for participant in participants {
            let dtid = &dtid;
            futs.push(async move { (participant.id().to_string(), participant.prepare(dtid).await) });
        }
        while let Some((id, res)) = futs.next().await {
            match res {
                Ok(()) => prepared.push(id),
                Err(err) => {
                    debug!(dtid = %dtid, participant = %id, error = %err, "prepare failed");
                    if failure.is_none() {
                        failure = Some((id, format!("{err:#}")));
                    }
                }
            }
        }
        drop(futs);

        if let Some((participant, reason)) = failure {
            return Ok(self
                .abort(log.as_ref(), dtid, participants, &prepared, participant, reason)
                .await);
        }

        let decided = match log.decide(&dtid, DecisionState::Commit).await {
            Ok(state) => state,
            Err(err) => {
                warn!(dtid = %dtid, error = %err, "record commit decision failed; trying rollback");
                // Whichever decision the record holds now is the outcome.
                log.decide(&dtid, DecisionState::Rollback)
                    .await
                    .with_context(|| format!("record decision for {dtid} after {err:#}"))?
            }
        };
        if decided != Some(DecisionState::Commit) {
            let reason = match decided {
                Some(state) => format!("transaction record decided {} elsewhere", state.as_str()),
                None => "transaction record was resolved by recovery".to_string(),
            };
            let participant = first.id().to_string();
            return Ok(self
                .abort(log.as_ref(), dtid, participants, &prepared, participant, reason)
                .await);
        }

        let pending = self.commit_prepared_all(&dtid, &prepared).await;
        if !pending.is_empty() {
            self.counters.pending_commits.fetch_add(1, Ordering::Relaxed);
            warn!(
                dtid = %dtid,
                pending = pending.len(),
                "commit decision recorded; recovery will finish unreachable participants"
            );
            return Ok(CommitOutcome::CommitPending { dtid, pending });
        }

        if let Err(err) = log.conclude(&dtid).await {
            // Decision: participants are committed; recovery re-commits idempotently and concludes later.
            warn!(dtid = %dtid, error = %err, "conclude transaction record failed");
        }
        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        Ok(CommitOutcome::Committed { dtid })
    }

    async fn abort(
        &self,
        log: &dyn CoordinatorLog,
        dtid: Dtid,
        participants: &[Arc<dyn Participant>],
        prepared: &[ParticipantId],
        participant: ParticipantId,
        reason: String,
    ) -> CommitOutcome {
        self.abort_after_prepare(log, &dtid, participants, prepared)
            .await;
        self.counters.aborts.fetch_add(1, Ordering::Relaxed);
        warn!(dtid = %dtid, participant = %participant, reason = %reason, "distributed transaction aborted");
        CommitOutcome::Aborted {
            dtid,
            participant,
            reason,
        }
    }

    async fn abort_after_prepare(
        &self,
        log: &dyn CoordinatorLog,
        dtid: &Dtid,
        participants: &[Arc<dyn Participant>],
        prepared: &[ParticipantId],
    ) {
        match log.decide(dtid, DecisionState::Rollback).await {
            Ok(Some(DecisionState::Commit)) => {
                warn!(dtid = %dtid, "record holds a commit decision; leaving it to recovery");
                return;
            }
            Ok(_) => {}
            Err(err) => warn!(dtid = %dtid, error = %err, "record rollback decision failed"),
        }
        let mut clean = true;
        for participant in participants {
            let id = participant.id();
            let result = if prepared.iter().any(|p| p == id) {
                self.directory.rollback_prepared(id, dtid).await
            } else {
                participant.rollback().await
            };
            if let Err(err) = result {
                clean = false;
                warn!(dtid = %dtid, participant = %id, error = %err, "rollback after failed prepare");
            }
        }
        // Decision: keep the record while any prepared participant may still hold its sub-transaction.
        if clean {
            if let Err(err) = log.conclude(dtid).await {
                warn!(dtid = %dtid, error = %err, "purge aborted transaction record failed");
            }
        }
    }

    async fn commit_prepared_all(
        &self,
        dtid: &Dtid,
        participants: &[ParticipantId],
    ) -> Vec<(ParticipantId, String)> {
        let mut futs = FuturesUnordered::new();
        for id in participants {
            futs.push(async move { (id.clone(), self.directory.commit_prepared(id, dtid).await) });
        }
        let mut pending = Vec::new();
        while let Some((id, res)) = futs.next().await {
            if let Err(err) = res {
                warn!(dtid = %dtid, participant = %id, error = %err, "commit prepared failed");
                pending.push((id, format!("{err:#}")));
            }
        }
        pending
    }

    /// Drives one durable record to its final state.
    pub async fn resolve(
        &self,
        log: &dyn CoordinatorLog,
        record: &TransactionRecord,
    ) -> Result<Resolution> {
        let dtid = &record.dtid;
        if self.is_in_flight(dtid) {
            return Ok(Resolution::Skipped);
        }
        let mut state = record.state;
        if state == DecisionState::Prepare {
            // Decision: no commit decision was recorded, so the transaction aborts.
            match log
                .decide(dtid, DecisionState::Rollback)
                .await
                .with_context(|| format!("record rollback decision for {dtid}"))?
            {
                Some(decided) => state = decided,
                None => return Ok(Resolution::Skipped),
            }
        }
        if state == DecisionState::Commit {
            let pending = self.commit_prepared_all(dtid, &record.participants).await;
            if !pending.is_empty() {
                return Ok(Resolution::Pending);
            }
            log.conclude(dtid)
                .await
                .with_context(|| format!("conclude recovered transaction {dtid}"))?;
            self.counters.recovered_commits.fetch_add(1, Ordering::Relaxed);
            info!(dtid = %dtid, participants = record.participants.len(), "recovered distributed commit");
            return Ok(Resolution::Committed);
        }

        let mut clean = true;
        for id in &record.participants {
            if let Err(err) = self.directory.rollback_prepared(id, dtid).await {
                clean = false;
                warn!(dtid = %dtid, participant = %id, error = %err, "rollback prepared failed");
            }
        }
        if !clean {
            return Ok(Resolution::Pending);
        }
        log.conclude(dtid)
            .await
            .with_context(|| format!("conclude rolled back transaction {dtid}"))?;
        self.counters.recovered_rollbacks.fetch_add(1, Ordering::Relaxed);
        info!(dtid = %dtid, "rolled back abandoned distributed transaction");
        Ok(Resolution::RolledBack)
    }
}

async fn rollback_unprepared(participants: &[Arc<dyn Participant>]) {
    for participant in participants {
        if let Err(err) = participant.rollback().await {
            warn!(participant = %participant.id(), error = %err, "rollback failed");
        }
    }
}
