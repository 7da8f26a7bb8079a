//! Background resolution of abandoned distributed transactions.
//!
//! Recovery is independent of any client session: it only reads durable
//! records from the coordinator logs and replays the decided outcome.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::coordinator::{Coordinator, Resolution};
use super::types::now_unix_ms;

/// Summary of one recovery pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub committed: usize,
    pub rolled_back: usize,
    /// Records that still have unreachable participants.
    pub pending: usize,
    /// Records whose commit is still being driven by this coordinator.
    pub skipped: usize,
}

impl Coordinator {
    /// Scans every coordinator log once and resolves records older than the
    /// abandon age. Records of commits this coordinator is still driving are
    /// skipped; other processes lose to them through the decision
    /// compare-and-set.
    pub async fn recover_once(&self) -> Result<RecoveryReport> {
        let abandon_ms = self.config().abandon_age.as_millis().min(u128::from(u64::MAX)) as u64;
        let cutoff = now_unix_ms().saturating_sub(abandon_ms);
        let mut report = RecoveryReport::default();

        for log in self.directory().coordinator_logs() {
            let records = log
                .unresolved(cutoff)
                .await
                .with_context(|| format!("scan coordinator log {}", log.name()))?;
            for record in records {
                report.scanned += 1;
                match self.resolve(log.as_ref(), &record).await {
                    Ok(Resolution::Committed) => report.committed += 1,
                    Ok(Resolution::RolledBack) => report.rolled_back += 1,
                    Ok(Resolution::Pending) => report.pending += 1,
                    Ok(Resolution::Skipped) => report.skipped += 1,
                    Err(err) => {
                        warn!(dtid = %record.dtid, error = %err, "resolve transaction record failed");
                        report.pending += 1;
                    }
                }
            }
        }
        Ok(report)
    }
}

/// Spawns the periodic recovery task.
///
/// The task exits once the shutdown sender is dropped or publishes `true`.
pub fn spawn_recovery_loop(
    coordinator: Arc<Coordinator>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = coordinator.config().recovery_interval;
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    match coordinator.recover_once().await {
                        Ok(report) => {
                            // Decision: log only passes that did work to keep background logs high-signal.
                            if report.scanned > 0 {
                                info!(
                                    scanned = report.scanned,
                                    committed = report.committed,
                                    rolled_back = report.rolled_back,
                                    pending = report.pending,
                                    "two-phase commit recovery pass"
                                );
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "two-phase commit recovery failed");
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use tokio::sync::Notify;

    use crate::twopc::coordinator::tests::{immediate_config, FakeDirectory};
    use crate::twopc::{CommitOutcome, TwoPcConfig};

    #[tokio::test]
    async fn recover_once_finishes_pending_commit() {
        let directory = Arc::new(FakeDirectory::new(&["user/-80", "lookup/0"]));
        let coordinator = Coordinator::new(directory.clone(), immediate_config());
        directory
            .shard("user/-80")
            .unreachable
            .store(true, Ordering::Relaxed);
        let participants = vec![
            directory.participant("user/-80", false),
            directory.participant("lookup/0", false),
        ];
        let outcome = coordinator.commit(&participants).await.expect("commit");
        assert!(matches!(outcome, CommitOutcome::CommitPending { .. }));

        let report = coordinator.recover_once().await.expect("recover");
        assert_eq!(report.pending, 1);
        assert_eq!(report.committed, 0);

        directory
            .shard("user/-80")
            .unreachable
            .store(false, Ordering::Relaxed);
        let report = coordinator.recover_once().await.expect("recover");
        assert_eq!(
            report,
            RecoveryReport {
                scanned: 1,
                committed: 1,
                rolled_back: 0,
                pending: 0,
                skipped: 0,
            }
        );
        assert_eq!(directory.shard("user/-80").committed.lock().len(), 1);
        assert_eq!(directory.log.len(), 0);
    }

    #[tokio::test]
    async fn young_records_are_left_to_their_coordinator() {
        let directory = Arc::new(FakeDirectory::new(&["user/-80", "lookup/0"]));
        let coordinator = Coordinator::new(
            directory.clone(),
            TwoPcConfig {
                abandon_age: Duration::from_secs(3600),
                recovery_interval: Duration::from_millis(10),
            },
        );
        directory
            .shard("lookup/0")
            .unreachable
            .store(true, Ordering::Relaxed);
        let participants = vec![
            directory.participant("user/-80", false),
            directory.participant("lookup/0", false),
        ];
        coordinator.commit(&participants).await.expect("commit");

        let report = coordinator.recover_once().await.expect("recover");
        assert_eq!(report.scanned, 0);
        assert_eq!(directory.log.len(), 1);
    }

    async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn recovery_skips_a_commit_it_is_still_driving() {
        let directory = Arc::new(FakeDirectory::new(&["user/-80", "lookup/0"]));
        let coordinator = Arc::new(Coordinator::new(directory.clone(), immediate_config()));
        let hold = Arc::new(Notify::new());
        let participants = vec![
            directory.participant("user/-80", false),
            directory.held_participant("lookup/0", hold.clone()),
        ];
        let committing = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.commit(&participants).await }
        });
        wait_for("first prepare", || {
            directory.shard("user/-80").prepared.lock().len() == 1
        })
        .await;

        let report = coordinator.recover_once().await.expect("recover");
        assert_eq!(report.scanned, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.rolled_back, 0);

        hold.notify_one();
        let outcome = committing.await.expect("join").expect("commit");
        assert!(matches!(outcome, CommitOutcome::Committed { .. }));
        assert_eq!(directory.shard("lookup/0").committed.lock().len(), 1);
        assert_eq!(directory.log.len(), 0);
    }

    #[tokio::test]
    async fn rollback_by_another_recovery_aborts_a_slow_commit() {
        let directory = Arc::new(FakeDirectory::new(&["user/-80", "lookup/0"]));
        let coordinator = Arc::new(Coordinator::new(directory.clone(), immediate_config()));
        // Another router process scanning the same coordinator log.
        let other = Coordinator::new(directory.clone(), immediate_config());
        let hold = Arc::new(Notify::new());
        let participants = vec![
            directory.participant("user/-80", false),
            directory.held_participant("lookup/0", hold.clone()),
        ];
        let committing = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.commit(&participants).await }
        });
        wait_for("first prepare", || {
            directory.shard("user/-80").prepared.lock().len() == 1
        })
        .await;

        let report = other.recover_once().await.expect("recover");
        assert_eq!(report.rolled_back, 1);
        assert_eq!(directory.log.len(), 0);

        hold.notify_one();
        let outcome = committing.await.expect("join").expect("commit");
        assert!(matches!(outcome, CommitOutcome::Aborted { .. }), "{outcome:?}");
        for id in ["user/-80", "lookup/0"] {
            let shard = directory.shard(id);
            assert!(shard.prepared.lock().is_empty(), "{id} still prepared");
            assert!(shard.committed.lock().is_empty(), "{id} committed");
        }
        assert_eq!(directory.log.len(), 0);
        assert_eq!(other.recover_once().await.expect("recover").scanned, 0);
    }

    #[tokio::test]
    async fn recovery_loop_converges_and_stops_on_shutdown() {
        let directory = Arc::new(FakeDirectory::new(&["user/-80", "lookup/0"]));
        let coordinator = Arc::new(Coordinator::new(directory.clone(), immediate_config()));
        directory
            .shard("lookup/0")
            .unreachable
            .store(true, Ordering::Relaxed);
        let participants = vec![
            directory.participant("user/-80", false),
            directory.participant("lookup/0", false),
        ];
        coordinator.commit(&participants).await.expect("commit");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_recovery_loop(coordinator.clone(), shutdown_rx);
        directory
            .shard("lookup/0")
            .unreachable
            .store(false, Ordering::Relaxed);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while directory.log.len() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "recovery did not converge");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(directory.shard("lookup/0").committed.lock().len(), 1);

        shutdown_tx.send(true).expect("send shutdown");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("recovery loop stops")
            .expect("recovery loop joins");
    }
}
