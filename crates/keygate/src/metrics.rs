//! In-process router counters.
//!
//! Lock-free apart from the per-plan breakdown, so they can be bumped on
//! every statement.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use keygate_twopc::twopc::CoordinatorStats;
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct GateMetrics {
    /// Schema snapshots swapped in (explicit reloads and watch updates).
    schema_reloads: AtomicU64,
    /// Schema documents or watch events that could not be applied.
    schema_watch_errors: AtomicU64,
    /// Statements rejected by the parser.
    parse_errors: AtomicU64,
    /// Statements that planned successfully.
    queries: AtomicU64,
    /// Sum of statement latency in nanoseconds.
    query_latency_ns_total: AtomicU64,
    /// Statements that failed after planning.
    query_errors: AtomicU64,
    /// Per-shard calls that failed or timed out.
    shard_errors: AtomicU64,
    /// Per-shard calls that timed out.
    shard_timeouts: AtomicU64,
    /// Per-shard errors downgraded to warnings.
    shard_warnings: AtomicU64,
    /// Statements per plan kind.
    queries_by_plan: Mutex<BTreeMap<&'static str, u64>>,
}

/// Immutable snapshot view of [`GateMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateMetricsSnapshot {
    pub schema_reloads: u64,
    pub schema_watch_errors: u64,
    pub parse_errors: u64,
    pub queries: u64,
    pub query_latency_ns_total: u64,
    pub query_errors: u64,
    pub shard_errors: u64,
    pub shard_timeouts: u64,
    pub shard_warnings: u64,
    pub queries_by_plan: BTreeMap<&'static str, u64>,
    /// Two-phase commit counters from the coordinator.
    pub twopc: CoordinatorStats,
}

impl GateMetrics {
    pub fn record_schema_reload(&self) {
        self.schema_reloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_schema_watch_error(&self) {
        self.schema_watch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one planned statement, its outcome and latency.
    pub fn record_query(&self, plan: &'static str, ok: bool, latency: Duration) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.query_latency_ns_total
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
        if !ok {
            self.query_errors.fetch_add(1, Ordering::Relaxed);
        }
        *self.queries_by_plan.lock().entry(plan).or_default() += 1;
    }

    /// Records one failed shard call; `timeout` marks deadline expiry.
    pub fn record_shard_error(&self, timeout: bool, as_warning: bool) {
        self.shard_errors.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.shard_timeouts.fetch_add(1, Ordering::Relaxed);
        }
        if as_warning {
            self.shard_warnings.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self, twopc: CoordinatorStats) -> GateMetricsSnapshot {
        GateMetricsSnapshot {
            schema_reloads: self.schema_reloads.load(Ordering::Relaxed),
            schema_watch_errors: self.schema_watch_errors.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            query_latency_ns_total: self.query_latency_ns_total.load(Ordering::Relaxed),
            query_errors: self.query_errors.load(Ordering::Relaxed),
            shard_errors: self.shard_errors.load(Ordering::Relaxed),
            shard_timeouts: self.shard_timeouts.load(Ordering::Relaxed),
            shard_warnings: self.shard_warnings.load(Ordering::Relaxed),
            queries_by_plan: self.queries_by_plan.lock().clone(),
            twopc,
        }
    }
}

impl GateMetricsSnapshot {
    /// Renders metrics in a plain-text `key=value` format.
    pub fn render_text(&self) -> String {
        let mut out = format!(
            "schema_reloads={}\nschema_watch_errors={}\nparse_errors={}\nqueries={}\nquery_latency_ns_total={}\nquery_errors={}\nshard_errors={}\nshard_timeouts={}\nshard_warnings={}\ntwopc_commits={}\ntwopc_aborts={}\ntwopc_pending_commits={}\ntwopc_recovered_commits={}\ntwopc_recovered_rollbacks={}\n",
            self.schema_reloads,
            self.schema_watch_errors,
            self.parse_errors,
            self.queries,
            self.query_latency_ns_total,
            self.query_errors,
            self.shard_errors,
            self.shard_timeouts,
            self.shard_warnings,
            self.twopc.commits,
            self.twopc.aborts,
            self.twopc.pending_commits,
            self.twopc.recovered_commits,
            self.twopc.recovered_rollbacks,
        );
        for (plan, count) in &self.queries_by_plan {
            out.push_str(&format!("queries_plan_{plan}={count}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_queries_per_plan_kind() {
        let metrics = GateMetrics::default();
        metrics.record_query("scatter", true, Duration::from_micros(5));
        metrics.record_query("scatter", false, Duration::from_micros(5));
        metrics.record_query("single_shard", true, Duration::from_micros(1));
        metrics.record_shard_error(true, true);
        metrics.record_parse_error();

        let snapshot = metrics.snapshot(CoordinatorStats::default());
        assert_eq!(snapshot.queries, 3);
        assert_eq!(snapshot.query_errors, 1);
        assert_eq!(snapshot.queries_by_plan.get("scatter"), Some(&2));
        assert_eq!(snapshot.shard_timeouts, 1);

        let text = snapshot.render_text();
        assert!(text.contains("parse_errors=1\n"));
        assert!(text.contains("queries_plan_single_shard=1\n"));
        assert!(text.contains("twopc_commits=0\n"));
    }
}
