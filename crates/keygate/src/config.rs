//! Router configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use keygate_twopc::twopc::TwoPcConfig;

/// Commit semantics for transactions spanning several shards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransactionMode {
    /// At most one participant shard.
    Single,
    /// Participants committed one at a time, no atomicity across shards.
    #[default]
    Multi,
    /// Atomic commit through the two-phase commit coordinator.
    TwoPc,
}

impl TransactionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionMode::Single => "single",
            TransactionMode::Multi => "multi",
            TransactionMode::TwoPc => "twopc",
        }
    }
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionMode {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(TransactionMode::Single),
            "multi" => Ok(TransactionMode::Multi),
            "twopc" | "2pc" => Ok(TransactionMode::TwoPc),
            other => anyhow::bail!("invalid transaction mode: {other}"),
        }
    }
}

/// Runtime configuration for one router process.
#[derive(Clone, Debug)]
pub struct GateConfig {
    /// Mode given to new sessions.
    pub transaction_mode: TransactionMode,
    /// Default per-shard statement timeout; a query directive overrides it.
    pub query_timeout: Duration,
    pub twopc: TwoPcConfig,
    /// Spacing between shard-map polls in the schema watcher.
    pub schema_watch_interval: Duration,
    /// Upper bound on intermediate rows materialized by a router-side join.
    pub max_join_rows: usize,
    /// How long the in-memory shard waits for a table lock.
    pub lock_wait_timeout: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            transaction_mode: TransactionMode::Multi,
            query_timeout: Duration::from_millis(30_000),
            twopc: TwoPcConfig::default(),
            schema_watch_interval: Duration::from_millis(1_000),
            max_join_rows: 100_000,
            lock_wait_timeout: Duration::from_millis(5_000),
        }
    }
}

impl GateConfig {
    /// Loads configuration from `KEYGATE_*` environment variables with
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let transaction_mode = match std::env::var("KEYGATE_TRANSACTION_MODE").ok() {
            Some(raw) => raw
                .parse::<TransactionMode>()
                .context("KEYGATE_TRANSACTION_MODE")?,
            None => defaults.transaction_mode,
        };
        let query_timeout_ms = parse_u64(std::env::var("KEYGATE_QUERY_TIMEOUT_MS").ok(), 30_000)
            .context("KEYGATE_QUERY_TIMEOUT_MS")?;
        let abandon_age_ms =
            parse_u64(std::env::var("KEYGATE_TWOPC_ABANDON_AGE_MS").ok(), 2_000)
                .context("KEYGATE_TWOPC_ABANDON_AGE_MS")?;
        let recovery_interval_ms =
            parse_u64(std::env::var("KEYGATE_TWOPC_RECOVERY_INTERVAL_MS").ok(), 1_000)
                .context("KEYGATE_TWOPC_RECOVERY_INTERVAL_MS")?;
        let watch_interval_ms =
            parse_u64(std::env::var("KEYGATE_SCHEMA_WATCH_INTERVAL_MS").ok(), 1_000)
                .context("KEYGATE_SCHEMA_WATCH_INTERVAL_MS")?;
        let max_join_rows = parse_usize(std::env::var("KEYGATE_MAX_JOIN_ROWS").ok(), 100_000)
            .context("KEYGATE_MAX_JOIN_ROWS")?;
        let lock_wait_ms = parse_u64(std::env::var("KEYGATE_LOCK_WAIT_TIMEOUT_MS").ok(), 5_000)
            .context("KEYGATE_LOCK_WAIT_TIMEOUT_MS")?;

        // Decision: a zero recovery interval would spin the background task.
        if recovery_interval_ms == 0 {
            anyhow::bail!("KEYGATE_TWOPC_RECOVERY_INTERVAL_MS must be greater than zero");
        }

        Ok(Self {
            transaction_mode,
            query_timeout: Duration::from_millis(query_timeout_ms),
            twopc: TwoPcConfig {
                abandon_age: Duration::from_millis(abandon_age_ms),
                recovery_interval: Duration::from_millis(recovery_interval_ms),
            },
            schema_watch_interval: Duration::from_millis(watch_interval_ms.max(1)),
            max_join_rows,
            lock_wait_timeout: Duration::from_millis(lock_wait_ms),
        })
    }
}

/// Parses an optional `u64` with fallback default.
fn parse_u64(value: Option<String>, default_value: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value: {raw}")),
        None => Ok(default_value),
    }
}

/// Parses an optional `usize` with fallback default.
fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 7] = [
        "KEYGATE_TRANSACTION_MODE",
        "KEYGATE_QUERY_TIMEOUT_MS",
        "KEYGATE_TWOPC_ABANDON_AGE_MS",
        "KEYGATE_TWOPC_RECOVERY_INTERVAL_MS",
        "KEYGATE_SCHEMA_WATCH_INTERVAL_MS",
        "KEYGATE_MAX_JOIN_ROWS",
        "KEYGATE_LOCK_WAIT_TIMEOUT_MS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_when_unset() {
        clear_env();
        let config = GateConfig::from_env().expect("load config");
        assert_eq!(config.transaction_mode, TransactionMode::Multi);
        assert_eq!(config.query_timeout, Duration::from_secs(30));
        assert_eq!(config.twopc.abandon_age, Duration::from_secs(2));
        assert_eq!(config.max_join_rows, 100_000);
    }

    #[test]
    #[serial]
    fn env_overrides_are_parsed() {
        clear_env();
        std::env::set_var("KEYGATE_TRANSACTION_MODE", "TWOPC");
        std::env::set_var("KEYGATE_QUERY_TIMEOUT_MS", "250");
        std::env::set_var("KEYGATE_TWOPC_ABANDON_AGE_MS", "0");
        let config = GateConfig::from_env().expect("load config");
        clear_env();
        assert_eq!(config.transaction_mode, TransactionMode::TwoPc);
        assert_eq!(config.query_timeout, Duration::from_millis(250));
        assert_eq!(config.twopc.abandon_age, Duration::ZERO);
    }

    #[test]
    #[serial]
    fn invalid_values_name_the_variable() {
        clear_env();
        std::env::set_var("KEYGATE_MAX_JOIN_ROWS", "lots");
        let err = GateConfig::from_env().expect_err("invalid usize");
        clear_env();
        assert!(format!("{err:#}").contains("KEYGATE_MAX_JOIN_ROWS"));

        std::env::set_var("KEYGATE_TRANSACTION_MODE", "eventual");
        let err = GateConfig::from_env().expect_err("invalid mode");
        clear_env();
        assert!(format!("{err:#}").contains("invalid transaction mode"));
    }
}
