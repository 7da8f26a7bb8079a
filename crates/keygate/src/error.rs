//! Router error taxonomy.
//!
//! Every statement-level failure surfaces as a `GateError` carrying a
//! MySQL-style numeric code, the shard it came from (when one is involved),
//! and a message. Shard endpoints report their native failures as
//! `ShardError`, which the executor either wraps into `GateError::Shard` or
//! converts into a `Warning` when the request asked for errors as warnings.

use std::fmt;

use thiserror::Error;

pub const ER_UNKNOWN_ERROR: u16 = 1105;
pub const ER_PARSE_ERROR: u16 = 1064;
pub const ER_NO_SUCH_TABLE: u16 = 1146;
pub const ER_BAD_FIELD_ERROR: u16 = 1054;
pub const ER_DUP_ENTRY: u16 = 1062;
pub const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
pub const ER_NOT_SUPPORTED_YET: u16 = 1235;
pub const ER_QUERY_INTERRUPTED: u16 = 1317;
pub const ER_XA_RBROLLBACK: u16 = 1614;
pub const CR_SERVER_LOST: u16 = 2013;

/// Message used for every statement timeout, shard-level or not.
pub const DEADLINE_EXCEEDED: &str = "query execution was interrupted: context deadline exceeded";

/// Native error returned by a shard endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("errno {code}: {message}")]
pub struct ShardError {
    pub code: u16,
    pub message: String,
}

impl ShardError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Endpoint could not be reached or dropped the connection.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(CR_SERVER_LOST, message)
    }

    pub fn interrupted() -> Self {
        Self::new(ER_QUERY_INTERRUPTED, DEADLINE_EXCEEDED)
    }

    pub fn is_unavailable(&self) -> bool {
        self.code == CR_SERVER_LOST
    }
}

/// One failed shard recorded in errors-as-warnings mode, or a non-fatal
/// condition such as a pending distributed commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Warning {
    pub shard: String,
    pub code: u16,
    pub message: String,
}

impl Warning {
    pub fn from_shard_error(shard: &str, err: &ShardError) -> Self {
        Self {
            shard: shard.to_string(),
            code: err.code,
            message: format!("target: {shard}: {err}"),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GateError {
    /// Malformed statement; never retried.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Unknown keyspace, table, vindex or column in the schema.
    #[error("{0}")]
    Schema(String),

    /// No keyspace id could be resolved for a row-placing value.
    #[error("{0}")]
    VindexResolution(String),

    /// Transient endpoint failure; read-only statements may be retried.
    #[error("target: {shard}: shard unavailable: {message}")]
    ShardUnavailable { shard: String, message: String },

    #[error("target: {shard}: query execution was interrupted: context deadline exceeded")]
    Timeout { shard: String },

    #[error("{0}")]
    TransactionModeViolation(String),

    /// A participant refused to prepare; every participant was rolled back.
    #[error("distributed transaction {dtid} aborted: prepare failed on {participant}: {message}")]
    PrepareFailure {
        dtid: String,
        participant: String,
        message: String,
    },

    /// The commit decision is durable but some participants have not
    /// acknowledged it yet. Recorded as a warning, never returned to callers
    /// of `commit`.
    #[error("distributed transaction {dtid} committed; waiting on {}", .pending.join(","))]
    PartialCommitFailure { dtid: String, pending: Vec<String> },

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A shard's native error, surfaced verbatim.
    #[error("target: {shard}: {source}")]
    Shard {
        shard: String,
        #[source]
        source: ShardError,
    },

    /// Failure inside the router itself (coordinator log, task join).
    #[error("{0}")]
    Internal(String),
}

impl GateError {
    pub fn schema(message: impl Into<String>) -> Self {
        GateError::Schema(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        GateError::Unsupported(message.into())
    }

    pub fn vindex(message: impl Into<String>) -> Self {
        GateError::VindexResolution(message.into())
    }

    /// Wraps a shard's native error, keeping timeouts and connectivity
    /// failures in their own categories.
    pub fn from_shard(shard: &str, err: ShardError) -> Self {
        if err.code == ER_QUERY_INTERRUPTED {
            GateError::Timeout {
                shard: shard.to_string(),
            }
        } else if err.is_unavailable() {
            GateError::ShardUnavailable {
                shard: shard.to_string(),
                message: err.message,
            }
        } else {
            GateError::Shard {
                shard: shard.to_string(),
                source: err,
            }
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            GateError::Syntax(_) => ER_PARSE_ERROR,
            GateError::Schema(_) => ER_NO_SUCH_TABLE,
            GateError::VindexResolution(_) => ER_UNKNOWN_ERROR,
            GateError::ShardUnavailable { .. } => CR_SERVER_LOST,
            GateError::Timeout { .. } => ER_QUERY_INTERRUPTED,
            GateError::TransactionModeViolation(_) => ER_UNKNOWN_ERROR,
            GateError::PrepareFailure { .. } => ER_XA_RBROLLBACK,
            GateError::PartialCommitFailure { .. } => ER_UNKNOWN_ERROR,
            GateError::Unsupported(_) => ER_NOT_SUPPORTED_YET,
            GateError::Shard { source, .. } => source.code,
            GateError::Internal(_) => ER_UNKNOWN_ERROR,
        }
    }

    pub fn shard(&self) -> Option<&str> {
        match self {
            GateError::ShardUnavailable { shard, .. }
            | GateError::Timeout { shard }
            | GateError::Shard { shard, .. } => Some(shard),
            GateError::PrepareFailure { participant, .. } => Some(participant),
            _ => None,
        }
    }

    /// True only for failures where re-running a read-only statement is safe.
    pub fn is_retryable_read(&self) -> bool {
        matches!(
            self,
            GateError::ShardUnavailable { .. } | GateError::Timeout { .. }
        )
    }

    /// The shard-native form used when this error becomes a warning.
    pub fn as_shard_error(&self) -> ShardError {
        match self {
            GateError::Shard { source, .. } => source.clone(),
            GateError::Timeout { .. } => ShardError::interrupted(),
            GateError::ShardUnavailable { message, .. } => ShardError::unavailable(message.clone()),
            other => ShardError::new(other.code(), other.to_string()),
        }
    }
}

impl From<anyhow::Error> for GateError {
    fn from(err: anyhow::Error) -> Self {
        GateError::Internal(format!("{err:#}"))
    }
}

pub type GateResult<T> = std::result::Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_errors_keep_native_code_and_target() {
        let err = GateError::from_shard(
            "user/-80",
            ShardError::new(ER_BAD_FIELD_ERROR, "Unknown column 'bad' in 'field list'"),
        );
        assert_eq!(err.code(), ER_BAD_FIELD_ERROR);
        assert_eq!(err.shard(), Some("user/-80"));
        assert_eq!(
            err.to_string(),
            "target: user/-80: errno 1054: Unknown column 'bad' in 'field list'"
        );
        assert!(!err.is_retryable_read());
    }

    #[test]
    fn interrupted_shard_call_becomes_timeout() {
        let err = GateError::from_shard("user/80-", ShardError::interrupted());
        assert!(matches!(err, GateError::Timeout { .. }));
        assert_eq!(err.code(), ER_QUERY_INTERRUPTED);
        assert!(err.to_string().contains("context deadline exceeded"));
        assert!(err.is_retryable_read());
    }

    #[test]
    fn warning_carries_errno_in_message() {
        let warning = Warning::from_shard_error(
            "user/-80",
            &ShardError::new(ER_BAD_FIELD_ERROR, "Unknown column 'bad'"),
        );
        assert_eq!(warning.code, 1054);
        assert!(warning.message.contains("errno 1054"));
        assert!(warning.message.contains("Unknown column"));
    }
}
