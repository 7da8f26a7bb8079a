//! Client session state carried between statements.

use crate::config::TransactionMode;
use crate::error::Warning;
use crate::shard::ShardTarget;
use crate::topology::TabletRole;
use crate::txn::{Transaction, TxnState};

/// Per-connection state. Owned by the caller and passed `&mut` into every
/// `Gate` call, so no two statements of one session ever run concurrently.
#[derive(Default)]
pub struct Session {
    /// Keyspace unqualified table names resolve against first.
    pub target_keyspace: Option<String>,
    /// Endpoint kind for reads outside a transaction.
    pub role: TabletRole,
    pub transaction_mode: TransactionMode,
    /// Warnings of the most recent statement.
    pub warnings: Vec<Warning>,
    pub(crate) txn: Transaction,
}

impl Session {
    pub fn new(transaction_mode: TransactionMode) -> Self {
        Self {
            transaction_mode,
            ..Self::default()
        }
    }

    pub fn with_target(mut self, keyspace: impl Into<String>) -> Self {
        self.target_keyspace = Some(keyspace.into());
        self
    }

    pub fn with_role(mut self, role: TabletRole) -> Self {
        self.role = role;
        self
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.is_active()
    }

    pub fn transaction_state(&self) -> TxnState {
        self.txn.state()
    }

    pub fn participants(&self) -> Vec<ShardTarget> {
        self.txn.participants()
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }
}
