//! Keygate: a sharding SQL router.
//!
//! A single `Gate` fronts a set of keyspaces, each split into shards by
//! keyspace-id range. Statements are parsed, planned against the current
//! vindex schema, fanned out to the shards that own the rows, and merged
//! back into one result. Multi-shard writes commit through the two-phase
//! commit coordinator in `keygate_twopc`.
//!
//! Shard endpoints sit behind the `ShardConn` trait. `memory::MemShard` is
//! the in-process implementation used by tests and local setups.

pub mod config;
pub mod error;
mod executor;
pub mod gate;
pub mod key;
mod lookup;
pub mod memory;
pub mod metrics;
pub mod planner;
mod sequence;
pub mod session;
pub mod shard;
pub mod split;
pub mod sql;
pub mod topology;
pub mod txn;
pub mod value;
pub mod vindex;
pub mod vschema;

pub use config::{GateConfig, TransactionMode};
pub use error::{GateError, GateResult, ShardError, Warning};
pub use gate::Gate;
pub use key::{KeyRange, KeyspaceId};
pub use metrics::GateMetricsSnapshot;
pub use session::Session;
pub use shard::{ShardConn, ShardTarget};
pub use split::{QuerySplit, SplitOptions};
pub use topology::{StaticTopology, TabletRole, Topology};
pub use txn::TxnState;
pub use value::{BindVars, Field, FieldType, QueryResult, Row, Value};
pub use vschema::{VSchema, VSchemaSource};
