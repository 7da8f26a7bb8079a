//! Shared fixture for router integration tests.
//!
//! Builds a `user` keyspace split into `-80` and `80-` plus an unsharded
//! `lookup` keyspace holding the lookup tables and the id sequence, all on
//! in-memory shards. `devices` carries a two-column lookup, `songs` owns a
//! raw keyspace-id lookup that `song_plays` uses as its primary vindex.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use anyhow::{Context, Result};
use keygate::memory::{MemShard, TableDef};
use keygate::vindex::hash_u64;
use keygate::{
    BindVars, FieldType, Gate, GateConfig, KeyspaceId, QueryResult, Session, ShardConn,
    StaticTopology, Value, VSchemaSource,
};
use tracing_subscriber::EnvFilter;

pub const VSCHEMA_JSON: &str = r#"{
  "keyspaces": {
    "user": {
      "sharded": true,
      "vindexes": {
        "hash_index": {"type": "hash"},
        "name_map": {"type": "lookup_hash",
                     "params": {"table": "lookup.name_map", "from": "name", "to": "user_id"},
                     "owner": "users"},
        "email_map": {"type": "lookup_hash_unique",
                      "params": {"table": "lookup.email_map", "from": "email", "to": "user_id"}},
        "device_pair": {"type": "lookup_hash",
                        "params": {"table": "lookup.device_pair", "from": "vendor,serial", "to": "device_id"},
                        "owner": "devices"},
        "song_map": {"type": "lookup_unique",
                     "params": {"table": "lookup.song_map", "from": "song_id", "to": "keyspace_id"},
                     "owner": "songs"}
      },
      "tables": {
        "users": {
          "column_vindexes": [
            {"column": "id", "name": "hash_index"},
            {"column": "name", "name": "name_map"},
            {"column": "email", "name": "email_map"}
          ],
          "auto_increment": {"column": "id", "sequence": "users_seq"}
        },
        "orders": {
          "column_vindexes": [{"column": "user_id", "name": "hash_index"}]
        },
        "devices": {
          "column_vindexes": [
            {"column": "id", "name": "hash_index"},
            {"columns": ["vendor", "serial"], "name": "device_pair"}
          ]
        },
        "songs": {
          "column_vindexes": [
            {"column": "user_id", "name": "hash_index"},
            {"column": "song_id", "name": "song_map"}
          ]
        },
        "song_plays": {
          "column_vindexes": [{"column": "song_id", "name": "song_map"}]
        }
      }
    },
    "lookup": {
      "sharded": false,
      "tables": {
        "name_map": {},
        "email_map": {},
        "device_pair": {},
        "song_map": {},
        "users_seq": {"type": "sequence"}
      }
    }
  }
}"#;

static TRACING: Once = Once::new();

/// Installs a test subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("keygate=info,keygate_twopc=info,warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_test_writer()
            .try_init();
    });
}

pub struct Cluster {
    pub gate: Gate,
    pub topology: Arc<StaticTopology>,
    /// `user/-80` then `user/80-`.
    pub user_shards: [Arc<MemShard>; 2],
    pub lookup: Arc<MemShard>,
}

impl Cluster {
    pub async fn start() -> Result<Self> {
        Self::start_with(GateConfig::default()).await
    }

    pub async fn start_with(config: GateConfig) -> Result<Self> {
        init_tracing();
        let source = VSchemaSource::from_json(VSCHEMA_JSON)?;
        let topology = Arc::new(StaticTopology::new(source.clone()));

        let user_shards = [user_shard("user/-80")?, user_shard("user/80-")?];
        topology.add_shard("user", "-80", user_shards[0].clone());
        topology.add_shard("user", "80-", user_shards[1].clone());

        let lookup = Arc::new(
            MemShard::new("lookup/0")
                .with_table(
                    TableDef::new("name_map")
                        .column("name", FieldType::VarChar)
                        .column("user_id", FieldType::Int64)
                        .primary_key(&["name", "user_id"]),
                )?
                .with_table(
                    TableDef::new("email_map")
                        .column("email", FieldType::VarChar)
                        .column("user_id", FieldType::Int64)
                        .primary_key(&["email"]),
                )?
                .with_table(
                    TableDef::new("device_pair")
                        .column("vendor", FieldType::VarChar)
                        .column("serial", FieldType::Int64)
                        .column("device_id", FieldType::Int64)
                        .primary_key(&["vendor", "serial", "device_id"]),
                )?
                .with_table(
                    TableDef::new("song_map")
                        .column("song_id", FieldType::Int64)
                        .column("keyspace_id", FieldType::VarBinary)
                        .primary_key(&["song_id"]),
                )?
                .with_table(TableDef::sequence("users_seq"))?,
        );
        lookup
            .execute(
                "insert into users_seq (id, next_id, cache) values (0, 1, 10)",
                &BindVars::new(),
                None,
            )
            .await
            .context("seed users_seq")?;
        topology.add_shard("lookup", "0", lookup.clone());

        let gate = Gate::new(topology.clone(), source, config)?;
        Ok(Self {
            gate,
            topology,
            user_shards,
            lookup,
        })
    }

    pub fn session(&self) -> Session {
        self.gate.new_session()
    }

    pub async fn exec(&self, session: &mut Session, sql: &str) -> Result<QueryResult> {
        self.gate
            .execute(session, sql, &BindVars::new())
            .await
            .with_context(|| format!("execute {sql}"))
    }

    /// Inserts one user per `(id, name)` in a single statement.
    pub async fn insert_users(&self, users: &[(i64, &str)]) -> Result<()> {
        let values: Vec<String> = users
            .iter()
            .map(|(id, name)| format!("({id}, '{name}')"))
            .collect();
        let mut session = self.session();
        self.exec(
            &mut session,
            &format!("insert into users (id, name) values {}", values.join(", ")),
        )
        .await?;
        Ok(())
    }
}

pub fn user_shard(target: &str) -> Result<Arc<MemShard>> {
    Ok(Arc::new(
        MemShard::new(target)
            .with_table(
                TableDef::new("users")
                    .column("id", FieldType::Int64)
                    .column("name", FieldType::VarChar)
                    .column("email", FieldType::VarChar)
                    .primary_key(&["id"]),
            )?
            .with_table(
                TableDef::new("orders")
                    .column("id", FieldType::Int64)
                    .column("user_id", FieldType::Int64)
                    .column("amount", FieldType::Int64)
                    .primary_key(&["id"]),
            )?
            .with_table(
                TableDef::new("devices")
                    .column("id", FieldType::Int64)
                    .column("vendor", FieldType::VarChar)
                    .column("serial", FieldType::Int64)
                    .primary_key(&["id"]),
            )?
            .with_table(
                TableDef::new("songs")
                    .column("song_id", FieldType::Int64)
                    .column("user_id", FieldType::Int64)
                    .column("title", FieldType::VarChar)
                    .primary_key(&["song_id"]),
            )?
            .with_table(
                TableDef::new("song_plays")
                    .column("song_id", FieldType::Int64)
                    .column("plays", FieldType::Int64)
                    .primary_key(&["song_id"]),
            )?,
    ))
}

/// Keyspace id the `hash` vindex assigns to `id`.
pub fn ksid(id: i64) -> KeyspaceId {
    KeyspaceId::from_u64(hash_u64(id as u64))
}

/// Index into `Cluster::user_shards` of the shard owning `id`.
pub fn shard_of(id: i64) -> usize {
    usize::from(hash_u64(id as u64) >= 1 << 63)
}

/// First `count` positive ids owned by shard `idx`.
pub fn ids_on_shard(idx: usize, count: usize) -> Vec<i64> {
    (1..).filter(|id| shard_of(*id) == idx).take(count).collect()
}

/// First column of every row, as integers.
pub fn int_column(result: &QueryResult) -> Vec<i64> {
    result
        .rows
        .iter()
        .filter_map(|row| row.first().and_then(Value::as_i64))
        .collect()
}
