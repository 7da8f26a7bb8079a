//! Service discovery: which endpoints serve which shard.
//!
//! The router resolves a `(keyspace, shard, role)` triple to a connection and
//! watches for schema documents published alongside the shard map. The
//! in-process `StaticTopology` is what tests and embedders use.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::info;

use crate::error::{GateError, GateResult};
use crate::shard::{ShardConn, ShardTarget};
use crate::vschema::VSchemaSource;

/// Kind of endpoint a read is served from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TabletRole {
    #[default]
    Primary,
    Replica,
    Rdonly,
}

impl TabletRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TabletRole::Primary => "primary",
            TabletRole::Replica => "replica",
            TabletRole::Rdonly => "rdonly",
        }
    }
}

impl fmt::Display for TabletRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TabletRole {
    type Err = GateError;

    fn from_str(raw: &str) -> GateResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "primary" | "master" => Ok(TabletRole::Primary),
            "replica" => Ok(TabletRole::Replica),
            "rdonly" | "batch" => Ok(TabletRole::Rdonly),
            other => Err(GateError::schema(format!("unknown tablet role {other}"))),
        }
    }
}

/// Schema document published through the topology watch.
#[derive(Clone, Debug, Default)]
pub struct SchemaUpdate {
    /// Monotonic publication counter; zero is the initial document.
    pub generation: u64,
    pub source: Arc<VSchemaSource>,
}

/// Topology contract consumed by the router.
pub trait Topology: Send + Sync + 'static {
    /// Shard names of a keyspace, in any order.
    fn shard_names(&self, keyspace: &str) -> Vec<String>;

    fn resolve(&self, keyspace: &str, shard: &str, role: TabletRole) -> GateResult<Arc<dyn ShardConn>>;

    /// Receiver observing every published schema document.
    fn watch(&self) -> watch::Receiver<SchemaUpdate>;

    /// Every primary endpoint, used to scan coordinator logs.
    fn primaries(&self) -> Vec<(ShardTarget, Arc<dyn ShardConn>)>;
}

struct ShardEndpoints {
    primary: Arc<dyn ShardConn>,
    replicas: Vec<Arc<dyn ShardConn>>,
    rdonly: Vec<Arc<dyn ShardConn>>,
    next_read: AtomicUsize,
}

impl ShardEndpoints {
    fn pick(&self, role: TabletRole) -> Option<Arc<dyn ShardConn>> {
        let pool = match role {
            TabletRole::Primary => return Some(self.primary.clone()),
            TabletRole::Replica => &self.replicas,
            TabletRole::Rdonly => &self.rdonly,
        };
        if pool.is_empty() {
            return None;
        }
        let idx = self.next_read.fetch_add(1, Ordering::Relaxed) % pool.len();
        pool.get(idx).cloned()
    }
}

/// Fixed shard map held in memory.
pub struct StaticTopology {
    shards: RwLock<BTreeMap<ShardTarget, ShardEndpoints>>,
    schema_tx: watch::Sender<SchemaUpdate>,
    generation: AtomicU64,
}

impl StaticTopology {
    pub fn new(source: VSchemaSource) -> Self {
        let (schema_tx, _) = watch::channel(SchemaUpdate {
            generation: 0,
            source: Arc::new(source),
        });
        Self {
            shards: RwLock::new(BTreeMap::new()),
            schema_tx,
            generation: AtomicU64::new(0),
        }
    }

    /// Registers (or replaces) the primary endpoint of a shard.
    pub fn add_shard(&self, keyspace: &str, shard: &str, primary: Arc<dyn ShardConn>) {
        let target = ShardTarget::new(keyspace, shard);
        let mut shards = self.shards.write();
        match shards.get_mut(&target) {
            Some(endpoints) => endpoints.primary = primary,
            None => {
                shards.insert(
                    target,
                    ShardEndpoints {
                        primary,
                        replicas: Vec::new(),
                        rdonly: Vec::new(),
                        next_read: AtomicUsize::new(0),
                    },
                );
            }
        }
    }

    /// Adds a read-only endpoint to an already registered shard.
    pub fn add_replica(
        &self,
        keyspace: &str,
        shard: &str,
        role: TabletRole,
        conn: Arc<dyn ShardConn>,
    ) -> GateResult<()> {
        let target = ShardTarget::new(keyspace, shard);
        let mut shards = self.shards.write();
        let endpoints = shards
            .get_mut(&target)
            .ok_or_else(|| GateError::schema(format!("shard {target} is not registered")))?;
        match role {
            TabletRole::Primary => endpoints.primary = conn,
            TabletRole::Replica => endpoints.replicas.push(conn),
            TabletRole::Rdonly => endpoints.rdonly.push(conn),
        }
        Ok(())
    }

    /// Removes a shard; the next schema rebuild drops it from routing.
    pub fn remove_shard(&self, keyspace: &str, shard: &str) {
        self.shards.write().remove(&ShardTarget::new(keyspace, shard));
    }

    /// Publishes a new schema document to every watcher.
    pub fn publish_schema(&self, source: VSchemaSource) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.schema_tx.send_replace(SchemaUpdate {
            generation,
            source: Arc::new(source),
        });
        info!(generation, "published schema update");
        generation
    }
}

impl Topology for StaticTopology {
    fn shard_names(&self, keyspace: &str) -> Vec<String> {
        self.shards
            .read()
            .keys()
            .filter(|t| t.keyspace.eq_ignore_ascii_case(keyspace))
            .map(|t| t.shard.clone())
            .collect()
    }

    fn resolve(&self, keyspace: &str, shard: &str, role: TabletRole) -> GateResult<Arc<dyn ShardConn>> {
        let shards = self.shards.read();
        let endpoints = shards
            .iter()
            .find(|(t, _)| t.keyspace.eq_ignore_ascii_case(keyspace) && t.shard == shard)
            .map(|(_, e)| e)
            .ok_or_else(|| GateError::ShardUnavailable {
                shard: format!("{keyspace}/{shard}"),
                message: "no endpoint registered".to_string(),
            })?;
        // Decision: a replica role with no replica endpoint errors instead of reading the primary.
        endpoints.pick(role).ok_or_else(|| GateError::ShardUnavailable {
            shard: format!("{keyspace}/{shard}"),
            message: format!("no {role} endpoint available"),
        })
    }

    fn watch(&self) -> watch::Receiver<SchemaUpdate> {
        self.schema_tx.subscribe()
    }

    fn primaries(&self) -> Vec<(ShardTarget, Arc<dyn ShardConn>)> {
        self.shards
            .read()
            .iter()
            .map(|(t, e)| (t.clone(), e.primary.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemShard;

    #[test]
    fn resolves_roles_and_rejects_missing_replicas() {
        let topology = StaticTopology::new(VSchemaSource::default());
        topology.add_shard("user", "-80", Arc::new(MemShard::new("user/-80")));
        topology.add_shard("user", "80-", Arc::new(MemShard::new("user/80-")));
        topology
            .add_replica("user", "-80", TabletRole::Replica, Arc::new(MemShard::new("user/-80@replica")))
            .expect("add replica");

        let mut names = topology.shard_names("USER");
        names.sort();
        assert_eq!(names, vec!["-80".to_string(), "80-".to_string()]);

        let primary = topology.resolve("user", "-80", TabletRole::Primary).expect("primary");
        assert_eq!(primary.target(), "user/-80");
        let replica = topology.resolve("user", "-80", TabletRole::Replica).expect("replica");
        assert_eq!(replica.target(), "user/-80@replica");

        let err = topology
            .resolve("user", "80-", TabletRole::Replica)
            .err()
            .expect("no replica");
        assert!(err.is_retryable_read());
        assert!(topology.resolve("user", "40-80", TabletRole::Primary).is_err());
        assert_eq!(topology.primaries().len(), 2);
    }

    #[test]
    fn publish_schema_bumps_generation() {
        let topology = StaticTopology::new(VSchemaSource::default());
        let rx = topology.watch();
        assert_eq!(rx.borrow().generation, 0);
        assert_eq!(topology.publish_schema(VSchemaSource::default()), 1);
        assert_eq!(rx.borrow().generation, 1);
        assert_eq!("REPLICA".parse::<TabletRole>().expect("role"), TabletRole::Replica);
    }
}
