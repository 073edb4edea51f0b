//! Registries & Topology Facade
//!
//! Hosts and database instances are interned so the whole process shares
//! one object (and one cached probe state, one shell pool) per machine.
//! `Topology` is the front door: it owns the registries, the spare
//! allocator, and the configuration sink, tracks every pool and shard, and
//! can rebuild all of that from persisted snapshots.

use crate::config::Config;
use crate::domain::entities::{
    InstanceId, PoolSnapshot, ShardRange, SpareCriteria, TableSpec,
};
use crate::domain::ports::{ConfigSink, QueryExecutor, RemoteShell, SpareAllocator};
use crate::error::{Error, Result};
use crate::infrastructure::tasks::fan_out_join;
use crate::topology::db::Db;
use crate::topology::host::Host;
use crate::topology::pool::Pool;
use crate::topology::shard::Shard;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// One `Host` per IP address, shared by every instance on that machine.
pub struct HostRegistry {
    shell: Arc<dyn RemoteShell>,
    config: Arc<Config>,
    hosts: DashMap<String, Arc<Host>>,
}

impl HostRegistry {
    pub fn new(shell: Arc<dyn RemoteShell>, config: Arc<Config>) -> Self {
        Self {
            shell,
            config,
            hosts: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, ip: &str) -> Arc<Host> {
        self.hosts
            .entry(ip.to_string())
            .or_insert_with(|| {
                Arc::new(Host::new(ip, self.shell.clone(), self.config.clone()))
            })
            .clone()
    }
}

/// One `Db` per (ip, port). Holds a weak self-reference so instances can
/// resolve peers (e.g. a master discovered in `SHOW SLAVE STATUS`) back
/// through the registry.
pub struct DbRegistry {
    hosts: HostRegistry,
    sql: Arc<dyn QueryExecutor>,
    config: Arc<Config>,
    dbs: DashMap<InstanceId, Arc<Db>>,
    self_ref: Weak<DbRegistry>,
}

impl DbRegistry {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        sql: Arc<dyn QueryExecutor>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            hosts: HostRegistry::new(shell, config.clone()),
            sql,
            config,
            dbs: DashMap::new(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn get_or_create(&self, id: InstanceId) -> Arc<Db> {
        self.dbs
            .entry(id.clone())
            .or_insert_with(|| {
                let host = self.hosts.get_or_create(&id.ip);
                Arc::new(Db::new(
                    id,
                    host,
                    self.self_ref.clone(),
                    self.sql.clone(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    pub fn hosts(&self) -> &HostRegistry {
        &self.hosts
    }
}

/// The fleet facade: registries plus the tracked pools and shards.
pub struct Topology {
    config: Arc<Config>,
    dbs: Arc<DbRegistry>,
    spares: Arc<dyn SpareAllocator>,
    sink: Arc<dyn ConfigSink>,
    pools: RwLock<Vec<Arc<Pool>>>,
    shards: RwLock<Vec<Arc<Shard>>>,
    /// Sharded-table definitions per keyspace, applied to shards rebuilt
    /// from snapshots (snapshots carry ranges, not schemas).
    tables: RwLock<HashMap<String, Vec<TableSpec>>>,
}

impl Topology {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        sql: Arc<dyn QueryExecutor>,
        config: Arc<Config>,
        spares: Arc<dyn SpareAllocator>,
        sink: Arc<dyn ConfigSink>,
    ) -> Self {
        Self {
            dbs: DbRegistry::new(shell, sql, config.clone()),
            config,
            spares,
            sink,
            pools: RwLock::new(Vec::new()),
            shards: RwLock::new(Vec::new()),
            tables: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn sink(&self) -> &Arc<dyn ConfigSink> {
        &self.sink
    }

    pub fn db(&self, id: InstanceId) -> Arc<Db> {
        self.dbs.get_or_create(id)
    }

    pub fn registry(&self) -> &Arc<DbRegistry> {
        &self.dbs
    }

    /// Register the sharded tables of a keyspace.
    pub fn define_keyspace(&self, keyspace: impl Into<String>, tables: Vec<TableSpec>) {
        self.tables.write().insert(keyspace.into(), tables);
    }

    // ---- Pool / shard tracking ---------------------------------------------

    pub fn add_pool(&self, pool: Arc<Pool>) -> Result<()> {
        let mut pools = self.pools.write();
        if pools
            .iter()
            .any(|p| p.name() == pool.name() || p.master().id() == pool.master().id())
        {
            return Err(Error::Precondition(format!(
                "pool {} (master {}) is already tracked",
                pool.name(),
                pool.master()
            )));
        }
        pools.push(pool);
        Ok(())
    }

    pub fn add_shard(&self, shard: Arc<Shard>) -> Result<()> {
        let mut shards = self.shards.write();
        if shards
            .iter()
            .any(|s| s.keyspace() == shard.keyspace() && s.range() == shard.range())
        {
            return Err(Error::Precondition(format!(
                "shard {} is already tracked",
                shard.name()
            )));
        }
        shards.push(shard);
        Ok(())
    }

    pub fn pools(&self) -> Vec<Arc<Pool>> {
        self.pools.read().clone()
    }

    pub fn shards(&self, keyspace: Option<&str>) -> Vec<Arc<Shard>> {
        self.shards
            .read()
            .iter()
            .filter(|s| keyspace.map_or(true, |k| s.keyspace() == k))
            .cloned()
            .collect()
    }

    /// Functional pool lookup by name or alias.
    pub fn pool(&self, name: &str) -> Option<Arc<Pool>> {
        self.pools
            .read()
            .iter()
            .find(|p| p.name() == name || p.aliases().iter().any(|a| a == name))
            .cloned()
    }

    pub fn shard_by_name(&self, name: &str) -> Option<Arc<Shard>> {
        self.shards.read().iter().find(|s| s.name() == name).cloned()
    }

    pub fn shard_covering(&self, keyspace: &str, range: ShardRange) -> Option<Arc<Shard>> {
        self.shards
            .read()
            .iter()
            .find(|s| s.keyspace() == keyspace && s.range() == range)
            .cloned()
    }

    /// The in-production shard responsible for one sharding-key value.
    /// During a split both a deprecating parent and its child can cover the
    /// id; the child wins.
    pub fn shard_for_id(&self, keyspace: &str, id: u64) -> Option<Arc<Shard>> {
        let shards = self.shards.read();
        let mut covering = shards
            .iter()
            .filter(|s| s.keyspace() == keyspace && s.in_production() && s.range().contains(id));
        let first = covering.next()?.clone();
        match covering.find(|s| s.parent().is_some()) {
            Some(child) => Some(child.clone()),
            None => Some(first),
        }
    }

    // ---- Spares ------------------------------------------------------------

    /// Claim spare machines and intern them as instances. Never partial:
    /// either `count` instances or an error.
    pub async fn claim_spares(
        &self,
        count: usize,
        criteria: &SpareCriteria,
    ) -> Result<Vec<Arc<Db>>> {
        let claimed = self.spares.claim_spares(count, criteria).await?;
        Ok(claimed
            .into_iter()
            .map(|id| self.dbs.get_or_create(id))
            .collect())
    }

    pub async fn count_spares(&self, criteria: &SpareCriteria) -> Result<usize> {
        self.spares.count_spares(criteria).await
    }

    // ---- Fleet-wide operations ---------------------------------------------

    /// Probe every tracked master and its replicas concurrently.
    pub async fn probe_all(&self) -> Result<()> {
        let mut jobs: Vec<(String, _)> = Vec::new();
        for pool in self.pools() {
            jobs.push((pool.name().to_string(), async move { pool.probe().await }));
        }
        fan_out_join(jobs).await?;

        let shard_jobs = self
            .shards(None)
            .into_iter()
            .map(|shard| {
                (shard.name().to_string(), async move {
                    shard.pool().probe().await
                })
            })
            .collect();
        fan_out_join(shard_jobs).await?;
        Ok(())
    }

    /// Push every tracked pool and shard to the configuration sink.
    pub async fn persist_configuration(&self) {
        for pool in self.pools() {
            pool.persist().await;
        }
        for shard in self.shards(None) {
            shard.persist().await;
        }
    }

    // ---- Snapshot load -----------------------------------------------------

    /// Rebuild tracked pools and shards from persisted snapshots. Parent
    /// links are resolved after every shard exists, so snapshot order does
    /// not matter.
    pub fn load(&self, snapshots: Vec<PoolSnapshot>) -> Result<()> {
        let mut pending_parents = Vec::new();
        for snapshot in snapshots {
            let master = self.dbs.get_or_create(snapshot.master.clone());
            match &snapshot.shard {
                Some(section) => {
                    let tables = self
                        .tables
                        .read()
                        .get(&section.keyspace)
                        .cloned()
                        .unwrap_or_default();
                    let shard = Shard::new(
                        section.keyspace.clone(),
                        ShardRange::new(section.min_id, section.max_id),
                        master,
                        section.state,
                        self.sink.clone(),
                        tables,
                    );
                    self.restore_pool_members(shard.pool(), &snapshot);
                    self.add_shard(shard.clone())?;
                    if let Some(parent) = &section.parent {
                        pending_parents.push((shard, parent.clone()));
                    }
                }
                None => {
                    let pool = Arc::new(Pool::new(
                        snapshot.name.clone(),
                        master,
                        self.sink.clone(),
                    ));
                    self.restore_pool_members(&pool, &snapshot);
                    self.add_pool(pool)?;
                }
            }
        }

        for (shard, parent_name) in pending_parents {
            let parent = self.shard_by_name(&parent_name).ok_or_else(|| {
                Error::Precondition(format!(
                    "shard {} names unknown parent {}",
                    shard.name(),
                    parent_name
                ))
            })?;
            Shard::adopt(&parent, &shard);
        }
        Ok(())
    }

    fn restore_pool_members(&self, pool: &Pool, snapshot: &PoolSnapshot) {
        for alias in &snapshot.aliases {
            pool.add_alias(alias.clone());
        }
        pool.set_master_read_weight(snapshot.master_read_weight);
        for (id, weight) in &snapshot.active_slaves {
            let db = self.dbs.get_or_create(id.clone());
            pool.mark_active(&db, *weight);
        }
        for id in &snapshot.backup_slaves {
            let db = self.dbs.get_or_create(id.clone());
            pool.mark_backup(&db);
        }
        // Standby replicas carry no marking; they are whatever probing
        // discovers minus the active and backup sets.
    }

    /// Drop all tracked pools and shards and rebuild from fresh snapshots.
    pub fn refresh(&self, snapshots: Vec<PoolSnapshot>) -> Result<()> {
        self.pools.write().clear();
        self.shards.write().clear();
        self.load(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::json_sink::NoopSink;
    use crate::adapters::memory_spares::MemorySpares;
    use crate::adapters::sim::SimFleet;
    use crate::domain::entities::{ShardSnapshot, ShardState, SpareRole};

    fn id(n: u8) -> InstanceId {
        InstanceId::new(format!("10.0.3.{}", n), 3306)
    }

    fn topology() -> (Arc<SimFleet>, Arc<MemorySpares>, Topology) {
        let config = Arc::new(Config::default());
        let fleet = SimFleet::new(config.clone());
        let spares = Arc::new(MemorySpares::new());
        let topology = Topology::new(
            fleet.clone(),
            fleet.clone(),
            config,
            spares.clone(),
            Arc::new(NoopSink),
        );
        (fleet, spares, topology)
    }

    fn shard_snapshot(
        name: &str,
        master: InstanceId,
        min: u64,
        max: u64,
        state: ShardState,
        parent: Option<&str>,
    ) -> PoolSnapshot {
        PoolSnapshot {
            name: name.to_string(),
            master,
            aliases: Vec::new(),
            master_read_weight: 0,
            active_slaves: Vec::new(),
            standby_slaves: Vec::new(),
            backup_slaves: Vec::new(),
            shard: Some(ShardSnapshot {
                keyspace: "posts".to_string(),
                min_id: min,
                max_id: max,
                state,
                parent: parent.map(str::to_string),
            }),
        }
    }

    #[test]
    fn test_instances_are_interned() {
        let (_fleet, _spares, topology) = topology();
        let a = topology.db(id(1));
        let b = topology.db(id(1));
        assert!(Arc::ptr_eq(&a, &b));
        // Same machine, different port: distinct instance, shared host.
        let c = topology.db(InstanceId::new("10.0.3.1", 3307));
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(Arc::ptr_eq(a.host(), c.host()));
    }

    #[test]
    fn test_duplicate_pool_and_shard_registration_refused() {
        let (_fleet, _spares, topology) = topology();
        let pool = Arc::new(Pool::new("users", topology.db(id(1)), Arc::new(NoopSink)));
        topology.add_pool(pool.clone()).unwrap();
        let same_master = Arc::new(Pool::new(
            "users-again",
            topology.db(id(1)),
            Arc::new(NoopSink),
        ));
        assert!(topology.add_pool(same_master).is_err());

        let shard = Shard::new(
            "posts",
            ShardRange::new(1, 100),
            topology.db(id(2)),
            ShardState::Ready,
            Arc::new(NoopSink),
            Vec::new(),
        );
        topology.add_shard(shard).unwrap();
        let twin = Shard::new(
            "posts",
            ShardRange::new(1, 100),
            topology.db(id(3)),
            ShardState::Ready,
            Arc::new(NoopSink),
            Vec::new(),
        );
        assert!(topology.add_shard(twin).is_err());
    }

    #[test]
    fn test_shard_for_id_prefers_child_during_cutover() {
        let (_fleet, _spares, topology) = topology();
        let parent = Shard::new(
            "posts",
            ShardRange::new(1, 100),
            topology.db(id(1)),
            ShardState::Ready,
            Arc::new(NoopSink),
            Vec::new(),
        );
        let child = Shard::new(
            "posts",
            ShardRange::new(1, 50),
            topology.db(id(2)),
            ShardState::Child,
            Arc::new(NoopSink),
            Vec::new(),
        );
        Shard::adopt(&parent, &child);
        topology.add_shard(parent.clone()).unwrap();
        topology.add_shard(child.clone()).unwrap();

        let hit = topology.shard_for_id("posts", 25).unwrap();
        assert_eq!(hit.name(), "posts-1-50");
        // Outside the child's range only the parent covers.
        let hit = topology.shard_for_id("posts", 80).unwrap();
        assert_eq!(hit.name(), "posts-1-100");
        assert!(topology.shard_for_id("posts", 101).is_none());
        assert!(topology.shard_for_id("blogs", 25).is_none());
    }

    #[test]
    fn test_load_restores_shards_and_parent_links() {
        let (_fleet, _spares, topology) = topology();
        topology.define_keyspace(
            "posts",
            vec![TableSpec::new("posts", vec!["post_id".to_string()])],
        );
        // Child listed before parent: load resolves links afterwards.
        topology
            .load(vec![
                shard_snapshot(
                    "posts-1-50",
                    id(2),
                    1,
                    50,
                    ShardState::Child,
                    Some("posts-1-100"),
                ),
                shard_snapshot("posts-1-100", id(1), 1, 100, ShardState::Ready, None),
            ])
            .unwrap();

        let child = topology.shard_by_name("posts-1-50").unwrap();
        assert_eq!(child.parent().unwrap().name(), "posts-1-100");
        assert_eq!(child.tables().len(), 1);
        let parent = topology.shard_by_name("posts-1-100").unwrap();
        assert_eq!(parent.children().len(), 1);
        // Writes for the child's range still route to the parent master.
        assert_eq!(child.write_master().id(), &id(1));
    }

    #[test]
    fn test_load_fails_on_unknown_parent() {
        let (_fleet, _spares, topology) = topology();
        let err = topology
            .load(vec![shard_snapshot(
                "posts-1-50",
                id(2),
                1,
                50,
                ShardState::Child,
                Some("posts-1-100"),
            )])
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn test_claim_spares_interns_instances() {
        let (_fleet, spares, topology) = topology();
        spares.add_spare(SpareRole::Standby, id(7));
        spares.add_spare(SpareRole::Standby, id(8));

        let claimed = topology
            .claim_spares(2, &SpareCriteria::for_role(SpareRole::Standby))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(Arc::ptr_eq(&claimed[0], &topology.db(id(7))));
    }
}
