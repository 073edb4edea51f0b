//! Pool - Replication Group & Master Promotion
//!
//! A Pool is one master plus its classified replicas. Active replicas carry
//! read weights, standbys exist for failover and cloning, and backup
//! replicas are never promotable. The promotion protocol is written to be
//! safe under master failure: the waiting strategy branches on whether the
//! demoted master can still be reached, and no replica resumes replication
//! until its re-pointed coordinates have been verified.

use crate::domain::entities::{BinlogCoordinates, InstanceId, PoolSnapshot, ReplicaRole};
use crate::domain::ports::ConfigSink;
use crate::error::{Error, Result};
use crate::infrastructure::tasks::fan_out_join;
use crate::topology::db::{ChangeMasterOptions, Db};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

struct PoolInner {
    master: Arc<Db>,
    aliases: Vec<String>,
    master_read_weight: u32,
    active_weights: HashMap<InstanceId, u32>,
}

pub struct Pool {
    name: String,
    inner: RwLock<PoolInner>,
    sink: Arc<dyn ConfigSink>,
}

/// Outcome of one master promotion.
#[derive(Debug, Clone)]
pub struct PromotionReport {
    pub old_master: InstanceId,
    pub new_master: InstanceId,
    /// Replicas successfully re-pointed at the new master.
    pub repointed: Vec<InstanceId>,
    /// Instances no longer part of the replication tree (an unreachable or
    /// deliberately dropped old master); cleanup must deal with them.
    pub ejected: Vec<InstanceId>,
    /// Whether every re-pointed replica ended up actively replicating.
    pub all_replicating: bool,
}

impl Pool {
    pub fn new(name: impl Into<String>, master: Arc<Db>, sink: Arc<dyn ConfigSink>) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(PoolInner {
                master,
                aliases: Vec::new(),
                master_read_weight: 0,
                active_weights: HashMap::new(),
            }),
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn master(&self) -> Arc<Db> {
        self.inner.read().master.clone()
    }

    pub fn aliases(&self) -> Vec<String> {
        self.inner.read().aliases.clone()
    }

    pub fn add_alias(&self, alias: impl Into<String>) {
        let alias = alias.into();
        let mut inner = self.inner.write();
        if !inner.aliases.contains(&alias) {
            inner.aliases.push(alias);
        }
    }

    pub fn set_master_read_weight(&self, weight: u32) {
        self.inner.write().master_read_weight = weight;
    }

    /// Give a replica a read weight, making it active.
    pub fn mark_active(&self, db: &Arc<Db>, weight: u32) {
        self.inner
            .write()
            .active_weights
            .insert(db.id().clone(), weight);
    }

    /// Remove a replica's read weight, demoting it to standby.
    pub fn mark_standby(&self, db: &Arc<Db>) {
        self.inner.write().active_weights.remove(db.id());
        db.set_for_backups(false);
    }

    pub fn mark_backup(&self, db: &Arc<Db>) {
        self.inner.write().active_weights.remove(db.id());
        db.set_for_backups(true);
    }

    /// Every replica of the current master, regardless of role.
    pub fn replicas(&self) -> Vec<Arc<Db>> {
        self.master().slaves()
    }

    pub fn role_of(&self, db: &Arc<Db>) -> ReplicaRole {
        if db.for_backups() {
            ReplicaRole::Backup
        } else if self.inner.read().active_weights.contains_key(db.id()) {
            ReplicaRole::Active
        } else {
            ReplicaRole::Standby
        }
    }

    pub fn replicas_in_role(&self, role: ReplicaRole) -> Vec<Arc<Db>> {
        self.replicas()
            .into_iter()
            .filter(|db| self.role_of(db) == role)
            .collect()
    }

    pub fn standby_replicas(&self) -> Vec<Arc<Db>> {
        self.replicas_in_role(ReplicaRole::Standby)
    }

    /// Force-probe the master and every discovered replica.
    pub async fn probe(&self) -> Result<()> {
        let master = self.master();
        master.probe(true).await?;
        let jobs = self
            .replicas()
            .into_iter()
            .map(|db| {
                let label = db.id().to_string();
                (label, async move { db.probe(true).await })
            })
            .collect();
        fan_out_join(jobs).await?;
        tracing::info!("{}", self.summary());
        Ok(())
    }

    /// One-line operator-facing description of the pool's tree.
    pub fn summary(&self) -> String {
        let master = self.master();
        let mut active = 0;
        let mut standby = 0;
        let mut backup = 0;
        for db in self.replicas() {
            match self.role_of(&db) {
                ReplicaRole::Active => active += 1,
                ReplicaRole::Standby => standby += 1,
                ReplicaRole::Backup => backup += 1,
            }
        }
        format!(
            "pool {}: master={} active={} standby={} backup={}",
            self.name, master, active, standby, backup
        )
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let inner = self.inner.read();
        let master = inner.master.clone();
        let mut active = Vec::new();
        let mut standby = Vec::new();
        let mut backup = Vec::new();
        for db in master.slaves() {
            if db.for_backups() {
                backup.push(db.id().clone());
            } else if let Some(weight) = inner.active_weights.get(db.id()) {
                active.push((db.id().clone(), *weight));
            } else {
                standby.push(db.id().clone());
            }
        }
        active.sort_by(|a, b| a.0.ip.cmp(&b.0.ip));
        standby.sort_by(|a, b| a.ip.cmp(&b.ip));
        backup.sort_by(|a, b| a.ip.cmp(&b.ip));
        PoolSnapshot {
            name: self.name.clone(),
            master: master.id().clone(),
            aliases: inner.aliases.clone(),
            master_read_weight: inner.master_read_weight,
            active_slaves: active,
            standby_slaves: standby,
            backup_slaves: backup,
            shard: None,
        }
    }

    /// Hand the current snapshot to the configuration sink. Sink failures
    /// are warnings, never operation failures.
    pub async fn persist(&self) {
        let snapshot = self.snapshot();
        if let Err(err) = self.sink.persist(&snapshot).await {
            tracing::warn!("pool {}: configuration sync failed: {}", self.name, err);
        }
    }

    pub(crate) fn sink(&self) -> &Arc<dyn ConfigSink> {
        &self.sink
    }

    // ---- Promotion ---------------------------------------------------------

    /// Promote `candidate` to pool master.
    ///
    /// When the demoted master is reachable it is frozen read-only and every
    /// replica drains to its exact final coordinates; when it is not, each
    /// replica instead waits for its own progress to stop moving. With
    /// `reattach_old_master` a reachable demoted master rejoins as a standby
    /// replica; an unreachable one is ejected either way.
    pub async fn promote_slave(
        &self,
        candidate: &Arc<Db>,
        reattach_old_master: bool,
    ) -> Result<PromotionReport> {
        let old_master = self.master();
        if candidate.id() == old_master.id() {
            return Err(Error::Precondition(format!(
                "{} is already the master of pool {}",
                candidate, self.name
            )));
        }
        if candidate.for_backups() {
            return Err(Error::Precondition(format!(
                "{} is a backup replica and never promotable",
                candidate
            )));
        }

        // Fresh reachability verdict; the sticky cache may predate a crash.
        let reachable =
            old_master.host().re_probe().await && old_master.probe_running().await;
        if reachable {
            old_master.probe(true).await?;
        }
        let replicas = self.replicas();
        if replicas.is_empty() {
            return Err(Error::Precondition(format!(
                "pool {}: no known replicas of {}; probe before promoting",
                self.name, old_master
            )));
        }
        if !replicas.iter().any(|db| db.id() == candidate.id()) {
            return Err(Error::Precondition(format!(
                "{} is not a tracked replica of {}",
                candidate, old_master
            )));
        }

        let timeout = Duration::from_secs(old_master.config().promotion_timeout_secs);
        if reachable {
            // Freeze writes, then confirm the coordinates truly stopped.
            old_master.set_read_only(true).await?;
            let frozen = old_master.binlog_coordinates().await?;
            let recheck = old_master.binlog_coordinates().await?;
            if frozen != recheck {
                return Err(Error::ReplicationInconsistency {
                    instance: old_master.id().clone(),
                    detail: format!(
                        "binlog advanced after read_only ({} -> {}); writes still arriving",
                        frozen, recheck
                    ),
                });
            }
            tracing::info!(
                "pool {}: draining {} replica(s) to {}",
                self.name,
                replicas.len(),
                frozen
            );
            let jobs = replicas
                .iter()
                .map(|db| {
                    let db = db.clone();
                    let target = frozen.clone();
                    (db.id().to_string(), async move {
                        wait_for_coordinates(&db, &target, timeout).await
                    })
                })
                .collect();
            fan_out_join(jobs).await?;
        } else {
            tracing::warn!(
                "pool {}: master {} unreachable, waiting for replica progress to stabilize",
                self.name,
                old_master
            );
            let jobs = replicas
                .iter()
                .map(|db| {
                    let db = db.clone();
                    (db.id().to_string(), async move {
                        wait_for_stable_progress(&db, timeout).await
                    })
                })
                .collect();
            fan_out_join(jobs).await?;
        }

        // Every replica must stop; a single refusal aborts the promotion.
        let jobs = replicas
            .iter()
            .map(|db| {
                let db = db.clone();
                (db.id().to_string(), async move {
                    db.pause_replication().await
                })
            })
            .collect();
        fan_out_join(jobs).await?;

        let new_coordinates = candidate.binlog_coordinates().await?;
        let credentials = candidate.replication_credentials().await?;

        candidate.disable_replication().await?;
        candidate.set_read_only(false).await?;

        let mut targets: Vec<Arc<Db>> = replicas
            .iter()
            .filter(|db| db.id() != candidate.id())
            .cloned()
            .collect();
        let mut ejected = Vec::new();
        if reachable && reattach_old_master {
            targets.push(old_master.clone());
        } else {
            ejected.push(old_master.id().clone());
        }

        let mut repointed = Vec::new();
        for db in &targets {
            db.change_master_to(
                Some(candidate),
                ChangeMasterOptions {
                    coordinates: Some(new_coordinates.clone()),
                    credentials: Some(credentials.clone()),
                },
            )
            .await?;
            repointed.push(db.id().clone());
        }

        // Verify before resuming; a replica must never run from the wrong
        // position.
        let jobs = targets
            .iter()
            .map(|db| {
                let db = db.clone();
                let expected_master = candidate.id().clone();
                let expected_coords = new_coordinates.clone();
                let expected_user = credentials.user.clone();
                (db.id().to_string(), async move {
                    verify_and_resume(&db, &expected_master, &expected_user, &expected_coords)
                        .await
                })
            })
            .collect();
        fan_out_join(jobs).await?;

        let mut all_replicating = true;
        for db in &targets {
            let healthy = matches!(
                db.replication_status().await,
                Ok(Some(status)) if status.io_running && status.sql_running
            );
            if !healthy {
                tracing::warn!("pool {}: {} is not replicating after promotion", self.name, db);
                all_replicating = false;
            }
        }

        {
            let mut inner = self.inner.write();
            inner.active_weights.remove(candidate.id());
            inner.master = candidate.clone();
        }
        self.persist().await;
        tracing::info!(
            "pool {}: promoted {} over {} ({} replica(s) repointed)",
            self.name,
            candidate,
            old_master,
            repointed.len()
        );

        Ok(PromotionReport {
            old_master: old_master.id().clone(),
            new_master: candidate.id().clone(),
            repointed,
            ejected,
            all_replicating,
        })
    }
}

/// Poll until the replica has executed through `target` on its master's
/// stream.
async fn wait_for_coordinates(
    db: &Arc<Db>,
    target: &BinlogCoordinates,
    timeout: Duration,
) -> Result<()> {
    let started = Instant::now();
    loop {
        let coords = db.replication_binlog_coordinates().await?;
        if coords >= *target {
            return Ok(());
        }
        if started.elapsed() >= timeout {
            return Err(Error::Timeout {
                operation: format!("drain of {} to {}", db, target),
                waited_secs: started.elapsed().as_secs(),
            });
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Poll until the replica's executed coordinates hold still for three
/// consecutive readings; the drain target when the master cannot be read.
async fn wait_for_stable_progress(db: &Arc<Db>, timeout: Duration) -> Result<()> {
    let started = Instant::now();
    let mut last: Option<BinlogCoordinates> = None;
    let mut stable: u32 = 0;
    loop {
        let coords = db.replication_binlog_coordinates().await?;
        if last.as_ref() == Some(&coords) {
            stable += 1;
            if stable >= 3 {
                return Ok(());
            }
        } else {
            stable = 0;
            last = Some(coords);
        }
        if started.elapsed() >= timeout {
            return Err(Error::Timeout {
                operation: format!("progress stabilization of {}", db),
                waited_secs: started.elapsed().as_secs(),
            });
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn verify_and_resume(
    db: &Arc<Db>,
    expected_master: &InstanceId,
    expected_user: &str,
    expected_coords: &BinlogCoordinates,
) -> Result<()> {
    let status = db
        .replication_status()
        .await?
        .ok_or_else(|| Error::ReplicationInconsistency {
            instance: db.id().clone(),
            detail: "no replica status after change master".to_string(),
        })?;
    let observed_coords =
        BinlogCoordinates::new(status.master_log_file.clone(), status.read_master_log_pos);
    if status.master != *expected_master
        || status.master_user != expected_user
        || observed_coords != *expected_coords
    {
        return Err(Error::ReplicationInconsistency {
            instance: db.id().clone(),
            detail: format!(
                "points at {} as {} from {}, expected {} as {} from {}",
                status.master,
                status.master_user,
                observed_coords,
                expected_master,
                expected_user,
                expected_coords
            ),
        });
    }
    db.resume_replication().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::json_sink::NoopSink;
    use crate::adapters::sim::SimFleet;
    use crate::config::Config;
    use crate::topology::registry::DbRegistry;

    fn id(n: u8) -> InstanceId {
        InstanceId::new(format!("10.0.0.{}", n), 3306)
    }

    fn setup() -> (Arc<SimFleet>, Arc<DbRegistry>) {
        let config = Arc::new(Config::default());
        let fleet = SimFleet::new(config.clone());
        let registry = DbRegistry::new(fleet.clone(), fleet.clone(), config);
        (fleet, registry)
    }

    /// Master with two replicas, fully probed.
    async fn seeded_pool(
        fleet: &Arc<SimFleet>,
        registry: &Arc<DbRegistry>,
    ) -> (Pool, Arc<Db>, Arc<Db>, Arc<Db>) {
        for n in 1..=3 {
            fleet.add_server(&id(n));
        }
        fleet.set_binlog(&id(1), "mysql-bin.000010", 4096);
        fleet.make_replica(&id(2), &id(1));
        fleet.make_replica(&id(3), &id(1));

        let master = registry.get_or_create(id(1));
        let r1 = registry.get_or_create(id(2));
        let r2 = registry.get_or_create(id(3));
        master.probe(true).await.unwrap();

        let pool = Pool::new("pool-posts", master.clone(), Arc::new(NoopSink));
        (pool, master, r1, r2)
    }

    #[tokio::test(start_paused = true)]
    async fn test_promotion_with_reachable_master() {
        let (fleet, registry) = setup();
        let (pool, master, r1, r2) = seeded_pool(&fleet, &registry).await;

        let report = pool.promote_slave(&r1, true).await.unwrap();

        assert_eq!(report.new_master, *r1.id());
        assert_eq!(report.old_master, *master.id());
        assert!(report.ejected.is_empty());
        assert!(report.all_replicating);
        assert_eq!(pool.master().id(), r1.id());

        // Every survivor replicates from the candidate, including the
        // demoted master.
        for follower in [&r2, &master] {
            let link = fleet.server(follower.id()).unwrap().link.unwrap();
            assert_eq!(link.master, *r1.id());
            assert!(link.io_running && link.sql_running);
        }
        // The candidate is a master now, detached and writable.
        let promoted = fleet.server(r1.id()).unwrap();
        assert!(promoted.link.is_none());
        assert!(!promoted.read_only);
        // The demoted master was frozen before the swap.
        assert!(fleet.server(master.id()).unwrap().read_only);
    }

    #[tokio::test(start_paused = true)]
    async fn test_promotion_with_unreachable_master_uses_stabilized_wait() {
        let (fleet, registry) = setup();
        let (pool, master, r1, r2) = seeded_pool(&fleet, &registry).await;

        fleet.set_unreachable(&master.id().ip);
        let report = pool.promote_slave(&r1, true).await.unwrap();

        // The dead master cannot rejoin even when reattachment was asked for.
        assert_eq!(report.ejected, vec![master.id().clone()]);
        assert_eq!(report.repointed, vec![r2.id().clone()]);
        assert!(report.all_replicating);
        assert_eq!(pool.master().id(), r1.id());

        // The drain never asked the dead master for its coordinates.
        let asked_dead_master = fleet
            .sql_history()
            .iter()
            .any(|(target, sql)| target == master.id() && sql.contains("SHOW MASTER STATUS"));
        assert!(!asked_dead_master);

        let link = fleet.server(r2.id()).unwrap().link.unwrap();
        assert_eq!(link.master, *r1.id());
        assert!(link.io_running && link.sql_running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_promotion_rejects_outsiders_and_backups() {
        let (fleet, registry) = setup();
        let (pool, _master, r1, _r2) = seeded_pool(&fleet, &registry).await;

        // Not a replica of this master at all.
        fleet.add_server(&id(9));
        let outsider = registry.get_or_create(id(9));
        assert!(matches!(
            pool.promote_slave(&outsider, true).await,
            Err(Error::Precondition(_))
        ));

        pool.mark_backup(&r1);
        assert!(matches!(
            pool.promote_slave(&r1, true).await,
            Err(Error::Precondition(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_promotion_aborts_when_a_replica_refuses_to_pause() {
        let config = Arc::new(Config {
            command_retries: 0,
            ..Default::default()
        });
        let fleet = SimFleet::new(config.clone());
        let registry = DbRegistry::new(fleet.clone(), fleet.clone(), config);
        let (pool, master, r1, r2) = seeded_pool(&fleet, &registry).await;

        fleet.fail_next_sql(r2.id(), "STOP SLAVE");
        let err = pool.promote_slave(&r1, true).await.unwrap_err();
        assert!(matches!(err, Error::Aggregate { .. }));
        // The pool still points at the old master.
        assert_eq!(pool.master().id(), master.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_promotion_excludes_dropped_master_from_tree() {
        let (fleet, registry) = setup();
        let (pool, master, r1, _r2) = seeded_pool(&fleet, &registry).await;

        let report = pool.promote_slave(&r1, false).await.unwrap();
        assert_eq!(report.ejected, vec![master.id().clone()]);
        // The demoted master keeps no replication link to the new tree.
        assert!(fleet.server(master.id()).unwrap().link.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_partitions_replica_roles() {
        let (fleet, registry) = setup();
        let (pool, _master, r1, r2) = seeded_pool(&fleet, &registry).await;

        pool.mark_active(&r1, 100);
        pool.mark_backup(&r2);
        pool.add_alias("posts-ro");
        pool.set_master_read_weight(1);

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.active_slaves, vec![(r1.id().clone(), 100)]);
        assert_eq!(snapshot.backup_slaves, vec![r2.id().clone()]);
        assert!(snapshot.standby_slaves.is_empty());
        assert_eq!(snapshot.aliases, vec!["posts-ro".to_string()]);
        assert_eq!(snapshot.master_read_weight, 1);

        pool.mark_standby(&r2);
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.standby_slaves, vec![r2.id().clone()]);
        assert!(snapshot.backup_slaves.is_empty());
    }
}
