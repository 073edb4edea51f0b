//! Shard - Range-Partitioned Pool & Lifecycle
//!
//! A Shard is a Pool additionally scoped to a contiguous id range within a
//! named keyspace. The lifecycle state machine drives splitting one shard
//! into several: children are cloned from a parent standby, pruned down to
//! their own ranges, given replicas, cut over in two phases (reads, then
//! writes), and finally detached while the parent is recycled. Every
//! state-affecting transition is followed by a configuration sync.

use crate::domain::entities::{
    InstanceId, ShardRange, ShardSnapshot, ShardState, SpareCriteria, SpareRole, TableSpec,
};
use crate::domain::entities::PoolSnapshot;
use crate::domain::ports::ConfigSink;
use crate::error::{Error, Result};
use crate::infrastructure::tasks::{aggregate, bounded_map, fan_out_join};
use crate::topology::db::Db;
use crate::topology::pool::{Pool, PromotionReport};
use crate::topology::range::{partition_range, ranges_cover};
use crate::topology::registry::Topology;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

pub struct Shard {
    pool: Pool,
    keyspace: String,
    range: ShardRange,
    state: RwLock<ShardState>,
    parent: RwLock<Option<Weak<Shard>>>,
    children: RwLock<Vec<Arc<Shard>>>,
    tables: RwLock<Vec<TableSpec>>,
    /// Instances dropped from the replication tree by a branched promotion,
    /// waiting for `cleanup`.
    ejected: RwLock<Vec<InstanceId>>,
}

fn shard_name(keyspace: &str, range: &ShardRange) -> String {
    if range.is_unbounded() {
        format!("{}-{}-inf", keyspace, range.min_id)
    } else {
        format!("{}-{}-{}", keyspace, range.min_id, range.max_id)
    }
}

impl Shard {
    pub fn new(
        keyspace: impl Into<String>,
        range: ShardRange,
        master: Arc<Db>,
        state: ShardState,
        sink: Arc<dyn ConfigSink>,
        tables: Vec<TableSpec>,
    ) -> Arc<Self> {
        let keyspace = keyspace.into();
        let name = shard_name(&keyspace, &range);
        Arc::new(Self {
            pool: Pool::new(name, master, sink),
            keyspace,
            range,
            state: RwLock::new(state),
            parent: RwLock::new(None),
            children: RwLock::new(Vec::new()),
            tables: RwLock::new(tables),
            ejected: RwLock::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        self.pool.name()
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn range(&self) -> ShardRange {
        self.range
    }

    pub fn state(&self) -> ShardState {
        *self.state.read()
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn master(&self) -> Arc<Db> {
        self.pool.master()
    }

    pub fn parent(&self) -> Option<Arc<Shard>> {
        self.parent.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn children(&self) -> Vec<Arc<Shard>> {
        self.children.read().clone()
    }

    pub fn tables(&self) -> Vec<TableSpec> {
        self.tables.read().clone()
    }

    pub fn set_tables(&self, tables: Vec<TableSpec>) {
        *self.tables.write() = tables;
    }

    /// Whether routing queries should see this shard.
    pub fn in_production(&self) -> bool {
        self.state().in_production()
    }

    /// Link a child to its parent, keeping both sides consistent.
    pub fn adopt(parent: &Arc<Shard>, child: &Arc<Shard>) {
        *child.parent.write() = Some(Arc::downgrade(parent));
        let mut children = parent.children.write();
        if !children.iter().any(|c| c.name() == child.name()) {
            children.push(child.clone());
        }
    }

    /// Apply a lifecycle transition, refusing illegal ones, then sync
    /// configuration.
    pub async fn transition_to(&self, to: ShardState) -> Result<()> {
        {
            let mut state = self.state.write();
            if !state.can_transition_to(to) {
                return Err(Error::InvalidTransition {
                    shard: self.name().to_string(),
                    from: *state,
                    to,
                });
            }
            tracing::info!("shard {}: {} -> {}", self.name(), *state, to);
            *state = to;
        }
        self.persist().await;
        Ok(())
    }

    /// The instance that must receive writes for this shard's range. A
    /// child that has not yet taken over writes resolves to its parent's
    /// master.
    pub fn write_master(self: &Arc<Self>) -> Arc<Db> {
        let writes_live_here = matches!(
            self.state(),
            ShardState::NeedsCleanup
                | ShardState::Ready
                | ShardState::ReadOnly
                | ShardState::Offline
                | ShardState::Deprecated
                | ShardState::Recycle
        );
        if !writes_live_here {
            if let Some(parent) = self.parent() {
                return parent.write_master();
            }
        }
        self.pool.master()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let mut snapshot = self.pool.snapshot();
        snapshot.shard = Some(ShardSnapshot {
            keyspace: self.keyspace.clone(),
            min_id: self.range.min_id,
            max_id: self.range.max_id,
            state: self.state(),
            parent: self.parent().map(|p| p.name().to_string()),
        });
        snapshot
    }

    /// Sink failures are warnings, never operation failures.
    pub async fn persist(&self) {
        let snapshot = self.snapshot();
        if let Err(err) = self.pool.sink().persist(&snapshot).await {
            tracing::warn!("shard {}: configuration sync failed: {}", self.name(), err);
        }
    }

    // ---- Promotion ---------------------------------------------------------

    /// Promote a replica to shard master. A promotion that ejects the old
    /// master leaves the shard needing cleanup.
    pub async fn promote_master(
        &self,
        candidate: &Arc<Db>,
        reattach_old_master: bool,
    ) -> Result<PromotionReport> {
        let report = self.pool.promote_slave(candidate, reattach_old_master).await?;
        if !report.ejected.is_empty() {
            self.ejected.write().extend(report.ejected.iter().cloned());
            if self.state() == ShardState::Ready {
                self.transition_to(ShardState::NeedsCleanup).await?;
            }
        }
        self.persist().await;
        Ok(report)
    }

    // ---- Split -------------------------------------------------------------

    /// Split this shard into `pieces` children.
    ///
    /// Children are registered immediately in `initializing`, cloned from a
    /// parent standby through one chained transfer, then driven concurrently
    /// through prune and replica attachment. Per-child failures are
    /// collected so siblings keep progressing; the split fails afterwards
    /// naming each one. Re-invoking after a partial failure resumes each
    /// child from its recorded state.
    pub async fn split(
        self: &Arc<Self>,
        topology: &Topology,
        pieces: usize,
        ranges: Option<Vec<ShardRange>>,
    ) -> Result<Vec<Arc<Shard>>> {
        if pieces < 2 {
            return Err(Error::Precondition(format!(
                "shard {}: cannot split into {} piece(s)",
                self.name(),
                pieces
            )));
        }
        if self.state() != ShardState::Ready {
            return Err(Error::Precondition(format!(
                "shard {}: split requires state ready, currently {}",
                self.name(),
                self.state()
            )));
        }

        let children = if self.children().is_empty() {
            self.provision_children(topology, pieces, ranges).await?
        } else {
            self.resumable_children(pieces)?
        };

        let jobs = children
            .iter()
            .map(|child| {
                let child = child.clone();
                (child.name().to_string(), async move {
                    child.advance_split(topology).await
                })
            })
            .collect();
        fan_out_join(jobs).await?;
        self.persist().await;
        Ok(children)
    }

    /// Validate that an interrupted split can be resumed automatically: the
    /// set of already-provisioned children must match the requested piece
    /// count exactly.
    fn resumable_children(&self, pieces: usize) -> Result<Vec<Arc<Shard>>> {
        let children = self.children();
        let provisioned = children
            .iter()
            .filter(|c| c.state() != ShardState::Initializing)
            .count();
        if provisioned != pieces {
            return Err(Error::Precondition(format!(
                "shard {}: has {} provisioned child(ren) but split into {} was requested; \
                 manual intervention required",
                self.name(),
                provisioned,
                pieces
            )));
        }
        tracing::info!("shard {}: resuming split across {} children", self.name(), pieces);
        Ok(children)
    }

    /// Fresh-split provisioning: compute ranges, claim a master per child,
    /// register the children, and seed them all through one chained clone of
    /// a parent standby.
    async fn provision_children(
        self: &Arc<Self>,
        topology: &Topology,
        pieces: usize,
        ranges: Option<Vec<ShardRange>>,
    ) -> Result<Vec<Arc<Shard>>> {
        let child_ranges = match ranges {
            Some(ranges) => {
                if ranges.len() != pieces {
                    return Err(Error::Precondition(format!(
                        "shard {}: {} range(s) given for a {}-way split",
                        self.name(),
                        ranges.len(),
                        pieces
                    )));
                }
                if !ranges_cover(self.range.min_id, self.range.max_id, &ranges) {
                    return Err(Error::Precondition(format!(
                        "shard {}: given ranges do not exactly cover {}",
                        self.name(),
                        self.range
                    )));
                }
                ranges
            }
            None => {
                if self.range.is_unbounded() {
                    return Err(Error::Precondition(format!(
                        "shard {}: splitting an unbounded range requires explicit child ranges",
                        self.name()
                    )));
                }
                partition_range(self.range.min_id, self.range.max_id, pieces)?
            }
        };

        let parent_master = self.pool.master();
        let source = self
            .pool
            .standby_replicas()
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| {
                Error::Precondition(format!(
                    "shard {}: split requires at least one standby replica to clone from",
                    self.name()
                ))
            })?;

        let criteria =
            SpareCriteria::for_role(SpareRole::Master).like(parent_master.id().clone());
        let masters = topology.claim_spares(child_ranges.len(), &criteria).await?;

        let mut children = Vec::with_capacity(child_ranges.len());
        for (range, master) in child_ranges.into_iter().zip(masters) {
            let child = Shard::new(
                self.keyspace.clone(),
                range,
                master,
                ShardState::Initializing,
                self.pool.sink().clone(),
                self.tables(),
            );
            Shard::adopt(self, &child);
            topology.add_shard(child.clone())?;
            child.persist().await;
            children.push(child);
        }

        // One chained transfer seeds every child master with the full
        // parent data set, replicating from the parent master.
        tracing::info!(
            "shard {}: cloning {} onto {} child master(s)",
            self.name(),
            source,
            children.len()
        );
        source.pause_replication().await?;
        let targets: Vec<Arc<Db>> = children.iter().map(|c| c.master()).collect();
        let cloned = source.enslave_siblings(&targets).await;
        source.resume_replication().await?;
        cloned?;

        for child in &children {
            child.transition_to(ShardState::Exporting).await?;
        }
        Ok(children)
    }

    /// Drive one child from its current split state to fully replicating
    /// with its own replicas attached.
    async fn advance_split(self: &Arc<Self>, topology: &Topology) -> Result<()> {
        match self.state() {
            ShardState::Exporting | ShardState::Importing => {
                self.prune_data_to_range().await?;
            }
            ShardState::Replicating => {}
            other => {
                return Err(Error::Precondition(format!(
                    "shard {}: cannot advance split from state {}",
                    self.name(),
                    other
                )))
            }
        }
        self.attach_replicas(topology).await
    }

    /// Export this shard's id range on its own master, rebuild the tables
    /// empty, and re-import only the in-range rows. Runs with replication
    /// stopped; row counts are verified at every step.
    pub async fn prune_data_to_range(&self) -> Result<()> {
        let master = self.pool.master();
        if master.replication_paused() == Some(false) {
            master.pause_replication().await?;
        }

        let exported = if self.state() == ShardState::Exporting {
            let exported = self.export_data().await?;
            self.transition_to(ShardState::Importing).await?;
            exported
        } else {
            // Resuming an interrupted import: the tables may hold partial
            // data, so the outfiles already on disk are the only
            // trustworthy copy. Import from them without re-exporting.
            HashMap::new()
        };
        let imported = self.import_data(&exported).await?;

        for (table, rows) in &imported {
            let counted = self.count_rows(table).await?;
            if counted != *rows {
                return Err(Error::RowCountMismatch {
                    table: table.clone(),
                    expected: *rows,
                    actual: counted,
                });
            }
        }
        self.discard_exports().await?;
        self.transition_to(ShardState::Replicating).await
    }

    /// Remove the outfiles of a completed prune.
    async fn discard_exports(&self) -> Result<()> {
        let master = self.pool.master();
        for table in self.tables() {
            chunked_op(&master, &table, &self.range, ChunkOp::Discard).await?;
        }
        Ok(())
    }

    /// Resume replication from the parent, catch up, and attach this
    /// shard's own standby/backup replicas via the clone protocol. Skips
    /// attachment when replicas already exist, so a resumed split does not
    /// double-claim spares.
    async fn attach_replicas(&self, topology: &Topology) -> Result<()> {
        let master = self.pool.master();
        let config = master.config().clone();

        if master.replication_paused() == Some(true) {
            master.resume_replication().await?;
        }
        master.catch_up_to_master().await?;

        if master.slaves().is_empty()
            && config.standbys_per_shard + config.backups_per_shard > 0
        {
            let standby_criteria =
                SpareCriteria::for_role(SpareRole::Standby).like(master.id().clone());
            let backup_criteria =
                SpareCriteria::for_role(SpareRole::Backup).like(master.id().clone());
            let standbys = topology
                .claim_spares(config.standbys_per_shard, &standby_criteria)
                .await?;
            let backups = if config.backups_per_shard > 0 {
                topology
                    .claim_spares(config.backups_per_shard, &backup_criteria)
                    .await?
            } else {
                Vec::new()
            };

            let mut targets = standbys;
            for backup in backups {
                self.pool.mark_backup(&backup);
                targets.push(backup);
            }

            master.pause_replication().await?;
            let cloned = master.enslave(&targets).await;
            master.resume_replication().await?;
            cloned?;

            let jobs = targets
                .iter()
                .map(|db| {
                    let db = db.clone();
                    (db.id().to_string(), async move {
                        db.resume_replication().await?;
                        db.catch_up_to_master().await
                    })
                })
                .collect();
            fan_out_join(jobs).await?;
        }

        self.persist().await;
        Ok(())
    }

    // ---- Cutover -----------------------------------------------------------

    /// Phase one of the cutover: children start serving reads. Writes still
    /// reach the parent because a `child`'s write handle resolves upward.
    pub async fn move_reads_to_children(&self) -> Result<()> {
        let children = self.children();
        if children.is_empty() {
            return Err(Error::Precondition(format!(
                "shard {}: no children to move reads to",
                self.name()
            )));
        }
        for child in &children {
            child.transition_to(ShardState::Child).await?;
        }
        Ok(())
    }

    /// Phase two: children take writes directly and the parent is
    /// deprecated, pending cleanup.
    pub async fn move_writes_to_children(&self) -> Result<()> {
        let children = self.children();
        if children.is_empty() || children.iter().any(|c| c.state() != ShardState::Child) {
            return Err(Error::Precondition(format!(
                "shard {}: every child must be serving reads before the write cutover",
                self.name()
            )));
        }
        // No child may be lagging when writes move over.
        let jobs = children
            .iter()
            .map(|child| {
                let child = child.clone();
                (child.name().to_string(), async move {
                    child.master().catch_up_to_master().await
                })
            })
            .collect();
        fan_out_join(jobs).await?;

        for child in &children {
            child.transition_to(ShardState::NeedsCleanup).await?;
        }
        self.transition_to(ShardState::Deprecated).await
    }

    // ---- Cleanup -----------------------------------------------------------

    /// Tear down whichever pending lifecycle debt this shard carries:
    ///
    /// - a deprecated post-split parent: freeze it, detach every child from
    ///   parent replication, purge out-of-range rows on each child, and
    ///   recycle the parent;
    /// - a shard left `needs_cleanup` by a branched promotion: decommission
    ///   the ejected instances.
    ///
    /// Any other state is an error.
    pub async fn cleanup(self: &Arc<Self>) -> Result<()> {
        let state = self.state();
        let children = self.children();
        if state == ShardState::Deprecated
            && !children.is_empty()
            && children.iter().all(|c| c.state() == ShardState::NeedsCleanup)
        {
            return self.cleanup_after_split(children).await;
        }
        if state == ShardState::NeedsCleanup && !self.ejected.read().is_empty() {
            return self.cleanup_ejected().await;
        }
        Err(Error::Precondition(format!(
            "shard {}: nothing to clean up in state {}",
            self.name(),
            state
        )))
    }

    async fn cleanup_after_split(self: &Arc<Self>, children: Vec<Arc<Shard>>) -> Result<()> {
        let parent_master = self.pool.master();
        parent_master.set_read_only(true).await?;

        let jobs = children
            .iter()
            .map(|child| {
                let child = child.clone();
                (child.name().to_string(), async move {
                    child.master().disable_replication().await?;
                    child.purge_rows_outside_range().await?;
                    child.transition_to(ShardState::Ready).await
                })
            })
            .collect();
        fan_out_join(jobs).await?;

        self.transition_to(ShardState::Recycle).await
    }

    /// Delete every row outside this shard's range, scanning down from the
    /// lower bound and up from the upper bound in batches. Multi-column
    /// sharding keys pay a cross-column preservation check per batch, so
    /// those tables are paced more gently.
    pub async fn purge_rows_outside_range(&self) -> Result<u64> {
        let master = self.pool.master();
        let batch = master.config().delete_batch_size;
        let mut removed_total = 0u64;

        for table in self.tables() {
            let pause = if table.sharding_keys.len() > 1 {
                Duration::from_millis(500)
            } else {
                Duration::from_millis(100)
            };
            for below in [true, false] {
                if below && self.range.min_id == 0 {
                    continue;
                }
                if !below && self.range.is_unbounded() {
                    continue;
                }
                loop {
                    let removed = master
                        .delete_batch_outside_range(&table, &self.range, below, batch)
                        .await?;
                    removed_total += removed;
                    if removed < batch {
                        break;
                    }
                    tokio::time::sleep(pause).await;
                }
            }
        }
        tracing::info!(
            "shard {}: purged {} out-of-range row(s)",
            self.name(),
            removed_total
        );
        Ok(removed_total)
    }

    async fn cleanup_ejected(self: &Arc<Self>) -> Result<()> {
        let ejected: Vec<InstanceId> = self.ejected.read().clone();
        let master = self.pool.master();
        for id in &ejected {
            let db = master.peer(id)?;
            // Also take down anything still replicating from the ejected
            // instance; it is no longer part of the tree.
            let mut doomed = vec![db.clone()];
            doomed.extend(db.slaves());
            for db in doomed {
                if let Err(err) = db.stop_service().await {
                    tracing::warn!(
                        "shard {}: could not stop ejected instance {}: {}",
                        self.name(),
                        db,
                        err
                    );
                }
            }
        }
        self.ejected.write().clear();
        self.transition_to(ShardState::Ready).await
    }

    // ---- Chunked export / import / count ------------------------------------

    /// Export every sharded table's in-range rows on this shard's master;
    /// returns rows exported per table.
    pub async fn export_data(&self) -> Result<HashMap<String, u64>> {
        let master = self.pool.master();
        let mut totals = HashMap::new();
        for table in self.tables() {
            let rows = chunked_op(&master, &table, &self.range, ChunkOp::Export).await?;
            tracing::info!(
                "shard {}: exported {} row(s) of {}",
                self.name(),
                rows,
                table.name
            );
            totals.insert(table.name.clone(), rows);
        }
        Ok(totals)
    }

    /// Rebuild every sharded table empty and re-import the exported rows,
    /// raising on any count that disagrees with the export.
    pub async fn import_data(&self, expected: &HashMap<String, u64>) -> Result<HashMap<String, u64>> {
        let master = self.pool.master();
        let mut totals = HashMap::new();
        for table in self.tables() {
            master.rebuild_table(&table).await?;
            let rows = chunked_op(&master, &table, &self.range, ChunkOp::Import).await?;
            if let Some(exported) = expected.get(&table.name) {
                if rows != *exported {
                    return Err(Error::RowCountMismatch {
                        table: table.name.clone(),
                        expected: *exported,
                        actual: rows,
                    });
                }
            }
            tracing::info!(
                "shard {}: imported {} row(s) of {}",
                self.name(),
                rows,
                table.name
            );
            totals.insert(table.name.clone(), rows);
        }
        Ok(totals)
    }

    /// Chunked in-range row count of one table on this shard's master.
    pub async fn count_rows(&self, table_name: &str) -> Result<u64> {
        let table = self
            .tables()
            .into_iter()
            .find(|t| t.name == table_name)
            .ok_or_else(|| {
                Error::Precondition(format!(
                    "shard {}: unknown table {}",
                    self.name(),
                    table_name
                ))
            })?;
        chunked_op(&self.pool.master(), &table, &self.range, ChunkOp::Count).await
    }
}

impl std::fmt::Display for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum ChunkOp {
    Export,
    Import,
    Count,
    Discard,
}

/// Run one range operation split into roughly-equal chunks with bounded
/// concurrency; each chunk retries transient failures independently with
/// linear backoff. Returns the summed row count.
async fn chunked_op(
    db: &Arc<Db>,
    table: &TableSpec,
    range: &ShardRange,
    op: ChunkOp,
) -> Result<u64> {
    let config = db.config().clone();
    let chunks = if range.is_unbounded() {
        vec![*range]
    } else {
        partition_range(range.min_id, range.max_id, config.chunk_count)?
    };
    let workers = config.chunk_count.min(config.max_concurrency);
    let retries = config.chunk_retries;

    let db = db.clone();
    let table = table.clone();
    let results = bounded_map(chunks, workers, move |chunk| {
        let db = db.clone();
        let table = table.clone();
        async move { run_chunk(db, table, chunk, op, retries).await }
    })
    .await;

    let pairs = results
        .into_iter()
        .enumerate()
        .map(|(index, result)| (format!("chunk {}", index), result))
        .collect();
    let rows = aggregate(pairs)?;
    Ok(rows.into_iter().sum())
}

async fn run_chunk(
    db: Arc<Db>,
    table: TableSpec,
    chunk: ShardRange,
    op: ChunkOp,
    retries: u32,
) -> Result<u64> {
    let mut attempt: u32 = 0;
    loop {
        let result = match op {
            ChunkOp::Export => db.export_range(&table, &chunk).await.map(|(_, rows)| rows),
            ChunkOp::Import => db.import_range(&table, &chunk).await,
            ChunkOp::Count => db.count_rows_in_range(&table, &chunk).await,
            ChunkOp::Discard => db.discard_export(&table, &chunk).await.map(|_| 0),
        };
        match result {
            Ok(rows) => return Ok(rows),
            Err(err) if err.is_transient() && attempt < retries => {
                attempt += 1;
                tracing::warn!(
                    "{} chunk {} on {}: retry {} after: {}",
                    table.name,
                    chunk,
                    db,
                    attempt,
                    err
                );
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }
            Err(err) => return Err(err),
        }
    }
}
