//! DB - Database Instance Model
//!
//! Wraps a Host plus a port: SQL access, probing of replication state, and
//! the replication-control operations everything above builds on. Instances
//! are deduplicated by (ip, port) through the DbRegistry; probe-derived
//! fields are memoized until an explicit re-probe.

use crate::config::Config;
use crate::domain::entities::{
    BinlogCoordinates, InstanceId, ReplicationCredentials, ReplicationStatus, ShardRange,
    TableSpec,
};
use crate::domain::ports::{QueryExecutor, Row, SqlTarget};
use crate::error::{Error, Result};
use crate::topology::host::Host;
use crate::topology::registry::DbRegistry;
use crate::topology::transfer::{transfer_directory, TransferOptions};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// Cached probe-derived state. `None` always means "not probed yet".
#[derive(Debug, Default, Clone)]
struct ProbeState {
    running: Option<bool>,
    /// Outer None = unknown; inner None = confirmed not a replica.
    master: Option<Option<InstanceId>>,
    slaves: Option<Vec<InstanceId>>,
    replication_paused: Option<bool>,
}

/// Options for `change_master_to`.
#[derive(Debug, Clone, Default)]
pub struct ChangeMasterOptions {
    /// Explicit coordinates; when absent the new master's own current
    /// coordinates are read (refused if the new master is a moving target).
    pub coordinates: Option<BinlogCoordinates>,
    pub credentials: Option<ReplicationCredentials>,
}

pub struct Db {
    id: InstanceId,
    host: Arc<Host>,
    registry: Weak<DbRegistry>,
    sql: Arc<dyn QueryExecutor>,
    config: Arc<Config>,
    probe: RwLock<ProbeState>,
    /// Current SQL connection identity; changing it forces a reconnect on
    /// the executor side.
    sql_identity: Mutex<(String, String)>,
    backup_flag: AtomicBool,
}

impl Db {
    pub(crate) fn new(
        id: InstanceId,
        host: Arc<Host>,
        registry: Weak<DbRegistry>,
        sql: Arc<dyn QueryExecutor>,
        config: Arc<Config>,
    ) -> Self {
        let identity = (config.app_user.clone(), config.app_schema.clone());
        Self {
            id,
            host,
            registry,
            sql,
            config,
            probe: RwLock::new(ProbeState::default()),
            sql_identity: Mutex::new(identity),
            backup_flag: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn ip(&self) -> &str {
        &self.id.ip
    }

    pub fn port(&self) -> u16 {
        self.id.port
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Look up (or create) another instance through the owning registry.
    pub fn peer(&self, id: &InstanceId) -> Result<Arc<Db>> {
        let registry = self.registry.upgrade().ok_or_else(|| {
            Error::Precondition("topology registry is no longer alive".to_string())
        })?;
        Ok(registry.get_or_create(id.clone()))
    }

    /// Whether this machine is dedicated to backups (never promotable).
    pub fn for_backups(&self) -> bool {
        self.backup_flag.load(Ordering::Relaxed)
    }

    pub fn set_for_backups(&self, value: bool) {
        self.backup_flag.store(value, Ordering::Relaxed);
    }

    // ---- SQL access -------------------------------------------------------

    /// Switch the pooled SQL connection identity. A no-op when the identity
    /// is unchanged; otherwise the next statement reconnects.
    pub fn use_connection(&self, user: &str, schema: &str) {
        let mut identity = self.sql_identity.lock();
        if identity.0 != user || identity.1 != schema {
            tracing::debug!("{}: switching sql identity to {}@{}", self.id, user, schema);
            *identity = (user.to_string(), schema.to_string());
        }
    }

    fn app_target(&self) -> SqlTarget {
        let identity = self.sql_identity.lock();
        SqlTarget {
            instance: self.id.clone(),
            user: identity.0.clone(),
            schema: identity.1.clone(),
        }
    }

    fn root_target(&self) -> SqlTarget {
        SqlTarget {
            instance: self.id.clone(),
            user: self.config.root_user.clone(),
            schema: self.sql_identity.lock().1.clone(),
        }
    }

    pub async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.sql.query(&self.app_target(), sql).await
    }

    /// Root-privileged query, retrying transient failures with linear
    /// backoff before re-raising.
    pub async fn query_root(&self, sql: &str) -> Result<Vec<Row>> {
        let target = self.root_target();
        let mut attempt: u32 = 0;
        loop {
            match self.sql.query(&target, sql).await {
                Ok(rows) => return Ok(rows),
                Err(err) if err.is_transient() && attempt < self.config.command_retries => {
                    attempt += 1;
                    tracing::warn!("{}: query retry {} after: {}", self.id, attempt, err);
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Root-privileged statement, same retry policy as `query_root`.
    pub async fn execute_root(&self, sql: &str) -> Result<u64> {
        let target = self.root_target();
        let mut attempt: u32 = 0;
        loop {
            match self.sql.execute(&target, sql).await {
                Ok(affected) => return Ok(affected),
                Err(err) if err.is_transient() && attempt < self.config.command_retries => {
                    attempt += 1;
                    tracing::warn!("{}: statement retry {} after: {}", self.id, attempt, err);
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    // ---- Probing ----------------------------------------------------------

    /// Probe running/master/slaves state. A no-op when everything is
    /// already known, unless `force` is set.
    pub async fn probe(self: &Arc<Self>, force: bool) -> Result<()> {
        {
            let probe = self.probe.read();
            if !force
                && probe.running.is_some()
                && probe.master.is_some()
                && probe.slaves.is_some()
            {
                return Ok(());
            }
        }

        let running = self.probe_running().await;
        if running {
            self.probe_master().await?;
            self.probe_slaves().await?;
        } else {
            let mut probe = self.probe.write();
            probe.master = Some(None);
            probe.slaves = Some(Vec::new());
        }
        Ok(())
    }

    /// Reachable host whose service status does not say "not running".
    pub async fn probe_running(&self) -> bool {
        let running = if !self.host.is_reachable().await {
            false
        } else {
            match self
                .host
                .execute(&self.config.service_status_command, self.config.command_retries)
                .await
            {
                Ok(output) => !output.contains("not running"),
                Err(_) => false,
            }
        };
        self.probe.write().running = Some(running);
        running
    }

    /// Inspect replica status and resolve the reported master.
    pub async fn probe_master(self: &Arc<Self>) -> Result<()> {
        let status = self.replication_status().await?;
        match status {
            None => {
                let mut probe = self.probe.write();
                probe.master = Some(None);
                probe.replication_paused = None;
            }
            Some(status) => {
                // Materialize the master so later operations can reach it.
                let _master = self.peer(&status.master)?;

                if status.io_running != status.sql_running {
                    let detail = format!(
                        "replication threads disagree (io={}, sql={})",
                        status.io_running, status.sql_running
                    );
                    if self.config.strict_replication {
                        return Err(Error::ReplicationInconsistency {
                            instance: self.id.clone(),
                            detail,
                        });
                    }
                    tracing::warn!("{}: {}", self.id, detail);
                    if self.config.probe_may_repair {
                        tracing::warn!("{}: pausing half-stopped replication", self.id);
                        self.execute_root("STOP SLAVE").await?;
                        let mut probe = self.probe.write();
                        probe.master = Some(Some(status.master));
                        probe.replication_paused = Some(true);
                        return Ok(());
                    }
                }

                let mut probe = self.probe.write();
                probe.master = Some(Some(status.master));
                probe.replication_paused = Some(!status.io_running);
            }
        }
        Ok(())
    }

    /// Scan the process list for replication clients and keep only those
    /// whose own probed master is this instance.
    pub async fn probe_slaves(self: &Arc<Self>) -> Result<()> {
        let rows = self.query_root("SHOW PROCESSLIST").await?;
        let mut candidate_ips: Vec<String> = rows
            .iter()
            .filter(|row| {
                row.get("Command")
                    .map(|c| c.starts_with("Binlog Dump"))
                    .unwrap_or(false)
            })
            .filter_map(|row| row.get("Host"))
            .map(|host| host.split(':').next().unwrap_or(host).to_string())
            .collect();
        candidate_ips.sort();
        candidate_ips.dedup();

        let mut probes = Vec::with_capacity(candidate_ips.len());
        for ip in candidate_ips {
            let candidate = self.peer(&InstanceId::new(ip, self.config.default_port))?;
            let me = self.id.clone();
            probes.push(async move {
                match candidate.probe_master().await {
                    Ok(()) if candidate.master_id().flatten() == Some(me) => Some(candidate),
                    Ok(()) => None,
                    Err(err) => {
                        // Stale or foreign processlist entry; not ours to fail over.
                        tracing::warn!("{}: skipping slave candidate: {}", candidate.id, err);
                        None
                    }
                }
            });
        }

        let confirmed: Vec<InstanceId> = join_all(probes)
            .await
            .into_iter()
            .flatten()
            .map(|db| db.id.clone())
            .collect();
        self.probe.write().slaves = Some(confirmed);
        Ok(())
    }

    /// Fresh SHOW SLAVE STATUS read; None when this is not a replica.
    pub async fn replication_status(&self) -> Result<Option<ReplicationStatus>> {
        let rows = self.query_root("SHOW SLAVE STATUS").await?;
        let row = match rows.first() {
            Some(row) => row,
            None => return Ok(None),
        };
        Ok(Some(self.parse_replication_status(row)?))
    }

    fn parse_replication_status(&self, row: &Row) -> Result<ReplicationStatus> {
        let field = |name: &str| -> Result<String> {
            row.get(name)
                .map(str::to_string)
                .ok_or_else(|| Error::Query {
                    instance: self.id.clone(),
                    detail: format!("SHOW SLAVE STATUS missing field {}", name),
                })
        };
        let master_host = field("Master_Host")?;
        let master_port = row.get_u64("Master_Port").unwrap_or(self.config.default_port as u64);
        Ok(ReplicationStatus {
            master: InstanceId::new(master_host, master_port as u16),
            master_user: field("Master_User")?,
            io_running: row.get("Slave_IO_Running") == Some("Yes"),
            sql_running: row.get("Slave_SQL_Running") == Some("Yes"),
            master_log_file: field("Master_Log_File")?,
            read_master_log_pos: row.get_u64("Read_Master_Log_Pos").unwrap_or(0),
            relay_master_log_file: field("Relay_Master_Log_File")?,
            exec_master_log_pos: row.get_u64("Exec_Master_Log_Pos").unwrap_or(0),
            seconds_behind_master: row.get_u64("Seconds_Behind_Master"),
        })
    }

    // ---- Cached accessors -------------------------------------------------

    pub fn is_running_cached(&self) -> Option<bool> {
        self.probe.read().running
    }

    /// Outer None = unknown; inner None = confirmed not a replica.
    pub fn master_id(&self) -> Option<Option<InstanceId>> {
        self.probe.read().master.clone()
    }

    pub fn slave_ids(&self) -> Option<Vec<InstanceId>> {
        self.probe.read().slaves.clone()
    }

    pub fn replication_paused(&self) -> Option<bool> {
        self.probe.read().replication_paused
    }

    /// Resolve the cached master to an instance handle.
    pub fn master(&self) -> Option<Arc<Db>> {
        let id = self.probe.read().master.clone().flatten()?;
        self.peer(&id).ok()
    }

    /// Resolve the cached slave list; empty when unknown.
    pub fn slaves(&self) -> Vec<Arc<Db>> {
        self.probe
            .read()
            .slaves
            .clone()
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.peer(id).ok())
            .collect()
    }

    fn require_replica(&self) -> Result<InstanceId> {
        match self.probe.read().master.clone() {
            Some(Some(master)) => Ok(master),
            _ => Err(Error::Precondition(format!(
                "{} is not a known replica",
                self.id
            ))),
        }
    }

    // ---- Replication control ----------------------------------------------

    /// Idempotent STOP SLAVE.
    pub async fn pause_replication(&self) -> Result<()> {
        self.require_replica()?;
        if self.probe.read().replication_paused == Some(true) {
            tracing::debug!("{}: replication already paused", self.id);
            return Ok(());
        }
        self.execute_root("STOP SLAVE").await?;
        self.probe.write().replication_paused = Some(true);
        Ok(())
    }

    /// Idempotent START SLAVE.
    pub async fn resume_replication(&self) -> Result<()> {
        self.require_replica()?;
        if self.probe.read().replication_paused == Some(false) {
            tracing::debug!("{}: replication already running", self.id);
            return Ok(());
        }
        self.execute_root("START SLAVE").await?;
        self.probe.write().replication_paused = Some(false);
        Ok(())
    }

    /// Permanently detach from the current master. Irreversible without
    /// re-cloning.
    pub async fn disable_replication(&self) -> Result<()> {
        let old_master = self.require_replica()?;
        self.execute_root("STOP SLAVE").await?;
        self.execute_root("RESET SLAVE ALL").await?;

        if let Ok(master) = self.peer(&old_master) {
            master.forget_slave(&self.id);
        }
        let mut probe = self.probe.write();
        probe.master = Some(None);
        probe.replication_paused = None;
        Ok(())
    }

    fn forget_slave(&self, id: &InstanceId) {
        if let Some(slaves) = self.probe.write().slaves.as_mut() {
            slaves.retain(|s| s != id);
        }
    }

    fn remember_slave(&self, id: &InstanceId) {
        // An explicit repoint is authoritative knowledge even for an
        // instance whose slave list was never probed.
        let mut probe = self.probe.write();
        let slaves = probe.slaves.get_or_insert_with(Vec::new);
        if !slaves.contains(id) {
            slaves.push(id.clone());
        }
    }

    /// Re-point this replica at `new_master`. With no explicit coordinates
    /// the new master's current position is used, refusing to read it while
    /// the new master is itself actively replicating (a moving target).
    /// Replication is left paused; callers resume explicitly.
    pub async fn change_master_to(
        &self,
        new_master: Option<&Arc<Db>>,
        options: ChangeMasterOptions,
    ) -> Result<()> {
        let new_master = match new_master {
            Some(master) => master,
            None => return self.disable_replication().await,
        };
        if new_master.id == self.id {
            return Err(Error::Precondition(format!(
                "{} cannot replicate from itself",
                self.id
            )));
        }

        let current = self.probe.read().master.clone();
        if current == Some(Some(new_master.id.clone())) && options.coordinates.is_none() {
            tracing::debug!("{}: already replicating from {}", self.id, new_master.id);
            return Ok(());
        }
        if let Some(Some(_)) = current {
            self.pause_replication().await?;
        }

        let coordinates = match options.coordinates {
            Some(coordinates) => coordinates,
            None => {
                if let Some(status) = new_master.replication_status().await? {
                    if status.io_running || status.sql_running {
                        return Err(Error::Precondition(format!(
                            "refusing to read binlog coordinates of {} while it is actively replicating",
                            new_master.id
                        )));
                    }
                }
                new_master.binlog_coordinates().await?
            }
        };
        let credentials = match options.credentials {
            Some(credentials) => credentials,
            None => self.replication_credentials().await?,
        };

        tracing::info!(
            "{}: changing master to {} at {}",
            self.id,
            new_master.id,
            coordinates
        );
        self.execute_root(&format!(
            "CHANGE MASTER TO MASTER_HOST='{}', MASTER_PORT={}, MASTER_USER='{}', MASTER_PASSWORD='{}', MASTER_LOG_FILE='{}', MASTER_LOG_POS={}",
            new_master.id.ip,
            new_master.id.port,
            credentials.user,
            credentials.password,
            coordinates.file,
            coordinates.position
        ))
        .await?;

        // Keep the in-memory tree consistent on both ends.
        if let Some(Some(old)) = current {
            if old != new_master.id {
                if let Ok(old) = self.peer(&old) {
                    old.forget_slave(&self.id);
                }
            }
        }
        new_master.remember_slave(&self.id);
        let mut probe = self.probe.write();
        probe.master = Some(Some(new_master.id.clone()));
        probe.replication_paused = Some(true);
        Ok(())
    }

    /// Best replication credentials available: own replica status first,
    /// then the configured defaults.
    pub async fn replication_credentials(&self) -> Result<ReplicationCredentials> {
        if let Some(status) = self.replication_status().await? {
            if !status.master_user.is_empty() {
                return Ok(ReplicationCredentials {
                    user: status.master_user,
                    password: self.config.repl_password.clone(),
                });
            }
        }
        Ok(ReplicationCredentials {
            user: self.config.repl_user.clone(),
            password: self.config.repl_password.clone(),
        })
    }

    // ---- Cloning ----------------------------------------------------------

    /// Clone this instance's data directory onto each target through one
    /// chained transfer, then point every target at *this* instance at its
    /// current coordinates. Replication on the targets is left stopped.
    pub async fn enslave(self: &Arc<Self>, targets: &[Arc<Db>]) -> Result<()> {
        let coordinates = self.clone_source_coordinates(false).await?;
        self.clone_to(targets).await?;
        let credentials = self.replication_credentials().await?;
        for target in targets {
            target
                .change_master_to(
                    Some(self),
                    ChangeMasterOptions {
                        coordinates: Some(coordinates.clone()),
                        credentials: Some(credentials.clone()),
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Clone this replica onto each target and point the targets at this
    /// replica's *master*, making them siblings.
    pub async fn enslave_siblings(self: &Arc<Self>, targets: &[Arc<Db>]) -> Result<()> {
        let master_id = self.require_replica()?;
        let master = self.peer(&master_id)?;
        let coordinates = self.clone_source_coordinates(true).await?;
        self.clone_to(targets).await?;
        let credentials = self.replication_credentials().await?;
        for target in targets {
            target
                .change_master_to(
                    Some(&master),
                    ChangeMasterOptions {
                        coordinates: Some(coordinates.clone()),
                        credentials: Some(credentials.clone()),
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Coordinates a clone of this instance should start replicating from.
    /// A replica source must be paused first so they cannot move mid-copy.
    async fn clone_source_coordinates(&self, of_master: bool) -> Result<BinlogCoordinates> {
        if self.probe.read().master.clone().flatten().is_some()
            && self.probe.read().replication_paused != Some(true)
        {
            return Err(Error::Precondition(format!(
                "{} must have replication paused before cloning",
                self.id
            )));
        }
        if of_master {
            self.replication_binlog_coordinates().await
        } else {
            self.binlog_coordinates().await
        }
    }

    /// Cold-copy the data directory to every target in one chained
    /// transfer: stop the service everywhere, wipe the targets, stream,
    /// restart, and wait for each listener to come back.
    async fn clone_to(self: &Arc<Self>, targets: &[Arc<Db>]) -> Result<()> {
        if targets.is_empty() {
            return Err(Error::Precondition("no clone targets".to_string()));
        }
        let datadir = &self.config.mysql_datadir;

        self.stop_service().await?;
        for target in targets {
            target.stop_service().await?;
            target
                .host
                .execute(&format!("find {} -mindepth 1 -delete", datadir), 0)
                .await?;
        }

        let destinations: Vec<(Arc<Host>, String)> = targets
            .iter()
            .map(|target| (target.host.clone(), datadir.clone()))
            .collect();
        let result = transfer_directory(
            &self.host,
            datadir,
            &destinations,
            &TransferOptions::default(),
        )
        .await;

        // Restart the source even when the copy failed.
        self.start_service().await?;
        result?;

        for target in targets {
            target.start_service().await?;
        }
        Ok(())
    }

    pub async fn stop_service(&self) -> Result<()> {
        self.host
            .execute(&self.config.service_stop_command, 0)
            .await?;
        self.probe.write().running = Some(false);
        Ok(())
    }

    pub async fn start_service(&self) -> Result<()> {
        self.host
            .execute(&self.config.service_start_command, 0)
            .await?;
        self.host
            .wait_for_listener(self.id.port, Duration::from_secs(self.config.listener_timeout_secs))
            .await?;
        self.probe.write().running = Some(true);
        Ok(())
    }

    // ---- Catch-up ---------------------------------------------------------

    /// Wait until replica lag reads 0 for `threshold` consecutive polls,
    /// backing the poll interval off proportionally to the reported lag
    /// (capped at +300s once lag exceeds 30000s).
    pub async fn catch_up_to_master(&self) -> Result<()> {
        self.catch_up_to_master_with(
            Duration::from_secs(self.config.catchup_timeout_secs),
            3,
            Duration::from_secs(5),
        )
        .await
    }

    pub async fn catch_up_to_master_with(
        &self,
        timeout: Duration,
        threshold: u32,
        poll_interval: Duration,
    ) -> Result<()> {
        self.require_replica()?;
        if self.probe.read().replication_paused == Some(true) {
            return Err(Error::Precondition(format!(
                "{} cannot catch up while replication is paused",
                self.id
            )));
        }

        let started = Instant::now();
        let mut consecutive_zero: u32 = 0;
        loop {
            let status = self.replication_status().await?.ok_or_else(|| {
                Error::ReplicationInconsistency {
                    instance: self.id.clone(),
                    detail: "replica status vanished during catch-up".to_string(),
                }
            })?;
            if !status.io_running || !status.sql_running {
                return Err(Error::ReplicationInconsistency {
                    instance: self.id.clone(),
                    detail: "replication threads stopped during catch-up".to_string(),
                });
            }

            let lag = status.seconds_behind_master;
            match lag {
                Some(0) => {
                    consecutive_zero += 1;
                    if consecutive_zero >= threshold {
                        tracing::info!("{}: caught up to master", self.id);
                        return Ok(());
                    }
                }
                _ => consecutive_zero = 0,
            }

            if started.elapsed() >= timeout {
                return Err(Error::Timeout {
                    operation: format!("catch-up on {}", self.id),
                    waited_secs: started.elapsed().as_secs(),
                });
            }

            let lag_secs = lag.unwrap_or(0);
            tracing::info!("{}: replica lag {}s", self.id, lag_secs);
            let backoff = if lag_secs > 30_000 {
                300
            } else {
                (lag_secs / 100).min(300)
            };
            tokio::time::sleep(poll_interval + Duration::from_secs(backoff)).await;
        }
    }

    // ---- Coordinates & read-only flag -------------------------------------

    /// Master-side (file, position); fails if binary logging is disabled.
    pub async fn binlog_coordinates(&self) -> Result<BinlogCoordinates> {
        let rows = self.query_root("SHOW MASTER STATUS").await?;
        let row = rows.first().ok_or_else(|| Error::Precondition(format!(
            "{} has binary logging disabled; no coordinates available",
            self.id
        )))?;
        match (row.get("File"), row.get_u64("Position")) {
            (Some(file), Some(position)) => Ok(BinlogCoordinates::new(file, position)),
            _ => Err(Error::Query {
                instance: self.id.clone(),
                detail: "unparseable SHOW MASTER STATUS output".to_string(),
            }),
        }
    }

    /// Replica-side coordinates executed through on the master's stream.
    pub async fn replication_binlog_coordinates(&self) -> Result<BinlogCoordinates> {
        let status = self.replication_status().await?.ok_or_else(|| {
            Error::Precondition(format!("{} is not a replica", self.id))
        })?;
        Ok(status.executed_coordinates())
    }

    pub async fn set_read_only(&self, value: bool) -> Result<()> {
        self.execute_root(&format!(
            "SET GLOBAL read_only = {}",
            if value { 1 } else { 0 }
        ))
        .await?;
        Ok(())
    }

    pub async fn is_read_only(&self) -> Result<bool> {
        let rows = self.query_root("SELECT @@global.read_only").await?;
        Ok(rows
            .first()
            .and_then(|row| row.0.first().cloned())
            .and_then(|(_, value)| value)
            .map(|value| value == "1" || value.eq_ignore_ascii_case("on"))
            .unwrap_or(false))
    }

    // ---- Export / import building blocks -----------------------------------

    fn range_condition(table: &TableSpec, range: &ShardRange) -> String {
        format!(
            "{} BETWEEN {} AND {}",
            table.key(),
            range.min_id,
            range.max_id
        )
    }

    fn outfile_path(&self, table: &TableSpec, range: &ShardRange) -> String {
        format!(
            "{}/{}_{}_{}.out",
            self.config.export_dir, table.name, range.min_id, range.max_id
        )
    }

    /// Dump one range of one table to a server-local file; returns the
    /// outfile path and the number of rows written.
    pub async fn export_range(
        &self,
        table: &TableSpec,
        range: &ShardRange,
    ) -> Result<(String, u64)> {
        let path = self.outfile_path(table, range);
        let rows = self
            .execute_root(&format!(
                "SELECT * FROM {} WHERE {} INTO OUTFILE '{}'",
                table.name,
                Self::range_condition(table, range),
                path
            ))
            .await?;
        Ok((path, rows))
    }

    /// Load a previously exported range back in. Binary logging is disabled
    /// and unique-key checks relaxed for the bulk load.
    pub async fn import_range(
        &self,
        table: &TableSpec,
        range: &ShardRange,
    ) -> Result<u64> {
        let path = self.outfile_path(table, range);
        self.execute_root("SET SESSION sql_log_bin = 0").await?;
        self.execute_root("SET SESSION unique_checks = 0").await?;
        let rows = self
            .execute_root(&format!(
                "LOAD DATA INFILE '{}' INTO TABLE {}",
                path, table.name
            ))
            .await?;
        self.execute_root("SET SESSION unique_checks = 1").await?;
        self.execute_root("SET SESSION sql_log_bin = 1").await?;
        Ok(rows)
    }

    /// Remove one exported chunk file. Outfiles survive the import itself
    /// so an interrupted import can be re-run from them; callers discard
    /// them once row counts have been verified.
    pub async fn discard_export(&self, table: &TableSpec, range: &ShardRange) -> Result<()> {
        let path = self.outfile_path(table, range);
        self.host
            .execute(&format!("rm -f {}", path), self.config.command_retries)
            .await?;
        Ok(())
    }

    pub async fn count_rows_in_range(&self, table: &TableSpec, range: &ShardRange) -> Result<u64> {
        let rows = self
            .query_root(&format!(
                "SELECT COUNT(*) AS cnt FROM {} WHERE {}",
                table.name,
                Self::range_condition(table, range)
            ))
            .await?;
        rows.first()
            .and_then(|row| row.get_u64("cnt"))
            .ok_or_else(|| Error::Query {
                instance: self.id.clone(),
                detail: format!("unparseable count for {}", table.name),
            })
    }

    /// Drop and recreate a table from its own DDL, leaving it empty.
    pub async fn rebuild_table(&self, table: &TableSpec) -> Result<()> {
        let rows = self
            .query_root(&format!("SHOW CREATE TABLE {}", table.name))
            .await?;
        let ddl = rows
            .first()
            .and_then(|row| row.get("Create Table"))
            .map(str::to_string)
            .ok_or_else(|| Error::Query {
                instance: self.id.clone(),
                detail: format!("no DDL for {}", table.name),
            })?;
        self.execute_root("SET SESSION sql_log_bin = 0").await?;
        self.execute_root(&format!("DROP TABLE {}", table.name)).await?;
        self.execute_root(&ddl).await?;
        self.execute_root("SET SESSION sql_log_bin = 1").await?;
        Ok(())
    }

    /// Delete one batch of rows strictly outside the range boundary.
    /// `below` scans downward from `min_id`, otherwise upward from
    /// `max_id`. Returns the number of rows removed.
    pub async fn delete_batch_outside_range(
        &self,
        table: &TableSpec,
        range: &ShardRange,
        below: bool,
        batch: u64,
    ) -> Result<u64> {
        // With several sharding-key columns a row is only out of range when
        // every column agrees, so all columns join the predicate.
        let (comparison, order) = if below {
            (format!("< {}", range.min_id), "DESC")
        } else {
            (format!("> {}", range.max_id), "ASC")
        };
        let predicate = table
            .sharding_keys
            .iter()
            .map(|key| format!("{} {}", key, comparison))
            .collect::<Vec<_>>()
            .join(" AND ");
        self.execute_root(&format!(
            "DELETE FROM {} WHERE {} ORDER BY {} {} LIMIT {}",
            table.name,
            predicate,
            table.key(),
            order,
            batch
        ))
        .await
    }
}

impl std::fmt::Display for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").field("id", &self.id).finish()
    }
}
