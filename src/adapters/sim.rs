//! Simulated Fleet Adapter
//!
//! An in-memory MySQL fleet implementing both the remote-shell and the
//! query-executor ports. It models just enough server behavior for the
//! orchestration layers to run end to end without real machines: binlog
//! positions, replication links, sharded tables, data directories, and the
//! netcat chain protocol. Every statement and shell command is recorded so
//! callers can assert on exactly what was issued.

use crate::config::Config;
use crate::domain::entities::{BinlogCoordinates, InstanceId};
use crate::domain::ports::{QueryExecutor, RemoteShell, Row, ShellSession, SqlTarget};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

/// Replication link of one simulated server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimLink {
    pub master: InstanceId,
    pub user: String,
    pub io_running: bool,
    pub sql_running: bool,
    /// Master-side coordinates this replica has executed through.
    pub coordinates: BinlogCoordinates,
    /// Forced lag; None reports NULL, Some(0) tracks the master instantly.
    pub lag: Option<u64>,
}

/// One logged change on a master's replication stream.
#[derive(Debug, Clone)]
enum SimEvent {
    Insert(String, Vec<u64>),
    Delete(String, Vec<u64>),
}

/// Full state of one simulated server, cloneable for assertions.
#[derive(Debug, Clone)]
pub struct SimServer {
    pub running: bool,
    pub read_only: bool,
    pub binlog: BinlogCoordinates,
    pub link: Option<SimLink>,
    pub tables: BTreeMap<String, BTreeSet<u64>>,
    log_bin: bool,
    /// Logged changes keyed by the binlog position they were written at.
    events: Vec<(u64, SimEvent)>,
}

impl SimServer {
    fn new() -> Self {
        Self {
            running: true,
            read_only: false,
            binlog: BinlogCoordinates::new("mysql-bin.000001", 4),
            link: None,
            tables: BTreeMap::new(),
            log_bin: true,
            events: Vec::new(),
        }
    }

    fn log_event(&mut self, event: SimEvent) {
        if self.log_bin {
            self.binlog.position += 100;
            self.events.push((self.binlog.position, event));
        }
    }

    fn apply_event(&mut self, event: &SimEvent) {
        match event {
            SimEvent::Insert(table, ids) => {
                self.tables
                    .entry(table.clone())
                    .or_default()
                    .extend(ids.iter().copied());
            }
            SimEvent::Delete(table, ids) => {
                if let Some(rows) = self.tables.get_mut(table) {
                    for id in ids {
                        rows.remove(id);
                    }
                }
            }
        }
    }
}

/// One registered receiving hop of a transfer chain.
#[derive(Debug, Clone)]
struct ChainHop {
    dir: String,
    next: Option<(String, u16)>,
}

pub struct SimFleet {
    config: Arc<Config>,
    self_ref: Weak<SimFleet>,
    servers: DashMap<InstanceId, SimServer>,
    /// ip -> absolute path -> size.
    files: DashMap<String, BTreeMap<String, u64>>,
    /// (ip, outfile path) -> (table, exported ids).
    exports: DashMap<(String, String), (String, Vec<u64>)>,
    /// Transfer listeners currently bound, ip -> ports.
    listeners: DashMap<String, BTreeSet<u16>>,
    chain_hops: DashMap<(String, u16), ChainHop>,
    unreachable: DashMap<String, ()>,
    sql_log: Mutex<Vec<(InstanceId, String)>>,
    shell_log: Mutex<Vec<(String, String)>>,
    /// Consume-once failure injections: (ip, command substring).
    shell_failures: Mutex<Vec<(String, String)>>,
    /// Consume-once failure injections: (instance, sql substring).
    sql_failures: Mutex<Vec<(InstanceId, String)>>,
}

impl SimFleet {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            self_ref: self_ref.clone(),
            servers: DashMap::new(),
            files: DashMap::new(),
            exports: DashMap::new(),
            listeners: DashMap::new(),
            chain_hops: DashMap::new(),
            unreachable: DashMap::new(),
            sql_log: Mutex::new(Vec::new()),
            shell_log: Mutex::new(Vec::new()),
            shell_failures: Mutex::new(Vec::new()),
            sql_failures: Mutex::new(Vec::new()),
        })
    }

    // ---- Fleet setup -------------------------------------------------------

    pub fn add_server(&self, id: &InstanceId) {
        self.servers.insert(id.clone(), SimServer::new());
    }

    pub fn set_binlog(&self, id: &InstanceId, file: &str, position: u64) {
        if let Some(mut server) = self.servers.get_mut(id) {
            server.binlog = BinlogCoordinates::new(file, position);
        }
    }

    /// Wire `slave` to replicate from `master`, already caught up.
    pub fn make_replica(&self, slave: &InstanceId, master: &InstanceId) {
        let (coordinates, tables) = match self.servers.get(master) {
            Some(m) => (m.binlog.clone(), m.tables.clone()),
            None => (BinlogCoordinates::new("mysql-bin.000001", 4), BTreeMap::new()),
        };
        if let Some(mut server) = self.servers.get_mut(slave) {
            server.tables = tables;
            server.link = Some(SimLink {
                master: master.clone(),
                user: self.config.repl_user.clone(),
                io_running: true,
                sql_running: true,
                coordinates,
                lag: Some(0),
            });
        }
    }

    /// Force the reported replica lag; `Some(0)` resumes instant tracking.
    pub fn set_lag(&self, id: &InstanceId, lag: Option<u64>) {
        if let Some(mut server) = self.servers.get_mut(id) {
            if let Some(link) = server.link.as_mut() {
                link.lag = lag;
            }
        }
    }

    /// Stop exactly one replication thread, a state real fleets get into.
    pub fn half_stop_replication(&self, id: &InstanceId) {
        if let Some(mut server) = self.servers.get_mut(id) {
            if let Some(link) = server.link.as_mut() {
                link.sql_running = false;
            }
        }
    }

    pub fn set_unreachable(&self, ip: &str) {
        self.unreachable.insert(ip.to_string(), ());
    }

    pub fn set_reachable(&self, ip: &str) {
        self.unreachable.remove(ip);
    }

    pub fn seed_table(&self, id: &InstanceId, table: &str, ids: impl IntoIterator<Item = u64>) {
        if let Some(mut server) = self.servers.get_mut(id) {
            server
                .tables
                .entry(table.to_string())
                .or_default()
                .extend(ids);
        }
    }

    /// Simulate live writes landing on a master: rows appear, the binlog
    /// advances, and replicas pick the change up through the event stream.
    pub fn append_writes(&self, id: &InstanceId, table: &str, ids: impl IntoIterator<Item = u64>) {
        if let Some(mut server) = self.servers.get_mut(id) {
            let ids: Vec<u64> = ids.into_iter().collect();
            server
                .tables
                .entry(table.to_string())
                .or_default()
                .extend(ids.iter().copied());
            server.log_event(SimEvent::Insert(table.to_string(), ids));
        }
    }

    pub fn add_file(&self, ip: &str, path: &str, size: u64) {
        self.files
            .entry(ip.to_string())
            .or_default()
            .insert(path.to_string(), size);
    }

    pub fn fail_next_shell(&self, ip: &str, needle: &str) {
        self.shell_failures
            .lock()
            .push((ip.to_string(), needle.to_string()));
    }

    pub fn fail_next_sql(&self, id: &InstanceId, needle: &str) {
        self.sql_failures
            .lock()
            .push((id.clone(), needle.to_string()));
    }

    // ---- Assertions --------------------------------------------------------

    pub fn server(&self, id: &InstanceId) -> Option<SimServer> {
        self.servers.get(id).map(|s| s.clone())
    }

    pub fn table_ids(&self, id: &InstanceId, table: &str) -> Vec<u64> {
        self.servers
            .get(id)
            .and_then(|s| s.tables.get(table).map(|ids| ids.iter().copied().collect()))
            .unwrap_or_default()
    }

    pub fn files_under(&self, ip: &str, dir: &str) -> BTreeMap<String, u64> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.files
            .get(ip)
            .map(|files| {
                files
                    .iter()
                    .filter(|(path, _)| path.starts_with(&prefix))
                    .map(|(path, size)| (path[prefix.len()..].to_string(), *size))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn sql_history(&self) -> Vec<(InstanceId, String)> {
        self.sql_log.lock().clone()
    }

    /// Statements that change server or data state, for probing-is-passive
    /// assertions.
    pub fn mutating_sql(&self) -> Vec<(InstanceId, String)> {
        self.sql_log
            .lock()
            .iter()
            .filter(|(_, sql)| {
                let upper = sql.to_uppercase();
                !upper.starts_with("SHOW") && !upper.starts_with("SELECT @@")
                    && !(upper.starts_with("SELECT") && !upper.contains("OUTFILE"))
            })
            .cloned()
            .collect()
    }

    pub fn shell_history(&self) -> Vec<(String, String)> {
        self.shell_log.lock().clone()
    }

    // ---- SQL dispatch ------------------------------------------------------

    fn check_sql_failure(&self, id: &InstanceId, sql: &str) -> Result<()> {
        let mut failures = self.sql_failures.lock();
        if let Some(pos) = failures
            .iter()
            .position(|(fid, needle)| fid == id && sql.contains(needle.as_str()))
        {
            failures.remove(pos);
            return Err(Error::Query {
                instance: id.clone(),
                detail: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn with_server<T>(
        &self,
        id: &InstanceId,
        f: impl FnOnce(&mut SimServer) -> Result<T>,
    ) -> Result<T> {
        if self.unreachable.contains_key(&id.ip) {
            return Err(Error::Query {
                instance: id.clone(),
                detail: "connection refused".to_string(),
            });
        }
        let mut server = self.servers.get_mut(id).ok_or_else(|| Error::Query {
            instance: id.clone(),
            detail: "unknown host".to_string(),
        })?;
        if !server.running {
            return Err(Error::Query {
                instance: id.clone(),
                detail: "server is not running".to_string(),
            });
        }
        f(&mut server)
    }

    fn slave_status_row(&self, id: &InstanceId) -> Result<Vec<Row>> {
        // Read the master's position first; holding two map entries at once
        // can deadlock on shared shards.
        let link = match self.servers.get(id).and_then(|s| s.link.clone()) {
            Some(link) => link,
            None => return Ok(Vec::new()),
        };
        let master_state = self
            .servers
            .get(&link.master)
            .map(|m| (m.binlog.clone(), m.events.clone()));

        self.with_server(id, |server| {
            let link = match server.link.as_mut() {
                Some(link) => link,
                None => return Ok(Vec::new()),
            };
            // A healthy caught-up replica tracks its master instantly,
            // applying every logged event past its executed position.
            if link.io_running && link.sql_running && link.lag == Some(0) {
                if let Some((binlog, events)) = master_state {
                    let executed = link.coordinates.clone();
                    link.coordinates = binlog.clone();
                    let pending: Vec<SimEvent> = events
                        .iter()
                        .filter(|(pos, _)| {
                            BinlogCoordinates::new(binlog.file.clone(), *pos) > executed
                        })
                        .map(|(_, event)| event.clone())
                        .collect();
                    for event in &pending {
                        server.apply_event(event);
                    }
                }
            }
            let link = server.link.as_ref().ok_or_else(|| Error::Query {
                instance: id.clone(),
                detail: "link vanished".to_string(),
            })?;
            let lag = if link.io_running && link.sql_running {
                link.lag
            } else {
                None
            };
            let yes_no = |b: bool| Some(if b { "Yes" } else { "No" }.to_string());
            Ok(vec![Row(vec![
                ("Master_Host".to_string(), Some(link.master.ip.clone())),
                ("Master_Port".to_string(), Some(link.master.port.to_string())),
                ("Master_User".to_string(), Some(link.user.clone())),
                ("Slave_IO_Running".to_string(), yes_no(link.io_running)),
                ("Slave_SQL_Running".to_string(), yes_no(link.sql_running)),
                (
                    "Master_Log_File".to_string(),
                    Some(link.coordinates.file.clone()),
                ),
                (
                    "Read_Master_Log_Pos".to_string(),
                    Some(link.coordinates.position.to_string()),
                ),
                (
                    "Relay_Master_Log_File".to_string(),
                    Some(link.coordinates.file.clone()),
                ),
                (
                    "Exec_Master_Log_Pos".to_string(),
                    Some(link.coordinates.position.to_string()),
                ),
                (
                    "Seconds_Behind_Master".to_string(),
                    lag.map(|l| l.to_string()),
                ),
            ])])
        })
    }

    fn processlist_rows(&self, id: &InstanceId) -> Vec<Row> {
        self.servers
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .link
                    .as_ref()
                    .map(|link| link.master == *id && link.io_running)
                    .unwrap_or(false)
            })
            .map(|entry| {
                Row(vec![
                    ("Id".to_string(), Some("42".to_string())),
                    (
                        "Host".to_string(),
                        Some(format!("{}:51234", entry.key().ip)),
                    ),
                    ("Command".to_string(), Some("Binlog Dump".to_string())),
                ])
            })
            .collect()
    }

    fn dispatch_query(&self, id: &InstanceId, sql: &str) -> Result<Vec<Row>> {
        let trimmed = sql.trim();
        if trimmed.eq_ignore_ascii_case("SHOW SLAVE STATUS") {
            return self.slave_status_row(id);
        }
        if trimmed.eq_ignore_ascii_case("SHOW MASTER STATUS") {
            return self.with_server(id, |server| {
                Ok(vec![Row(vec![
                    ("File".to_string(), Some(server.binlog.file.clone())),
                    (
                        "Position".to_string(),
                        Some(server.binlog.position.to_string()),
                    ),
                ])])
            });
        }
        if trimmed.eq_ignore_ascii_case("SHOW PROCESSLIST") {
            self.with_server(id, |_| Ok(()))?;
            return Ok(self.processlist_rows(id));
        }
        if trimmed.eq_ignore_ascii_case("SELECT @@global.read_only") {
            return self.with_server(id, |server| {
                Ok(vec![Row(vec![(
                    "@@global.read_only".to_string(),
                    Some(if server.read_only { "1" } else { "0" }.to_string()),
                )])])
            });
        }
        if let Some(rest) = strip_prefix_ci(trimmed, "SHOW CREATE TABLE ") {
            let table = rest.trim().to_string();
            return self.with_server(id, |server| {
                if !server.tables.contains_key(&table) {
                    return Err(Error::Query {
                        instance: id.clone(),
                        detail: format!("table {} does not exist", table),
                    });
                }
                Ok(vec![Row(vec![
                    ("Table".to_string(), Some(table.clone())),
                    (
                        "Create Table".to_string(),
                        Some(format!(
                            "CREATE TABLE {} (id bigint unsigned NOT NULL, PRIMARY KEY (id))",
                            table
                        )),
                    ),
                ])])
            });
        }
        if strip_prefix_ci(trimmed, "SELECT COUNT(*)").is_some() {
            let table = word_after(trimmed, "FROM").ok_or_else(|| self.parse_error(id, sql))?;
            let (min, max) = parse_between(trimmed).ok_or_else(|| self.parse_error(id, sql))?;
            return self.with_server(id, |server| {
                let count = server
                    .tables
                    .get(&table)
                    .map(|ids| ids.range(min..=max).count() as u64)
                    .unwrap_or(0);
                Ok(vec![Row(vec![("cnt".to_string(), Some(count.to_string()))])])
            });
        }
        Err(self.parse_error(id, sql))
    }

    fn dispatch_execute(&self, id: &InstanceId, sql: &str) -> Result<u64> {
        let trimmed = sql.trim();
        let upper = trimmed.to_uppercase();

        if upper == "STOP SLAVE" {
            return self.with_server(id, |server| {
                if let Some(link) = server.link.as_mut() {
                    link.io_running = false;
                    link.sql_running = false;
                }
                Ok(0)
            });
        }
        if upper == "START SLAVE" {
            return self.with_server(id, |server| {
                if let Some(link) = server.link.as_mut() {
                    link.io_running = true;
                    link.sql_running = true;
                }
                Ok(0)
            });
        }
        if upper == "RESET SLAVE ALL" {
            return self.with_server(id, |server| {
                server.link = None;
                Ok(0)
            });
        }
        if upper.starts_with("CHANGE MASTER TO") {
            let host = quoted_value(trimmed, "MASTER_HOST").ok_or_else(|| self.parse_error(id, sql))?;
            let port = numeric_value(trimmed, "MASTER_PORT").unwrap_or(self.config.default_port as u64);
            let user = quoted_value(trimmed, "MASTER_USER").unwrap_or_default();
            let file = quoted_value(trimmed, "MASTER_LOG_FILE").ok_or_else(|| self.parse_error(id, sql))?;
            let pos = numeric_value(trimmed, "MASTER_LOG_POS").ok_or_else(|| self.parse_error(id, sql))?;
            return self.with_server(id, |server| {
                server.link = Some(SimLink {
                    master: InstanceId::new(host, port as u16),
                    user,
                    io_running: false,
                    sql_running: false,
                    coordinates: BinlogCoordinates::new(file, pos),
                    lag: Some(0),
                });
                Ok(0)
            });
        }
        if upper.starts_with("SET GLOBAL READ_ONLY") {
            let value = trimmed.ends_with('1');
            return self.with_server(id, |server| {
                server.read_only = value;
                Ok(0)
            });
        }
        if upper.starts_with("SET SESSION SQL_LOG_BIN") {
            let value = trimmed.ends_with('1');
            return self.with_server(id, |server| {
                server.log_bin = value;
                Ok(0)
            });
        }
        if upper.starts_with("SET SESSION UNIQUE_CHECKS") {
            return self.with_server(id, |_| Ok(0));
        }
        if upper.contains("INTO OUTFILE") {
            let table = word_after(trimmed, "FROM").ok_or_else(|| self.parse_error(id, sql))?;
            let (min, max) = parse_between(trimmed).ok_or_else(|| self.parse_error(id, sql))?;
            let path = quoted_value(trimmed, "OUTFILE").ok_or_else(|| self.parse_error(id, sql))?;
            let ids: Vec<u64> = self.with_server(id, |server| {
                Ok(server
                    .tables
                    .get(&table)
                    .map(|ids| ids.range(min..=max).copied().collect())
                    .unwrap_or_default())
            })?;
            let count = ids.len() as u64;
            self.add_file(&id.ip, &path, count * 16);
            self.exports
                .insert((id.ip.clone(), path), (table, ids));
            return Ok(count);
        }
        if upper.starts_with("LOAD DATA INFILE") {
            let path = quoted_value(trimmed, "INFILE").ok_or_else(|| self.parse_error(id, sql))?;
            let table = word_after(trimmed, "TABLE").ok_or_else(|| self.parse_error(id, sql))?;
            let export = self
                .exports
                .get(&(id.ip.clone(), path.clone()))
                .map(|e| e.clone());
            let (_, ids) = export.ok_or_else(|| Error::Query {
                instance: id.clone(),
                detail: format!("no such file {}", path),
            })?;
            let count = ids.len() as u64;
            return self.with_server(id, |server| {
                server.tables.entry(table).or_default().extend(ids);
                Ok(count)
            });
        }
        if upper.starts_with("DELETE FROM") {
            let table = word_after(trimmed, "FROM").ok_or_else(|| self.parse_error(id, sql))?;
            let limit = numeric_after(trimmed, "LIMIT").unwrap_or(u64::MAX);
            let (below, boundary) = parse_comparison(trimmed).ok_or_else(|| self.parse_error(id, sql))?;
            return self.with_server(id, |server| {
                let ids = match server.tables.get_mut(&table) {
                    Some(ids) => ids,
                    None => return Ok(0),
                };
                let doomed: Vec<u64> = if below {
                    ids.range(..boundary).copied().take(limit as usize).collect()
                } else {
                    ids.range(boundary + 1..).copied().take(limit as usize).collect()
                };
                for id in &doomed {
                    ids.remove(id);
                }
                if !doomed.is_empty() {
                    server.log_event(SimEvent::Delete(table, doomed.clone()));
                }
                Ok(doomed.len() as u64)
            });
        }
        if upper.starts_with("DROP TABLE") {
            let table = word_after(trimmed, "TABLE").ok_or_else(|| self.parse_error(id, sql))?;
            return self.with_server(id, |server| {
                server.tables.remove(&table);
                Ok(0)
            });
        }
        if upper.starts_with("CREATE TABLE") {
            let table = word_after(trimmed, "TABLE").ok_or_else(|| self.parse_error(id, sql))?;
            return self.with_server(id, |server| {
                server.tables.entry(table).or_default();
                Ok(0)
            });
        }
        Err(self.parse_error(id, sql))
    }

    fn parse_error(&self, id: &InstanceId, sql: &str) -> Error {
        Error::Precondition(format!("statement not modeled on {}: {}", id, sql))
    }

    // ---- Shell dispatch ----------------------------------------------------

    fn check_shell_failure(&self, ip: &str, command: &str) -> Result<()> {
        let mut failures = self.shell_failures.lock();
        if let Some(pos) = failures
            .iter()
            .position(|(fip, needle)| fip == ip && command.contains(needle.as_str()))
        {
            failures.remove(pos);
            return Err(Error::CommandFailed {
                ip: ip.to_string(),
                command: command.to_string(),
                detail: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn servers_on(&self, ip: &str) -> Vec<InstanceId> {
        self.servers
            .iter()
            .filter(|entry| entry.key().ip == ip)
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn set_running(&self, ip: &str, running: bool) {
        for id in self.servers_on(ip) {
            if let Some(mut server) = self.servers.get_mut(&id) {
                server.running = running;
            }
        }
    }

    fn ss_output(&self, ip: &str) -> String {
        let mut ports: BTreeSet<u16> = self
            .servers_on(ip)
            .into_iter()
            .filter(|id| {
                self.servers
                    .get(id)
                    .map(|s| s.running)
                    .unwrap_or(false)
            })
            .map(|id| id.port)
            .collect();
        if let Some(bound) = self.listeners.get(ip) {
            ports.extend(bound.iter());
        }
        let mut out = String::from("State Recv-Q Send-Q Local Address:Port Peer Address:Port\n");
        for port in ports {
            out.push_str(&format!("LISTEN 0 128 0.0.0.0:{} 0.0.0.0:*\n", port));
        }
        out
    }

    fn wipe_directory(&self, ip: &str, dir: &str) {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        if let Some(mut files) = self.files.get_mut(ip) {
            files.retain(|path, _| !path.starts_with(&prefix));
        }
        // Wiping a data directory destroys the database itself.
        if dir.trim_end_matches('/') == self.config.mysql_datadir.trim_end_matches('/') {
            for id in self.servers_on(ip) {
                if let Some(mut server) = self.servers.get_mut(&id) {
                    server.tables.clear();
                    server.link = None;
                    server.binlog = BinlogCoordinates::new("mysql-bin.000001", 4);
                    server.events.clear();
                }
            }
        }
    }

    /// Register one receiving hop parsed from its shell command.
    fn register_receiver(&self, ip: &str, command: &str) -> Result<()> {
        let port = numeric_after(command, "nc -l").ok_or_else(|| Error::CommandFailed {
            ip: ip.to_string(),
            command: command.to_string(),
            detail: "unparseable receiver".to_string(),
        })? as u16;
        let dir = word_after(command, "-C").ok_or_else(|| Error::CommandFailed {
            ip: ip.to_string(),
            command: command.to_string(),
            detail: "receiver without target directory".to_string(),
        })?;
        // Forward hop, if any: "nc <ip> <port> <" ahead of the listener.
        let next = command.find(" < ").and_then(|_| {
            let fwd = command.split("nc ").nth(1)?;
            let mut parts = fwd.split_whitespace();
            let next_ip = parts.next()?.to_string();
            let next_port: u16 = parts.next()?.parse().ok()?;
            Some((next_ip, next_port))
        });
        self.listeners
            .entry(ip.to_string())
            .or_default()
            .insert(port);
        self.chain_hops.insert(
            (ip.to_string(), port),
            ChainHop {
                dir: dir.trim_end_matches(';').to_string(),
                next,
            },
        );
        Ok(())
    }

    /// Run a sender command: walk the registered chain, copying files (and,
    /// for data directories, database state) into every hop.
    fn run_sender(&self, ip: &str, command: &str) -> Result<()> {
        let source_dir = word_after(command, "-C").ok_or_else(|| Error::CommandFailed {
            ip: ip.to_string(),
            command: command.to_string(),
            detail: "sender without source directory".to_string(),
        })?;
        let head = command.rsplit("nc ").next().and_then(|tail| {
            let mut parts = tail.split_whitespace();
            let head_ip = parts.next()?.to_string();
            let head_port: u16 = parts.next()?.parse().ok()?;
            Some((head_ip, head_port))
        });
        let (mut hop_ip, mut hop_port) = head.ok_or_else(|| Error::CommandFailed {
            ip: ip.to_string(),
            command: command.to_string(),
            detail: "sender without chain head".to_string(),
        })?;

        // Requested entries between the -C dir and the first pipe.
        let file_args: Vec<String> = command
            .split('|')
            .next()
            .unwrap_or("")
            .split_whitespace()
            .skip_while(|tok| *tok != &source_dir)
            .skip(1)
            .map(str::to_string)
            .collect();

        let source_files = self.files_under(ip, &source_dir);
        let is_datadir =
            source_dir.trim_end_matches('/') == self.config.mysql_datadir.trim_end_matches('/');
        let source_state = if is_datadir {
            self.servers_on(ip)
                .first()
                .and_then(|id| self.servers.get(id))
                .map(|s| (s.binlog.clone(), s.tables.clone()))
        } else {
            None
        };

        loop {
            let hop = self
                .chain_hops
                .remove(&(hop_ip.clone(), hop_port))
                .map(|(_, hop)| hop)
                .ok_or_else(|| Error::CommandFailed {
                    ip: ip.to_string(),
                    command: command.to_string(),
                    detail: format!("connection refused by {}:{}", hop_ip, hop_port),
                })?;
            if let Some(mut bound) = self.listeners.get_mut(&hop_ip) {
                bound.remove(&hop_port);
            }

            let dest_prefix = hop.dir.trim_end_matches('/');
            for (name, size) in &source_files {
                let wanted = file_args.is_empty()
                    || file_args.iter().any(|f| {
                        f == "." || name == f || name.starts_with(&format!("{}/", f))
                    });
                if wanted {
                    self.add_file(&hop_ip, &format!("{}/{}", dest_prefix, name), *size);
                }
            }
            if let Some((binlog, tables)) = &source_state {
                if hop.dir.trim_end_matches('/')
                    == self.config.mysql_datadir.trim_end_matches('/')
                {
                    for id in self.servers_on(&hop_ip) {
                        if let Some(mut server) = self.servers.get_mut(&id) {
                            server.binlog = binlog.clone();
                            server.tables = tables.clone();
                        }
                    }
                }
            }

            match hop.next {
                Some((next_ip, next_port)) => {
                    hop_ip = next_ip;
                    hop_port = next_port;
                }
                None => return Ok(()),
            }
        }
    }

    fn dispatch_shell(&self, ip: &str, command: &str) -> Result<String> {
        if command.contains("echo ping") {
            return Ok("ping".to_string());
        }
        if command == self.config.service_status_command {
            let running = self
                .servers_on(ip)
                .first()
                .and_then(|id| self.servers.get(id))
                .map(|s| s.running)
                .unwrap_or(false);
            return Ok(if running {
                "mysqld is running".to_string()
            } else {
                "mysqld is not running".to_string()
            });
        }
        if command == self.config.service_start_command {
            self.set_running(ip, true);
            return Ok(String::new());
        }
        if command == self.config.service_stop_command {
            self.set_running(ip, false);
            return Ok(String::new());
        }
        if command.starts_with("ss -lnt") {
            return Ok(self.ss_output(ip));
        }
        // Receiving hops may lead with fifo setup, so match before rm/find.
        if command.contains("nc -l") {
            self.register_receiver(ip, command)?;
            return Ok(String::new());
        }
        if command.starts_with("find ") && command.contains("-printf") {
            let dir = command.split_whitespace().nth(1).unwrap_or("");
            let listing = self.files_under(ip, dir);
            let mut out = String::new();
            for (name, size) in listing {
                out.push_str(&format!("{}\t{}\n", name, size));
            }
            return Ok(out);
        }
        if command.starts_with("find ") && command.contains("-delete") {
            let dir = command.split_whitespace().nth(1).unwrap_or("").to_string();
            self.wipe_directory(ip, &dir);
            return Ok(String::new());
        }
        if command.starts_with("du -sb") {
            let dir = command.split_whitespace().nth(2).unwrap_or("");
            let total: u64 = self.files_under(ip, dir).values().sum();
            return Ok(format!("{}\t{}\n", total, dir));
        }
        if command.starts_with("mkdir -p") {
            return Ok(String::new());
        }
        if command.starts_with("rm -f") {
            if let Some(path) = command.split_whitespace().nth(2) {
                if let Some(mut files) = self.files.get_mut(ip) {
                    files.remove(path);
                }
            }
            return Ok(String::new());
        }
        if command.starts_with("tar c -C") {
            self.run_sender(ip, command)?;
            return Ok(String::new());
        }
        Err(Error::CommandFailed {
            ip: ip.to_string(),
            command: command.to_string(),
            detail: "command not modeled".to_string(),
        })
    }
}

#[async_trait]
impl QueryExecutor for SimFleet {
    async fn query(&self, target: &SqlTarget, sql: &str) -> Result<Vec<Row>> {
        self.sql_log
            .lock()
            .push((target.instance.clone(), sql.to_string()));
        self.check_sql_failure(&target.instance, sql)?;
        self.dispatch_query(&target.instance, sql)
    }

    async fn execute(&self, target: &SqlTarget, sql: &str) -> Result<u64> {
        self.sql_log
            .lock()
            .push((target.instance.clone(), sql.to_string()));
        self.check_sql_failure(&target.instance, sql)?;
        self.dispatch_execute(&target.instance, sql)
    }
}

struct SimSession {
    fleet: Arc<SimFleet>,
    ip: String,
}

#[async_trait]
impl ShellSession for SimSession {
    async fn run(&mut self, command: &str) -> Result<String> {
        self.fleet
            .shell_log
            .lock()
            .push((self.ip.clone(), command.to_string()));
        if self.fleet.unreachable.contains_key(&self.ip) {
            return Err(Error::Unreachable {
                ip: self.ip.clone(),
                detail: "connection reset".to_string(),
            });
        }
        self.fleet.check_shell_failure(&self.ip, command)?;
        self.fleet.dispatch_shell(&self.ip, command)
    }

    async fn is_alive(&mut self) -> bool {
        !self.fleet.unreachable.contains_key(&self.ip)
    }
}

#[async_trait]
impl RemoteShell for SimFleet {
    async fn connect(&self, ip: &str) -> Result<Box<dyn ShellSession>> {
        if self.unreachable.contains_key(ip) {
            return Err(Error::Unreachable {
                ip: ip.to_string(),
                detail: "connection refused".to_string(),
            });
        }
        let fleet = self.self_ref.upgrade().ok_or_else(|| Error::Unreachable {
            ip: ip.to_string(),
            detail: "fleet is gone".to_string(),
        })?;
        Ok(Box::new(SimSession {
            fleet,
            ip: ip.to_string(),
        }))
    }
}

// ---- Statement parsing helpers ---------------------------------------------

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// First whitespace-delimited word after `keyword`, trimmed of SQL noise.
fn word_after(s: &str, keyword: &str) -> Option<String> {
    let mut tokens = s.split_whitespace();
    while let Some(token) = tokens.next() {
        if token.eq_ignore_ascii_case(keyword) {
            return tokens
                .next()
                .map(|w| w.trim_matches(|c| c == ';' || c == '`').to_string());
        }
    }
    None
}

fn numeric_after(s: &str, keyword: &str) -> Option<u64> {
    let pos = s.find(keyword)?;
    s[pos + keyword.len()..]
        .split_whitespace()
        .next()?
        .trim_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .ok()
}

/// Value of `KEY='...'` in a statement.
fn quoted_value(s: &str, key: &str) -> Option<String> {
    let pos = s.find(key)?;
    let rest = &s[pos + key.len()..];
    let open = rest.find('\'')?;
    let rest = &rest[open + 1..];
    let close = rest.find('\'')?;
    Some(rest[..close].to_string())
}

/// Value of `KEY=n` in a statement.
fn numeric_value(s: &str, key: &str) -> Option<u64> {
    let pos = s.find(key)?;
    let rest = s[pos + key.len()..].trim_start_matches([' ', '=']);
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// `BETWEEN a AND b` bounds.
fn parse_between(s: &str) -> Option<(u64, u64)> {
    let pos = s.to_uppercase().find("BETWEEN")?;
    let mut tokens = s[pos..].split_whitespace();
    tokens.next(); // BETWEEN
    let min: u64 = tokens.next()?.parse().ok()?;
    tokens.next(); // AND
    let max: u64 = tokens.next()?.parse().ok()?;
    Some((min, max))
}

/// First `< n` / `> n` comparison; true means "below".
fn parse_comparison(s: &str) -> Option<(bool, u64)> {
    for (i, c) in s.char_indices() {
        if c == '<' || c == '>' {
            let boundary: u64 = s[i + 1..].split_whitespace().next()?.parse().ok()?;
            return Some((c == '<', boundary));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet() -> Arc<SimFleet> {
        SimFleet::new(Arc::new(Config::default()))
    }

    fn id(ip: &str) -> InstanceId {
        InstanceId::new(ip, 3306)
    }

    fn target(id: &InstanceId) -> SqlTarget {
        SqlTarget {
            instance: id.clone(),
            user: "root".to_string(),
            schema: "app".to_string(),
        }
    }

    #[tokio::test]
    async fn test_master_status_reflects_binlog() {
        let fleet = fleet();
        let master = id("10.0.0.1");
        fleet.add_server(&master);
        fleet.set_binlog(&master, "mysql-bin.000010", 4096);

        let rows = fleet
            .query(&target(&master), "SHOW MASTER STATUS")
            .await
            .unwrap();
        assert_eq!(rows[0].get("File"), Some("mysql-bin.000010"));
        assert_eq!(rows[0].get_u64("Position"), Some(4096));
    }

    #[tokio::test]
    async fn test_replica_tracks_master_when_caught_up() {
        let fleet = fleet();
        let master = id("10.0.0.1");
        let slave = id("10.0.0.2");
        fleet.add_server(&master);
        fleet.add_server(&slave);
        fleet.seed_table(&master, "posts", [1, 2, 3]);
        fleet.make_replica(&slave, &master);
        fleet.append_writes(&master, "posts", [4]);

        let rows = fleet
            .query(&target(&slave), "SHOW SLAVE STATUS")
            .await
            .unwrap();
        let pos = rows[0].get_u64("Exec_Master_Log_Pos").unwrap();
        assert_eq!(pos, fleet.server(&master).unwrap().binlog.position);
        assert_eq!(fleet.table_ids(&slave, "posts"), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_change_master_parses_coordinates() {
        let fleet = fleet();
        let a = id("10.0.0.1");
        let b = id("10.0.0.2");
        fleet.add_server(&a);
        fleet.add_server(&b);

        fleet
            .execute(
                &target(&b),
                "CHANGE MASTER TO MASTER_HOST='10.0.0.1', MASTER_PORT=3306, MASTER_USER='replication', MASTER_PASSWORD='x', MASTER_LOG_FILE='mysql-bin.000010', MASTER_LOG_POS=4096",
            )
            .await
            .unwrap();

        let link = fleet.server(&b).unwrap().link.unwrap();
        assert_eq!(link.master, a);
        assert_eq!(link.coordinates, BinlogCoordinates::new("mysql-bin.000010", 4096));
        assert!(!link.io_running);
    }

    #[tokio::test]
    async fn test_outfile_then_load_round_trip() {
        let fleet = fleet();
        let a = id("10.0.0.1");
        fleet.add_server(&a);
        fleet.seed_table(&a, "posts", [5, 10, 15, 20]);

        let exported = fleet
            .execute(
                &target(&a),
                "SELECT * FROM posts WHERE post_id BETWEEN 10 AND 20 INTO OUTFILE '/var/tmp/posts_10_20.out'",
            )
            .await
            .unwrap();
        assert_eq!(exported, 3);

        fleet
            .execute(&target(&a), "DROP TABLE posts")
            .await
            .unwrap();
        let loaded = fleet
            .execute(
                &target(&a),
                "LOAD DATA INFILE '/var/tmp/posts_10_20.out' INTO TABLE posts",
            )
            .await
            .unwrap();
        assert_eq!(loaded, 3);
        assert_eq!(fleet.table_ids(&a, "posts"), vec![10, 15, 20]);
    }

    #[tokio::test]
    async fn test_delete_respects_direction_and_limit() {
        let fleet = fleet();
        let a = id("10.0.0.1");
        fleet.add_server(&a);
        fleet.seed_table(&a, "posts", 1..=10);

        let removed = fleet
            .execute(
                &target(&a),
                "DELETE FROM posts WHERE post_id < 5 ORDER BY post_id DESC LIMIT 2",
            )
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(fleet.table_ids(&a, "posts").len(), 8);

        let removed = fleet
            .execute(
                &target(&a),
                "DELETE FROM posts WHERE post_id > 8 ORDER BY post_id ASC LIMIT 100",
            )
            .await
            .unwrap();
        assert_eq!(removed, 2);
    }

    #[tokio::test]
    async fn test_shell_models_service_and_listeners() {
        let fleet = fleet();
        let a = id("10.0.0.1");
        fleet.add_server(&a);

        let mut session = fleet.connect("10.0.0.1").await.unwrap();
        assert!(session
            .run("ss -lnt")
            .await
            .unwrap()
            .contains(":3306 "));
        session.run("service mysql stop").await.unwrap();
        assert!(!fleet.server(&a).unwrap().running);
        assert!(session
            .run("service mysql status")
            .await
            .unwrap()
            .contains("not running"));
    }

    #[tokio::test]
    async fn test_chained_copy_through_receivers() {
        let fleet = fleet();
        fleet.add_server(&id("10.0.0.1"));
        fleet.add_server(&id("10.0.0.2"));
        fleet.add_server(&id("10.0.0.3"));
        fleet.add_file("10.0.0.1", "/var/lib/mysql/ibdata1", 1024);
        fleet.seed_table(&id("10.0.0.1"), "posts", [1, 2]);

        let mut s3 = fleet.connect("10.0.0.3").await.unwrap();
        s3.run("nc -l 7001 | tar x -C /var/lib/mysql").await.unwrap();
        let mut s2 = fleet.connect("10.0.0.2").await.unwrap();
        s2.run("rm -f /tmp/f && mkfifo /tmp/f && (nc 10.0.0.3 7001 < /tmp/f &) && nc -l 7000 | tee /tmp/f | tar x -C /var/lib/mysql; rm -f /tmp/f")
            .await
            .unwrap();
        let mut s1 = fleet.connect("10.0.0.1").await.unwrap();
        s1.run("tar c -C /var/lib/mysql . | nc 10.0.0.2 7000")
            .await
            .unwrap();

        for ip in ["10.0.0.2", "10.0.0.3"] {
            assert_eq!(
                fleet.files_under(ip, "/var/lib/mysql").get("ibdata1"),
                Some(&1024)
            );
            assert_eq!(fleet.table_ids(&id(ip), "posts"), vec![1, 2]);
        }
    }

    #[tokio::test]
    async fn test_unreachable_hosts_refuse_everything() {
        let fleet = fleet();
        let a = id("10.0.0.1");
        fleet.add_server(&a);
        fleet.set_unreachable("10.0.0.1");

        assert!(fleet.connect("10.0.0.1").await.is_err());
        assert!(fleet
            .query(&target(&a), "SHOW MASTER STATUS")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_injected_failures_fire_once() {
        let fleet = fleet();
        let a = id("10.0.0.1");
        fleet.add_server(&a);
        fleet.fail_next_sql(&a, "SHOW MASTER STATUS");

        assert!(fleet
            .query(&target(&a), "SHOW MASTER STATUS")
            .await
            .is_err());
        assert!(fleet
            .query(&target(&a), "SHOW MASTER STATUS")
            .await
            .is_ok());
    }
}
