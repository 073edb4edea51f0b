//! Host - Remote Execution Primitive
//!
//! One Host per machine, deduplicated by IP through the registry. Owns the
//! pooled shell sessions and the structural primitives the transfer
//! verification pass depends on.

use crate::config::Config;
use crate::domain::ports::RemoteShell;
use crate::error::{Error, Result};
use crate::infrastructure::shell_pool::ShellPool;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Idle sessions retained per host.
const MAX_IDLE_SESSIONS: usize = 3;

pub struct Host {
    ip: String,
    pool: ShellPool,
    config: Arc<Config>,
    /// Sticky reachability verdict; cleared only by an explicit re-probe.
    reachable: Mutex<Option<bool>>,
}

impl Host {
    pub fn new(ip: impl Into<String>, shell: Arc<dyn RemoteShell>, config: Arc<Config>) -> Self {
        let ip = ip.into();
        Self {
            pool: ShellPool::new(ip.clone(), shell, MAX_IDLE_SESSIONS),
            ip,
            config,
            reachable: Mutex::new(None),
        }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// Run `command` through a pooled, validated session. Connection-level
    /// failures are retried up to `retries` times with linear backoff
    /// (`sleep(failure_count)` seconds); non-idempotent callers must pass 0.
    /// Exhausting every attempt marks the host unreachable.
    pub async fn execute(&self, command: &str, retries: u32) -> Result<String> {
        let mut failures: u32 = 0;
        loop {
            let attempt = async {
                let mut session = self.pool.acquire().await?;
                let output = session.run(command).await;
                if output.is_ok() {
                    self.pool.release(session).await;
                }
                // Failed sessions are dropped, never pooled.
                output
            };

            match attempt.await {
                Ok(output) => return Ok(output),
                // The command ran and failed; retrying won't change that.
                Err(err @ Error::CommandFailed { .. }) => return Err(err),
                Err(err) => {
                    failures += 1;
                    if failures > retries {
                        *self.reachable.lock() = Some(false);
                        return Err(Error::Unreachable {
                            ip: self.ip.clone(),
                            detail: err.to_string(),
                        });
                    }
                    tracing::warn!(
                        "command on {} failed (attempt {}/{}), backing off {}s: {}",
                        self.ip,
                        failures,
                        retries + 1,
                        failures,
                        err
                    );
                    tokio::time::sleep(Duration::from_secs(failures as u64)).await;
                }
            }
        }
    }

    /// Cached no-op probe. The verdict is sticky for the process lifetime
    /// unless `re_probe` is called.
    pub async fn is_reachable(&self) -> bool {
        if let Some(cached) = *self.reachable.lock() {
            return cached;
        }
        let verdict = matches!(self.execute("echo ping", 1).await, Ok(out) if out.contains("ping"));
        *self.reachable.lock() = Some(verdict);
        verdict
    }

    /// Clear the cached verdict and probe again.
    pub async fn re_probe(&self) -> bool {
        *self.reachable.lock() = None;
        self.is_reachable().await
    }

    /// Poll until a process is listening on `port`, or time out.
    pub async fn wait_for_listener(&self, port: u16, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let needle = format!(":{} ", port);
        loop {
            let output = self.execute("ss -lnt", 0).await.unwrap_or_default();
            if output.contains(&needle) {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(Error::Timeout {
                    operation: format!("listener on {}:{}", self.ip, port),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Recursive file listing: relative path -> size in bytes.
    pub async fn directory_listing(&self, path: &str) -> Result<BTreeMap<String, u64>> {
        let command = format!("find {} -type f -printf '%P\\t%s\\n'", path);
        let output = self.execute(&command, self.config.command_retries).await?;

        let mut listing = BTreeMap::new();
        for line in output.lines() {
            if let Some((name, size)) = line.rsplit_once('\t') {
                if let Ok(size) = size.trim().parse() {
                    listing.insert(name.to_string(), size);
                }
            }
        }
        Ok(listing)
    }

    /// Total bytes under `path`.
    pub async fn directory_size(&self, path: &str) -> Result<u64> {
        let command = format!("du -sb {}", path);
        let output = self.execute(&command, self.config.command_retries).await?;
        output
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::CommandFailed {
                ip: self.ip.clone(),
                command,
                detail: format!("unparseable du output: {:?}", output),
            })
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.config
    }
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.ip)
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host").field("ip", &self.ip).finish()
    }
}
