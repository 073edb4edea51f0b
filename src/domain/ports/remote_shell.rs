//! Remote Shell Port
//!
//! The only way the core touches a remote machine: privileged command
//! execution returning captured text output. Implementations wrap SSH or,
//! for tests and single-host dry runs, a local subprocess.

use crate::error::Result;
use async_trait::async_trait;

/// Factory for shell sessions against arbitrary hosts.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Open a new session to `ip`. Sessions are pooled per host and
    /// validated before reuse; see `infrastructure::shell_pool`.
    async fn connect(&self, ip: &str) -> Result<Box<dyn ShellSession>>;
}

/// One persistent shell session.
#[async_trait]
pub trait ShellSession: Send {
    /// Run a command, returning its captured output. A non-zero exit is an
    /// error carrying the command's stderr.
    async fn run(&mut self, command: &str) -> Result<String>;

    /// Cheap round-trip check that the session is still usable.
    async fn is_alive(&mut self) -> bool;
}
