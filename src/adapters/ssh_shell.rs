//! SSH Shell Adapter
//!
//! Remote execution over the system ssh client with batch-mode key auth.
//! Each session multiplexes over a ControlMaster socket so repeated
//! commands against one host skip the handshake.

use crate::domain::ports::{RemoteShell, ShellSession};
use crate::error::{Error, Result};
use async_trait::async_trait;
use tokio::process::Command;

pub struct SshShell {
    user: String,
    connect_timeout_secs: u64,
}

impl SshShell {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            connect_timeout_secs: 10,
        }
    }
}

impl Default for SshShell {
    fn default() -> Self {
        Self::new("root")
    }
}

struct SshSession {
    user: String,
    ip: String,
    connect_timeout_secs: u64,
}

impl SshSession {
    fn base_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs))
            .arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg(format!("ControlPath=/tmp/shardherd_ssh_{}", self.ip))
            .arg("-o")
            .arg("ControlPersist=60")
            .arg(format!("{}@{}", self.user, self.ip));
        cmd
    }
}

#[async_trait]
impl ShellSession for SshSession {
    async fn run(&mut self, command: &str) -> Result<String> {
        let output = self
            .base_command()
            .arg(command)
            .output()
            .await
            .map_err(|e| Error::Unreachable {
                ip: self.ip.clone(),
                detail: format!("ssh spawn failed: {}", e),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        // ssh itself exits 255 on connection-level failures.
        if output.status.code() == Some(255) {
            return Err(Error::Unreachable {
                ip: self.ip.clone(),
                detail: stderr.trim().to_string(),
            });
        }
        Err(Error::CommandFailed {
            ip: self.ip.clone(),
            command: command.to_string(),
            detail: format!(
                "exit {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ),
        })
    }

    async fn is_alive(&mut self) -> bool {
        matches!(self.run("true").await, Ok(_))
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn connect(&self, ip: &str) -> Result<Box<dyn ShellSession>> {
        let mut session = SshSession {
            user: self.user.clone(),
            ip: ip.to_string(),
            connect_timeout_secs: self.connect_timeout_secs,
        };
        // Establish the control socket up front so a dead host fails here,
        // not on first use.
        session.run("true").await?;
        Ok(Box::new(session))
    }
}
