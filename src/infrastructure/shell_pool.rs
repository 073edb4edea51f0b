//! Shell Session Pool
//!
//! Each Host keeps a small set of idle remote-shell sessions. A session is
//! validated with a trivial round-trip before reuse and discarded (never
//! returned) on any failure.

use crate::domain::ports::{RemoteShell, ShellSession};
use crate::error::Result;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Pool of idle sessions for one host.
pub struct ShellPool {
    ip: String,
    shell: Arc<dyn RemoteShell>,
    /// Idle sessions; at most `max_idle` are retained.
    idle: Mutex<VecDeque<Box<dyn ShellSession>>>,
    max_idle: usize,
}

impl ShellPool {
    pub fn new(ip: impl Into<String>, shell: Arc<dyn RemoteShell>, max_idle: usize) -> Self {
        Self {
            ip: ip.into(),
            shell,
            idle: Mutex::new(VecDeque::new()),
            max_idle,
        }
    }

    /// Take a validated session, opening a fresh one if no idle session
    /// survives validation.
    pub async fn acquire(&self) -> Result<Box<dyn ShellSession>> {
        {
            let mut idle = self.idle.lock().await;
            while let Some(mut session) = idle.pop_front() {
                if session.is_alive().await {
                    return Ok(session);
                }
                tracing::debug!("discarding dead shell session to {}", self.ip);
            }
        }
        self.shell.connect(&self.ip).await
    }

    /// Return a session after successful use.
    pub async fn release(&self, session: Box<dyn ShellSession>) {
        let mut idle = self.idle.lock().await;
        if idle.len() < self.max_idle {
            idle.push_back(session);
        }
        // Over capacity: drop on the floor.
    }

    /// Number of idle sessions currently pooled.
    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }
}
