//! JSON Configuration Sink
//!
//! Writes one pretty-printed JSON document per pool under a target
//! directory. Writes go through a temp file and rename so readers never see
//! a torn snapshot. A no-op sink is provided for callers that do not export
//! configuration.

use crate::domain::entities::PoolSnapshot;
use crate::domain::ports::ConfigSink;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;

pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn io_err(&self, detail: String) -> Error {
        Error::Precondition(format!(
            "config sink {} failed: {}",
            self.dir.display(),
            detail
        ))
    }
}

#[async_trait]
impl ConfigSink for JsonFileSink {
    async fn persist(&self, snapshot: &PoolSnapshot) -> Result<()> {
        let body = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| self.io_err(e.to_string()))?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| self.io_err(e.to_string()))?;

        let path = self.dir.join(format!("{}.json", snapshot.name));
        let tmp = self.dir.join(format!(".{}.json.tmp", snapshot.name));
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| self.io_err(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| self.io_err(e.to_string()))?;
        tracing::debug!("persisted pool {} to {}", snapshot.name, path.display());
        Ok(())
    }
}

/// Sink that drops every snapshot.
#[derive(Default)]
pub struct NoopSink;

#[async_trait]
impl ConfigSink for NoopSink {
    async fn persist(&self, _snapshot: &PoolSnapshot) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::InstanceId;

    fn snapshot(name: &str) -> PoolSnapshot {
        PoolSnapshot {
            name: name.to_string(),
            master: InstanceId::new("10.0.0.1", 3306),
            aliases: vec!["users".to_string()],
            master_read_weight: 0,
            active_slaves: vec![(InstanceId::new("10.0.0.2", 3306), 100)],
            standby_slaves: vec![InstanceId::new("10.0.0.3", 3306)],
            backup_slaves: Vec::new(),
            shard: None,
        }
    }

    #[tokio::test]
    async fn test_persist_writes_readable_json() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonFileSink::new(dir.path());
        sink.persist(&snapshot("pool-users")).await.unwrap();

        let body = tokio::fs::read_to_string(dir.path().join("pool-users.json"))
            .await
            .unwrap();
        let parsed: PoolSnapshot = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.name, "pool-users");
        assert_eq!(parsed.master, InstanceId::new("10.0.0.1", 3306));
        // No leftover temp file.
        assert!(!dir.path().join(".pool-users.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_persist_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonFileSink::new(dir.path());

        sink.persist(&snapshot("p")).await.unwrap();
        let mut updated = snapshot("p");
        updated.master = InstanceId::new("10.9.9.9", 3306);
        sink.persist(&updated).await.unwrap();

        let body = tokio::fs::read_to_string(dir.path().join("p.json"))
            .await
            .unwrap();
        assert!(body.contains("10.9.9.9"));
    }
}
