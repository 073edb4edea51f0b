//! Configuration Sink Port
//!
//! Receives a snapshot after every state-affecting transition so other
//! systems can observe topology changes. Persist failures are surfaced to
//! the caller as warnings, never as operation failures: correctness of the
//! topology itself does not depend on the sink.

use crate::domain::entities::PoolSnapshot;
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ConfigSink: Send + Sync {
    async fn persist(&self, snapshot: &PoolSnapshot) -> Result<()>;
}
