//! Topology Layer
//!
//! The core of the orchestrator, leaf-first: Host (remote execution and the
//! chained transfer protocol), DB (instance model and replication control),
//! Pool (replica classification and master promotion), Shard (range
//! lifecycle state machine), and the Topology registry facade.

pub mod db;
pub mod host;
pub mod pool;
pub mod range;
pub mod registry;
pub mod shard;
pub mod transfer;
