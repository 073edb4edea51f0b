//! shardherd Library
//!
//! This module exposes the shardherd components for use in integration tests
//! and as a library.

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod logging;
pub mod topology;

// Re-export commonly used types
pub use config::{load_config, Config};
pub use domain::entities::{
    BinlogCoordinates, InstanceId, PoolSnapshot, ReplicaRole, ShardRange, ShardState,
    SpareCriteria, SpareRole, TableSpec,
};
pub use domain::ports::{ConfigSink, QueryExecutor, RemoteShell, SpareAllocator};
pub use error::{Error, Result};
pub use topology::db::Db;
pub use topology::host::Host;
pub use topology::pool::{Pool, PromotionReport};
pub use topology::registry::{DbRegistry, Topology};
pub use topology::shard::Shard;
