//! Infrastructure
//!
//! Reusable machinery underneath the topology layer: the per-host shell
//! session pool and the two concurrency primitives (fan-out-join and the
//! bounded worker pool).

pub mod shell_pool;
pub mod tasks;
