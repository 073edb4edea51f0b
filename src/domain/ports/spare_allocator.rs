//! Spare Allocator Port
//!
//! Abstracts the inventory system that tracks unassigned machines. The core
//! only needs to claim spares by role/affinity and to count what is left.

use crate::domain::entities::{InstanceId, SpareCriteria};
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait SpareAllocator: Send + Sync {
    /// Claim `count` spares matching `criteria`. Errors with
    /// `Error::InsufficientSpares` when the inventory cannot satisfy the
    /// claim; a partial claim is never returned.
    async fn claim_spares(&self, count: usize, criteria: &SpareCriteria)
        -> Result<Vec<InstanceId>>;

    /// How many spares match `criteria` right now.
    async fn count_spares(&self, criteria: &SpareCriteria) -> Result<usize>;
}
