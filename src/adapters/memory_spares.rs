//! In-Memory Spare Inventory
//!
//! Spare tracking backed by a role-keyed map. The inventory is flat: no
//! hardware or locality metadata is tracked, so the `SpareCriteria::like`
//! affinity hint carries no weight here. Suitable for deployments that feed
//! the inventory at start-up and for tests; sites with an asset tracker
//! implement the port against it instead.

use crate::domain::entities::{InstanceId, SpareCriteria, SpareRole};
use crate::domain::ports::SpareAllocator;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
pub struct MemorySpares {
    inventory: Mutex<HashMap<SpareRole, Vec<InstanceId>>>,
}

impl MemorySpares {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_spare(&self, role: SpareRole, id: InstanceId) {
        self.inventory.lock().entry(role).or_default().push(id);
    }

    /// Return a machine to the pool, e.g. after a recycled shard is wiped.
    pub fn release(&self, role: SpareRole, id: InstanceId) {
        self.add_spare(role, id);
    }
}

impl SpareRole {
    /// Claims fall back to the standby pool when the requested role has no
    /// dedicated inventory.
    fn fallback(&self) -> Option<SpareRole> {
        match self {
            SpareRole::Master | SpareRole::Backup => Some(SpareRole::Standby),
            SpareRole::Standby => None,
        }
    }
}

#[async_trait]
impl SpareAllocator for MemorySpares {
    async fn claim_spares(
        &self,
        count: usize,
        criteria: &SpareCriteria,
    ) -> Result<Vec<InstanceId>> {
        let mut inventory = self.inventory.lock();
        let available = inventory.get(&criteria.role).map(Vec::len).unwrap_or(0);
        let role = if available >= count {
            criteria.role
        } else {
            match criteria.role.fallback() {
                Some(fallback)
                    if inventory.get(&fallback).map(Vec::len).unwrap_or(0) >= count =>
                {
                    fallback
                }
                _ => {
                    return Err(Error::InsufficientSpares {
                        wanted: count,
                        available,
                    })
                }
            }
        };
        let pool = inventory.entry(role).or_default();
        Ok(pool.drain(..count).collect())
    }

    /// Counts the dedicated pool plus the fallback pool a claim could draw
    /// from instead.
    async fn count_spares(&self, criteria: &SpareCriteria) -> Result<usize> {
        let inventory = self.inventory.lock();
        let direct = inventory.get(&criteria.role).map(Vec::len).unwrap_or(0);
        let fallback = criteria
            .role
            .fallback()
            .and_then(|role| inventory.get(&role).map(Vec::len))
            .unwrap_or(0);
        Ok(direct + fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> InstanceId {
        InstanceId::new(format!("10.0.1.{}", n), 3306)
    }

    #[tokio::test]
    async fn test_claim_is_all_or_nothing() {
        let spares = MemorySpares::new();
        spares.add_spare(SpareRole::Standby, id(1));
        spares.add_spare(SpareRole::Standby, id(2));

        let criteria = SpareCriteria::for_role(SpareRole::Standby);
        let err = spares.claim_spares(3, &criteria).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientSpares {
                wanted: 3,
                available: 2
            }
        ));
        // Nothing was consumed by the failed claim.
        assert_eq!(spares.count_spares(&criteria).await.unwrap(), 2);

        let claimed = spares.claim_spares(2, &criteria).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(spares.count_spares(&criteria).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_master_claims_fall_back_to_standby_pool() {
        let spares = MemorySpares::new();
        spares.add_spare(SpareRole::Standby, id(1));

        let claimed = spares
            .claim_spares(1, &SpareCriteria::for_role(SpareRole::Master))
            .await
            .unwrap();
        assert_eq!(claimed, vec![id(1)]);
    }

    #[tokio::test]
    async fn test_count_includes_the_fallback_pool() {
        let spares = MemorySpares::new();
        spares.add_spare(SpareRole::Master, id(1));
        spares.add_spare(SpareRole::Standby, id(2));
        spares.add_spare(SpareRole::Standby, id(3));

        // Master claims may draw from the standby pool, so the count does.
        let masters = SpareCriteria::for_role(SpareRole::Master);
        assert_eq!(spares.count_spares(&masters).await.unwrap(), 3);
        // Standbys have no fallback.
        let standbys = SpareCriteria::for_role(SpareRole::Standby);
        assert_eq!(spares.count_spares(&standbys).await.unwrap(), 2);
    }
}
