//! In-memory vertical registry.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::VerticalRegistry;
use crate::error::ExternalError;
use crate::lease::{LeaseSlot, LeaseStatus};

/// Process-local [`VerticalRegistry`] keyed by vertical.
///
/// Used by the daemon when no external registry is wired, and by tests.
#[derive(Debug, Default)]
pub struct InMemoryVerticalRegistry {
    slots: RwLock<BTreeMap<String, LeaseSlot>>,
}

impl InMemoryVerticalRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of slots ever stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Returns `true` if no slot was ever stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Returns a snapshot of the slot for `vertical`.
    #[must_use]
    pub fn get(&self, vertical: &str) -> Option<LeaseSlot> {
        self.slots.read().get(vertical).cloned()
    }
}

#[async_trait]
impl VerticalRegistry for InMemoryVerticalRegistry {
    async fn load_slot(&self, vertical: &str) -> Result<Option<LeaseSlot>, ExternalError> {
        Ok(self.get(vertical))
    }

    async fn store_slot(&self, slot: LeaseSlot) -> Result<(), ExternalError> {
        self.slots.write().insert(slot.vertical.clone(), slot);
        Ok(())
    }

    async fn slots_in_status(&self, status: LeaseStatus) -> Result<Vec<LeaseSlot>, ExternalError> {
        Ok(self
            .slots
            .read()
            .values()
            .filter(|slot| slot.status == status)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    #[tokio::test]
    async fn test_store_and_filter_by_status() {
        let registry = InMemoryVerticalRegistry::new();
        let now = Utc::now();
        registry
            .store_slot(LeaseSlot::award("solar", "0xA", now, Duration::days(90)))
            .await
            .unwrap();
        let mut expired = LeaseSlot::award("mortgage", "0xB", now, Duration::days(90));
        expired.expire(now).unwrap();
        registry.store_slot(expired).await.unwrap();

        assert_eq!(registry.len(), 2);
        let active = registry.slots_in_status(LeaseStatus::Active).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].vertical, "solar");
        assert!(registry.load_slot("insurance").await.unwrap().is_none());
    }
}
