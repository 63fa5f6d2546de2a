use std::sync::Arc;

use harvest_core::{EventSink, HarvestEvent, Listing};

use crate::{ItemStore, StoreError};

/// Drops listings whose id is already stored.
pub struct DedupFilter {
    store: Arc<dyn ItemStore>,
    events: Arc<dyn EventSink>,
}

impl DedupFilter {
    pub fn new(store: Arc<dyn ItemStore>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    /// Keeps input order. An error means nothing about the batch is known and it must not be
    /// written.
    pub async fn filter_new(&self, records: Vec<Listing>) -> Result<Vec<Listing>, StoreError> {
        if records.is_empty() {
            return Ok(records);
        }

        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        let existing = self.store.existing_ids(&ids).await?;

        let candidates = records.len();
        let fresh: Vec<Listing> = records
            .into_iter()
            .filter(|r| !existing.contains(&r.id))
            .collect();

        self.events.emit(HarvestEvent::DuplicatesFiltered {
            candidates,
            existing: candidates - fresh.len(),
        });
        Ok(fresh)
    }
}
