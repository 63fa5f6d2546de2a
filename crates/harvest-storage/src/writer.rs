use std::sync::Arc;
use std::time::Duration;

use harvest_core::{EventSink, HarvestEvent, ItemRow, Listing, SkipReason, Sleeper};

use crate::{BatchTransaction, ItemStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertRetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for InsertRetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub invalid_price: usize,
    pub insert_failed: usize,
}

impl BatchOutcome {
    pub fn skipped(&self) -> usize {
        self.invalid_price + self.insert_failed
    }
}

/// Writes one page worth of new listings in a single transaction.
///
/// Bad rows are skipped and reported; only failing to open or commit the transaction is an
/// error, in which case nothing from the batch is stored.
pub struct BatchWriter {
    store: Arc<dyn ItemStore>,
    policy: InsertRetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    events: Arc<dyn EventSink>,
}

impl BatchWriter {
    pub fn new(
        store: Arc<dyn ItemStore>,
        policy: InsertRetryPolicy,
        sleeper: Arc<dyn Sleeper>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            policy,
            sleeper,
            events,
        }
    }

    pub async fn write_batch(&self, records: &[Listing]) -> Result<BatchOutcome, StoreError> {
        let mut outcome = BatchOutcome::default();
        if records.is_empty() {
            return Ok(outcome);
        }

        let mut batch = self.store.begin_batch().await?;

        for listing in records {
            let row = match ItemRow::try_from(listing) {
                Ok(row) => row,
                Err(err) => {
                    self.events.emit(HarvestEvent::RecordSkipped {
                        id: listing.id,
                        reason: SkipReason::InvalidPrice(err.raw),
                    });
                    outcome.invalid_price += 1;
                    continue;
                }
            };

            match self.insert_with_retry(&mut batch, &row).await {
                Ok(()) => outcome.inserted += 1,
                Err(err) => {
                    self.events.emit(HarvestEvent::RecordSkipped {
                        id: row.id,
                        reason: SkipReason::InsertFailed(err.to_string()),
                    });
                    outcome.insert_failed += 1;
                }
            }
        }

        batch.commit().await?;
        self.events.emit(HarvestEvent::BatchCommitted {
            inserted: outcome.inserted,
            skipped: outcome.skipped(),
        });
        Ok(outcome)
    }

    async fn insert_with_retry(
        &self,
        batch: &mut Box<dyn BatchTransaction>,
        row: &ItemRow,
    ) -> Result<(), StoreError> {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match batch.insert(row).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= attempts => return Err(err),
                Err(err) => {
                    self.events.emit(HarvestEvent::InsertRetry {
                        id: row.id,
                        attempt,
                        error: err.to_string(),
                    });
                    self.sleeper.sleep(self.policy.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
