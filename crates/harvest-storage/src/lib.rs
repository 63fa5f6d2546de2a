//! Persistence side of the harvester: the `items` store, its additive schema, the
//! existence filter and the transactional batch writer.

use std::collections::HashSet;

use async_trait::async_trait;
use harvest_core::ItemRow;
use thiserror::Error;

pub mod dedup;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod postgres;
pub mod schema;
pub mod writer;

pub use dedup::DedupFilter;
#[cfg(any(test, feature = "test-support"))]
pub use memory::MemoryStore;
pub use postgres::{ConnectPolicy, PgItemStore};
pub use schema::{ColumnOutcome, SchemaInitializer, SchemaReport};
pub use writer::{BatchOutcome, BatchWriter, InsertRetryPolicy};

pub const CRATE_NAME: &str = "harvest-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unreachable after {attempts} attempts: {source}")]
    Unreachable {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
    #[error("{0}")]
    Backend(String),
}

/// The operations the pipeline needs from the analytical store.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Runs a statement without parameters or results (DDL).
    async fn execute(&self, statement: &str) -> Result<(), StoreError>;

    /// Returns which of `ids` are already stored, using a single query.
    async fn existing_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError>;

    /// Opens a transaction with the insert statement prepared. Dropping the returned value
    /// without committing rolls everything back.
    async fn begin_batch(&self) -> Result<Box<dyn BatchTransaction>, StoreError>;
}

#[async_trait]
pub trait BatchTransaction: Send {
    /// A failed insert leaves the transaction usable for the following rows.
    async fn insert(&mut self, row: &ItemRow) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
