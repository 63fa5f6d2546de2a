//! Additive, idempotent setup of the `items` table.
//!
//! The table is created with a minimal column set and then brought up to date by a fixed list
//! of `ADD COLUMN IF NOT EXISTS` operations. Column operations are independent: one failing is
//! reported and the rest still run. Nothing here ever drops or rewrites data.

use std::sync::Arc;

use harvest_core::{EventSink, HarvestEvent};

use crate::{ItemStore, StoreError};

pub const ITEMS_TABLE: &str = "items";

pub const BASE_COLUMNS: &[&str] = &["id", "title", "description", "price"];

pub const CREATE_ITEMS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS items (
        id BIGINT PRIMARY KEY,
        title TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        price DOUBLE PRECISION NOT NULL DEFAULT 0
    )
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnAddition {
    pub name: &'static str,
    pub sql_type: &'static str,
}

impl ColumnAddition {
    pub fn statement(&self) -> String {
        format!(
            "ALTER TABLE {ITEMS_TABLE} ADD COLUMN IF NOT EXISTS {} {}",
            self.name, self.sql_type
        )
    }
}

/// Applied in order after the base table exists.
pub const COLUMN_ADDITIONS: &[ColumnAddition] = &[
    ColumnAddition { name: "url", sql_type: "TEXT" },
    ColumnAddition { name: "created_dt", sql_type: "TEXT" },
    ColumnAddition { name: "owner_advert_count", sql_type: "INTEGER" },
    ColumnAddition { name: "negotiable_price", sql_type: "SMALLINT" },
    ColumnAddition { name: "rubric", sql_type: "INTEGER" },
    ColumnAddition { name: "city", sql_type: "INTEGER" },
    ColumnAddition { name: "user_id", sql_type: "BIGINT" },
    ColumnAddition { name: "currency", sql_type: "TEXT" },
    ColumnAddition { name: "raise_dt", sql_type: "TEXT" },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnOutcome {
    Applied,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaReport {
    pub columns: Vec<(&'static str, ColumnOutcome)>,
}

impl SchemaReport {
    pub fn failed_columns(&self) -> Vec<&'static str> {
        self.columns
            .iter()
            .filter(|(_, outcome)| matches!(outcome, ColumnOutcome::Failed(_)))
            .map(|(name, _)| *name)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failed_columns().is_empty()
    }
}

pub struct SchemaInitializer {
    store: Arc<dyn ItemStore>,
    events: Arc<dyn EventSink>,
}

impl SchemaInitializer {
    pub fn new(store: Arc<dyn ItemStore>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    /// Creates the table if needed, then applies every column addition.
    ///
    /// Only the table creation is fatal; column failures end up in the report.
    pub async fn ensure_schema(&self) -> Result<SchemaReport, StoreError> {
        self.store.execute(CREATE_ITEMS_TABLE).await?;
        self.events.emit(HarvestEvent::TableEnsured {
            table: ITEMS_TABLE.to_string(),
        });

        let mut report = SchemaReport::default();
        for addition in COLUMN_ADDITIONS {
            let outcome = match self.store.execute(&addition.statement()).await {
                Ok(()) => {
                    self.events.emit(HarvestEvent::ColumnEnsured {
                        column: addition.name.to_string(),
                    });
                    ColumnOutcome::Applied
                }
                Err(err) => {
                    self.events.emit(HarvestEvent::ColumnFailed {
                        column: addition.name.to_string(),
                        error: err.to_string(),
                    });
                    ColumnOutcome::Failed(err.to_string())
                }
            };
            report.columns.push((addition.name, outcome));
        }

        Ok(report)
    }
}
