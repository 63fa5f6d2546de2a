//! Structured pipeline events.
//!
//! Components report what happened through an [`EventSink`] instead of logging inline, so the
//! retry and skip decisions stay separate from how they are observed. [`TracingSink`] is the
//! production observer; [`MemorySink`] keeps events around for assertions.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryCause {
    Transport(String),
    Status(u16),
}

impl fmt::Display for RetryCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryCause::Transport(err) => write!(f, "transport error: {err}"),
            RetryCause::Status(status) => write!(f, "retryable status {status}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The record did not match the listing shape; the rest of its page is kept.
    Undecodable(String),
    InvalidPrice(String),
    InsertFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum HarvestEvent {
    TableEnsured {
        table: String,
    },
    ColumnEnsured {
        column: String,
    },
    ColumnFailed {
        column: String,
        error: String,
    },
    FetchRetry {
        feed: String,
        page: u32,
        attempt: u32,
        cause: RetryCause,
        delay: Duration,
    },
    PageFetched {
        feed: String,
        page: u32,
        records: usize,
        advertised_total: u64,
    },
    MalformedPage {
        feed: String,
        page: u32,
        error: String,
    },
    DuplicatesFiltered {
        candidates: usize,
        existing: usize,
    },
    InsertRetry {
        id: i64,
        attempt: u32,
        error: String,
    },
    RecordSkipped {
        id: i64,
        reason: SkipReason,
    },
    BatchCommitted {
        inserted: usize,
        skipped: usize,
    },
    FeedStarted {
        feed: String,
    },
    FeedCompleted {
        feed: String,
        pages: u32,
        inserted: usize,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: HarvestEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: HarvestEvent) {
        match event {
            HarvestEvent::TableEnsured { table } => info!(%table, "table ensured"),
            HarvestEvent::ColumnEnsured { column } => debug!(%column, "column ensured"),
            HarvestEvent::ColumnFailed { column, error } => {
                warn!(%column, %error, "could not add column")
            }
            HarvestEvent::FetchRetry {
                feed,
                page,
                attempt,
                cause,
                delay,
            } => warn!(
                %feed,
                page,
                attempt,
                %cause,
                delay_ms = delay.as_millis() as u64,
                "retrying page fetch"
            ),
            HarvestEvent::PageFetched {
                feed,
                page,
                records,
                advertised_total,
            } => info!(%feed, page, records, advertised_total, "fetched page"),
            HarvestEvent::MalformedPage { feed, page, error } => {
                warn!(%feed, page, %error, "page body did not decode; treating as empty")
            }
            HarvestEvent::DuplicatesFiltered {
                candidates,
                existing,
            } => debug!(candidates, existing, "filtered stored listings"),
            HarvestEvent::InsertRetry { id, attempt, error } => {
                debug!(id, attempt, %error, "insert attempt failed")
            }
            HarvestEvent::RecordSkipped { id, reason } => match reason {
                SkipReason::Undecodable(error) => {
                    warn!(id, %error, "skipping item that did not decode")
                }
                SkipReason::InvalidPrice(raw) => {
                    warn!(id, price = %raw, "skipping item with invalid price")
                }
                SkipReason::InsertFailed(error) => {
                    warn!(id, %error, "skipping item after insert retries")
                }
            },
            HarvestEvent::BatchCommitted { inserted, skipped } => {
                info!(inserted, skipped, "batch committed")
            }
            HarvestEvent::FeedStarted { feed } => info!(%feed, "feed started"),
            HarvestEvent::FeedCompleted {
                feed,
                pages,
                inserted,
            } => info!(%feed, pages, inserted, "feed exhausted"),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<HarvestEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HarvestEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: HarvestEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
