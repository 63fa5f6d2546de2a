//! Harvest orchestration: every feed is paged to exhaustion through fetch, dedup and write.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use harvest_core::{EventSink, FeedDescriptor, HarvestEvent, Sleeper, TokioSleeper, TracingSink};
use harvest_fetch::{FetchError, PageFetcher};
use harvest_storage::{
    BatchWriter, DedupFilter, ItemStore, PgItemStore, SchemaInitializer, SchemaReport, StoreError,
};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub mod config;

pub use config::{default_feeds, FeedRegistry, HarvestConfig};

pub const CRATE_NAME: &str = "harvest-sync";

/// Conditions that end a run. Everything recoverable is handled inside the stages.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("schema setup failed: {0}")]
    Schema(#[source] StoreError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("existence check failed for feed {feed} page {page}: {source}")]
    Dedup {
        feed: String,
        page: u32,
        #[source]
        source: StoreError,
    },
    #[error("page not saved for feed {feed} page {page}: {source}")]
    Write {
        feed: String,
        page: u32,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeedSummary {
    pub feed: String,
    pub pages: u32,
    pub fetched: usize,
    pub new: usize,
    pub inserted: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feeds: Vec<FeedSummary>,
}

impl HarvestSummary {
    pub fn inserted(&self) -> usize {
        self.feeds.iter().map(|f| f.inserted).sum()
    }

    pub fn fetched(&self) -> usize {
        self.feeds.iter().map(|f| f.fetched).sum()
    }

    pub fn skipped(&self) -> usize {
        self.feeds.iter().map(|f| f.skipped).sum()
    }
}

pub struct Harvester {
    feeds: Vec<FeedDescriptor>,
    schema: SchemaInitializer,
    fetcher: PageFetcher,
    dedup: DedupFilter,
    writer: BatchWriter,
    events: Arc<dyn EventSink>,
}

impl Harvester {
    pub fn new(
        config: &HarvestConfig,
        store: Arc<dyn ItemStore>,
        sleeper: Arc<dyn Sleeper>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let fetcher = PageFetcher::new(config.http.clone(), sleeper.clone(), events.clone())?;
        Ok(Self {
            feeds: config.feeds.clone(),
            schema: SchemaInitializer::new(store.clone(), events.clone()),
            fetcher,
            dedup: DedupFilter::new(store.clone(), events.clone()),
            writer: BatchWriter::new(store, config.insert, sleeper, events.clone()),
            events,
        })
    }

    pub async fn ensure_schema(&self) -> Result<SchemaReport, HarvestError> {
        self.schema.ensure_schema().await.map_err(HarvestError::Schema)
    }

    /// Ensures the schema, then harvests every feed in order. The first fatal error stops the
    /// run; pages committed before it stay committed.
    pub async fn run(&self) -> Result<HarvestSummary, HarvestError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, feeds = self.feeds.len(), "harvest started");

        self.ensure_schema().await?;

        let mut feeds = Vec::with_capacity(self.feeds.len());
        for feed in &self.feeds {
            feeds.push(self.harvest_feed(feed).await?);
        }

        let summary = HarvestSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            feeds,
        };
        info!(
            %run_id,
            fetched = summary.fetched(),
            inserted = summary.inserted(),
            skipped = summary.skipped(),
            "harvest complete"
        );
        Ok(summary)
    }

    pub async fn harvest_feed(&self, feed: &FeedDescriptor) -> Result<FeedSummary, HarvestError> {
        self.events.emit(HarvestEvent::FeedStarted {
            feed: feed.name.clone(),
        });

        let mut summary = FeedSummary {
            feed: feed.name.clone(),
            ..Default::default()
        };
        let mut page = 1;

        loop {
            let response = self.fetcher.fetch_page(feed, page).await?;
            let has_more = response.has_more();
            summary.pages += 1;
            summary.fetched += response.results.len();

            let fresh = self
                .dedup
                .filter_new(response.results)
                .await
                .map_err(|source| HarvestError::Dedup {
                    feed: feed.name.clone(),
                    page,
                    source,
                })?;
            summary.new += fresh.len();

            if !fresh.is_empty() {
                let outcome =
                    self.writer
                        .write_batch(&fresh)
                        .await
                        .map_err(|source| HarvestError::Write {
                            feed: feed.name.clone(),
                            page,
                            source,
                        })?;
                summary.inserted += outcome.inserted;
                summary.skipped += outcome.skipped();
            }

            if !has_more {
                break;
            }
            page += 1;
        }

        self.events.emit(HarvestEvent::FeedCompleted {
            feed: feed.name.clone(),
            pages: summary.pages,
            inserted: summary.inserted,
        });
        Ok(summary)
    }
}

async fn connect_store(config: &HarvestConfig) -> Result<Arc<PgItemStore>> {
    let store = PgItemStore::connect_with_retry(&config.database_url, config.connect, &TokioSleeper)
        .await
        .context("connecting to store")?;
    Ok(Arc::new(store))
}

/// Production wiring: Postgres store, tokio sleeps, tracing-backed events.
pub async fn run_harvest(config: &HarvestConfig) -> Result<HarvestSummary> {
    let store = connect_store(config).await?;
    let harvester = Harvester::new(config, store, Arc::new(TokioSleeper), Arc::new(TracingSink))?;
    Ok(harvester.run().await?)
}

pub async fn run_migrate(config: &HarvestConfig) -> Result<SchemaReport> {
    let store = connect_store(config).await?;
    SchemaInitializer::new(store, Arc::new(TracingSink))
        .ensure_schema()
        .await
        .context("ensuring schema")
}
