use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use harvest_core::{ItemRow, Sleeper};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgStatement};
use sqlx::{Connection, Executor, Postgres, Statement, Transaction};
use tracing::{info, warn};

use crate::{BatchTransaction, ItemStore, StoreError};

const INSERT_ITEM_SQL: &str = r#"
    INSERT INTO items (id, title, description, price, url, created_dt, owner_advert_count,
                       negotiable_price, rubric, city, user_id, currency, raise_dt)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
"#;

const EXISTING_IDS_SQL: &str = "SELECT id FROM items WHERE id = ANY($1)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub attempts: u32,
    pub delay: Duration,
    /// Upper bound on a single connection attempt.
    pub attempt_timeout: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 100,
            delay: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgItemStore {
    pool: PgPool,
}

impl PgItemStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Opens a single-connection pool and pings it, retrying while the server is not up yet.
    ///
    /// A malformed URL fails immediately.
    pub async fn connect_with_retry(
        database_url: &str,
        policy: ConnectPolicy,
        sleeper: &dyn Sleeper,
    ) -> Result<Self, StoreError> {
        let options: PgConnectOptions = database_url.parse()?;
        let attempts = policy.attempts.max(1);

        let mut attempt = 1;
        loop {
            match Self::connect_once(options.clone(), policy.attempt_timeout).await {
                Ok(pool) => {
                    info!(attempt, "connected to store");
                    return Ok(Self::new(pool));
                }
                Err(source) if attempt >= attempts => {
                    return Err(StoreError::Unreachable { attempts, source });
                }
                Err(err) => {
                    warn!(attempt, error = %err, "store not reachable yet");
                    sleeper.sleep(policy.delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn connect_once(
        options: PgConnectOptions,
        timeout: Duration,
    ) -> Result<PgPool, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(timeout)
            .connect_with(options)
            .await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(pool)
    }
}

#[async_trait]
impl ItemStore for PgItemStore {
    async fn execute(&self, statement: &str) -> Result<(), StoreError> {
        sqlx::query(statement).execute(&self.pool).await?;
        Ok(())
    }

    async fn existing_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError> {
        let rows = sqlx::query_scalar::<_, i64>(EXISTING_IDS_SQL)
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn begin_batch(&self) -> Result<Box<dyn BatchTransaction>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let statement = (&mut *tx).prepare(INSERT_ITEM_SQL).await?;
        Ok(Box::new(PgBatch { tx, statement }))
    }
}

struct PgBatch {
    tx: Transaction<'static, Postgres>,
    statement: PgStatement<'static>,
}

#[async_trait]
impl BatchTransaction for PgBatch {
    async fn insert(&mut self, row: &ItemRow) -> Result<(), StoreError> {
        // A failed statement aborts a Postgres transaction, so each row gets its own savepoint.
        let mut savepoint = Connection::begin(&mut *self.tx).await?;
        self.statement
            .query()
            .bind(row.id)
            .bind(row.title.clone())
            .bind(row.description.clone())
            .bind(row.price)
            .bind(row.url.clone())
            .bind(row.created_dt.clone())
            .bind(row.owner_advert_count)
            .bind(row.negotiable_price)
            .bind(row.rubric)
            .bind(row.city)
            .bind(row.user_id)
            .bind(row.currency.clone())
            .bind(row.raise_dt.clone())
            .execute(&mut *savepoint)
            .await?;
        savepoint.commit().await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let PgBatch { tx, .. } = *self;
        tx.commit().await?;
        Ok(())
    }
}
