//! Record store contract + backends, and HTTP fetch utilities for the loco service.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loco_core::{DataSet, SourceRow, StoredRecord};
use reqwest::StatusCode;
use sqlx::postgres::{PgConnection, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "loco-storage";

/// Rows per multi-value INSERT; keeps bind parameters well below the Postgres limit.
const INSERT_CHUNK: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid schema name {0:?}")]
    InvalidSchema(String),
}

/// Document-style collection store keyed by normalized locomotive number.
///
/// Each [`DataSet`] maps to one collection. Reads return records in insertion order.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn clear(&self, dataset: DataSet) -> Result<u64, StoreError>;

    async fn insert_many(
        &self,
        dataset: DataSet,
        records: Vec<StoredRecord>,
    ) -> Result<u64, StoreError>;

    /// Clear the collection and repopulate it. Backends that can do both in one
    /// transaction override this so readers never see the emptied collection.
    async fn replace_all(
        &self,
        dataset: DataSet,
        records: Vec<StoredRecord>,
    ) -> Result<u64, StoreError> {
        self.clear(dataset).await?;
        self.insert_many(dataset, records).await
    }

    async fn find_one(
        &self,
        dataset: DataSet,
        loco_no: &str,
    ) -> Result<Option<StoredRecord>, StoreError>;

    async fn find_many(
        &self,
        dataset: DataSet,
        loco_no: &str,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    async fn count(&self, dataset: DataSet) -> Result<u64, StoreError>;

    /// Distinct non-blank identifiers containing `needle` case-insensitively,
    /// sorted ascending by byte order and capped at `limit`.
    async fn distinct_loco_nos_containing(
        &self,
        dataset: DataSet,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;
}

/// Process-local store; used by tests and by `loco-cli` when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    collections: RwLock<HashMap<DataSet, Vec<StoredRecord>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn clear(&self, dataset: DataSet) -> Result<u64, StoreError> {
        let mut collections = self.collections.write().await;
        let removed = collections.remove(&dataset).map(|v| v.len()).unwrap_or(0);
        Ok(removed as u64)
    }

    async fn insert_many(
        &self,
        dataset: DataSet,
        records: Vec<StoredRecord>,
    ) -> Result<u64, StoreError> {
        let inserted = records.len() as u64;
        let mut collections = self.collections.write().await;
        collections.entry(dataset).or_default().extend(records);
        Ok(inserted)
    }

    async fn replace_all(
        &self,
        dataset: DataSet,
        records: Vec<StoredRecord>,
    ) -> Result<u64, StoreError> {
        let inserted = records.len() as u64;
        self.collections.write().await.insert(dataset, records);
        Ok(inserted)
    }

    async fn find_one(
        &self,
        dataset: DataSet,
        loco_no: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(&dataset)
            .and_then(|records| records.iter().find(|r| r.loco_no == loco_no))
            .cloned())
    }

    async fn find_many(
        &self,
        dataset: DataSet,
        loco_no: &str,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(&dataset)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.loco_no == loco_no)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count(&self, dataset: DataSet) -> Result<u64, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections.get(&dataset).map(|v| v.len()).unwrap_or(0) as u64)
    }

    async fn distinct_loco_nos_containing(
        &self,
        dataset: DataSet,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let needle = needle.to_lowercase();
        let collections = self.collections.read().await;
        let matches: BTreeSet<&str> = collections
            .get(&dataset)
            .into_iter()
            .flatten()
            .map(|r| r.loco_no.as_str())
            .filter(|id| !id.trim().is_empty() && id.to_lowercase().contains(&needle))
            .collect();
        Ok(matches.into_iter().take(limit).map(str::to_string).collect())
    }
}

/// Postgres-backed store. Each collection is a table in `schema` holding the
/// source row as a JSON array of `[column, value]` pairs so header order survives.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
    schema: String,
}

fn validate_schema_name(schema: &str) -> Result<(), StoreError> {
    let valid = !schema.is_empty()
        && schema.len() <= 63
        && !schema.starts_with(|c: char| c.is_ascii_digit())
        && schema.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidSchema(schema.to_string()))
    }
}

impl PgRecordStore {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Result<Self, StoreError> {
        let schema = schema.into();
        validate_schema_name(&schema)?;
        Ok(Self { pool, schema })
    }

    pub async fn connect(database_url: &str, schema: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to record store database")?;
        Ok(Self::new(pool, schema)?)
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn table(&self, dataset: DataSet) -> String {
        format!("\"{}\".{}", self.schema, dataset.collection())
    }

    /// Create the schema and collection tables if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", self.schema))
            .execute(&self.pool)
            .await?;
        for dataset in DataSet::ALL {
            let table = self.table(dataset);
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    seq        BIGSERIAL PRIMARY KEY,
                    loco_no    TEXT        NOT NULL,
                    row_data   JSONB       NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL
                )
                "#
            ))
            .execute(&self.pool)
            .await?;
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {collection}_loco_no_idx ON {table} (loco_no)",
                collection = dataset.collection()
            ))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

async fn insert_rows(
    conn: &mut PgConnection,
    table: &str,
    records: &[StoredRecord],
) -> Result<u64, sqlx::Error> {
    let mut inserted = 0u64;
    for chunk in records.chunks(INSERT_CHUNK) {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO {table} (loco_no, row_data, updated_at) "));
        builder.push_values(chunk, |mut b, record| {
            b.push_bind(record.loco_no.clone())
                .push_bind(Json(record.row.clone()))
                .push_bind(record.updated_at);
        });
        inserted += builder.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(inserted)
}

fn record_from_row(row: &PgRow) -> Result<StoredRecord, sqlx::Error> {
    let Json(source_row): Json<SourceRow> = row.try_get("row_data")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
    Ok(StoredRecord {
        loco_no: row.try_get("loco_no")?,
        row: source_row,
        updated_at,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn clear(&self, dataset: DataSet) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!("DELETE FROM {}", self.table(dataset)))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_many(
        &self,
        dataset: DataSet,
        records: Vec<StoredRecord>,
    ) -> Result<u64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(insert_rows(&mut *conn, &self.table(dataset), &records).await?)
    }

    async fn replace_all(
        &self,
        dataset: DataSet,
        records: Vec<StoredRecord>,
    ) -> Result<u64, StoreError> {
        let table = self.table(dataset);
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let inserted = insert_rows(&mut *tx, &table, &records).await?;
        tx.commit().await?;
        debug!(collection = dataset.collection(), removed, inserted, "collection replaced");
        Ok(inserted)
    }

    async fn find_one(
        &self,
        dataset: DataSet,
        loco_no: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT loco_no, row_data, updated_at FROM {} WHERE loco_no = $1 ORDER BY seq LIMIT 1",
            self.table(dataset)
        ))
        .bind(loco_no)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn find_many(
        &self,
        dataset: DataSet,
        loco_no: &str,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT loco_no, row_data, updated_at FROM {} WHERE loco_no = $1 ORDER BY seq LIMIT $2",
            self.table(dataset)
        ))
        .bind(loco_no)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn count(&self, dataset: DataSet) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.table(dataset)))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn distinct_loco_nos_containing(
        &self,
        dataset: DataSet,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let rows: Vec<String> = sqlx::query_scalar(&format!(
            r#"
            SELECT loco_no
              FROM {}
             WHERE btrim(loco_no) <> ''
               AND strpos(lower(loco_no), lower($1)) > 0
             GROUP BY loco_no
             ORDER BY loco_no COLLATE "C"
             LIMIT $2
            "#,
            self.table(dataset)
        ))
        .bind(needle)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Plain-text GET client with bounded retry on transient failures.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(&self, label: &str, url: &str) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", label, url);
        self.fetch_text_with_retry(url).instrument(span).await
    }

    async fn fetch_text_with_retry(&self, url: &str) -> Result<String, FetchError> {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(attempt, %status, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(attempt, error = %err, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
