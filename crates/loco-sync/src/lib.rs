//! Refresh coordination and read-side assembly over the cached loco collections.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use loco_adapters::{CsvDirectorySource, GoogleSheetsSource, SourceError, TabularSource};
use loco_core::{
    normalize_loco_no, CollectionCounts, DataSet, DataSetMapping, DataSetMappings, LocoDetail,
    LocoSchedule, LocoSummary, RefreshState, RefreshStatus, SourceRow, StoredRecord,
    TractionFailure,
};
use loco_storage::{
    HttpClientConfig, HttpFetcher, MemoryRecordStore, PgRecordStore, RecordStore, StoreError,
};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "loco-sync";

pub const DEFAULT_SHEET_ID: &str = "1oVY3a7LrG4zn2oVkW88bi31uZqGdw_mb-YHk2-NVqKQ";
pub const DEFAULT_REFRESH_INTERVAL_HOURS: i64 = 6;
/// Upper bound on schedule/failure rows returned for one locomotive.
pub const MAX_RECORDS_PER_LOCO: usize = 1000;
pub const SEARCH_LIMIT: usize = 20;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// `None` keeps the cache in process memory.
    pub database_url: Option<String>,
    pub db_name: String,
    pub sheet_id: String,
    pub source_dir: Option<PathBuf>,
    pub datasets_file: Option<PathBuf>,
    pub refresh_interval_hours: i64,
    pub operation_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            db_name: std::env::var("DB_NAME").unwrap_or_else(|_| "loco".to_string()),
            sheet_id: std::env::var("LOCO_SHEET_ID").unwrap_or_else(|_| DEFAULT_SHEET_ID.to_string()),
            source_dir: std::env::var("LOCO_SOURCE_DIR").ok().map(PathBuf::from),
            datasets_file: std::env::var("LOCO_DATASETS_FILE").ok().map(PathBuf::from),
            refresh_interval_hours: std::env::var("LOCO_REFRESH_INTERVAL_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_REFRESH_INTERVAL_HOURS),
            operation_timeout_secs: std::env::var("LOCO_OPERATION_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            http_timeout_secs: std::env::var("LOCO_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("LOCO_USER_AGENT")
                .unwrap_or_else(|_| "loco-sync/0.1".to_string()),
            scheduler_enabled: std::env::var("LOCO_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            refresh_cron: std::env::var("LOCO_REFRESH_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
        }
    }

    pub fn refresh_interval(&self) -> TimeDelta {
        TimeDelta::hours(self.refresh_interval_hours.clamp(0, 24 * 365))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs.max(1))
    }
}

/// Load a header layout override. The file mirrors [`DataSetMappings`] field for field.
pub fn load_dataset_mappings(path: &Path) -> Result<DataSetMappings> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: StdMutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: StdMutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to fetch {dataset} data: {source}")]
    Fetch {
        dataset: DataSet,
        #[source]
        source: SourceError,
    },
    #[error("store operation on {collection} failed: {source}")]
    Store {
        collection: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("{stage} of {dataset} timed out after {}s", timeout.as_secs())]
    Timeout {
        stage: &'static str,
        dataset: DataSet,
        timeout: Duration,
    },
    #[error("No data found for loco number: {loco_no}")]
    NotFound { loco_no: String },
    /// The refresh this caller waited on failed; carries that failure's message.
    #[error("{message}")]
    RefreshFailed { message: String },
}

fn store_error(dataset: DataSet) -> impl FnOnce(StoreError) -> SyncError {
    move |source| SyncError::Store {
        collection: dataset.collection(),
        source,
    }
}

/// Owns cache freshness: when to refresh, how to replace the collections, and
/// when the last complete refresh finished.
///
/// Every refresh runs under one lock, so concurrent triggers never interleave
/// their clear/insert steps and a burst of stale readers fetches the source once.
pub struct RefreshCoordinator {
    source: Arc<dyn TabularSource>,
    store: Arc<dyn RecordStore>,
    mappings: DataSetMappings,
    clock: Arc<dyn Clock>,
    refresh_interval: TimeDelta,
    operation_timeout: Duration,
    last_refresh: RwLock<Option<DateTime<Utc>>>,
    /// Bumped after every refresh attempt, successful or not.
    attempts: AtomicU64,
    /// Held for the whole refresh; stores the failure of the latest attempt.
    refresh_lock: Mutex<Option<String>>,
}

impl RefreshCoordinator {
    pub fn new(source: Arc<dyn TabularSource>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            source,
            store,
            mappings: DataSetMappings::default(),
            clock: Arc::new(SystemClock),
            refresh_interval: TimeDelta::hours(DEFAULT_REFRESH_INTERVAL_HOURS),
            operation_timeout: Duration::from_secs(60),
            last_refresh: RwLock::new(None),
            attempts: AtomicU64::new(0),
            refresh_lock: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_mappings(mut self, mappings: DataSetMappings) -> Self {
        self.mappings = mappings;
        self
    }

    pub fn with_refresh_interval(mut self, interval: TimeDelta) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn mappings(&self) -> &DataSetMappings {
        &self.mappings
    }

    pub fn refresh_interval(&self) -> TimeDelta {
        self.refresh_interval
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn last_refresh(&self) -> Option<DateTime<Utc>> {
        *self.last_refresh.read().await
    }

    pub async fn is_stale(&self) -> bool {
        match self.last_refresh().await {
            None => true,
            Some(last) => self.clock.now() - last > self.refresh_interval,
        }
    }

    /// Refresh if the cache is older than the refresh interval. Returns whether
    /// this call performed the refresh.
    pub async fn ensure_fresh(&self) -> Result<bool, SyncError> {
        if !self.is_stale().await {
            return Ok(false);
        }
        let seen = self.attempts.load(Ordering::SeqCst);
        let mut last_failure = self.refresh_lock.lock().await;
        // An attempt finished while this caller waited: share its outcome.
        if self.attempts.load(Ordering::SeqCst) != seen {
            return match last_failure.as_ref() {
                Some(message) => Err(SyncError::RefreshFailed {
                    message: message.clone(),
                }),
                None => Ok(false),
            };
        }
        if !self.is_stale().await {
            return Ok(false);
        }
        self.attempt_refresh(&mut last_failure).await?;
        Ok(true)
    }

    /// Unconditionally re-derive all four collections from the source.
    pub async fn refresh_all(&self) -> Result<CollectionCounts, SyncError> {
        let mut last_failure = self.refresh_lock.lock().await;
        self.attempt_refresh(&mut last_failure).await
    }

    async fn attempt_refresh(
        &self,
        last_failure: &mut Option<String>,
    ) -> Result<CollectionCounts, SyncError> {
        let result = self.refresh_locked().await;
        *last_failure = result.as_ref().err().map(ToString::to_string);
        self.attempts.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn refresh_locked(&self) -> Result<CollectionCounts, SyncError> {
        info!(source = self.source.source_id(), "starting data refresh");
        let mut counts = CollectionCounts::default();
        for dataset in DataSet::ALL {
            let span = info_span!("refresh_dataset", %dataset, collection = dataset.collection());
            match self.refresh_dataset(dataset).instrument(span).await {
                Ok(inserted) => counts.set(dataset, inserted),
                Err(err) => {
                    error!(%dataset, error = %err, "data refresh aborted");
                    return Err(err);
                }
            }
        }

        let finished_at = self.clock.now();
        *self.last_refresh.write().await = Some(finished_at);
        info!(
            loco = counts.loco_data,
            schedules = counts.schedule_data,
            failures = counts.failure_data,
            modifications = counts.modifications_data,
            "data refresh completed"
        );
        Ok(counts)
    }

    async fn refresh_dataset(&self, dataset: DataSet) -> Result<u64, SyncError> {
        let mapping = self.mappings.get(dataset);
        let rows = self
            .bounded("fetch", dataset, self.source.fetch_rows(dataset, &mapping.sheet_name))
            .await?
            .map_err(|source| SyncError::Fetch { dataset, source })?;

        let records = rows_to_records(rows, mapping, self.clock.now());
        let blank = records.iter().filter(|r| r.loco_no.is_empty()).count();
        if blank > 0 {
            warn!(
                blank,
                id_column = mapping.id_column.as_str(),
                "rows without a loco number"
            );
        }

        self.bounded("replace", dataset, self.store.replace_all(dataset, records))
            .await?
            .map_err(store_error(dataset))
    }

    async fn bounded<F: Future>(
        &self,
        stage: &'static str,
        dataset: DataSet,
        fut: F,
    ) -> Result<F::Output, SyncError> {
        tokio::time::timeout(self.operation_timeout, fut)
            .await
            .map_err(|_| SyncError::Timeout {
                stage,
                dataset,
                timeout: self.operation_timeout,
            })
    }

    pub async fn status(&self) -> Result<RefreshStatus, SyncError> {
        let mut records_count = CollectionCounts::default();
        for dataset in DataSet::ALL {
            let count = self
                .store
                .count(dataset)
                .await
                .map_err(store_error(dataset))?;
            records_count.set(dataset, count);
        }
        let last_refresh = self.last_refresh().await;
        Ok(RefreshStatus {
            status: if last_refresh.is_some() {
                RefreshState::Active
            } else {
                RefreshState::Pending
            },
            last_refresh,
            next_refresh: last_refresh.map(|t| t + self.refresh_interval),
            records_count,
        })
    }
}

fn rows_to_records(
    rows: Vec<SourceRow>,
    mapping: &DataSetMapping,
    updated_at: DateTime<Utc>,
) -> Vec<StoredRecord> {
    rows.into_iter()
        .map(|row| StoredRecord {
            loco_no: normalize_loco_no(row.get(&mapping.id_column).unwrap_or("")),
            row,
            updated_at,
        })
        .collect()
}

fn present(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// `field: value` pairs of a detail-style row, minus excluded and blank columns.
pub fn project_attributes(row: &SourceRow, mapping: &DataSetMapping) -> Vec<LocoDetail> {
    row.iter()
        .filter(|(column, value)| !mapping.is_excluded(column) && !value.trim().is_empty())
        .map(|(column, value)| LocoDetail {
            field: column.to_string(),
            value: value.to_string(),
        })
        .collect()
}

pub fn project_schedule(row: &SourceRow, mapping: &DataSetMapping) -> LocoSchedule {
    let field = |name: &str| present(mapping.column_for(name).and_then(|c| row.get(c)));
    LocoSchedule {
        incoming_date: field("incoming_date"),
        sch: field("sch"),
        outgoing_date: field("outgoing_date"),
    }
}

pub fn project_failure(row: &SourceRow, mapping: &DataSetMapping) -> TractionFailure {
    let field = |name: &str| present(mapping.column_for(name).and_then(|c| row.get(c)));
    TractionFailure {
        date_failed: field("date_failed"),
        icms_message: field("icms_message"),
        loco_no: field("loco_no"),
        mu_with: field("mu_with"),
        div: field("div"),
        rly: field("rly"),
        brief_message: field("brief_message"),
        cause_of_failure: field("cause_of_failure"),
        component: field("component"),
        system: field("system"),
    }
}

/// Read side: joins the four collections for one locomotive.
#[derive(Clone)]
pub struct SummaryAssembler {
    coordinator: Arc<RefreshCoordinator>,
}

impl SummaryAssembler {
    pub fn new(coordinator: Arc<RefreshCoordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub async fn get_summary(&self, raw_loco_no: &str) -> Result<LocoSummary, SyncError> {
        let loco_no = normalize_loco_no(raw_loco_no);
        self.coordinator.ensure_fresh().await?;

        let store = self.coordinator.store();
        let mappings = self.coordinator.mappings();

        let details = store
            .find_one(DataSet::LocoList, &loco_no)
            .await
            .map_err(store_error(DataSet::LocoList))?
            .map(|r| project_attributes(&r.row, mappings.get(DataSet::LocoList)))
            .unwrap_or_default();

        let schedules = store
            .find_many(DataSet::LocoSchedules, &loco_no, MAX_RECORDS_PER_LOCO)
            .await
            .map_err(store_error(DataSet::LocoSchedules))?
            .iter()
            .map(|r| project_schedule(&r.row, mappings.get(DataSet::LocoSchedules)))
            .collect::<Vec<_>>();

        let failures = store
            .find_many(DataSet::TractionFailures, &loco_no, MAX_RECORDS_PER_LOCO)
            .await
            .map_err(store_error(DataSet::TractionFailures))?
            .iter()
            .map(|r| project_failure(&r.row, mappings.get(DataSet::TractionFailures)))
            .collect::<Vec<_>>();

        let modifications = store
            .find_one(DataSet::Wag7Modifications, &loco_no)
            .await
            .map_err(store_error(DataSet::Wag7Modifications))?
            .map(|r| project_attributes(&r.row, mappings.get(DataSet::Wag7Modifications)))
            .unwrap_or_default();

        if details.is_empty() && schedules.is_empty() && failures.is_empty() && modifications.is_empty()
        {
            return Err(SyncError::NotFound { loco_no });
        }

        let last_updated = match self.coordinator.last_refresh().await {
            Some(at) => at,
            None => self.coordinator.now(),
        };
        Ok(LocoSummary {
            loco_no,
            details,
            schedules,
            failures,
            modifications,
            last_updated,
        })
    }

    /// Identifiers from the loco list containing `partial`, case-insensitively.
    /// The query is matched as given, surrounding whitespace included.
    pub async fn search(&self, partial: &str) -> Result<Vec<String>, SyncError> {
        self.coordinator.ensure_fresh().await?;
        self.coordinator
            .store()
            .distinct_loco_nos_containing(DataSet::LocoList, partial, SEARCH_LIMIT)
            .await
            .map_err(store_error(DataSet::LocoList))
    }
}

pub fn build_source(config: &SyncConfig) -> Result<Arc<dyn TabularSource>> {
    if let Some(dir) = &config.source_dir {
        info!(dir = %dir.display(), "reading sheets from csv directory");
        return Ok(Arc::new(CsvDirectorySource::new(dir.clone())));
    }
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    Ok(Arc::new(GoogleSheetsSource::new(http, config.sheet_id.clone())))
}

pub async fn build_store(config: &SyncConfig) -> Result<Arc<dyn RecordStore>> {
    let Some(database_url) = &config.database_url else {
        warn!("DATABASE_URL not set; caching records in process memory");
        return Ok(Arc::new(MemoryRecordStore::new()));
    };
    let store = PgRecordStore::connect(database_url, &config.db_name).await?;
    store
        .migrate()
        .await
        .with_context(|| format!("preparing schema {}", store.schema()))?;
    Ok(Arc::new(store))
}

pub async fn coordinator_from_config(config: &SyncConfig) -> Result<Arc<RefreshCoordinator>> {
    let mappings = match &config.datasets_file {
        Some(path) => load_dataset_mappings(path)?,
        None => DataSetMappings::default(),
    };
    let source = build_source(config)?;
    let store = build_store(config).await?;
    Ok(Arc::new(
        RefreshCoordinator::new(source, store)
            .with_mappings(mappings)
            .with_refresh_interval(config.refresh_interval())
            .with_operation_timeout(config.operation_timeout()),
    ))
}

/// Background job that keeps the cache warm without waiting for read traffic.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    coordinator: Arc<RefreshCoordinator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(config.refresh_cron.as_str(), move |_uuid, _l| {
        let coordinator = coordinator.clone();
        Box::pin(async move {
            match coordinator.ensure_fresh().await {
                Ok(true) => info!("scheduled refresh completed"),
                Ok(false) => {}
                Err(err) => error!(error = %err, "scheduled refresh failed"),
            }
        })
    })
    .with_context(|| format!("creating refresh job for cron {}", config.refresh_cron))?;
    sched.add(job).await.context("adding refresh job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use loco_adapters::MemoryTabularSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    fn row(pairs: &[(&str, &str)]) -> SourceRow {
        pairs.iter().copied().collect()
    }

    async fn seeded_source() -> Arc<MemoryTabularSource> {
        let source = Arc::new(MemoryTabularSource::new());
        source
            .set_rows(
                DataSet::LocoList,
                vec![
                    row(&[("Loco No.", "27865.0"), ("Type", "WAG7"), ("Zone", "SECR"), ("Remarks", "  ")]),
                    row(&[("Loco No.", "27801.0"), ("Type", "WAG7"), ("Zone", "SECR")]),
                    row(&[("Loco No.", "12780"), ("Type", "WAP4"), ("Zone", "SR")]),
                    row(&[("Loco No.", ""), ("Type", "WAG7"), ("Zone", "NR")]),
                ],
            )
            .await;
        source
            .set_rows(
                DataSet::LocoSchedules,
                vec![
                    row(&[("Loco No. ", "27865.0"), ("Incoming Date ", "2024-03-15"), ("Sch ", "IC"), ("Outgoing Date ", " ")]),
                    row(&[("Loco No. ", "27865.0"), ("Incoming Date ", "2024-01-01"), ("Sch ", "IA"), ("Outgoing Date ", "2024-01-03")]),
                    row(&[("Loco No. ", "99999.0"), ("Incoming Date ", "2024-02-02"), ("Sch ", "IB"), ("Outgoing Date ", "")]),
                ],
            )
            .await;
        source
            .set_rows(
                DataSet::TractionFailures,
                vec![row(&[
                    ("Date Failed ", "2024-02-02"),
                    ("ICMS/ Message ", ""),
                    ("LOCO No. ", "27865.0"),
                    ("Div ", " R "),
                    ("System ", "Traction"),
                ])],
            )
            .await;
        source
            .set_rows(
                DataSet::Wag7Modifications,
                vec![row(&[("Loco No.", "27865"), ("Type", "WAG7"), ("Roof Bar Mod", "Done"), ("LED", "")])],
            )
            .await;
        source
    }

    struct Harness {
        source: Arc<MemoryTabularSource>,
        clock: Arc<ManualClock>,
        coordinator: Arc<RefreshCoordinator>,
        assembler: SummaryAssembler,
    }

    async fn harness() -> Harness {
        let source = seeded_source().await;
        let clock = Arc::new(ManualClock::new(t0()));
        let coordinator = Arc::new(
            RefreshCoordinator::new(source.clone(), Arc::new(MemoryRecordStore::new()))
                .with_clock(clock.clone()),
        );
        Harness {
            source,
            clock,
            assembler: SummaryAssembler::new(coordinator.clone()),
            coordinator,
        }
    }

    /// Wraps the memory source, failing one data set and optionally slowing every fetch.
    struct FlakySource {
        inner: Arc<MemoryTabularSource>,
        fail_on: Option<DataSet>,
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TabularSource for FlakySource {
        fn source_id(&self) -> &'static str {
            "flaky"
        }

        async fn fetch_rows(
            &self,
            dataset: DataSet,
            sheet_name: &str,
        ) -> Result<Vec<SourceRow>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail_on == Some(dataset) {
                return Err(SourceError::Message(format!("{sheet_name} unavailable")));
            }
            self.inner.fetch_rows(dataset, sheet_name).await
        }
    }

    #[tokio::test]
    async fn refresh_normalizes_identifiers_and_reports_counts() {
        let h = harness().await;
        let counts = h.coordinator.refresh_all().await.unwrap();
        assert_eq!(counts.loco_data, 4);
        assert_eq!(counts.schedule_data, 3);
        assert_eq!(counts.failure_data, 1);
        assert_eq!(counts.modifications_data, 1);

        let stored = h
            .coordinator
            .store()
            .find_one(DataSet::LocoList, "27865")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.updated_at, t0());
        assert_eq!(stored.row.get("Loco No."), Some("27865.0"));
    }

    #[tokio::test]
    async fn refresh_twice_with_unchanged_source_is_idempotent() {
        let h = harness().await;
        let first = h.coordinator.refresh_all().await.unwrap();
        let second = h.coordinator.refresh_all().await.unwrap();
        assert_eq!(first, second);
        let status = h.coordinator.status().await.unwrap();
        assert_eq!(status.records_count, second);
    }

    #[tokio::test]
    async fn status_is_pending_until_first_refresh() {
        let h = harness().await;
        let status = h.coordinator.status().await.unwrap();
        assert_eq!(status.status, RefreshState::Pending);
        assert!(status.last_refresh.is_none());
        assert!(status.next_refresh.is_none());
        assert_eq!(status.records_count, CollectionCounts::default());

        h.coordinator.refresh_all().await.unwrap();
        let status = h.coordinator.status().await.unwrap();
        assert_eq!(status.status, RefreshState::Active);
        assert_eq!(status.last_refresh, Some(t0()));
        assert_eq!(status.next_refresh, Some(t0() + TimeDelta::hours(6)));
        assert_eq!(status.records_count.loco_data, 4);
    }

    #[tokio::test]
    async fn ensure_fresh_only_refreshes_when_stale() {
        let h = harness().await;
        assert!(h.coordinator.ensure_fresh().await.unwrap());
        assert_eq!(h.source.fetch_count(), 4);

        h.clock.advance(TimeDelta::hours(6));
        assert!(!h.coordinator.ensure_fresh().await.unwrap());
        assert_eq!(h.source.fetch_count(), 4);

        h.clock.advance(TimeDelta::seconds(1));
        assert!(h.coordinator.ensure_fresh().await.unwrap());
        assert_eq!(h.source.fetch_count(), 8);
        assert_eq!(
            h.coordinator.last_refresh().await,
            Some(t0() + TimeDelta::hours(6) + TimeDelta::seconds(1))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_stale_readers_share_one_refresh() {
        let inner = seeded_source().await;
        let flaky = Arc::new(FlakySource {
            inner,
            fail_on: None,
            delay: Duration::from_millis(20),
            calls: AtomicUsize::new(0),
        });
        let coordinator = Arc::new(
            RefreshCoordinator::new(flaky.clone(), Arc::new(MemoryRecordStore::new()))
                .with_clock(Arc::new(ManualClock::new(t0()))),
        );

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let c = coordinator.clone();
                tokio::spawn(async move { c.ensure_fresh().await })
            })
            .collect();
        let mut refreshed = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() {
                refreshed += 1;
            }
        }
        assert_eq!(refreshed, 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_stale_readers_share_one_failed_refresh() {
        let inner = seeded_source().await;
        let flaky = Arc::new(FlakySource {
            inner,
            fail_on: Some(DataSet::LocoList),
            delay: Duration::from_millis(50),
            calls: AtomicUsize::new(0),
        });
        let coordinator = Arc::new(
            RefreshCoordinator::new(flaky.clone(), Arc::new(MemoryRecordStore::new()))
                .with_clock(Arc::new(ManualClock::new(t0()))),
        );

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let c = coordinator.clone();
                tokio::spawn(async move { c.ensure_fresh().await })
            })
            .collect();
        let mut fetch_errors = 0;
        for task in tasks {
            match task.await.unwrap() {
                Err(SyncError::Fetch { .. }) => fetch_errors += 1,
                Err(SyncError::RefreshFailed { message }) => {
                    assert!(message.contains("Loco_list"), "{message}")
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(fetch_errors, 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
        assert!(coordinator.last_refresh().await.is_none());

        // A later reader retries instead of reusing the old failure.
        assert!(coordinator.ensure_fresh().await.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fetch_failure_aborts_refresh_and_keeps_timestamp_unset() {
        let inner = seeded_source().await;
        let flaky = Arc::new(FlakySource {
            inner,
            fail_on: Some(DataSet::TractionFailures),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        });
        let coordinator = RefreshCoordinator::new(flaky, Arc::new(MemoryRecordStore::new()))
            .with_clock(Arc::new(ManualClock::new(t0())));

        let err = coordinator.refresh_all().await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Fetch {
                dataset: DataSet::TractionFailures,
                ..
            }
        ));
        assert!(err.to_string().contains("Traction_failures"));
        assert!(coordinator.last_refresh().await.is_none());

        // Earlier data sets were already replaced; later ones were never touched.
        let status = coordinator.status().await.unwrap();
        assert_eq!(status.status, RefreshState::Pending);
        assert_eq!(status.records_count.loco_data, 4);
        assert_eq!(status.records_count.schedule_data, 3);
        assert_eq!(status.records_count.failure_data, 0);
        assert_eq!(status.records_count.modifications_data, 0);
    }

    #[tokio::test]
    async fn slow_fetch_times_out() {
        let inner = seeded_source().await;
        let flaky = Arc::new(FlakySource {
            inner,
            fail_on: None,
            delay: Duration::from_millis(200),
            calls: AtomicUsize::new(0),
        });
        let coordinator = RefreshCoordinator::new(flaky, Arc::new(MemoryRecordStore::new()))
            .with_operation_timeout(Duration::from_millis(10));
        let err = coordinator.refresh_all().await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Timeout {
                stage: "fetch",
                dataset: DataSet::LocoList,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn summary_joins_all_collections() {
        let h = harness().await;
        let summary = h.assembler.get_summary(" 27865.0 ").await.unwrap();
        assert_eq!(summary.loco_no, "27865");
        assert_eq!(summary.last_updated, t0());

        assert_eq!(
            summary.details,
            vec![LocoDetail {
                field: "Zone".into(),
                value: "SECR".into()
            }]
        );

        let incoming: Vec<_> = summary
            .schedules
            .iter()
            .map(|s| s.incoming_date.as_deref())
            .collect();
        assert_eq!(incoming, vec![Some("2024-03-15"), Some("2024-01-01")]);
        assert_eq!(summary.schedules[0].outgoing_date, None);
        assert_eq!(summary.schedules[1].sch.as_deref(), Some("IA"));

        assert_eq!(summary.failures.len(), 1);
        let failure = &summary.failures[0];
        assert_eq!(failure.loco_no.as_deref(), Some("27865.0"));
        assert_eq!(failure.div.as_deref(), Some("R"));
        assert_eq!(failure.icms_message, None);
        assert_eq!(failure.mu_with, None);

        assert_eq!(
            summary.modifications,
            vec![LocoDetail {
                field: "Roof Bar Mod".into(),
                value: "Done".into()
            }]
        );
    }

    #[tokio::test]
    async fn summary_for_identifier_only_in_schedules() {
        let h = harness().await;
        let summary = h.assembler.get_summary("99999").await.unwrap();
        assert!(summary.details.is_empty());
        assert_eq!(summary.schedules.len(), 1);
        assert!(summary.failures.is_empty());
        assert!(summary.modifications.is_empty());
    }

    #[tokio::test]
    async fn unknown_identifier_is_not_found() {
        let h = harness().await;
        let err = h.assembler.get_summary("00000.0").await.unwrap_err();
        match err {
            SyncError::NotFound { loco_no } => assert_eq!(loco_no, "00000"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_path_propagates_refresh_failure() {
        let inner = seeded_source().await;
        let flaky = Arc::new(FlakySource {
            inner,
            fail_on: Some(DataSet::LocoList),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        });
        let coordinator = Arc::new(RefreshCoordinator::new(
            flaky,
            Arc::new(MemoryRecordStore::new()),
        ));
        let assembler = SummaryAssembler::new(coordinator);
        assert!(matches!(
            assembler.get_summary("27865").await,
            Err(SyncError::Fetch { .. })
        ));
        assert!(matches!(
            assembler.search("278").await,
            Err(SyncError::Fetch { .. })
        ));
    }

    #[tokio::test]
    async fn search_is_sorted_distinct_and_skips_blank_ids() {
        let h = harness().await;
        let hits = h.assembler.search("278").await.unwrap();
        assert_eq!(hits, vec!["12780", "27801", "27865"]);
        assert!(hits.len() <= SEARCH_LIMIT);

        assert!(h.assembler.search(" ").await.unwrap().is_empty());
        assert!(h.assembler.search("  ").await.unwrap().is_empty());
        assert!(h.assembler.search("278 ").await.unwrap().is_empty());
        assert_eq!(h.assembler.search("7865").await.unwrap(), vec!["27865"]);
    }

    #[tokio::test]
    async fn search_caps_results() {
        let source = Arc::new(MemoryTabularSource::with_rows(
            DataSet::LocoList,
            (0..30)
                .map(|i| row(&[("Loco No.", format!("278{i:02}.0").as_str())]))
                .collect(),
        ));
        let coordinator = Arc::new(RefreshCoordinator::new(
            source,
            Arc::new(MemoryRecordStore::new()),
        ));
        let hits = SummaryAssembler::new(coordinator).search("278").await.unwrap();
        assert_eq!(hits.len(), SEARCH_LIMIT);
        assert_eq!(hits.first().map(String::as_str), Some("27800"));
        let mut sorted = hits.clone();
        sorted.sort();
        assert_eq!(hits, sorted);
    }

    #[tokio::test]
    async fn refresh_replaces_previous_contents() {
        let h = harness().await;
        h.coordinator.refresh_all().await.unwrap();
        h.source
            .set_rows(
                DataSet::LocoList,
                vec![row(&[("Loco No.", "31278.0"), ("Type", "WAP7"), ("Zone", "WCR")])],
            )
            .await;
        h.coordinator.refresh_all().await.unwrap();
        assert_eq!(h.assembler.search("278").await.unwrap(), vec!["31278"]);
    }

    #[test]
    fn mappings_file_overrides_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("datasets.yaml");
        let mut mappings = DataSetMappings::default();
        mappings.loco_schedules.id_column = "Loco Number".to_string();
        std::fs::write(&path, serde_yaml::to_string(&mappings).unwrap()).unwrap();

        let loaded = load_dataset_mappings(&path).unwrap();
        assert_eq!(loaded.get(DataSet::LocoSchedules).id_column, "Loco Number");
        assert_eq!(loaded.get(DataSet::TractionFailures).id_column, "LOCO No. ");
    }

    #[test]
    fn bundled_datasets_file_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../datasets.yaml");
        assert_eq!(load_dataset_mappings(&path).unwrap(), DataSetMappings::default());
    }
}
