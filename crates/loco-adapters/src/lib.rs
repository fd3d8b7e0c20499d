//! Tabular source adapters: turn a named sheet into ordered rows of `column -> text`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use loco_core::{DataSet, SourceRow};
use loco_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use thiserror::Error;
use tokio::sync::RwLock;

pub const CRATE_NAME: &str = "loco-adapters";

pub const GOOGLE_SHEETS_BASE_URL: &str = "https://docs.google.com";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("fetching {dataset}: {source}")]
    Fetch {
        dataset: DataSet,
        #[source]
        source: FetchError,
    },
    #[error("parsing {dataset} csv: {source}")]
    Csv {
        dataset: DataSet,
        #[source]
        source: csv::Error,
    },
    #[error("reading {dataset} from {}: {source}", path.display())]
    Io {
        dataset: DataSet,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Message(String),
}

/// Read-only access to the four sheets backing the cache.
#[async_trait]
pub trait TabularSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Fetch every row of `sheet_name`. `dataset` labels errors and logs.
    async fn fetch_rows(
        &self,
        dataset: DataSet,
        sheet_name: &str,
    ) -> Result<Vec<SourceRow>, SourceError>;
}

/// Parse CSV text into rows keyed by the header line, spelled exactly as written.
///
/// Short rows are padded with empty cells; blank lines are skipped.
pub fn parse_csv_rows(dataset: DataSet, text: &str) -> Result<Vec<SourceRow>, SourceError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::None)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|source| SourceError::Csv { dataset, source })?
        .clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|source| SourceError::Csv { dataset, source })?;
        let row = headers
            .iter()
            .enumerate()
            .map(|(idx, header)| (header, record.get(idx).unwrap_or("")))
            .collect::<SourceRow>();
        rows.push(row);
    }
    Ok(rows)
}

/// Google Sheets CSV export (`gviz/tq?tqx=out:csv`) of one spreadsheet document.
#[derive(Debug, Clone)]
pub struct GoogleSheetsSource {
    http: HttpFetcher,
    base_url: String,
    sheet_id: String,
}

impl GoogleSheetsSource {
    pub fn new(http: HttpFetcher, sheet_id: impl Into<String>) -> Self {
        Self {
            http,
            base_url: GOOGLE_SHEETS_BASE_URL.to_string(),
            sheet_id: sheet_id.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn export_url(&self, sheet_name: &str) -> Result<Url, SourceError> {
        let base = self.base_url.trim_end_matches('/');
        let mut url = Url::parse(&format!("{base}/spreadsheets/d/{}/gviz/tq", self.sheet_id))
            .map_err(|e| SourceError::Message(format!("invalid sheet export url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("tqx", "out:csv")
            .append_pair("sheet", sheet_name);
        Ok(url)
    }
}

#[async_trait]
impl TabularSource for GoogleSheetsSource {
    fn source_id(&self) -> &'static str {
        "google-sheets"
    }

    async fn fetch_rows(
        &self,
        dataset: DataSet,
        sheet_name: &str,
    ) -> Result<Vec<SourceRow>, SourceError> {
        let url = self.export_url(sheet_name)?;
        let text = self
            .http
            .fetch_text(sheet_name, url.as_str())
            .await
            .map_err(|source| SourceError::Fetch { dataset, source })?;
        parse_csv_rows(dataset, &text)
    }
}

/// Directory of `{sheet_name}.csv` exports, for offline runs and fixtures.
#[derive(Debug, Clone)]
pub struct CsvDirectorySource {
    root: PathBuf,
}

impl CsvDirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, sheet_name: &str) -> PathBuf {
        self.root.join(format!("{sheet_name}.csv"))
    }
}

#[async_trait]
impl TabularSource for CsvDirectorySource {
    fn source_id(&self) -> &'static str {
        "csv-directory"
    }

    async fn fetch_rows(
        &self,
        dataset: DataSet,
        sheet_name: &str,
    ) -> Result<Vec<SourceRow>, SourceError> {
        let path = self.path_for(sheet_name);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| SourceError::Io {
                dataset,
                path: path.clone(),
                source,
            })?;
        parse_csv_rows(dataset, &text)
    }
}

/// In-memory rows per data set. Counts fetches so callers can observe refresh traffic.
#[derive(Debug, Default)]
pub struct MemoryTabularSource {
    tables: RwLock<HashMap<DataSet, Vec<SourceRow>>>,
    fetches: AtomicUsize,
}

impl MemoryTabularSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(dataset: DataSet, rows: Vec<SourceRow>) -> Self {
        let mut tables = HashMap::new();
        tables.insert(dataset, rows);
        Self {
            tables: RwLock::new(tables),
            fetches: AtomicUsize::new(0),
        }
    }

    pub async fn set_rows(&self, dataset: DataSet, rows: Vec<SourceRow>) {
        self.tables.write().await.insert(dataset, rows);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TabularSource for MemoryTabularSource {
    fn source_id(&self) -> &'static str {
        "memory"
    }

    async fn fetch_rows(
        &self,
        dataset: DataSet,
        _sheet_name: &str,
    ) -> Result<Vec<SourceRow>, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .tables
            .read()
            .await
            .get(&dataset)
            .cloned()
            .unwrap_or_default())
    }
}
