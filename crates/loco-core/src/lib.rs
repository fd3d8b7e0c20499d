//! Core domain model for the loco summary service: data sets, rows, records and views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "loco-core";

/// Canonical form of a locomotive number.
///
/// Trims surrounding whitespace and strips trailing `.0` artifacts left behind by
/// numeric-to-text conversion in the source sheet (`"27865.0"` becomes `"27865"`).
/// Stripping repeats until no trailing `.0` remains, so the result is a fixpoint:
/// `normalize_loco_no(normalize_loco_no(x)) == normalize_loco_no(x)`. Interior
/// occurrences are kept and case is never changed.
pub fn normalize_loco_no(raw: &str) -> String {
    let mut value = raw.trim();
    while let Some(stripped) = value.strip_suffix(".0") {
        value = stripped.trim();
    }
    value.to_string()
}

/// The four source data sets, in the order a refresh processes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSet {
    LocoList,
    LocoSchedules,
    TractionFailures,
    Wag7Modifications,
}

impl DataSet {
    pub const ALL: [DataSet; 4] = [
        DataSet::LocoList,
        DataSet::LocoSchedules,
        DataSet::TractionFailures,
        DataSet::Wag7Modifications,
    ];

    /// Name of the store collection holding this data set.
    pub fn collection(self) -> &'static str {
        match self {
            DataSet::LocoList => "loco_data",
            DataSet::LocoSchedules => "schedule_data",
            DataSet::TractionFailures => "failure_data",
            DataSet::Wag7Modifications => "modifications_data",
        }
    }

    pub fn default_sheet_name(self) -> &'static str {
        match self {
            DataSet::LocoList => "Loco_list",
            DataSet::LocoSchedules => "Loco_Schedules",
            DataSet::TractionFailures => "Traction_failures",
            DataSet::Wag7Modifications => "WAG7_Modifications",
        }
    }
}

impl std::fmt::Display for DataSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_sheet_name())
    }
}

/// One source row: `(column header, cell text)` pairs in header order.
///
/// Header spellings are kept byte-for-byte, trailing whitespace included.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRow(pub Vec<(String, String)>);

impl SourceRow {
    pub fn new(cells: Vec<(String, String)>) -> Self {
        Self(cells)
    }

    /// Exact-match column lookup.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SourceRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A cached row tagged with its normalized locomotive number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub loco_no: String,
    pub row: SourceRow,
    pub updated_at: DateTime<Utc>,
}

/// Literal source headers for one data set.
///
/// `fields` maps a logical display field to the exact header text in the sheet;
/// it is only consulted for the schedule and failure data sets, whose rows are
/// reshaped into fixed display records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSetMapping {
    pub sheet_name: String,
    pub id_column: String,
    #[serde(default)]
    pub excluded_columns: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldMapping>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub field: String,
    pub column: String,
}

impl DataSetMapping {
    pub fn column_for(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|m| m.field == field)
            .map(|m| m.column.as_str())
    }

    /// Columns hidden from the detail projection: the identifier column plus any extras.
    pub fn is_excluded(&self, column: &str) -> bool {
        column == self.id_column || self.excluded_columns.iter().any(|c| c == column)
    }
}

/// Header layout for all four data sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSetMappings {
    pub loco_list: DataSetMapping,
    pub loco_schedules: DataSetMapping,
    pub traction_failures: DataSetMapping,
    pub wag7_modifications: DataSetMapping,
}

impl DataSetMappings {
    pub fn get(&self, dataset: DataSet) -> &DataSetMapping {
        match dataset {
            DataSet::LocoList => &self.loco_list,
            DataSet::LocoSchedules => &self.loco_schedules,
            DataSet::TractionFailures => &self.traction_failures,
            DataSet::Wag7Modifications => &self.wag7_modifications,
        }
    }
}

fn fields(pairs: &[(&str, &str)]) -> Vec<FieldMapping> {
    pairs
        .iter()
        .map(|(field, column)| FieldMapping {
            field: (*field).to_string(),
            column: (*column).to_string(),
        })
        .collect()
}

impl Default for DataSetMappings {
    fn default() -> Self {
        let detail = |dataset: DataSet| DataSetMapping {
            sheet_name: dataset.default_sheet_name().to_string(),
            id_column: "Loco No.".to_string(),
            excluded_columns: vec!["Type".to_string()],
            fields: Vec::new(),
        };
        Self {
            loco_list: detail(DataSet::LocoList),
            loco_schedules: DataSetMapping {
                sheet_name: DataSet::LocoSchedules.default_sheet_name().to_string(),
                id_column: "Loco No. ".to_string(),
                excluded_columns: Vec::new(),
                fields: fields(&[
                    ("incoming_date", "Incoming Date "),
                    ("sch", "Sch "),
                    ("outgoing_date", "Outgoing Date "),
                ]),
            },
            traction_failures: DataSetMapping {
                sheet_name: DataSet::TractionFailures.default_sheet_name().to_string(),
                id_column: "LOCO No. ".to_string(),
                excluded_columns: Vec::new(),
                fields: fields(&[
                    ("date_failed", "Date Failed "),
                    ("icms_message", "ICMS/ Message "),
                    ("loco_no", "LOCO No. "),
                    ("mu_with", "MU with "),
                    ("div", "Div "),
                    ("rly", "Rly "),
                    ("brief_message", "Brief Message "),
                    ("cause_of_failure", "Cause of Failure "),
                    ("component", "Component "),
                    ("system", "System "),
                ]),
            },
            wag7_modifications: detail(DataSet::Wag7Modifications),
        }
    }
}

/// A single `field: value` attribute from the loco list or modification sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocoDetail {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocoSchedule {
    pub incoming_date: Option<String>,
    pub sch: Option<String>,
    pub outgoing_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TractionFailure {
    pub date_failed: Option<String>,
    pub icms_message: Option<String>,
    pub loco_no: Option<String>,
    pub mu_with: Option<String>,
    pub div: Option<String>,
    pub rly: Option<String>,
    pub brief_message: Option<String>,
    pub cause_of_failure: Option<String>,
    pub component: Option<String>,
    pub system: Option<String>,
}

/// Composite view of everything known about one locomotive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocoSummary {
    pub loco_no: String,
    pub details: Vec<LocoDetail>,
    pub schedules: Vec<LocoSchedule>,
    pub failures: Vec<TractionFailure>,
    pub modifications: Vec<LocoDetail>,
    pub last_updated: DateTime<Utc>,
}

/// Per-collection record counts, keyed by collection name when serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CollectionCounts {
    pub loco_data: u64,
    pub schedule_data: u64,
    pub failure_data: u64,
    pub modifications_data: u64,
}

impl CollectionCounts {
    pub fn set(&mut self, dataset: DataSet, count: u64) {
        match dataset {
            DataSet::LocoList => self.loco_data = count,
            DataSet::LocoSchedules => self.schedule_data = count,
            DataSet::TractionFailures => self.failure_data = count,
            DataSet::Wag7Modifications => self.modifications_data = count,
        }
    }

    pub fn get(&self, dataset: DataSet) -> u64 {
        match dataset {
            DataSet::LocoList => self.loco_data,
            DataSet::LocoSchedules => self.schedule_data,
            DataSet::TractionFailures => self.failure_data,
            DataSet::Wag7Modifications => self.modifications_data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshState {
    Active,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshStatus {
    pub status: RefreshState,
    pub last_refresh: Option<DateTime<Utc>>,
    pub next_refresh: Option<DateTime<Utc>>,
    pub records_count: CollectionCounts,
}
