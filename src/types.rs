//! Core data model shared by the monitor, the format adapters and the derivation engine.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, HarvestResult};

/// Format-independent identifier for a measured or derived quantity.
///
/// The numeric ids are part of the wire format and are never reused for a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum CanonicalColumn {
    SampleNumber,
    TestTime,
    Volts,
    Amps,
    EnergyCapacity,
    ChargeCapacity,
    Temperature,
    StepTime,
    CycleNumber,
    StepNumber,
    Power,
}

impl CanonicalColumn {
    /// Every known column, in id order.
    pub const ALL: [CanonicalColumn; 11] = [
        Self::SampleNumber,
        Self::TestTime,
        Self::Volts,
        Self::Amps,
        Self::EnergyCapacity,
        Self::ChargeCapacity,
        Self::Temperature,
        Self::StepTime,
        Self::CycleNumber,
        Self::StepNumber,
        Self::Power,
    ];

    pub fn id(self) -> u32 {
        match self {
            Self::SampleNumber => 0,
            Self::TestTime => 1,
            Self::Volts => 2,
            Self::Amps => 3,
            Self::EnergyCapacity => 4,
            Self::ChargeCapacity => 5,
            Self::Temperature => 6,
            Self::StepTime => 7,
            Self::CycleNumber => 8,
            Self::StepNumber => 9,
            Self::Power => 10,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.id() == id)
    }

    /// Semantic name used in logs and metadata.
    pub fn name(self) -> &'static str {
        match self {
            Self::SampleNumber => "sample_no",
            Self::TestTime => "test_time",
            Self::Volts => "volts",
            Self::Amps => "amps",
            Self::EnergyCapacity => "energy_capacity",
            Self::ChargeCapacity => "charge_capacity",
            Self::Temperature => "temperature",
            Self::StepTime => "step_time",
            Self::CycleNumber => "cycle_number",
            Self::StepNumber => "step_number",
            Self::Power => "power",
        }
    }

    /// Unit symbol; empty for dimensionless counters.
    pub fn unit(self) -> &'static str {
        match self {
            Self::TestTime | Self::StepTime => "s",
            Self::Volts => "V",
            Self::Amps => "A",
            Self::EnergyCapacity => "Wh",
            Self::ChargeCapacity => "Ah",
            Self::Temperature => "degC",
            Self::Power => "W",
            Self::SampleNumber | Self::CycleNumber | Self::StepNumber => "",
        }
    }
}

impl fmt::Display for CanonicalColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.id())
    }
}

impl From<CanonicalColumn> for u32 {
    fn from(c: CanonicalColumn) -> Self {
        c.id()
    }
}

impl TryFrom<u32> for CanonicalColumn {
    type Error = String;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        Self::from_id(id).ok_or_else(|| format!("unknown canonical column id {id}"))
    }
}

/// A single value as read from a source file, before it is mapped to a canonical column.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// Missing/empty cell.
    Empty,
    /// Numeric cell.
    Number(f64),
    /// Text cell; may still hold a number (delimited text is read untyped).
    Text(String),
}

impl RawValue {
    /// Interpret the value as a number.
    ///
    /// `row` is the 1-based sample position and is only used for error reporting.
    pub fn as_number(&self, row: usize, column: &str) -> HarvestResult<Option<f64>> {
        match self {
            Self::Empty => Ok(None),
            Self::Number(v) => Ok(Some(*v)),
            Self::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                trimmed
                    .parse::<f64>()
                    .map(Some)
                    .map_err(|e| HarvestError::ParseError {
                        row,
                        column: column.to_owned(),
                        raw: s.clone(),
                        message: e.to_string(),
                    })
            }
        }
    }
}

/// One source row keyed by native column name.
pub type NativeRow = BTreeMap<String, RawValue>;

/// One source row keyed by canonical column, values already numeric.
pub type CanonicalValues = BTreeMap<CanonicalColumn, Option<f64>>;

/// The unit of output: one `(sample, column)` pair of a dataset, in long layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRow {
    pub dataset_id: u64,
    pub row_index: u64,
    pub column: CanonicalColumn,
    /// `None` is written as the `\N` sentinel, never by omitting the row.
    pub value: Option<f64>,
}

/// Lifecycle state of an observed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileState {
    Unstable,
    /// Reserved for an explicit "known still writing" signal; nothing produces it yet.
    Growing,
    Stable,
    Importing,
    Imported,
    ImportFailed,
    RetryImport,
}

impl FileState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unstable => "UNSTABLE",
            Self::Growing => "GROWING",
            Self::Stable => "STABLE",
            Self::Importing => "IMPORTING",
            Self::Imported => "IMPORTED",
            Self::ImportFailed => "IMPORT_FAILED",
            Self::RetryImport => "RETRY_IMPORT",
        }
    }

    /// Whether the monitor still re-examines files in this state on every poll.
    pub fn is_polled(self) -> bool {
        matches!(self, Self::Unstable | Self::RetryImport)
    }

    /// Whether an import may start from this state.
    pub fn is_importable(self) -> bool {
        matches!(self, Self::Stable | Self::RetryImport)
    }

    /// Edges of the lifecycle graph.
    ///
    /// `IMPORTED`/`IMPORT_FAILED` → `RETRY_IMPORT` is the operator override; `RETRY_IMPORT` →
    /// `UNSTABLE` happens when a file queued for retry changes on disk.
    pub fn can_transition_to(self, next: FileState) -> bool {
        use FileState::*;
        matches!(
            (self, next),
            (Unstable, Unstable)
                | (Unstable, Stable)
                | (Stable, Importing)
                | (RetryImport, Importing)
                | (RetryImport, Unstable)
                | (Importing, Imported)
                | (Importing, ImportFailed)
                | (Imported, RetryImport)
                | (ImportFailed, RetryImport)
        )
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileState {
    type Err = String;

    /// Accepts both `RETRY_IMPORT` and the space-separated `RETRY IMPORT` stored by older schemas.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace(' ', "_").as_str() {
            "UNSTABLE" => Ok(Self::Unstable),
            "GROWING" => Ok(Self::Growing),
            "STABLE" => Ok(Self::Stable),
            "IMPORTING" => Ok(Self::Importing),
            "IMPORTED" => Ok(Self::Imported),
            "IMPORT_FAILED" => Ok(Self::ImportFailed),
            "RETRY_IMPORT" => Ok(Self::RetryImport),
            other => Err(format!("unknown file state '{other}'")),
        }
    }
}

fn default_stable_time_secs() -> u64 {
    60
}

/// A directory a harvester watches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredPath {
    pub id: u64,
    /// Identity of the harvester that owns this path (its machine id).
    pub harvester: String,
    pub path: PathBuf,
    /// Seconds a file's size must stay unchanged before it is considered stable.
    #[serde(default = "default_stable_time_secs")]
    pub stable_time_secs: u64,
}

impl MonitoredPath {
    pub fn new(id: u64, harvester: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            harvester: harvester.into(),
            path: path.into(),
            stable_time_secs: default_stable_time_secs(),
        }
    }

    pub fn with_stable_time_secs(mut self, secs: u64) -> Self {
        self.stable_time_secs = secs;
        self
    }

    pub fn stable_time(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stable_time_secs as i64)
    }
}

/// Identity of an observed file: the monitored path plus the path relative to it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObservedFileKey {
    pub monitored_path_id: u64,
    /// `/`-separated path relative to the monitored directory.
    pub relative_path: String,
}

impl ObservedFileKey {
    pub fn new(monitored_path_id: u64, relative_path: impl Into<String>) -> Self {
        Self {
            monitored_path_id,
            relative_path: relative_path.into(),
        }
    }

    /// Absolute location of the file under `root`.
    pub fn resolve(&self, root: &Path) -> PathBuf {
        self.relative_path
            .split('/')
            .fold(root.to_path_buf(), |acc, part| acc.join(part))
    }
}

/// Persisted record of one file ever seen under a monitored path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedFile {
    pub key: ObservedFileKey,
    pub last_observed_size: u64,
    /// Anchor of the stability clock; only moved when something about the file changed.
    pub last_observed_time: DateTime<Utc>,
    /// When the current size was first seen. Bounds how long an open handle may defer stability.
    pub size_changed_at: DateTime<Utc>,
    pub state: FileState,
    /// Text of the last import failure, kept so failed files stay inspectable.
    pub last_error: Option<String>,
}

impl ObservedFile {
    pub fn new(key: ObservedFileKey, size: u64, now: DateTime<Utc>) -> Self {
        Self {
            key,
            last_observed_size: size,
            last_observed_time: now,
            size_changed_at: now,
            state: FileState::Unstable,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_ids_are_unique_and_round_trip() {
        for c in CanonicalColumn::ALL {
            assert_eq!(CanonicalColumn::from_id(c.id()), Some(c));
        }
        assert_eq!(CanonicalColumn::from_id(99), None);
        assert_eq!(CanonicalColumn::Amps.id(), 3);
        assert_eq!(CanonicalColumn::ChargeCapacity.id(), 5);
    }

    #[test]
    fn file_state_parses_legacy_spaced_names() {
        assert_eq!("RETRY IMPORT".parse::<FileState>().unwrap(), FileState::RetryImport);
        assert_eq!("import_failed".parse::<FileState>().unwrap(), FileState::ImportFailed);
        assert!("DONE".parse::<FileState>().is_err());
    }

    #[test]
    fn lifecycle_only_moves_forward() {
        assert!(FileState::Unstable.can_transition_to(FileState::Stable));
        assert!(FileState::Importing.can_transition_to(FileState::ImportFailed));
        assert!(FileState::ImportFailed.can_transition_to(FileState::RetryImport));
        assert!(!FileState::Imported.can_transition_to(FileState::Importing));
        assert!(!FileState::Stable.can_transition_to(FileState::Unstable));
        assert!(!FileState::Unstable.can_transition_to(FileState::Importing));
    }

    #[test]
    fn raw_text_is_parsed_on_demand() {
        let v = RawValue::Text(" 2.5 ".to_string());
        assert_eq!(v.as_number(1, "Amps").unwrap(), Some(2.5));
        assert_eq!(RawValue::Empty.as_number(1, "Amps").unwrap(), None);
        let err = RawValue::Text("C".to_string()).as_number(4, "State").unwrap_err();
        assert!(err.to_string().contains("column 'State'"));
    }

    #[test]
    fn key_resolves_nested_relative_paths() {
        let key = ObservedFileKey::new(1, "cell_a/run1.txt");
        assert_eq!(
            key.resolve(Path::new("/data")),
            PathBuf::from("/data").join("cell_a").join("run1.txt")
        );
    }
}
