//! Format detection and per-format adapters.
//!
//! Most callers go through [`classify`] and [`open_adapter`]:
//!
//! - [`classify`] maps a path to a closed [`FormatTag`]
//! - [`open_adapter`] binds a tag to its [`FormatAdapter`]
//! - the adapter extracts [`FileMetadata`] and streams [`NativeRow`]s lazily
//!
//! Format-specific implementations live under:
//! - [`maccor_text`] (tab/comma text)
//! - `maccor_excel` (spreadsheets, feature `excel`)
//! - [`biologic_mpt`] (EC-Lab ASCII)
//! - [`biologic_mpr`] (EC-Lab binary)

pub mod biologic_mpr;
pub mod biologic_mpt;
pub mod classify;
#[cfg(feature = "excel")]
pub mod maccor_excel;
pub mod maccor_text;
pub mod observability;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, HarvestResult};
use crate::types::{CanonicalColumn, NativeRow, RawValue};

pub use classify::{classify, FormatTag};
pub use observability::{
    CompositeObserver, FileObserver, HarvestContext, HarvestObserver, HarvestSeverity, HarvestStats,
    StdErrObserver, TracingObserver,
};

/// Lazy, finite, non-restartable sequence of source rows in file order.
pub type RowStream = Box<dyn Iterator<Item = HarvestResult<NativeRow>>>;

/// Static native-column-name → canonical-column mapping of an adapter.
pub type ColumnMapping = BTreeMap<String, CanonicalColumn>;

/// What a file says about one of its native columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// At least one non-empty value exists.
    pub has_data: bool,
    /// Every non-empty value reads as a number.
    pub is_numeric: bool,
}

/// Metadata extracted from a source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub format: FormatTag,
    /// Experiment start, when the file records one.
    pub start_date: Option<NaiveDateTime>,
    /// Free-form key/value pairs from the file header.
    pub properties: BTreeMap<String, String>,
    /// Native columns in file order.
    pub columns: Vec<ColumnInfo>,
}

impl FileMetadata {
    /// Names of native columns that carry numeric data.
    pub fn numeric_columns_with_data(&self) -> BTreeSet<&str> {
        self.columns
            .iter()
            .filter(|c| c.has_data && c.is_numeric)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// One implementation per [`FormatTag`].
pub trait FormatAdapter {
    fn format(&self) -> FormatTag;

    /// Read header metadata and scan which columns carry numeric data.
    ///
    /// Fails with [`HarvestError::UnsupportedFileType`] when the file does not follow the grammar
    /// its tag promises.
    fn load_metadata(&self, path: &Path) -> HarvestResult<FileMetadata>;

    /// Default mapping of native column names onto the canonical vocabulary.
    fn native_to_canonical(&self) -> ColumnMapping;

    /// Multiplier that brings a native column into its canonical unit (e.g. mA → A).
    fn native_scale(&self, _native: &str) -> f64 {
        1.0
    }

    /// Stream rows restricted to `columns`, without materialising the file.
    fn stream_rows(&self, path: &Path, columns: &BTreeSet<String>) -> HarvestResult<RowStream>;
}

/// Bind a tag to its adapter.
pub fn open_adapter(tag: FormatTag) -> HarvestResult<Box<dyn FormatAdapter>> {
    match tag {
        FormatTag::MaccorTsv => Ok(Box::new(maccor_text::MaccorText::tab())),
        FormatTag::MaccorCsv => Ok(Box::new(maccor_text::MaccorText::comma())),
        FormatTag::MaccorExcel => open_excel_adapter(),
        FormatTag::BiologicMpt => Ok(Box::new(biologic_mpt::BiologicMpt)),
        FormatTag::BiologicMpr => Ok(Box::new(biologic_mpr::BiologicMpr)),
    }
}

fn open_excel_adapter() -> HarvestResult<Box<dyn FormatAdapter>> {
    #[cfg(feature = "excel")]
    {
        Ok(Box::new(maccor_excel::MaccorExcel))
    }

    #[cfg(not(feature = "excel"))]
    {
        Err(HarvestError::Configuration {
            message: "excel ingestion not enabled (enable cargo feature 'excel')".to_string(),
        })
    }
}

/// Accumulates [`ColumnInfo`] while scanning rows.
#[derive(Debug, Default)]
pub(crate) struct ColumnScan {
    names: Vec<String>,
    has_data: Vec<bool>,
    is_numeric: Vec<bool>,
}

impl ColumnScan {
    pub(crate) fn new(names: Vec<String>) -> Self {
        let n = names.len();
        Self {
            names,
            has_data: vec![false; n],
            is_numeric: vec![true; n],
        }
    }

    /// Index of the column called `name`.
    pub(crate) fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub(crate) fn observe(&mut self, idx: usize, value: &RawValue) {
        if idx >= self.names.len() {
            return;
        }
        match value {
            RawValue::Empty => {}
            RawValue::Number(_) => self.has_data[idx] = true,
            RawValue::Text(s) => {
                if s.trim().is_empty() {
                    return;
                }
                self.has_data[idx] = true;
                if s.trim().parse::<f64>().is_err() {
                    self.is_numeric[idx] = false;
                }
            }
        }
    }

    pub(crate) fn finish(self) -> Vec<ColumnInfo> {
        self.names
            .into_iter()
            .zip(self.has_data)
            .zip(self.is_numeric)
            .map(|((name, has_data), is_numeric)| ColumnInfo {
                name,
                has_data,
                // A column without data tells us nothing; report it as non-numeric.
                is_numeric: has_data && is_numeric,
            })
            .collect()
    }
}

/// Reject empty or duplicated headers.
pub(crate) fn validate_header(path: &Path, header: &[String]) -> HarvestResult<()> {
    let named: Vec<&String> = header.iter().filter(|h| !h.is_empty()).collect();
    if named.len() < 2 {
        return Err(HarvestError::unsupported(
            path,
            format!("header has fewer than two named columns: {header:?}"),
        ));
    }
    let mut seen = BTreeSet::new();
    for h in named {
        if !seen.insert(h.as_str()) {
            return Err(HarvestError::unsupported(
                path,
                format!("duplicate column '{h}' in header"),
            ));
        }
    }
    Ok(())
}

/// Maccor-style `[d ]hh:mm:ss[.fff]` (or plain seconds) into seconds.
pub(crate) fn parse_duration_secs(raw: &str) -> Option<f64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(v) = s.parse::<f64>() {
        return Some(v);
    }
    let (days, clock) = match s.split_once('d') {
        Some((d, rest)) => (d.trim().parse::<f64>().ok()?, rest.trim()),
        None => (0.0, s),
    };
    let parts: Vec<&str> = clock.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let h = parts[0].parse::<f64>().ok()?;
    let m = parts[1].parse::<f64>().ok()?;
    let sec = parts[2].parse::<f64>().ok()?;
    Some(((days * 24.0 + h) * 60.0 + m) * 60.0 + sec)
}

const DATETIME_FORMATS: &[&str] = &[
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%Y-%m-%d", "%m/%d/%y"];

/// Best-effort parse of instrument date stamps; date-only values map to midnight.
pub(crate) fn parse_instrument_datetime(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_accept_clock_and_day_prefix() {
        assert_eq!(parse_duration_secs("12.5"), Some(12.5));
        assert_eq!(parse_duration_secs("00:01:30"), Some(90.0));
        assert_eq!(parse_duration_secs("1d 00:00:01.5"), Some(86_401.5));
        assert_eq!(parse_duration_secs("C"), None);
    }

    #[test]
    fn instrument_dates_parse_common_layouts() {
        let dt = parse_instrument_datetime("03/26/2019 5:47:02 PM").unwrap();
        assert_eq!(dt.to_string(), "2019-03-26 17:47:02");
        let d = parse_instrument_datetime("03/26/2019").unwrap();
        assert_eq!(d.to_string(), "2019-03-26 00:00:00");
        assert!(parse_instrument_datetime("yesterday").is_none());
    }

    #[test]
    fn column_scan_reports_text_columns_as_non_numeric() {
        let mut scan = ColumnScan::new(vec!["Amps".into(), "State".into(), "Spare".into()]);
        scan.observe(0, &RawValue::Text("0.5".into()));
        scan.observe(1, &RawValue::Text("C".into()));
        scan.observe(2, &RawValue::Empty);
        let info = scan.finish();
        assert!(info[0].has_data && info[0].is_numeric);
        assert!(info[1].has_data && !info[1].is_numeric);
        assert!(!info[2].has_data);
    }

    #[test]
    fn header_validation_rejects_duplicates() {
        let p = Path::new("x.txt");
        assert!(validate_header(p, &["A".into(), "B".into()]).is_ok());
        assert!(validate_header(p, &["A".into(), "A".into()]).is_err());
        assert!(validate_header(p, &["A".into()]).is_err());
    }
}
