//! Maccor delimited-text exports (tab or comma).
//!
//! Layout:
//!
//! - optional metadata line of `key` / value cell pairs (`Today's Date`, `Date of Test:`, ...)
//! - one header line naming the columns
//! - data rows
//!
//! Time columns exported as `[d ]hh:mm:ss` are converted to seconds while streaming.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::Path;

use chrono::NaiveDateTime;

use crate::error::{HarvestError, HarvestResult};
use crate::types::{CanonicalColumn, NativeRow, RawValue};

use super::{
    parse_duration_secs, parse_instrument_datetime, validate_header, ColumnMapping, ColumnScan,
    FileMetadata, FormatAdapter, FormatTag, RowStream,
};

const MACCOR_COLUMNS: &[(&str, CanonicalColumn)] = &[
    ("Rec#", CanonicalColumn::SampleNumber),
    ("Test Time", CanonicalColumn::TestTime),
    ("Test Time (sec)", CanonicalColumn::TestTime),
    ("TestTime", CanonicalColumn::TestTime),
    ("Volts", CanonicalColumn::Volts),
    ("Amps", CanonicalColumn::Amps),
    ("Watt-hr", CanonicalColumn::EnergyCapacity),
    ("Amp-hr", CanonicalColumn::ChargeCapacity),
    ("Temp 1", CanonicalColumn::Temperature),
    ("Step Time", CanonicalColumn::StepTime),
    ("StepTime", CanonicalColumn::StepTime),
    ("Cyc#", CanonicalColumn::CycleNumber),
    ("Step", CanonicalColumn::StepNumber),
    ("Watts", CanonicalColumn::Power),
];

const DURATION_COLUMNS: &[&str] = &["Test Time", "TestTime", "Step Time", "StepTime"];

/// Columns written as `[d]d hh:mm:ss[.f]` and read as seconds.
pub(crate) fn is_duration_column(column: &str) -> bool {
    DURATION_COLUMNS.contains(&column)
}

/// Default Maccor column mapping, shared by the text and spreadsheet adapters.
pub(crate) fn maccor_column_mapping() -> ColumnMapping {
    MACCOR_COLUMNS
        .iter()
        .map(|(name, col)| (name.to_string(), *col))
        .collect()
}

/// Convert one Maccor cell, turning clock-style durations into seconds.
pub(crate) fn maccor_value(column: &str, raw: &str) -> RawValue {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return RawValue::Empty;
    }
    if is_duration_column(column) {
        if let Some(secs) = parse_duration_secs(trimmed) {
            return RawValue::Number(secs);
        }
    }
    RawValue::Text(trimmed.to_owned())
}

/// Header metadata parsed from the optional first line.
#[derive(Debug, Default)]
pub(crate) struct MaccorPreamble {
    pub properties: BTreeMap<String, String>,
    pub start_date: Option<NaiveDateTime>,
}

/// Parse a metadata line, or `None` if `cells` is not one.
pub(crate) fn parse_metadata_cells(cells: &[String]) -> Option<MaccorPreamble> {
    let is_metadata = cells
        .iter()
        .any(|c| c.starts_with("Today's Date") || c.starts_with("Date of Test"));
    if !is_metadata {
        return None;
    }

    let mut preamble = MaccorPreamble::default();
    for pair in cells.chunks(2) {
        let key = pair[0].trim().trim_end_matches(':').trim();
        if key.is_empty() {
            continue;
        }
        let value = pair.get(1).map(|v| v.trim()).unwrap_or("");
        preamble.properties.insert(key.to_owned(), value.to_owned());
    }
    preamble.start_date = preamble
        .properties
        .get("Date of Test")
        .and_then(|v| parse_instrument_datetime(v));
    Some(preamble)
}

/// Adapter for [`FormatTag::MaccorTsv`] and [`FormatTag::MaccorCsv`].
#[derive(Debug, Clone, Copy)]
pub struct MaccorText {
    delimiter: u8,
}

impl MaccorText {
    pub fn tab() -> Self {
        Self { delimiter: b'\t' }
    }

    pub fn comma() -> Self {
        Self { delimiter: b',' }
    }

    fn open(&self, path: &Path) -> HarvestResult<csv::ByteRecordsIntoIter<File>> {
        let rdr = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;
        Ok(rdr.into_byte_records())
    }

    /// Consume the metadata and header lines, leaving `records` at the first data row.
    fn read_preamble(
        &self,
        path: &Path,
        records: &mut csv::ByteRecordsIntoIter<File>,
    ) -> HarvestResult<(MaccorPreamble, Vec<String>)> {
        let mut preamble: Option<MaccorPreamble> = None;
        for result in records.by_ref() {
            let cells = decode_record(&result?);
            if cells.iter().all(|c| c.is_empty()) {
                continue;
            }
            if preamble.is_none() {
                if let Some(p) = parse_metadata_cells(&cells) {
                    preamble = Some(p);
                    continue;
                }
            }
            validate_header(path, &cells)?;
            return Ok((preamble.unwrap_or_default(), cells));
        }
        Err(HarvestError::unsupported(path, "no header row found"))
    }
}

impl FormatAdapter for MaccorText {
    fn format(&self) -> FormatTag {
        if self.delimiter == b'\t' {
            FormatTag::MaccorTsv
        } else {
            FormatTag::MaccorCsv
        }
    }

    fn load_metadata(&self, path: &Path) -> HarvestResult<FileMetadata> {
        let mut records = self.open(path)?;
        let (preamble, header) = self.read_preamble(path, &mut records)?;

        let mut scan = ColumnScan::new(header.clone());
        for result in records {
            let record = result?;
            for (idx, raw) in record.iter().enumerate() {
                if let Some(name) = header.get(idx) {
                    scan.observe(idx, &maccor_value(name, &String::from_utf8_lossy(raw)));
                }
            }
        }

        Ok(FileMetadata {
            format: self.format(),
            start_date: preamble.start_date,
            properties: preamble.properties,
            columns: scan.finish(),
        })
    }

    fn native_to_canonical(&self) -> ColumnMapping {
        maccor_column_mapping()
    }

    fn stream_rows(&self, path: &Path, columns: &BTreeSet<String>) -> HarvestResult<RowStream> {
        let mut records = self.open(path)?;
        let (_, header) = self.read_preamble(path, &mut records)?;
        let projection = project(path, &header, columns)?;
        Ok(Box::new(MaccorTextRows {
            records,
            projection,
        }))
    }
}

/// Map requested column names to header positions.
pub(crate) fn project(
    path: &Path,
    header: &[String],
    columns: &BTreeSet<String>,
) -> HarvestResult<Vec<(usize, String)>> {
    columns
        .iter()
        .map(|name| {
            header
                .iter()
                .position(|h| h == name)
                .map(|idx| (idx, name.clone()))
                .ok_or_else(|| {
                    HarvestError::unsupported(
                        path,
                        format!("missing column '{name}'. headers={header:?}"),
                    )
                })
        })
        .collect()
}

fn decode_record(record: &csv::ByteRecord) -> Vec<String> {
    record
        .iter()
        .map(|b| String::from_utf8_lossy(b).trim().to_owned())
        .collect()
}

struct MaccorTextRows {
    records: csv::ByteRecordsIntoIter<File>,
    projection: Vec<(usize, String)>,
}

impl Iterator for MaccorTextRows {
    type Item = HarvestResult<NativeRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let record = match self.records.next()? {
                Ok(r) => r,
                Err(e) => return Some(Err(e.into())),
            };
            if record.iter().all(|b| b.iter().all(u8::is_ascii_whitespace)) {
                continue;
            }
            let row = self
                .projection
                .iter()
                .map(|(idx, name)| {
                    let raw: Cow<'_, str> = record
                        .get(*idx)
                        .map(String::from_utf8_lossy)
                        .unwrap_or(Cow::Borrowed(""));
                    (name.clone(), maccor_value(name, &raw))
                })
                .collect();
            return Some(Ok(row));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "Today's Date\t04/02/2019\tDate of Test:\t03/26/2019 5:47:02 PM\tFilename:\tC:\\Data\\cell15.txt\n\
Rec#\tCyc#\tStep\tTest Time\tAmps\tVolts\tState\n\
1\t0\t1\t00:00:00\t0\t4.1\tR\n\
2\t0\t1\t00:00:01.5\t0.5\t4.0\tD\n\
\n";

    fn fixture(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cell15.txt");
        File::create(&path)
            .unwrap()
            .write_all(contents.as_bytes())
            .unwrap();
        (dir, path)
    }

    #[test]
    fn metadata_line_is_parsed() {
        let (_d, p) = fixture(SAMPLE);
        let md = MaccorText::tab().load_metadata(&p).unwrap();
        assert_eq!(md.format, FormatTag::MaccorTsv);
        assert_eq!(md.properties["Filename"], "C:\\Data\\cell15.txt");
        assert_eq!(md.start_date.unwrap().to_string(), "2019-03-26 17:47:02");
        let state = md.columns.iter().find(|c| c.name == "State").unwrap();
        assert!(state.has_data && !state.is_numeric);
        let time = md.columns.iter().find(|c| c.name == "Test Time").unwrap();
        assert!(time.is_numeric);
    }

    #[test]
    fn stream_projects_and_converts_durations() {
        let (_d, p) = fixture(SAMPLE);
        let cols: BTreeSet<String> = ["Test Time", "Amps"].iter().map(|s| s.to_string()).collect();
        let rows: Vec<NativeRow> = MaccorText::tab()
            .stream_rows(&p, &cols)
            .unwrap()
            .collect::<HarvestResult<_>>()
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["Test Time"], RawValue::Number(1.5));
        assert_eq!(rows[1]["Amps"], RawValue::Text("0.5".to_string()));
        assert_eq!(rows[0].len(), 2);
    }

    #[test]
    fn headerless_file_is_unsupported() {
        let (_d, p) = fixture("just-one-cell\n");
        let err = MaccorText::tab().load_metadata(&p).unwrap_err();
        assert!(matches!(err, HarvestError::UnsupportedFileType { .. }));
    }

    #[test]
    fn file_without_metadata_line_still_loads() {
        let (_d, p) = fixture("Time,Current\n0,0\n1,2\n");
        let md = MaccorText::comma().load_metadata(&p).unwrap();
        assert!(md.start_date.is_none());
        assert_eq!(md.numeric_columns_with_data().len(), 2);
    }
}
