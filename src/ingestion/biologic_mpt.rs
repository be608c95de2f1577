//! Bio-Logic EC-Lab ASCII exports (`.mpt`).
//!
//! The first line is the `EC-Lab ASCII FILE` preamble and the second declares
//! `Nb header lines : N`; the N-th line is the tab-separated column header. Files are Latin-1
//! and may use a decimal comma.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use chrono::NaiveDateTime;

use crate::error::{HarvestError, HarvestResult};
use crate::types::{CanonicalColumn, NativeRow, RawValue};

use super::classify::MPT_MAGIC;
use super::maccor_text::project;
use super::{
    parse_instrument_datetime, validate_header, ColumnMapping, ColumnScan, FileMetadata,
    FormatAdapter, FormatTag, RowStream,
};

const BIOLOGIC_COLUMNS: &[(&str, CanonicalColumn)] = &[
    ("time/s", CanonicalColumn::TestTime),
    ("Ewe/V", CanonicalColumn::Volts),
    ("<Ewe>/V", CanonicalColumn::Volts),
    ("I/mA", CanonicalColumn::Amps),
    ("<I>/mA", CanonicalColumn::Amps),
    ("(Q-Qo)/mA.h", CanonicalColumn::ChargeCapacity),
    ("Energy/W.h", CanonicalColumn::EnergyCapacity),
    ("Temperature/\u{b0}C", CanonicalColumn::Temperature),
    ("cycle number", CanonicalColumn::CycleNumber),
    ("Ns", CanonicalColumn::StepNumber),
    ("P/W", CanonicalColumn::Power),
];

const START_KEYS: &[&str] = &["Acquisition started on", "Technique started on"];

/// Default Bio-Logic mapping, shared by the ASCII and binary adapters.
pub(crate) fn biologic_column_mapping() -> ColumnMapping {
    BIOLOGIC_COLUMNS
        .iter()
        .map(|(name, col)| (name.to_string(), *col))
        .collect()
}

/// EC-Lab reports current and charge in milli-units.
pub(crate) fn biologic_scale(native: &str) -> f64 {
    if native.ends_with("/mA") || native.ends_with("/mA.h") {
        1e-3
    } else {
        1.0
    }
}

pub(crate) fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn biologic_value(raw: &str) -> RawValue {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        RawValue::Empty
    } else {
        RawValue::Text(trimmed.replace(',', "."))
    }
}

struct MptHeader {
    properties: BTreeMap<String, String>,
    start_date: Option<NaiveDateTime>,
    columns: Vec<String>,
}

/// Adapter for [`FormatTag::BiologicMpt`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BiologicMpt;

impl BiologicMpt {
    fn read_header(path: &Path, reader: &mut BufReader<File>) -> HarvestResult<MptHeader> {
        let next_line = |reader: &mut BufReader<File>| -> HarvestResult<Option<String>> {
            let mut buf = Vec::new();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                return Ok(None);
            }
            Ok(Some(latin1(&buf).trim_end_matches(['\r', '\n']).to_owned()))
        };

        let first = next_line(reader)?.unwrap_or_default();
        if !first.as_bytes().starts_with(MPT_MAGIC) {
            return Err(HarvestError::unsupported(path, "missing EC-Lab ASCII preamble"));
        }
        let declared = next_line(reader)?
            .and_then(|l| {
                l.split_once(':')
                    .filter(|(k, _)| k.trim() == "Nb header lines")
                    .and_then(|(_, v)| v.trim().parse::<usize>().ok())
            })
            .filter(|n| *n >= 3)
            .ok_or_else(|| HarvestError::unsupported(path, "invalid 'Nb header lines' line"))?;

        let mut properties = BTreeMap::new();
        let mut columns = Vec::new();
        for line_no in 3..=declared {
            let line = next_line(reader)?
                .ok_or_else(|| HarvestError::unsupported(path, "file ends inside header"))?;
            if line_no == declared {
                columns = line.split('\t').map(|c| c.trim().to_owned()).collect();
                while columns.last().is_some_and(|c| c.is_empty()) {
                    columns.pop();
                }
            } else if let Some((k, v)) = line.split_once(" : ") {
                properties.insert(k.trim().to_owned(), v.trim().to_owned());
            }
        }
        validate_header(path, &columns)?;

        let start_date = START_KEYS
            .iter()
            .find_map(|k| properties.get(*k))
            .and_then(|v| parse_instrument_datetime(v));
        Ok(MptHeader {
            properties,
            start_date,
            columns,
        })
    }

    fn open(path: &Path) -> HarvestResult<(MptHeader, csv::ByteRecordsIntoIter<BufReader<File>>)> {
        let mut reader = BufReader::new(File::open(path)?);
        let header = Self::read_header(path, &mut reader)?;
        let records = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .from_reader(reader)
            .into_byte_records();
        Ok((header, records))
    }
}

impl FormatAdapter for BiologicMpt {
    fn format(&self) -> FormatTag {
        FormatTag::BiologicMpt
    }

    fn load_metadata(&self, path: &Path) -> HarvestResult<FileMetadata> {
        let (header, records) = Self::open(path)?;
        let mut scan = ColumnScan::new(header.columns.clone());
        for result in records {
            for (idx, raw) in result?.iter().enumerate() {
                scan.observe(idx, &biologic_value(&latin1(raw)));
            }
        }
        Ok(FileMetadata {
            format: FormatTag::BiologicMpt,
            start_date: header.start_date,
            properties: header.properties,
            columns: scan.finish(),
        })
    }

    fn native_to_canonical(&self) -> ColumnMapping {
        biologic_column_mapping()
    }

    fn native_scale(&self, native: &str) -> f64 {
        biologic_scale(native)
    }

    fn stream_rows(&self, path: &Path, columns: &BTreeSet<String>) -> HarvestResult<RowStream> {
        let (header, records) = Self::open(path)?;
        let projection = project(path, &header.columns, columns)?;
        Ok(Box::new(MptRows {
            records,
            projection,
        }))
    }
}

struct MptRows {
    records: csv::ByteRecordsIntoIter<BufReader<File>>,
    projection: Vec<(usize, String)>,
}

impl Iterator for MptRows {
    type Item = HarvestResult<NativeRow>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = match self.records.next()? {
            Ok(r) => r,
            Err(e) => return Some(Err(e.into())),
        };
        let row = self
            .projection
            .iter()
            .map(|(idx, name)| {
                let raw = record.get(*idx).map(latin1).unwrap_or_default();
                (name.clone(), biologic_value(&raw))
            })
            .collect();
        Some(Ok(row))
    }
}
