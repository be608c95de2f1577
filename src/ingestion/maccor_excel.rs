#![cfg(feature = "excel")]

//! Maccor spreadsheet exports (`.xls`, `.xlsx`).
//!
//! Same layout as the text export: an optional metadata row, a header row, then data. Large
//! runs are split across several sheets, each repeating the header; rows are streamed sheet by
//! sheet in workbook order, holding one sheet in memory at a time.

use std::collections::{BTreeSet, VecDeque};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Range, Reader, Sheets};

use crate::error::{HarvestError, HarvestResult};
use crate::types::{NativeRow, RawValue};

use super::maccor_text::{
    is_duration_column, maccor_column_mapping, maccor_value, parse_metadata_cells, project,
    MaccorPreamble,
};
use super::{validate_header, ColumnMapping, ColumnScan, FileMetadata, FormatAdapter, FormatTag, RowStream};

type Workbook = Sheets<BufReader<File>>;

const SECS_PER_DAY: f64 = 86_400.0;

/// Adapter for [`FormatTag::MaccorExcel`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MaccorExcel;

/// A sheet with its header located.
struct SheetLayout {
    preamble: Option<MaccorPreamble>,
    header_row: usize,
    header: Vec<String>,
}

fn locate_header(path: &Path, sheet: &str, range: &Range<Data>) -> HarvestResult<Option<SheetLayout>> {
    let mut preamble = None;
    for (idx, row) in range.rows().enumerate() {
        if row.iter().all(|c| matches!(c, Data::Empty)) {
            continue;
        }
        let cells: Vec<String> = row.iter().map(cell_to_header_string).collect();
        if preamble.is_none() {
            if let Some(p) = parse_metadata_cells(&cells) {
                preamble = Some(p);
                continue;
            }
        }
        let mut header = cells;
        while header.last().is_some_and(|c| c.is_empty()) {
            header.pop();
        }
        validate_header(path, &header).map_err(|e| wrap_with_sheet(sheet, e))?;
        return Ok(Some(SheetLayout {
            preamble,
            header_row: idx,
            header,
        }));
    }
    Ok(None)
}

fn wrap_with_sheet(sheet: &str, err: HarvestError) -> HarvestError {
    match err {
        HarvestError::UnsupportedFileType { path, reason } => HarvestError::UnsupportedFileType {
            path,
            reason: format!("sheet '{sheet}': {reason}"),
        },
        other => other,
    }
}

fn cell_to_header_string(c: &Data) -> String {
    match c {
        Data::String(s) => s.trim().to_owned(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 {
                (*f as i64).to_string()
            } else {
                f.to_string()
            }
        }
        Data::Empty => String::new(),
        other => other.to_string(),
    }
}

fn cell_to_raw(column: &str, c: &Data) -> RawValue {
    match c {
        Data::Empty => RawValue::Empty,
        Data::Int(i) => RawValue::Number(*i as f64),
        Data::Float(f) => RawValue::Number(*f),
        Data::Bool(b) => RawValue::Number(if *b { 1.0 } else { 0.0 }),
        // Time-formatted cells hold Excel serial days; text exports give these columns in seconds.
        Data::DateTime(dt) if is_duration_column(column) => {
            RawValue::Number(dt.as_f64() * SECS_PER_DAY)
        }
        Data::DateTime(dt) => RawValue::Number(dt.as_f64()),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => maccor_value(column, s),
        Data::Error(e) => RawValue::Text(format!("{e:?}")),
    }
}

impl FormatAdapter for MaccorExcel {
    fn format(&self) -> FormatTag {
        FormatTag::MaccorExcel
    }

    fn load_metadata(&self, path: &Path) -> HarvestResult<FileMetadata> {
        let mut workbook: Workbook = open_workbook_auto(path)?;
        let sheets = workbook.sheet_names().to_vec();
        if sheets.is_empty() {
            return Err(HarvestError::unsupported(path, "workbook has no sheets"));
        }

        let mut first: Option<SheetLayout> = None;
        let mut scan: Option<ColumnScan> = None;
        for sheet in &sheets {
            let range = workbook.worksheet_range(sheet)?;
            let Some(layout) = locate_header(path, sheet, &range)? else {
                continue;
            };
            let scan = scan.get_or_insert_with(|| ColumnScan::new(layout.header.clone()));
            // Later sheets may order their columns differently; match them to the first by name.
            let slots: Vec<Option<usize>> = layout.header.iter().map(|n| scan.position(n)).collect();
            for row in range.rows().skip(layout.header_row + 1) {
                for ((cell, name), slot) in row.iter().zip(&layout.header).zip(&slots) {
                    if let Some(idx) = slot {
                        scan.observe(*idx, &cell_to_raw(name, cell));
                    }
                }
            }
            if first.is_none() {
                first = Some(layout);
            }
        }

        let first = first.ok_or_else(|| HarvestError::unsupported(path, "no sheet has a header row"))?;
        let preamble = first.preamble.unwrap_or_default();
        let mut properties = preamble.properties;
        properties.insert("sheets".to_string(), sheets.join(","));
        Ok(FileMetadata {
            format: FormatTag::MaccorExcel,
            start_date: preamble.start_date,
            properties,
            columns: scan.map(ColumnScan::finish).unwrap_or_default(),
        })
    }

    fn native_to_canonical(&self) -> ColumnMapping {
        maccor_column_mapping()
    }

    fn stream_rows(&self, path: &Path, columns: &BTreeSet<String>) -> HarvestResult<RowStream> {
        let workbook: Workbook = open_workbook_auto(path)?;
        let pending = workbook.sheet_names().to_vec().into();
        Ok(Box::new(ExcelRows {
            path: path.to_path_buf(),
            workbook,
            pending,
            columns: columns.clone(),
            current: None,
        }))
    }
}

struct OpenSheet {
    range: Range<Data>,
    next_row: usize,
    projection: Vec<(usize, String)>,
}

struct ExcelRows {
    path: PathBuf,
    workbook: Workbook,
    pending: VecDeque<String>,
    columns: BTreeSet<String>,
    current: Option<OpenSheet>,
}

impl ExcelRows {
    /// Load the next sheet that has a header; `Ok(false)` once sheets are exhausted.
    fn advance_sheet(&mut self) -> HarvestResult<bool> {
        while let Some(sheet) = self.pending.pop_front() {
            let range = self.workbook.worksheet_range(&sheet)?;
            let Some(layout) = locate_header(&self.path, &sheet, &range)? else {
                continue;
            };
            let projection = project(&self.path, &layout.header, &self.columns)
                .map_err(|e| wrap_with_sheet(&sheet, e))?;
            self.current = Some(OpenSheet {
                range,
                next_row: layout.header_row + 1,
                projection,
            });
            return Ok(true);
        }
        Ok(false)
    }
}

impl Iterator for ExcelRows {
    type Item = HarvestResult<NativeRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(open) = self.current.as_mut() {
                while open.next_row < open.range.height() {
                    let r = open.next_row;
                    open.next_row += 1;
                    let cells: Vec<(&String, &Data)> = open
                        .projection
                        .iter()
                        .map(|(c, name)| (name, open.range.get((r, *c)).unwrap_or(&Data::Empty)))
                        .collect();
                    if cells.iter().all(|(_, d)| matches!(d, Data::Empty)) {
                        continue;
                    }
                    let row = cells
                        .into_iter()
                        .map(|(name, d)| (name.clone(), cell_to_raw(name, d)))
                        .collect();
                    return Some(Ok(row));
                }
                self.current = None;
            }
            match self.advance_sheet() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    self.pending.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}
