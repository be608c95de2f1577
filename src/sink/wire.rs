//! Tab-separated bulk-load format for [`CanonicalRow`]s.
//!
//! One line per row: `dataset_id\trow_index\tcolumn_id\tvalue\n`. Missing values are the two
//! characters `\N`. Values use Rust's shortest round-trip float formatting, so decoding and
//! re-encoding reproduces the input bytes.

use std::io::{Read, Write};

use csv::{QuoteStyle, ReaderBuilder, StringRecord, WriterBuilder};

use crate::error::{HarvestError, HarvestResult};
use crate::types::{CanonicalColumn, CanonicalRow};

/// Null sentinel.
pub const NULL: &str = "\\N";

fn writer<W: Write>(w: W) -> csv::Writer<W> {
    WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(QuoteStyle::Never)
        .has_headers(false)
        .from_writer(w)
}

fn fields(row: &CanonicalRow) -> [String; 4] {
    [
        row.dataset_id.to_string(),
        row.row_index.to_string(),
        row.column.id().to_string(),
        row.value.map(|v| v.to_string()).unwrap_or_else(|| NULL.to_string()),
    ]
}

/// Encode a single row, including the trailing newline.
pub fn encode_row(row: &CanonicalRow) -> HarvestResult<String> {
    let mut bytes = Vec::new();
    write_rows(&mut bytes, [row])?;
    String::from_utf8(bytes).map_err(|e| HarvestError::WireFormat {
        line: 1,
        message: e.to_string(),
    })
}

/// Write `rows` to `out`; returns how many were written.
pub fn write_rows<'a, W, I>(out: W, rows: I) -> HarvestResult<u64>
where
    W: Write,
    I: IntoIterator<Item = &'a CanonicalRow>,
{
    let mut w = writer(out);
    let mut n = 0;
    for row in rows {
        w.write_record(fields(row))?;
        n += 1;
    }
    w.flush()?;
    Ok(n)
}

/// Decode every line of `input`.
pub fn decode_rows<R: Read>(input: R) -> HarvestResult<Vec<CanonicalRow>> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_reader(input);

    let mut rows = Vec::new();
    let mut record = StringRecord::new();
    let mut line = 0;
    while rdr.read_record(&mut record)? {
        line += 1;
        rows.push(decode_record(line, &record)?);
    }
    Ok(rows)
}

fn decode_record(line: usize, record: &StringRecord) -> HarvestResult<CanonicalRow> {
    let bad = |message: String| HarvestError::WireFormat { line, message };
    if record.len() != 4 {
        return Err(bad(format!("expected 4 fields, got {}", record.len())));
    }

    let dataset_id = record[0]
        .parse::<u64>()
        .map_err(|e| bad(format!("dataset_id '{}': {e}", &record[0])))?;
    let row_index = record[1]
        .parse::<u64>()
        .map_err(|e| bad(format!("row_index '{}': {e}", &record[1])))?;
    let column = record[2]
        .parse::<u32>()
        .ok()
        .and_then(CanonicalColumn::from_id)
        .ok_or_else(|| bad(format!("unknown column id '{}'", &record[2])))?;
    let value = match &record[3] {
        NULL => None,
        raw => Some(
            raw.parse::<f64>()
                .map_err(|e| bad(format!("value '{raw}': {e}")))?,
        ),
    };

    Ok(CanonicalRow {
        dataset_id,
        row_index,
        column,
        value,
    })
}
