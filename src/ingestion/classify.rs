//! File classification: extension first, then a bounded content sniff.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, HarvestResult};

/// Upper bound on how much of a file the classifier reads.
pub const SNIFF_BYTES: u64 = 4 * 1024;

pub(crate) const MPR_MAGIC: &[u8] = b"BIO-LOGIC MODULAR FILE";
pub(crate) const MPT_MAGIC: &[u8] = b"EC-Lab ASCII FILE";
const XLSX_MAGIC: &[u8] = b"PK\x03\x04";
const XLS_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Closed set of supported {vendor, sub-format} combinations.
///
/// Each variant is bound to exactly one adapter in [`super::open_adapter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatTag {
    /// Maccor text export, tab-delimited.
    MaccorTsv,
    /// Maccor text export, comma-delimited.
    MaccorCsv,
    /// Maccor spreadsheet export (`.xls`/`.xlsx`).
    MaccorExcel,
    /// Bio-Logic EC-Lab ASCII export.
    BiologicMpt,
    /// Bio-Logic EC-Lab binary modular file.
    BiologicMpr,
}

impl FormatTag {
    pub fn vendor(self) -> &'static str {
        match self {
            Self::MaccorTsv | Self::MaccorCsv | Self::MaccorExcel => "MACCOR",
            Self::BiologicMpt | Self::BiologicMpr => "BIOLOGIC",
        }
    }

    pub fn sub_format(self) -> &'static str {
        match self {
            Self::MaccorTsv => "TSV",
            Self::MaccorCsv => "CSV",
            Self::MaccorExcel => "EXCEL",
            Self::BiologicMpt => "MPT",
            Self::BiologicMpr => "MPR",
        }
    }

    pub fn encoding(self) -> &'static str {
        match self {
            Self::MaccorTsv | Self::MaccorCsv => "utf-8",
            Self::BiologicMpt => "latin-1",
            Self::MaccorExcel | Self::BiologicMpr => "binary",
        }
    }

    /// The tag set as strings, e.g. `["MACCOR", "TSV", "utf-8"]`.
    pub fn tags(self) -> [&'static str; 3] {
        [self.vendor(), self.sub_format(), self.encoding()]
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.sub_format(), self.vendor())
    }
}

/// Extension-level guess before sniffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtensionHint {
    DelimitedText,
    Spreadsheet,
    BiologicText,
    BiologicBinary,
}

impl ExtensionHint {
    fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "txt" | "csv" | "tsv" => Some(Self::DelimitedText),
            "xls" | "xlsx" => Some(Self::Spreadsheet),
            "mpt" => Some(Self::BiologicText),
            "mpr" => Some(Self::BiologicBinary),
            _ => None,
        }
    }
}

/// Classify `path` into a [`FormatTag`].
///
/// The extension decides which family is considered; content then resolves the exact tag
/// (a `.csv` that is really tab-delimited is `MaccorTsv`, a `.xls` that is really text is
/// treated as text, vendor preambles win over the extension). Returns
/// [`HarvestError::UnsupportedFileType`] for anything else.
pub fn classify(path: impl AsRef<Path>) -> HarvestResult<FormatTag> {
    let path = path.as_ref();
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| HarvestError::unsupported(path, "path has no extension"))?;
    let hint = ExtensionHint::from_extension(ext)
        .ok_or_else(|| HarvestError::unsupported(path, format!("unknown extension '{ext}'")))?;

    let prefix = read_prefix(path)?;
    classify_prefix(path, hint, &prefix)
}

fn read_prefix(path: &Path) -> HarvestResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(SNIFF_BYTES as usize);
    File::open(path)?.take(SNIFF_BYTES).read_to_end(&mut buf)?;
    Ok(buf)
}

fn classify_prefix(path: &Path, hint: ExtensionHint, prefix: &[u8]) -> HarvestResult<FormatTag> {
    if prefix.starts_with(MPR_MAGIC) {
        return Ok(FormatTag::BiologicMpr);
    }
    if prefix.starts_with(MPT_MAGIC) {
        return Ok(FormatTag::BiologicMpt);
    }

    match hint {
        ExtensionHint::BiologicBinary | ExtensionHint::BiologicText => Err(
            HarvestError::unsupported(path, "missing EC-Lab file preamble"),
        ),
        ExtensionHint::Spreadsheet if is_workbook(prefix) => Ok(FormatTag::MaccorExcel),
        // Some cyclers write tab-separated text under a spreadsheet extension.
        ExtensionHint::Spreadsheet | ExtensionHint::DelimitedText => sniff_delimiter(prefix)
            .ok_or_else(|| HarvestError::unsupported(path, "no tab or comma delimited header")),
    }
}

fn is_workbook(prefix: &[u8]) -> bool {
    prefix.starts_with(XLSX_MAGIC) || prefix.starts_with(XLS_MAGIC)
}

/// Choose tab vs comma from the first lines of the prefix.
fn sniff_delimiter(prefix: &[u8]) -> Option<FormatTag> {
    if prefix.contains(&0) {
        return None;
    }
    let (mut tabs, mut commas) = (0usize, 0usize);
    for line in prefix.split(|&b| b == b'\n').take(3) {
        tabs += line.iter().filter(|&&b| b == b'\t').count();
        commas += line.iter().filter(|&&b| b == b',').count();
    }
    match (tabs, commas) {
        (0, 0) => None,
        (t, c) if t >= c => Some(FormatTag::MaccorTsv),
        _ => Some(FormatTag::MaccorCsv),
    }
}
