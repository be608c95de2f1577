//! Bio-Logic EC-Lab binary modular files (`.mpr`).
//!
//! A file is a fixed preamble followed by modules:
//!
//! ```text
//! "MODULE" | short name [10] | long name [25] | length u32 | version u32 | date [8] | data [length]
//! ```
//!
//! Only the `VMP data` module is read. It starts with the point count (`u32`), the column count
//! (`u8`) and a table of column ids (`u8` for version 0, `u16` otherwise); fixed-width
//! little-endian records follow at offset 100 (version 0) or 405 (versions 2 and 3). Flag ids
//! share one leading bitfield byte.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use chrono::NaiveDate;

use crate::error::{HarvestError, HarvestResult};
use crate::types::{NativeRow, RawValue};

use super::biologic_mpt::{biologic_column_mapping, biologic_scale, latin1};
use super::classify::MPR_MAGIC;
use super::{ColumnInfo, ColumnMapping, FileMetadata, FormatAdapter, FormatTag, RowStream};

pub(crate) const PREAMBLE_LEN: u64 = 0x34;
pub(crate) const MODULE_TAG: &[u8] = b"MODULE";
const MODULE_HEADER_LEN: usize = 10 + 25 + 4 + 4 + 8;
const DATA_MODULE: &str = "VMP data";

/// Storage of one column inside a record.
#[derive(Debug, Clone, Copy, PartialEq)]
enum FieldKind {
    /// Bits of the shared leading flags byte.
    Flag(u8),
    F32,
    F64,
    U16,
}

impl FieldKind {
    fn width(self) -> usize {
        match self {
            Self::Flag(_) => 0,
            Self::F32 => 4,
            Self::F64 => 8,
            Self::U16 => 2,
        }
    }
}

fn column_spec(id: u16) -> Option<(&'static str, FieldKind)> {
    let spec = match id {
        1 => ("mode", FieldKind::Flag(0x03)),
        2 => ("ox/red", FieldKind::Flag(0x04)),
        3 => ("error", FieldKind::Flag(0x08)),
        21 => ("control changes", FieldKind::Flag(0x10)),
        31 => ("Ns changes", FieldKind::Flag(0x20)),
        65 => ("counter inc.", FieldKind::Flag(0x80)),
        4 => ("time/s", FieldKind::F64),
        5 => ("control/V/mA", FieldKind::F32),
        6 => ("Ewe/V", FieldKind::F32),
        7 => ("dq/mA.h", FieldKind::F64),
        8 => ("I/mA", FieldKind::F32),
        9 => ("Ece/V", FieldKind::F32),
        11 => ("<I>/mA", FieldKind::F64),
        13 => ("(Q-Qo)/mA.h", FieldKind::F64),
        19 => ("control/V", FieldKind::F32),
        20 => ("control/mA", FieldKind::F32),
        23 => ("dQ/mA.h", FieldKind::F64),
        24 => ("cycle number", FieldKind::F64),
        39 => ("I Range", FieldKind::U16),
        70 => ("P/W", FieldKind::F32),
        74 => ("Energy/W.h", FieldKind::F64),
        76 => ("<I>/mA", FieldKind::F32),
        77 => ("<Ewe>/V", FieldKind::F32),
        131 => ("Ns", FieldKind::U16),
        _ => return None,
    };
    Some(spec)
}

#[derive(Debug, Clone)]
struct Field {
    name: &'static str,
    kind: FieldKind,
    offset: usize,
}

/// Decoded layout of the `VMP data` module.
#[derive(Debug, Clone)]
struct DataLayout {
    version: u32,
    date: Option<NaiveDate>,
    n_points: u64,
    fields: Vec<Field>,
    record_len: usize,
    /// Absolute offset of the first record.
    records_at: u64,
}

impl DataLayout {
    fn from_column_ids(ids: &[u16]) -> Result<(Vec<Field>, usize), u16> {
        let mut fields = Vec::with_capacity(ids.len());
        let mut flags_at: Option<usize> = None;
        let mut offset = 0usize;
        for &id in ids {
            let (name, kind) = column_spec(id).ok_or(id)?;
            let at = match kind {
                FieldKind::Flag(_) => *flags_at.get_or_insert_with(|| {
                    offset += 1;
                    offset - 1
                }),
                _ => {
                    offset += kind.width();
                    offset - kind.width()
                }
            };
            fields.push(Field {
                name,
                kind,
                offset: at,
            });
        }
        Ok((fields, offset))
    }

    fn decode(&self, record: &[u8], field: &Field) -> f64 {
        let at = field.offset;
        match field.kind {
            FieldKind::Flag(mask) => {
                let bits = record[at] & mask;
                f64::from(bits >> mask.trailing_zeros())
            }
            FieldKind::F32 => f64::from(f32::from_le_bytes([
                record[at],
                record[at + 1],
                record[at + 2],
                record[at + 3],
            ])),
            FieldKind::F64 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&record[at..at + 8]);
                f64::from_le_bytes(b)
            }
            FieldKind::U16 => f64::from(u16::from_le_bytes([record[at], record[at + 1]])),
        }
    }
}

struct ModuleHeader {
    short_name: String,
    long_name: String,
    length: u64,
    version: u32,
    date: String,
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_module_header(reader: &mut impl Read) -> HarvestResult<Option<ModuleHeader>> {
    let mut tag = [0u8; 6];
    match reader.read_exact(&mut tag) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if &tag[..] != MODULE_TAG {
        return Ok(None);
    }
    let mut hdr = [0u8; MODULE_HEADER_LEN];
    reader.read_exact(&mut hdr)?;
    Ok(Some(ModuleHeader {
        short_name: latin1(&hdr[0..10]).trim().to_owned(),
        long_name: latin1(&hdr[10..35]).trim().to_owned(),
        length: u64::from(read_u32(&hdr[35..39])),
        version: read_u32(&hdr[39..43]),
        date: latin1(&hdr[43..51]).trim().to_owned(),
    }))
}

/// Adapter for [`FormatTag::BiologicMpr`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BiologicMpr;

impl BiologicMpr {
    fn read_layout(
        path: &Path,
        file: &mut File,
    ) -> HarvestResult<(DataLayout, BTreeMap<String, String>)> {
        let file_len = file.metadata()?.len();
        let mut magic = [0u8; 22];
        file.read_exact(&mut magic)
            .map_err(|_| HarvestError::unsupported(path, "file shorter than preamble"))?;
        if &magic[..] != MPR_MAGIC {
            return Err(HarvestError::unsupported(path, "missing BIO-LOGIC MODULAR FILE preamble"));
        }
        file.seek(SeekFrom::Start(PREAMBLE_LEN))?;

        let mut properties = BTreeMap::new();
        let mut modules = Vec::new();
        let mut layout = None;
        let mut pos = PREAMBLE_LEN;
        while let Some(module) = read_module_header(file)? {
            let data_at = pos + (MODULE_TAG.len() + MODULE_HEADER_LEN) as u64;
            if data_at + module.length > file_len {
                return Err(HarvestError::unsupported(
                    path,
                    format!("module '{}' truncated", module.short_name),
                ));
            }
            modules.push(module.short_name.clone());
            if !module.long_name.is_empty() {
                properties.insert(format!("module.{}", module.short_name), module.long_name.clone());
            }
            if module.short_name == DATA_MODULE {
                layout = Some(Self::read_data_header(path, file, &module, data_at)?);
            }
            pos = data_at + module.length;
            file.seek(SeekFrom::Start(pos))?;
        }

        let layout = layout
            .ok_or_else(|| HarvestError::unsupported(path, "no 'VMP data' module"))?;
        properties.insert("modules".to_string(), modules.join(","));
        properties.insert("data_version".to_string(), layout.version.to_string());
        properties.insert("points".to_string(), layout.n_points.to_string());
        Ok((layout, properties))
    }

    fn read_data_header(
        path: &Path,
        file: &mut File,
        module: &ModuleHeader,
        data_at: u64,
    ) -> HarvestResult<DataLayout> {
        let (id_width, records_rel): (usize, u64) = match module.version {
            0 => (1, 100),
            2 | 3 => (2, 405),
            v => {
                return Err(HarvestError::unsupported(
                    path,
                    format!("unsupported data module version {v}"),
                ));
            }
        };
        if module.length < records_rel {
            return Err(HarvestError::unsupported(path, "data module shorter than its header"));
        }
        let mut head = vec![0u8; records_rel as usize];
        file.read_exact(&mut head)?;
        let n_points = u64::from(read_u32(&head[0..4]));
        let n_columns = head[4] as usize;
        if 5 + n_columns * id_width > head.len() {
            return Err(HarvestError::unsupported(path, "column table overflows header"));
        }
        let ids: Vec<u16> = (0..n_columns)
            .map(|i| {
                let at = 5 + i * id_width;
                if id_width == 1 {
                    u16::from(head[at])
                } else {
                    u16::from_le_bytes([head[at], head[at + 1]])
                }
            })
            .collect();
        let (fields, record_len) = DataLayout::from_column_ids(&ids).map_err(|id| {
            HarvestError::unsupported(path, format!("unknown column id {id}"))
        })?;
        if records_rel + n_points * record_len as u64 > module.length {
            return Err(HarvestError::unsupported(
                path,
                format!("data module holds fewer than {n_points} records"),
            ));
        }
        Ok(DataLayout {
            version: module.version,
            date: NaiveDate::parse_from_str(&module.date, "%m/%d/%y").ok(),
            n_points,
            fields,
            record_len,
            records_at: data_at + records_rel,
        })
    }
}

impl FormatAdapter for BiologicMpr {
    fn format(&self) -> FormatTag {
        FormatTag::BiologicMpr
    }

    fn load_metadata(&self, path: &Path) -> HarvestResult<FileMetadata> {
        let mut file = File::open(path)?;
        let (layout, properties) = Self::read_layout(path, &mut file)?;
        let has_data = layout.n_points > 0;
        Ok(FileMetadata {
            format: FormatTag::BiologicMpr,
            start_date: layout.date.and_then(|d| d.and_hms_opt(0, 0, 0)),
            properties,
            columns: layout
                .fields
                .iter()
                .map(|f| ColumnInfo {
                    name: f.name.to_string(),
                    has_data,
                    is_numeric: has_data,
                })
                .collect(),
        })
    }

    fn native_to_canonical(&self) -> ColumnMapping {
        biologic_column_mapping()
    }

    fn native_scale(&self, native: &str) -> f64 {
        biologic_scale(native)
    }

    fn stream_rows(&self, path: &Path, columns: &BTreeSet<String>) -> HarvestResult<RowStream> {
        let mut file = File::open(path)?;
        let (layout, _) = Self::read_layout(path, &mut file)?;
        let projection = columns
            .iter()
            .map(|name| {
                layout
                    .fields
                    .iter()
                    .find(|f| f.name == name.as_str())
                    .cloned()
                    .ok_or_else(|| {
                        HarvestError::unsupported(path, format!("missing column '{name}'"))
                    })
            })
            .collect::<HarvestResult<Vec<_>>>()?;
        file.seek(SeekFrom::Start(layout.records_at))?;
        Ok(Box::new(MprRows {
            reader: BufReader::new(file),
            buf: vec![0u8; layout.record_len],
            remaining: layout.n_points,
            layout,
            projection,
        }))
    }
}

struct MprRows {
    reader: BufReader<File>,
    buf: Vec<u8>,
    remaining: u64,
    layout: DataLayout,
    projection: Vec<Field>,
}

impl Iterator for MprRows {
    type Item = HarvestResult<NativeRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        if let Err(e) = self.reader.read_exact(&mut self.buf) {
            self.remaining = 0;
            return Some(Err(e.into()));
        }
        let row = self
            .projection
            .iter()
            .map(|f| {
                (
                    f.name.to_string(),
                    RawValue::Number(self.layout.decode(&self.buf, f)),
                )
            })
            .collect();
        Some(Ok(row))
    }
}
