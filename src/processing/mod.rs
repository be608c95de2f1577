//! Turning native rows into complete canonical samples.
//!
//! - [`resolve()`]: decide which requested columns come from the file and which are derived
//! - [`DerivationEngine`]: fill in derived columns row by row, threading [`DerivationState`]
//!
//! ## Example: resolve → derive
//!
//! ```rust
//! use std::collections::{BTreeMap, BTreeSet};
//! use cell_harvester::ingestion::{maccor_text::MaccorText, ColumnInfo, FileMetadata, FormatTag};
//! use cell_harvester::processing::{resolve, ColumnOverrides, DerivationEngine, DerivationState};
//! use cell_harvester::types::{CanonicalColumn, NativeRow, RawValue};
//!
//! let metadata = FileMetadata {
//!     format: FormatTag::MaccorCsv,
//!     start_date: None,
//!     properties: BTreeMap::new(),
//!     columns: vec![
//!         ColumnInfo { name: "Test Time".into(), has_data: true, is_numeric: true },
//!         ColumnInfo { name: "Amps".into(), has_data: true, is_numeric: true },
//!     ],
//! };
//! let required: BTreeSet<_> = [CanonicalColumn::ChargeCapacity].into_iter().collect();
//! let plan = resolve(&required, &ColumnOverrides::new(), &MaccorText::comma(), &metadata).unwrap();
//! let engine = DerivationEngine::new(plan);
//!
//! let mut row = NativeRow::new();
//! row.insert("Test Time".into(), RawValue::Number(2.0));
//! row.insert("Amps".into(), RawValue::Number(1.5));
//! let values = engine.plan().to_canonical(1, &row).unwrap();
//! let (derived, _state) = engine.derive_row(1, values, DerivationState::fresh()).unwrap();
//! assert_eq!(derived.values[&CanonicalColumn::ChargeCapacity], Some(1.5));
//! ```

pub mod derive;
pub mod resolve;

pub use derive::{Derivation, DerivationEngine, DerivationState, DerivedRow};
pub use resolve::{resolve, ColumnOverrides, ColumnPlan, SourcedColumn};
