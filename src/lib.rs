//! `cell-harvester` watches the output directories of battery cyclers and turns finished
//! instrument files into a canonical, long-format time series ready for bulk loading.
//!
//! The pipeline, leaves first:
//!
//! - [`monitor`]: polls monitored directories and gates when a file is stable enough to import
//! - [`ingestion::classify`]: maps a path to a closed [`ingestion::FormatTag`]
//! - [`ingestion::FormatAdapter`]: per-format metadata extraction and lazy row streaming
//! - [`processing::resolve()`]: decides which canonical columns are read and which are derived
//! - [`processing::DerivationEngine`]: row index, trapezoidal charge capacity and power, resumable
//!   from a [`processing::DerivationState`]
//! - [`sink`]: the transactional row sink contract and the tab-separated wire format
//! - [`harvest::Harvester`]: ties it together into poll/import cycles
//!
//! ## What you can harvest
//!
//! - **Maccor text**: tab- or comma-delimited exports, with or without the metadata line
//! - **Maccor spreadsheet** (Cargo feature `excel`, on by default): `.xls`, `.xlsx`
//! - **Bio-Logic EC-Lab ASCII**: `.mpt`
//! - **Bio-Logic EC-Lab binary**: `.mpr` (`VMP data` module)
//!
//! Extension is the first hint; content sniffing decides (a `.csv` holding tab-delimited Maccor
//! text is read as tab-delimited).
//!
//! ## Quick example: one harvest cycle
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cell_harvester::config::HarvesterConfig;
//! use cell_harvester::harvest::{DatasetMetadata, HarvestOptions, Harvester, ImportRequest};
//! use cell_harvester::monitor::{MemoryStateStore, ProcessTableDetector};
//! use cell_harvester::sink::MemoryRowSink;
//! use cell_harvester::types::{CanonicalColumn, ObservedFile};
//!
//! # fn main() -> Result<(), cell_harvester::HarvestError> {
//! let config = HarvesterConfig::from_json_path("harvester.json")?;
//! let harvester = Harvester::new(
//!     config,
//!     Arc::new(MemoryStateStore::new()),
//!     Arc::new(ProcessTableDetector::new()),
//!     HarvestOptions::default(),
//! )?;
//!
//! let mut next_id = 0;
//! let mut planner = |_: &ObservedFile, _: &DatasetMetadata| {
//!     next_id += 1;
//!     Some(ImportRequest::new(
//!         next_id,
//!         [CanonicalColumn::SampleNumber, CanonicalColumn::Volts, CanonicalColumn::ChargeCapacity],
//!     ))
//! };
//! let mut sink = MemoryRowSink::new();
//! let report = harvester.run_cycle(&mut planner, &mut sink)?;
//! println!("imported={}", report.imported.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`types`]: canonical columns, file lifecycle states, observed-file records
//! - [`error`]: error type used across the crate
//! - [`config`]: JSON harvester configuration
//! - [`ingestion::observability`]: observer hooks for transitions, imports and alerts

pub mod config;
pub mod error;
pub mod harvest;
pub mod ingestion;
pub mod monitor;
pub mod processing;
pub mod sink;
pub mod types;

pub use error::{HarvestError, HarvestResult};
