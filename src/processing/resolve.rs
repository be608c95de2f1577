//! Column resolution: which canonical columns are read from the file and which are derived.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{HarvestError, HarvestResult};
use crate::ingestion::{FileMetadata, FormatAdapter};
use crate::types::{CanonicalColumn, CanonicalValues, NativeRow, RawValue};

use super::derive::Derivation;

/// Caller-supplied mapping changes, keyed by native column name.
///
/// `Some(column)` maps (or remaps) a native column; `None` unmaps one the adapter maps by default.
/// Overrides take precedence over the adapter defaults.
pub type ColumnOverrides = BTreeMap<String, Option<CanonicalColumn>>;

/// One native column read from the file.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcedColumn {
    pub native: String,
    pub column: CanonicalColumn,
    /// Multiplier into the canonical unit.
    pub scale: f64,
}

/// Outcome of [`resolve`]: the read set, the derivations to run and the columns to emit.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnPlan {
    sourced: Vec<SourcedColumn>,
    derived: Vec<Derivation>,
    emitted: BTreeSet<CanonicalColumn>,
}

impl ColumnPlan {
    pub fn sourced(&self) -> &[SourcedColumn] {
        &self.sourced
    }

    /// Derivations in evaluation order.
    pub fn derived(&self) -> &[Derivation] {
        &self.derived
    }

    /// Requested columns, i.e. what each output sample carries.
    pub fn emitted(&self) -> &BTreeSet<CanonicalColumn> {
        &self.emitted
    }

    /// Native columns to request from [`FormatAdapter::stream_rows`].
    pub fn desired_native_columns(&self) -> BTreeSet<String> {
        self.sourced.iter().map(|s| s.native.clone()).collect()
    }

    /// Requested columns that the file cannot supply.
    pub fn unresolved(&self) -> BTreeSet<CanonicalColumn> {
        self.derived.iter().map(|d| d.target()).collect()
    }

    /// Convert one native row into canonical, unit-scaled values.
    ///
    /// `position` is the 1-based sample position in the file, used for error reporting.
    pub fn to_canonical(&self, position: usize, row: &NativeRow) -> HarvestResult<CanonicalValues> {
        let mut values = CanonicalValues::new();
        for s in &self.sourced {
            let value = row
                .get(&s.native)
                .unwrap_or(&RawValue::Empty)
                .as_number(position, &s.native)?
                .map(|v| if s.scale == 1.0 { v } else { v * s.scale });
            values.insert(s.column, value);
        }
        Ok(values)
    }
}

/// Plan how to fill `required` for a file described by `metadata`.
///
/// A column is sourced when some mapped native column carries numeric data. Everything else must
/// be derivable from sourced (or earlier derived) columns, otherwise this fails with
/// [`HarvestError::DataGeneration`] before any row is read.
pub fn resolve(
    required: &BTreeSet<CanonicalColumn>,
    overrides: &ColumnOverrides,
    adapter: &dyn FormatAdapter,
    metadata: &FileMetadata,
) -> HarvestResult<ColumnPlan> {
    if required.is_empty() {
        return Err(HarvestError::data_generation(
            "no columns requested, an import needs at least one canonical column",
        ));
    }

    let mut mapping = adapter.native_to_canonical();
    for (native, target) in overrides {
        match target {
            Some(column) => {
                mapping.insert(native.clone(), *column);
            }
            None => {
                mapping.remove(native);
            }
        }
    }

    // First numeric column in file order wins, unless an override names another one.
    let with_data = metadata.numeric_columns_with_data();
    let mut candidates: BTreeMap<CanonicalColumn, String> = BTreeMap::new();
    for info in &metadata.columns {
        let name = info.name.as_str();
        if !with_data.contains(name) {
            continue;
        }
        let Some(column) = mapping.get(name).copied() else {
            continue;
        };
        let is_override = |native: &str| matches!(overrides.get(native), Some(Some(_)));
        let replace = match candidates.get(&column) {
            None => true,
            Some(prev) => is_override(name) && !is_override(prev),
        };
        if replace {
            candidates.insert(column, name.to_owned());
        }
    }

    let mut available: BTreeSet<CanonicalColumn> = candidates.keys().copied().collect();
    let mut read: BTreeSet<CanonicalColumn> = required.intersection(&available).copied().collect();
    let mut derived = Vec::new();
    for derivation in Derivation::PRIORITY {
        let target = derivation.target();
        if !required.contains(&target) || available.contains(&target) {
            continue;
        }
        let missing: Vec<CanonicalColumn> = derivation
            .requires()
            .iter()
            .copied()
            .filter(|c| !available.contains(c))
            .collect();
        if !missing.is_empty() {
            return Err(HarvestError::data_generation(format!(
                "cannot derive {target}: missing {}",
                join_columns(missing)
            )));
        }
        for dep in derivation.requires() {
            if candidates.contains_key(dep) {
                read.insert(*dep);
            }
        }
        available.insert(target);
        derived.push(derivation);
    }

    let unfillable: Vec<CanonicalColumn> = required
        .iter()
        .copied()
        .filter(|c| !available.contains(c))
        .collect();
    if !unfillable.is_empty() {
        return Err(HarvestError::data_generation(format!(
            "required columns neither present nor derivable: {}",
            join_columns(unfillable)
        )));
    }

    let sourced = read
        .into_iter()
        .filter_map(|column| {
            candidates.get(&column).map(|native| SourcedColumn {
                scale: adapter.native_scale(native),
                native: native.clone(),
                column,
            })
        })
        .collect();

    Ok(ColumnPlan {
        sourced,
        derived,
        emitted: required.clone(),
    })
}

fn join_columns(columns: Vec<CanonicalColumn>) -> String {
    columns
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
