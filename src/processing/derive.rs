//! Incremental derivation of columns a source file does not carry.
//!
//! Derivations run per row in a fixed order, each one reading only sourced or earlier-derived
//! values. Everything carried between rows lives in [`DerivationState`], so an import can stop
//! after any row and continue later from a persisted state with identical results.

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, HarvestResult};
use crate::types::{CanonicalColumn, CanonicalRow, CanonicalValues};

use super::resolve::ColumnPlan;

/// A derivable column and its rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Derivation {
    /// Sample number from the stream position.
    RowIndex,
    /// Trapezoidal integral of current over test time.
    ChargeCapacity,
    /// `volts * amps`.
    Power,
}

impl Derivation {
    /// Evaluation order.
    pub const PRIORITY: [Derivation; 3] = [Self::RowIndex, Self::ChargeCapacity, Self::Power];

    pub fn target(self) -> CanonicalColumn {
        match self {
            Self::RowIndex => CanonicalColumn::SampleNumber,
            Self::ChargeCapacity => CanonicalColumn::ChargeCapacity,
            Self::Power => CanonicalColumn::Power,
        }
    }

    /// Columns that must be available in the same row.
    pub fn requires(self) -> &'static [CanonicalColumn] {
        match self {
            Self::RowIndex => &[],
            Self::ChargeCapacity => &[CanonicalColumn::TestTime, CanonicalColumn::Amps],
            Self::Power => &[CanonicalColumn::Volts, CanonicalColumn::Amps],
        }
    }
}

/// Scalars carried from one row to the next.
///
/// A fresh import starts from zeros. A resumed import starts from the state committed with the
/// last persisted row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivationState {
    pub prev_time: f64,
    pub prev_current: f64,
    /// Running integral of current over test time (A·s with canonical inputs).
    pub capacity: f64,
    /// Row index of the last row persisted before this session.
    pub start_row_index: u64,
}

impl DerivationState {
    pub fn fresh() -> Self {
        Self::default()
    }

    /// State after the last persisted row.
    pub fn resume(row_index: u64, test_time: f64, current: f64, capacity: f64) -> Self {
        Self {
            prev_time: test_time,
            prev_current: current,
            capacity,
            start_row_index: row_index,
        }
    }

    /// Row index of the sample at 1-based session `position`.
    pub fn row_index(&self, position: u64) -> u64 {
        self.start_row_index + position
    }

    /// Checkpoint describing the state after the sample at `position`.
    pub fn checkpoint_at(&self, position: u64) -> Self {
        Self {
            start_row_index: self.row_index(position),
            ..*self
        }
    }
}

/// One completed sample.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedRow {
    pub row_index: u64,
    /// Exactly the requested columns.
    pub values: CanonicalValues,
}

impl DerivedRow {
    /// Expand into long-layout rows, in column id order.
    pub fn into_canonical_rows(self, dataset_id: u64) -> impl Iterator<Item = CanonicalRow> {
        let row_index = self.row_index;
        self.values
            .into_iter()
            .map(move |(column, value)| CanonicalRow {
                dataset_id,
                row_index,
                column,
                value,
            })
    }
}

/// Applies a plan's derivations row by row.
#[derive(Debug, Clone)]
pub struct DerivationEngine {
    plan: ColumnPlan,
}

impl DerivationEngine {
    pub fn new(plan: ColumnPlan) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &ColumnPlan {
        &self.plan
    }

    /// Complete the sample at 1-based session `position`.
    ///
    /// `values` are the sourced columns of the row, as produced by [`ColumnPlan::to_canonical`].
    pub fn derive_row(
        &self,
        position: u64,
        mut values: CanonicalValues,
        state: DerivationState,
    ) -> HarvestResult<(DerivedRow, DerivationState)> {
        let mut next = state;
        let row_index = state.row_index(position);

        for derivation in self.plan.derived() {
            let value = match derivation {
                Derivation::RowIndex => row_index as f64,
                Derivation::ChargeCapacity => {
                    let time = require(&values, CanonicalColumn::TestTime, row_index)?;
                    let current = require(&values, CanonicalColumn::Amps, row_index)?;
                    next.capacity += ((next.prev_current + current) / 2.0) * (time - next.prev_time);
                    next.prev_current = current;
                    next.prev_time = time;
                    next.capacity
                }
                Derivation::Power => {
                    match (
                        values.get(&CanonicalColumn::Volts).copied().flatten(),
                        values.get(&CanonicalColumn::Amps).copied().flatten(),
                    ) {
                        (Some(v), Some(i)) => v * i,
                        _ => {
                            values.insert(CanonicalColumn::Power, None);
                            continue;
                        }
                    }
                }
            };
            values.insert(derivation.target(), Some(value));
        }

        let emitted = self.plan.emitted();
        values.retain(|column, _| emitted.contains(column));
        Ok((DerivedRow { row_index, values }, next))
    }
}

fn require(values: &CanonicalValues, column: CanonicalColumn, row_index: u64) -> HarvestResult<f64> {
    values.get(&column).copied().flatten().ok_or_else(|| {
        HarvestError::data_generation(format!(
            "row {row_index}: {column} is empty, cannot integrate charge capacity"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::{ColumnInfo, FileMetadata, FormatTag};
    use crate::ingestion::maccor_text::MaccorText;
    use crate::processing::resolve::{resolve, ColumnOverrides};
    use std::collections::{BTreeMap, BTreeSet};

    fn time_current_engine(required: &[CanonicalColumn]) -> DerivationEngine {
        let md = FileMetadata {
            format: FormatTag::MaccorCsv,
            start_date: None,
            properties: BTreeMap::new(),
            columns: ["Time", "Current"]
                .iter()
                .map(|n| ColumnInfo {
                    name: n.to_string(),
                    has_data: true,
                    is_numeric: true,
                })
                .collect(),
        };
        let mut overrides = ColumnOverrides::new();
        overrides.insert("Time".into(), Some(CanonicalColumn::TestTime));
        overrides.insert("Current".into(), Some(CanonicalColumn::Amps));
        let required: BTreeSet<_> = required.iter().copied().collect();
        DerivationEngine::new(resolve(&required, &overrides, &MaccorText::comma(), &md).unwrap())
    }

    fn sample(t: f64, i: f64) -> CanonicalValues {
        [
            (CanonicalColumn::TestTime, Some(t)),
            (CanonicalColumn::Amps, Some(i)),
        ]
        .into_iter()
        .collect()
    }

    fn derive_all(
        engine: &DerivationEngine,
        samples: &[(f64, f64)],
        mut state: DerivationState,
    ) -> (Vec<DerivedRow>, DerivationState) {
        let mut out = Vec::new();
        for (pos, (t, i)) in samples.iter().enumerate() {
            let (row, next) = engine.derive_row(pos as u64 + 1, sample(*t, *i), state).unwrap();
            out.push(row);
            state = next;
        }
        (out, state)
    }

    #[test]
    fn trapezoidal_capacity_over_three_samples() {
        let engine = time_current_engine(&[
            CanonicalColumn::SampleNumber,
            CanonicalColumn::TestTime,
            CanonicalColumn::Amps,
            CanonicalColumn::ChargeCapacity,
        ]);
        let (rows, _) = derive_all(&engine, &[(0.0, 0.0), (1.0, 2.0), (2.0, 4.0)], DerivationState::fresh());
        let caps: Vec<_> = rows
            .iter()
            .map(|r| r.values[&CanonicalColumn::ChargeCapacity].unwrap())
            .collect();
        assert_eq!(caps, vec![0.0, 1.0, 4.0]);
        let idx: Vec<_> = rows.iter().map(|r| r.row_index).collect();
        assert_eq!(idx, vec![1, 2, 3]);
        assert_eq!(rows[2].values[&CanonicalColumn::SampleNumber], Some(3.0));
    }

    #[test]
    fn resumed_derivation_is_bit_identical() {
        let engine = time_current_engine(&[
            CanonicalColumn::SampleNumber,
            CanonicalColumn::ChargeCapacity,
        ]);
        let samples: Vec<(f64, f64)> = (0..50)
            .map(|n| (n as f64 * 0.37, ((n * 7) % 11) as f64 * 0.013 - 0.05))
            .collect();
        let (full, _) = derive_all(&engine, &samples, DerivationState::fresh());

        for k in [1usize, 17, 49] {
            let (head, state) = derive_all(&engine, &samples[..k], DerivationState::fresh());
            let checkpoint = state.checkpoint_at(k as u64);
            let (tail, _) = derive_all(&engine, &samples[k..], checkpoint);
            let joined: Vec<_> = head.into_iter().chain(tail).collect();
            assert_eq!(joined, full, "split at {k}");
        }
    }

    #[test]
    fn unrequested_dependencies_are_not_emitted() {
        let engine = time_current_engine(&[CanonicalColumn::ChargeCapacity]);
        let (row, _) = engine
            .derive_row(1, sample(1.0, 1.0), DerivationState::fresh())
            .unwrap();
        assert_eq!(row.values.keys().copied().collect::<Vec<_>>(), vec![CanonicalColumn::ChargeCapacity]);
    }

    #[test]
    fn empty_current_fails_the_integration() {
        let engine = time_current_engine(&[CanonicalColumn::ChargeCapacity]);
        let mut values = sample(1.0, 0.0);
        values.insert(CanonicalColumn::Amps, None);
        let err = engine
            .derive_row(1, values, DerivationState::fresh())
            .unwrap_err();
        assert!(matches!(err, HarvestError::DataGeneration { .. }));
    }

    #[test]
    fn canonical_rows_follow_column_id_order() {
        let values: CanonicalValues = [
            (CanonicalColumn::ChargeCapacity, Some(1.0)),
            (CanonicalColumn::SampleNumber, Some(4.0)),
        ]
        .into_iter()
        .collect();
        let rows: Vec<_> = DerivedRow { row_index: 4, values }.into_canonical_rows(9).collect();
        assert_eq!(rows[0].column, CanonicalColumn::SampleNumber);
        assert_eq!(rows[1].column, CanonicalColumn::ChargeCapacity);
        assert!(rows.iter().all(|r| r.dataset_id == 9 && r.row_index == 4));
    }
}
