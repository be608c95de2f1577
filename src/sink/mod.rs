//! Destination of canonical rows.
//!
//! A [`RowSink`] receives the rows of one dataset in row-index order and makes them durable on
//! [`RowSink::commit`], together with the [`DerivationState`] reached after the last committed
//! sample. Rows accepted but not committed are discarded by [`RowSink::abort`]. Re-running an
//! import seeded with [`RowSink::checkpoint`] therefore neither duplicates nor skips a row.
//!
//! A sink opened after a restart learns where the destination stopped through
//! `with_checkpoint`, using the checkpoint persisted with the last commit.

pub mod wire;

use std::collections::BTreeMap;
use std::io::Write;

use crate::error::{HarvestError, HarvestResult};
use crate::processing::DerivationState;
use crate::types::CanonicalRow;

/// Transactional consumer of canonical rows.
pub trait RowSink {
    /// Stage one row. Rows of a dataset arrive grouped by row index, indices increasing by one.
    fn accept(&mut self, row: CanonicalRow) -> HarvestResult<()>;

    /// Make staged rows of `dataset_id` durable, recording `checkpoint` alongside them.
    fn commit(&mut self, dataset_id: u64, checkpoint: DerivationState) -> HarvestResult<()>;

    /// Drop rows staged since the last commit.
    fn abort(&mut self, dataset_id: u64) -> HarvestResult<()>;

    /// State after the last committed sample of `dataset_id`, if anything was committed.
    fn checkpoint(&self, dataset_id: u64) -> HarvestResult<Option<DerivationState>>;
}

/// Row-index bookkeeping shared by the sinks.
#[derive(Debug, Default, Clone)]
struct Watermark {
    committed: Option<DerivationState>,
    /// Highest row index staged since the last commit.
    staged: Option<u64>,
}

impl Watermark {
    fn resumed(checkpoint: DerivationState) -> Self {
        Self {
            committed: Some(checkpoint),
            staged: None,
        }
    }

    fn committed_index(&self) -> u64 {
        self.committed.map(|c| c.start_row_index).unwrap_or(0)
    }

    fn admit(&mut self, row: &CanonicalRow) -> HarvestResult<()> {
        let current = self.staged.unwrap_or_else(|| self.committed_index());
        if row.row_index <= self.committed_index() {
            return Err(sink_error(format!(
                "dataset {}: row {} is already committed",
                row.dataset_id, row.row_index
            )));
        }
        if row.row_index != current && row.row_index != current + 1 {
            return Err(sink_error(format!(
                "dataset {}: row {} out of order (expected {} or {})",
                row.dataset_id,
                row.row_index,
                current,
                current + 1
            )));
        }
        self.staged = Some(row.row_index);
        Ok(())
    }

    fn commit(&mut self, dataset_id: u64, checkpoint: DerivationState) -> HarvestResult<()> {
        let staged = self.staged.unwrap_or_else(|| self.committed_index());
        if checkpoint.start_row_index != staged {
            return Err(sink_error(format!(
                "dataset {dataset_id}: checkpoint row {} does not match staged row {staged}",
                checkpoint.start_row_index
            )));
        }
        self.committed = Some(checkpoint);
        self.staged = None;
        Ok(())
    }
}

fn sink_error(message: String) -> HarvestError {
    HarvestError::Sink { message }
}

/// Keeps committed rows in memory.
#[derive(Debug, Default)]
pub struct MemoryRowSink {
    committed: BTreeMap<u64, Vec<CanonicalRow>>,
    staged: BTreeMap<u64, Vec<CanonicalRow>>,
    marks: BTreeMap<u64, Watermark>,
}

impl MemoryRowSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat `dataset_id` as committed up to `checkpoint`.
    pub fn with_checkpoint(mut self, dataset_id: u64, checkpoint: DerivationState) -> Self {
        self.marks.insert(dataset_id, Watermark::resumed(checkpoint));
        self
    }

    /// Committed rows of `dataset_id`, in arrival order.
    pub fn rows(&self, dataset_id: u64) -> &[CanonicalRow] {
        self.committed
            .get(&dataset_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of rows staged but not yet committed.
    pub fn pending(&self, dataset_id: u64) -> usize {
        self.staged.get(&dataset_id).map(Vec::len).unwrap_or(0)
    }
}

impl RowSink for MemoryRowSink {
    fn accept(&mut self, row: CanonicalRow) -> HarvestResult<()> {
        self.marks.entry(row.dataset_id).or_default().admit(&row)?;
        self.staged.entry(row.dataset_id).or_default().push(row);
        Ok(())
    }

    fn commit(&mut self, dataset_id: u64, checkpoint: DerivationState) -> HarvestResult<()> {
        self.marks
            .entry(dataset_id)
            .or_default()
            .commit(dataset_id, checkpoint)?;
        let staged = self.staged.remove(&dataset_id).unwrap_or_default();
        self.committed.entry(dataset_id).or_default().extend(staged);
        Ok(())
    }

    fn abort(&mut self, dataset_id: u64) -> HarvestResult<()> {
        self.staged.remove(&dataset_id);
        if let Some(mark) = self.marks.get_mut(&dataset_id) {
            mark.staged = None;
        }
        Ok(())
    }

    fn checkpoint(&self, dataset_id: u64) -> HarvestResult<Option<DerivationState>> {
        Ok(self.marks.get(&dataset_id).and_then(|m| m.committed))
    }
}

/// Writes committed rows in the [`wire`] format, e.g. into a bulk-load pipe.
///
/// Rows are buffered until commit, so an aborted import leaves nothing in `out`.
#[derive(Debug)]
pub struct TsvRowSink<W: Write> {
    out: W,
    staged: BTreeMap<u64, Vec<CanonicalRow>>,
    marks: BTreeMap<u64, Watermark>,
    written: u64,
}

impl<W: Write> TsvRowSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            staged: BTreeMap::new(),
            marks: BTreeMap::new(),
            written: 0,
        }
    }

    /// Continue a dataset whose rows up to `checkpoint` were written by an earlier sink.
    pub fn with_checkpoint(mut self, dataset_id: u64, checkpoint: DerivationState) -> Self {
        self.marks.insert(dataset_id, Watermark::resumed(checkpoint));
        self
    }

    /// Rows written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> RowSink for TsvRowSink<W> {
    fn accept(&mut self, row: CanonicalRow) -> HarvestResult<()> {
        self.marks.entry(row.dataset_id).or_default().admit(&row)?;
        self.staged.entry(row.dataset_id).or_default().push(row);
        Ok(())
    }

    fn commit(&mut self, dataset_id: u64, checkpoint: DerivationState) -> HarvestResult<()> {
        let mark = self.marks.entry(dataset_id).or_default();
        let mut trial = mark.clone();
        trial.commit(dataset_id, checkpoint)?;
        let staged = self.staged.remove(&dataset_id).unwrap_or_default();
        self.written += wire::write_rows(&mut self.out, &staged)?;
        *mark = trial;
        Ok(())
    }

    fn abort(&mut self, dataset_id: u64) -> HarvestResult<()> {
        self.staged.remove(&dataset_id);
        if let Some(mark) = self.marks.get_mut(&dataset_id) {
            mark.staged = None;
        }
        Ok(())
    }

    fn checkpoint(&self, dataset_id: u64) -> HarvestResult<Option<DerivationState>> {
        Ok(self.marks.get(&dataset_id).and_then(|m| m.committed))
    }
}
