//! Persistence of [`ObservedFile`] records.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{HarvestError, HarvestResult};
use crate::types::{FileState, ObservedFile, ObservedFileKey};

/// Shared store of observed files, keyed by monitored path and relative path.
///
/// Every write is conditional on the state the writer last saw, so concurrent pollers and
/// importers never overwrite each other blindly. A write that would change the state along an
/// edge [`FileState::can_transition_to`] does not allow is refused like a failed condition.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &ObservedFileKey) -> HarvestResult<Option<ObservedFile>>;

    /// Insert `file`, or update size, times and state of the existing record in one step.
    ///
    /// With `expected = None` the record must not exist yet; with `Some(state)` the stored state
    /// must equal `state`. Returns `false` (and writes nothing) when the condition fails.
    fn upsert(&self, file: &ObservedFile, expected: Option<FileState>) -> HarvestResult<bool>;

    /// Move `key` from `from` to `to` if it is still in `from`.
    fn compare_and_set_state(
        &self,
        key: &ObservedFileKey,
        from: FileState,
        to: FileState,
    ) -> HarvestResult<bool>;

    /// Replace the stored error text.
    fn record_error(&self, key: &ObservedFileKey, error: Option<String>) -> HarvestResult<()>;

    /// Files of one monitored path whose state is one of `states`, ordered by relative path.
    fn files_in_state(
        &self,
        monitored_path_id: u64,
        states: &[FileState],
    ) -> HarvestResult<Vec<ObservedFile>>;
}

/// In-process [`StateStore`].
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    files: Mutex<BTreeMap<ObservedFileKey, ObservedFile>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> HarvestResult<std::sync::MutexGuard<'_, BTreeMap<ObservedFileKey, ObservedFile>>> {
        self.files.lock().map_err(|_| HarvestError::StateStore {
            message: "lock poisoned".to_string(),
        })
    }

    /// Every record, ordered by key.
    pub fn snapshot(&self) -> HarvestResult<Vec<ObservedFile>> {
        Ok(self.lock()?.values().cloned().collect())
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &ObservedFileKey) -> HarvestResult<Option<ObservedFile>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn upsert(&self, file: &ObservedFile, expected: Option<FileState>) -> HarvestResult<bool> {
        let mut files = self.lock()?;
        if !files.contains_key(&file.key) {
            if expected.is_some() {
                return Ok(false);
            }
            files.insert(file.key.clone(), file.clone());
            return Ok(true);
        }
        match (files.get_mut(&file.key), expected) {
            (Some(existing), Some(state))
                if existing.state == state && is_allowed(state, file.state) =>
            {
                existing.last_observed_size = file.last_observed_size;
                existing.last_observed_time = file.last_observed_time;
                existing.size_changed_at = file.size_changed_at;
                existing.state = file.state;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn compare_and_set_state(
        &self,
        key: &ObservedFileKey,
        from: FileState,
        to: FileState,
    ) -> HarvestResult<bool> {
        let mut files = self.lock()?;
        match files.get_mut(key) {
            Some(f) if f.state == from && is_allowed(from, to) => {
                f.state = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn record_error(&self, key: &ObservedFileKey, error: Option<String>) -> HarvestResult<()> {
        if let Some(f) = self.lock()?.get_mut(key) {
            f.last_error = error;
        }
        Ok(())
    }

    fn files_in_state(
        &self,
        monitored_path_id: u64,
        states: &[FileState],
    ) -> HarvestResult<Vec<ObservedFile>> {
        Ok(self
            .lock()?
            .values()
            .filter(|f| f.key.monitored_path_id == monitored_path_id && states.contains(&f.state))
            .cloned()
            .collect())
    }
}

/// Same-state writes only refresh sizes and times.
fn is_allowed(from: FileState, to: FileState) -> bool {
    from == to || from.can_transition_to(to)
}
