//! The harvest loop: poll monitored paths, then import every file that became eligible.
//!
//! One import runs in lockstep, one row at a time:
//!
//! ```text
//! classify → adapter.load_metadata → planner → resolve → stream_rows → derive_row → sink
//! ```
//!
//! - a file must be `STABLE` or `RETRY_IMPORT`, otherwise [`HarvestError::FileStateConflict`]
//! - classification and metadata failures leave the lifecycle state untouched
//! - once the file is `IMPORTING`, any failure ends in `IMPORT_FAILED` with the error text stored
//!   on the record, and rows the sink had not committed are aborted
//!
//! When an observer is configured, the harvester reports:
//!
//! - `on_transition` for every state change it or the monitor makes
//! - `on_success` with sample/row counts
//! - `on_failure` with a computed severity, plus `on_alert` at or above `alert_at_or_above`

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::config::HarvesterConfig;
use crate::error::{HarvestError, HarvestResult};
use crate::ingestion::{
    classify, open_adapter, FileMetadata, FormatAdapter, FormatTag, HarvestContext,
    HarvestObserver, HarvestSeverity, HarvestStats, TracingObserver,
};
use crate::monitor::{OpenHandleDetector, PathMonitor, StateStore, Transition};
use crate::processing::{resolve, ColumnOverrides, DerivationEngine, DerivationState};
use crate::sink::RowSink;
use crate::types::{CanonicalColumn, FileState, MonitoredPath, ObservedFile, ObservedFileKey};

/// What to import a file as.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRequest {
    pub dataset_id: u64,
    /// Canonical columns every output sample carries.
    pub required: BTreeSet<CanonicalColumn>,
    pub overrides: ColumnOverrides,
    /// Continue after a previously committed sample instead of starting fresh.
    pub resume: Option<DerivationState>,
}

impl ImportRequest {
    pub fn new(dataset_id: u64, required: impl IntoIterator<Item = CanonicalColumn>) -> Self {
        Self {
            dataset_id,
            required: required.into_iter().collect(),
            overrides: ColumnOverrides::new(),
            resume: None,
        }
    }

    pub fn with_override(mut self, native: impl Into<String>, column: Option<CanonicalColumn>) -> Self {
        self.overrides.insert(native.into(), column);
        self
    }

    pub fn resume_from(mut self, checkpoint: Option<DerivationState>) -> Self {
        self.resume = checkpoint;
        self
    }
}

/// Metadata extracted for a file about to be imported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetMetadata {
    pub key: ObservedFileKey,
    pub path: PathBuf,
    pub size: u64,
    #[serde(flatten)]
    pub file: FileMetadata,
}

impl DatasetMetadata {
    pub fn format(&self) -> FormatTag {
        self.file.format
    }
}

/// Decides whether and how an eligible file is imported.
///
/// This is where a caller registers the dataset with its own catalogue and picks the columns.
/// Returning `Ok(None)` leaves the file in its current state for a later cycle.
pub trait ImportPlanner {
    fn plan(&mut self, file: &ObservedFile, metadata: &DatasetMetadata) -> HarvestResult<Option<ImportRequest>>;
}

impl<F> ImportPlanner for F
where
    F: FnMut(&ObservedFile, &DatasetMetadata) -> Option<ImportRequest>,
{
    fn plan(&mut self, file: &ObservedFile, metadata: &DatasetMetadata) -> HarvestResult<Option<ImportRequest>> {
        Ok(self(file, metadata))
    }
}

/// Result of a completed import.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportOutcome {
    pub dataset_id: u64,
    pub metadata: DatasetMetadata,
    /// Samples derived in this session (excludes rows skipped on resume).
    pub samples: u64,
    /// Canonical rows handed to the sink.
    pub rows: u64,
    /// State after the last committed sample.
    pub checkpoint: DerivationState,
}

/// Tally of one or more harvest cycles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub files_seen: usize,
    pub stabilized: usize,
    pub imported: Vec<ImportOutcome>,
    /// Files left as they were: unsupported, declined by the planner, or raced by another worker.
    pub skipped: usize,
    pub failed: usize,
    /// Monitored paths that could not be polled.
    pub unreadable_paths: usize,
}

impl CycleReport {
    pub fn merge(&mut self, other: CycleReport) {
        self.files_seen += other.files_seen;
        self.stabilized += other.stabilized;
        self.imported.extend(other.imported);
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.unreadable_paths += other.unreadable_paths;
    }
}

/// Observer wiring for a [`Harvester`].
#[derive(Clone)]
pub struct HarvestOptions {
    /// Optional observer for logging/alerts; defaults to [`TracingObserver`].
    pub observer: Option<Arc<dyn HarvestObserver>>,
    /// Severity threshold at which `on_alert` is invoked.
    pub alert_at_or_above: HarvestSeverity,
}

impl fmt::Debug for HarvestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarvestOptions")
            .field("observer_set", &self.observer.is_some())
            .field("alert_at_or_above", &self.alert_at_or_above)
            .finish()
    }
}

impl Default for HarvestOptions {
    fn default() -> Self {
        Self {
            observer: Some(Arc::new(TracingObserver)),
            alert_at_or_above: HarvestSeverity::Critical,
        }
    }
}

/// One harvester process: its configuration, state store and observers.
#[derive(Debug)]
pub struct Harvester {
    config: HarvesterConfig,
    monitor: PathMonitor,
    options: HarvestOptions,
}

impl Harvester {
    pub fn new(
        config: HarvesterConfig,
        store: Arc<dyn StateStore>,
        detector: Arc<dyn OpenHandleDetector>,
        options: HarvestOptions,
    ) -> HarvestResult<Self> {
        config.validate()?;
        let monitor = PathMonitor::new(store, detector)
            .with_in_use_deferral_factor(config.in_use_deferral_factor);
        Ok(Self {
            config,
            monitor,
            options,
        })
    }

    pub fn config(&self) -> &HarvesterConfig {
        &self.config
    }

    pub fn monitor(&self) -> &PathMonitor {
        &self.monitor
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        self.monitor.store()
    }

    /// Run up to `max_cycles` cycles (forever with `None`), sleeping between them.
    pub fn run(
        &self,
        planner: &mut dyn ImportPlanner,
        sink: &mut dyn RowSink,
        max_cycles: Option<usize>,
    ) -> HarvestResult<CycleReport> {
        let mut total = CycleReport::default();
        let mut cycle = 0usize;
        loop {
            total.merge(self.run_cycle(planner, sink)?);
            cycle += 1;
            if max_cycles.is_some_and(|max| cycle >= max) {
                return Ok(total);
            }
            debug!(sleep_secs = self.config.sleep_time_secs, "sleeping until next cycle");
            std::thread::sleep(self.config.sleep_time());
        }
    }

    /// Poll every owned path once, then import what is eligible.
    ///
    /// Per-file failures are reported and counted; only state store failures abort the cycle.
    pub fn run_cycle(
        &self,
        planner: &mut dyn ImportPlanner,
        sink: &mut dyn RowSink,
    ) -> HarvestResult<CycleReport> {
        let mut report = CycleReport::default();
        for monitored in self.config.own_paths() {
            let _span = info_span!("path", id = monitored.id, root = %monitored.path.display()).entered();
            match self.monitor.poll(monitored) {
                Ok(polled) => {
                    report.files_seen += polled.len();
                    for (file, transition) in &polled {
                        self.report_transition(monitored, file, *transition);
                        if *transition == Transition::Stabilized {
                            report.stabilized += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "monitored path could not be polled");
                    report.unreadable_paths += 1;
                    continue;
                }
            }

            let eligible = self
                .store()
                .files_in_state(monitored.id, &[FileState::Stable, FileState::RetryImport])?;
            for file in eligible {
                match self.import_file(monitored, &file.key, planner, sink) {
                    Ok(Some(outcome)) => report.imported.push(outcome),
                    Ok(None) => report.skipped += 1,
                    Err(HarvestError::StateStore { message }) => {
                        return Err(HarvestError::StateStore { message });
                    }
                    Err(e) if e.is_recoverable() => report.skipped += 1,
                    Err(_) => report.failed += 1,
                }
            }
        }
        info!(
            seen = report.files_seen,
            imported = report.imported.len(),
            failed = report.failed,
            "harvest cycle complete"
        );
        Ok(report)
    }

    /// Queue an `IMPORTED` or `IMPORT_FAILED` file for another import.
    pub fn request_retry(&self, key: &ObservedFileKey) -> HarvestResult<bool> {
        for from in [FileState::ImportFailed, FileState::Imported] {
            if self
                .store()
                .compare_and_set_state(key, from, FileState::RetryImport)?
            {
                info!(file = %key.relative_path, %from, "queued for retry");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Import one observed file of `monitored`.
    ///
    /// Returns `Ok(None)` when the planner declines the file.
    pub fn import_file(
        &self,
        monitored: &MonitoredPath,
        key: &ObservedFileKey,
        planner: &mut dyn ImportPlanner,
        sink: &mut dyn RowSink,
    ) -> HarvestResult<Option<ImportOutcome>> {
        let path = key.resolve(&monitored.path);
        let _span = info_span!("import", file = %key.relative_path).entered();
        let mut ctx = HarvestContext {
            key: key.clone(),
            path: path.clone(),
            format: None,
        };

        let record = self.store().get(key)?.ok_or_else(|| HarvestError::StateStore {
            message: format!("no record for {}", path.display()),
        })?;
        if !record.state.is_importable() {
            return Err(self.fail(&ctx, HarvestError::FileStateConflict {
                path,
                state: record.state,
            }));
        }

        let (adapter, metadata) = match inspect(&path) {
            Ok(found) => found,
            Err(e) => return Err(self.fail(&ctx, e)),
        };
        ctx.format = Some(adapter.format());
        let metadata = DatasetMetadata {
            key: key.clone(),
            path: path.clone(),
            size: record.last_observed_size,
            file: metadata,
        };

        let Some(request) = planner.plan(&record, &metadata)? else {
            debug!("planner declined file");
            return Ok(None);
        };

        if !self
            .store()
            .compare_and_set_state(key, record.state, FileState::Importing)?
        {
            let state = self.store().get(key)?.map(|f| f.state).unwrap_or(record.state);
            return Err(self.fail(&ctx, HarvestError::FileStateConflict { path, state }));
        }
        self.notify_transition(&ctx, Some(record.state), FileState::Importing);

        match self.stream_into(adapter.as_ref(), &metadata, &request, sink) {
            Ok((samples, rows, checkpoint)) => {
                self.finish(key, FileState::Imported, None)?;
                self.notify_transition(&ctx, Some(FileState::Importing), FileState::Imported);
                if let Some(obs) = self.options.observer.as_ref() {
                    obs.on_success(&ctx, HarvestStats { samples, rows });
                }
                Ok(Some(ImportOutcome {
                    dataset_id: request.dataset_id,
                    metadata,
                    samples,
                    rows,
                    checkpoint,
                }))
            }
            Err(e) => {
                if let Err(abort) = sink.abort(request.dataset_id) {
                    warn!(error = %abort, "sink abort failed");
                }
                self.finish(key, FileState::ImportFailed, Some(e.to_string()))?;
                self.notify_transition(&ctx, Some(FileState::Importing), FileState::ImportFailed);
                Err(self.fail(&ctx, e))
            }
        }
    }

    fn stream_into(
        &self,
        adapter: &dyn FormatAdapter,
        metadata: &DatasetMetadata,
        request: &ImportRequest,
        sink: &mut dyn RowSink,
    ) -> HarvestResult<(u64, u64, DerivationState)> {
        let plan = resolve(&request.required, &request.overrides, adapter, &metadata.file)?;
        debug!(
            sourced = ?plan.desired_native_columns(),
            derived = ?plan.unresolved(),
            "column plan"
        );
        let engine = DerivationEngine::new(plan);
        let mut state = request.resume.unwrap_or_else(DerivationState::fresh);
        let skip = state.start_row_index;
        if skip > 0 {
            info!(resume_after = skip, "resuming import");
        }

        let commit_every = self.config.commit_every_rows.max(1);
        let rows_in = adapter.stream_rows(&metadata.path, &engine.plan().desired_native_columns())?;
        let mut samples = 0u64;
        let mut rows = 0u64;
        for (idx, native) in rows_in.enumerate() {
            let native = native?;
            let file_position = idx as u64 + 1;
            if file_position <= skip {
                continue;
            }
            samples += 1;
            let values = engine.plan().to_canonical(idx + 1, &native)?;
            let (derived, next) = engine.derive_row(samples, values, state)?;
            state = next;
            for row in derived.into_canonical_rows(request.dataset_id) {
                sink.accept(row)?;
                rows += 1;
            }
            if samples % commit_every == 0 {
                sink.commit(request.dataset_id, state.checkpoint_at(samples))?;
            }
        }
        let checkpoint = state.checkpoint_at(samples);
        sink.commit(request.dataset_id, checkpoint)?;
        Ok((samples, rows, checkpoint))
    }

    fn finish(&self, key: &ObservedFileKey, to: FileState, error: Option<String>) -> HarvestResult<()> {
        if !self
            .store()
            .compare_and_set_state(key, FileState::Importing, to)?
        {
            warn!(file = %key.relative_path, %to, "state changed while importing");
        }
        self.store().record_error(key, error)
    }

    fn report_transition(&self, monitored: &MonitoredPath, file: &ObservedFile, transition: Transition) {
        let from = match transition {
            Transition::Discovered => None,
            Transition::SizeChanged { from } => Some(from),
            Transition::Stabilized => Some(FileState::Unstable),
            _ => return,
        };
        if from == Some(file.state) {
            return;
        }
        let ctx = HarvestContext {
            key: file.key.clone(),
            path: file.key.resolve(&monitored.path),
            format: None,
        };
        self.notify_transition(&ctx, from, file.state);
    }

    fn notify_transition(&self, ctx: &HarvestContext, from: Option<FileState>, to: FileState) {
        if let Some(obs) = self.options.observer.as_ref() {
            obs.on_transition(ctx, from, to);
        }
    }

    /// Report `e` to the observer and hand it back.
    fn fail(&self, ctx: &HarvestContext, e: HarvestError) -> HarvestError {
        if let Some(obs) = self.options.observer.as_ref() {
            let sev = HarvestSeverity::for_error(&e);
            obs.on_failure(ctx, sev, &e);
            if sev >= self.options.alert_at_or_above {
                obs.on_alert(ctx, sev, &e);
            }
        }
        e
    }
}

/// Classify `path`, bind its adapter and read its metadata.
pub fn inspect(path: &Path) -> HarvestResult<(Box<dyn FormatAdapter>, FileMetadata)> {
    let tag = classify(path)?;
    let adapter = open_adapter(tag)?;
    let metadata = adapter.load_metadata(path)?;
    Ok((adapter, metadata))
}
