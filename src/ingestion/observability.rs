use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::error::HarvestError;
use crate::types::{FileState, ObservedFileKey};

use super::classify::FormatTag;

/// Severity classification used for observer callbacks and alerting thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HarvestSeverity {
    /// Informational event.
    Info,
    /// Non-fatal; the file is retried on a later cycle.
    Warning,
    /// The import failed and the file is parked in `IMPORT_FAILED`.
    Error,
    /// Infrastructure failure (I/O, sink).
    Critical,
}

impl HarvestSeverity {
    /// Severity of a failed harvest step.
    pub fn for_error(e: &HarvestError) -> Self {
        match e {
            HarvestError::Io(_) | HarvestError::Sink { .. } | HarvestError::StateStore { .. } => {
                Self::Critical
            }
            HarvestError::Csv(err) => match err.kind() {
                ::csv::ErrorKind::Io(_) => Self::Critical,
                _ => Self::Error,
            },
            HarvestError::UnsupportedFileType { .. } | HarvestError::FileStateConflict { .. } => {
                Self::Warning
            }
            #[cfg(feature = "excel")]
            HarvestError::Excel(_) => Self::Error,
            HarvestError::Json(_)
            | HarvestError::DataGeneration { .. }
            | HarvestError::ParseError { .. }
            | HarvestError::WireFormat { .. }
            | HarvestError::Configuration { .. } => Self::Error,
        }
    }
}

/// Context about one file being harvested.
#[derive(Debug, Clone)]
pub struct HarvestContext {
    pub key: ObservedFileKey,
    pub path: PathBuf,
    /// Known once the file has been classified.
    pub format: Option<FormatTag>,
}

/// Counts reported on a successful import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarvestStats {
    /// Source samples consumed in this session.
    pub samples: u64,
    /// Canonical rows handed to the sink.
    pub rows: u64,
}

/// Observer interface for harvest outcomes.
///
/// Implementors can record metrics, logs, or trigger alerts.
pub trait HarvestObserver: Send + Sync {
    /// Called when the monitor moves a file to a new lifecycle state.
    fn on_transition(&self, _ctx: &HarvestContext, _from: Option<FileState>, _to: FileState) {}

    /// Called when an import completes.
    fn on_success(&self, _ctx: &HarvestContext, _stats: HarvestStats) {}

    /// Called when classification or import fails.
    fn on_failure(&self, _ctx: &HarvestContext, _severity: HarvestSeverity, _error: &HarvestError) {}

    /// Called when a failure meets the alert threshold.
    ///
    /// Default behavior forwards to [`Self::on_failure`].
    fn on_alert(&self, ctx: &HarvestContext, severity: HarvestSeverity, error: &HarvestError) {
        self.on_failure(ctx, severity, error)
    }
}

/// An observer that fans out callbacks to a list of observers.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn HarvestObserver>>,
}

impl CompositeObserver {
    pub fn new(observers: Vec<Arc<dyn HarvestObserver>>) -> Self {
        Self { observers }
    }
}

impl fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("observers_len", &self.observers.len())
            .finish()
    }
}

impl HarvestObserver for CompositeObserver {
    fn on_transition(&self, ctx: &HarvestContext, from: Option<FileState>, to: FileState) {
        for o in &self.observers {
            o.on_transition(ctx, from, to);
        }
    }

    fn on_success(&self, ctx: &HarvestContext, stats: HarvestStats) {
        for o in &self.observers {
            o.on_success(ctx, stats);
        }
    }

    fn on_failure(&self, ctx: &HarvestContext, severity: HarvestSeverity, error: &HarvestError) {
        for o in &self.observers {
            o.on_failure(ctx, severity, error);
        }
    }

    fn on_alert(&self, ctx: &HarvestContext, severity: HarvestSeverity, error: &HarvestError) {
        for o in &self.observers {
            o.on_alert(ctx, severity, error);
        }
    }
}

fn format_label(format: Option<FormatTag>) -> String {
    format.map(|f| f.to_string()).unwrap_or_else(|| "?".to_string())
}

/// Forwards events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl HarvestObserver for TracingObserver {
    fn on_transition(&self, ctx: &HarvestContext, from: Option<FileState>, to: FileState) {
        tracing::info!(
            path = %ctx.path.display(),
            from = from.map(FileState::as_str).unwrap_or("NEW"),
            to = to.as_str(),
            "file state changed"
        );
    }

    fn on_success(&self, ctx: &HarvestContext, stats: HarvestStats) {
        tracing::info!(
            path = %ctx.path.display(),
            format = %format_label(ctx.format),
            samples = stats.samples,
            rows = stats.rows,
            "import complete"
        );
    }

    fn on_failure(&self, ctx: &HarvestContext, severity: HarvestSeverity, error: &HarvestError) {
        match severity {
            HarvestSeverity::Info => tracing::info!(path = %ctx.path.display(), %error, "harvest note"),
            HarvestSeverity::Warning => {
                tracing::warn!(path = %ctx.path.display(), %error, "file skipped")
            }
            HarvestSeverity::Error | HarvestSeverity::Critical => tracing::error!(
                path = %ctx.path.display(),
                severity = ?severity,
                %error,
                "import failed"
            ),
        }
    }

    fn on_alert(&self, ctx: &HarvestContext, severity: HarvestSeverity, error: &HarvestError) {
        tracing::error!(path = %ctx.path.display(), severity = ?severity, %error, "ALERT");
    }
}

/// Logs harvest events to stderr.
#[derive(Debug, Default)]
pub struct StdErrObserver;

impl HarvestObserver for StdErrObserver {
    fn on_transition(&self, ctx: &HarvestContext, from: Option<FileState>, to: FileState) {
        eprintln!(
            "[harvest][state] path={} {} -> {}",
            ctx.path.display(),
            from.map(FileState::as_str).unwrap_or("NEW"),
            to
        );
    }

    fn on_success(&self, ctx: &HarvestContext, stats: HarvestStats) {
        eprintln!(
            "[harvest][ok] format={} path={} samples={} rows={}",
            format_label(ctx.format),
            ctx.path.display(),
            stats.samples,
            stats.rows
        );
    }

    fn on_failure(&self, ctx: &HarvestContext, severity: HarvestSeverity, error: &HarvestError) {
        eprintln!(
            "[harvest][{:?}] format={} path={} err={}",
            severity,
            format_label(ctx.format),
            ctx.path.display(),
            error
        );
    }

    fn on_alert(&self, ctx: &HarvestContext, severity: HarvestSeverity, error: &HarvestError) {
        eprintln!(
            "[ALERT][harvest][{:?}] format={} path={} err={}",
            severity,
            format_label(ctx.format),
            ctx.path.display(),
            error
        );
    }
}

/// Appends harvest events to a local log file.
#[derive(Debug)]
pub struct FileObserver {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileObserver {
    /// Writes are best-effort; failures to open/write the log file are ignored.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn append_line(&self, line: &str) {
        let _guard = self.lock.lock().ok();
        if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(&self.path) {
            let _ = writeln!(f, "{} {line}", Utc::now().to_rfc3339());
        }
    }
}

impl HarvestObserver for FileObserver {
    fn on_transition(&self, ctx: &HarvestContext, from: Option<FileState>, to: FileState) {
        self.append_line(&format!(
            "state path={} from={} to={}",
            ctx.path.display(),
            from.map(FileState::as_str).unwrap_or("NEW"),
            to
        ));
    }

    fn on_success(&self, ctx: &HarvestContext, stats: HarvestStats) {
        self.append_line(&format!(
            "ok format={} path={} samples={} rows={}",
            format_label(ctx.format),
            ctx.path.display(),
            stats.samples,
            stats.rows
        ));
    }

    fn on_failure(&self, ctx: &HarvestContext, severity: HarvestSeverity, error: &HarvestError) {
        self.append_line(&format!(
            "fail severity={:?} format={} path={} err={}",
            severity,
            format_label(ctx.format),
            ctx.path.display(),
            error
        ));
    }

    fn on_alert(&self, ctx: &HarvestContext, severity: HarvestSeverity, error: &HarvestError) {
        self.append_line(&format!(
            "ALERT severity={:?} format={} path={} err={}",
            severity,
            format_label(ctx.format),
            ctx.path.display(),
            error
        ));
    }
}
