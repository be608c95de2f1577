//! Directory polling and the observed-file lifecycle.
//!
//! [`PathMonitor::poll`] walks a monitored directory and advances each file's record:
//!
//! - new file: recorded as `UNSTABLE`
//! - not `UNSTABLE`/`RETRY_IMPORT`: left alone (already handled)
//! - size changed: clock restarts, `UNSTABLE`
//! - held open for writing: clock restarts, `UNSTABLE`, for at most the in-use deferral window
//! - unchanged for longer than the path's threshold: `STABLE`
//! - otherwise nothing is written, so the stability clock keeps running

pub mod handles;
pub mod store;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::{HarvestError, HarvestResult};
use crate::types::{FileState, MonitoredPath, ObservedFile, ObservedFileKey};

pub use handles::{NeverOpen, OpenHandleDetector, ProcessTableDetector};
pub use store::{MemoryStateStore, StateStore};

/// Default in-use deferral, as a multiple of the path's stability threshold.
pub const DEFAULT_IN_USE_DEFERRAL_FACTOR: i32 = 10;

/// What one poll did to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First sighting; recorded as `UNSTABLE`.
    Discovered,
    /// Size differs from the last observation.
    SizeChanged { from: FileState },
    /// Size unchanged but another process holds the file open for writing.
    InUse,
    /// `UNSTABLE` → `STABLE`.
    Stabilized,
    /// Stable past the threshold while queued for `RETRY_IMPORT`.
    ReadyForRetry,
    /// Stability window still running; nothing written.
    Waiting,
    /// Importing or done; not re-examined.
    AlreadyHandled,
    /// Another writer changed the record between our read and write.
    Conflict,
}

impl Transition {
    /// Whether the record's state changed.
    pub fn changes_state(&self) -> bool {
        match self {
            Self::Discovered | Self::Stabilized => true,
            Self::SizeChanged { from } => *from != FileState::Unstable,
            _ => false,
        }
    }
}

/// Polls monitored directories against a [`StateStore`].
#[derive(Clone)]
pub struct PathMonitor {
    store: Arc<dyn StateStore>,
    detector: Arc<dyn OpenHandleDetector>,
    in_use_deferral_factor: i32,
}

impl std::fmt::Debug for PathMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathMonitor")
            .field("in_use_deferral_factor", &self.in_use_deferral_factor)
            .finish_non_exhaustive()
    }
}

impl PathMonitor {
    pub fn new(store: Arc<dyn StateStore>, detector: Arc<dyn OpenHandleDetector>) -> Self {
        Self {
            store,
            detector,
            in_use_deferral_factor: DEFAULT_IN_USE_DEFERRAL_FACTOR,
        }
    }

    /// Bound how long an open handle may postpone stability, in multiples of the threshold.
    pub fn with_in_use_deferral_factor(mut self, factor: i32) -> Self {
        self.in_use_deferral_factor = factor.max(0);
        self
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn poll(&self, monitored: &MonitoredPath) -> HarvestResult<Vec<(ObservedFile, Transition)>> {
        self.poll_at(monitored, Utc::now())
    }

    /// [`Self::poll`] with an explicit clock.
    pub fn poll_at(
        &self,
        monitored: &MonitoredPath,
        now: DateTime<Utc>,
    ) -> HarvestResult<Vec<(ObservedFile, Transition)>> {
        let root = monitored.path.as_path();
        if !root.is_dir() {
            return Err(HarvestError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("monitored path is not a directory: {}", root.display()),
            )));
        }

        let mut out = Vec::new();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_hidden(e));
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(path = %root.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(relative) = relative_key(root, entry.path()) else {
                continue;
            };
            let size = match entry.metadata() {
                Ok(m) => m.len(),
                // Vanished between listing and stat.
                Err(e) => {
                    debug!(path = %entry.path().display(), error = %e, "stat failed");
                    continue;
                }
            };
            let key = ObservedFileKey::new(monitored.id, relative);
            out.push(self.observe(monitored, entry.path(), key, size, now)?);
        }
        Ok(out)
    }

    fn observe(
        &self,
        monitored: &MonitoredPath,
        path: &Path,
        key: ObservedFileKey,
        size: u64,
        now: DateTime<Utc>,
    ) -> HarvestResult<(ObservedFile, Transition)> {
        let Some(record) = self.store.get(&key)? else {
            let file = ObservedFile::new(key, size, now);
            let transition = if self.store.upsert(&file, None)? {
                debug!(file = %file.key.relative_path, size, "new file");
                Transition::Discovered
            } else {
                Transition::Conflict
            };
            return Ok((file, transition));
        };

        if !record.state.is_polled() {
            return Ok((record, Transition::AlreadyHandled));
        }

        let threshold = monitored.stable_time();
        let mut next = record.clone();
        let transition = if size != record.last_observed_size {
            next.last_observed_size = size;
            next.last_observed_time = now;
            next.size_changed_at = now;
            next.state = FileState::Unstable;
            Transition::SizeChanged { from: record.state }
        } else if now - record.size_changed_at < self.max_in_use_deferral(threshold)
            && self.detector.is_open_for_writing(path)
        {
            next.last_observed_time = now;
            next.state = FileState::Unstable;
            Transition::InUse
        } else if now - record.last_observed_time > threshold {
            match record.state {
                FileState::Unstable => {
                    next.state = FileState::Stable;
                    Transition::Stabilized
                }
                _ => return Ok((record, Transition::ReadyForRetry)),
            }
        } else {
            return Ok((record, Transition::Waiting));
        };

        if self.store.upsert(&next, Some(record.state))? {
            debug!(file = %next.key.relative_path, ?transition, state = %next.state, "observed");
            Ok((next, transition))
        } else {
            Ok((record, Transition::Conflict))
        }
    }

    fn max_in_use_deferral(&self, threshold: Duration) -> Duration {
        threshold * self.in_use_deferral_factor
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|s| s.starts_with('.'))
}

/// `/`-separated path of `path` under `root`.
fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixture {
        _dir: tempfile::TempDir,
        path: MonitoredPath,
        store: Arc<MemoryStateStore>,
    }

    fn fixture(threshold: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = MonitoredPath::new(1, "bench-1", dir.path()).with_stable_time_secs(threshold);
        Fixture {
            _dir: dir,
            path,
            store: Arc::new(MemoryStateStore::new()),
        }
    }

    fn append(path: &Path, bytes: &[u8]) {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap()
            .write_all(bytes)
            .unwrap();
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn secs(n: i64) -> Duration {
        Duration::seconds(n)
    }

    fn only(polled: Vec<(ObservedFile, Transition)>) -> (ObservedFile, Transition) {
        assert_eq!(polled.len(), 1);
        polled.into_iter().next().unwrap()
    }

    #[test]
    fn stable_only_after_threshold() {
        let fx = fixture(60);
        append(&fx.path.path.join("cell.txt"), b"abc");
        let monitor = PathMonitor::new(fx.store.clone(), Arc::new(NeverOpen));

        let (f, t) = only(monitor.poll_at(&fx.path, t0()).unwrap());
        assert_eq!((f.state, t), (FileState::Unstable, Transition::Discovered));

        for s in [10, 30, 60] {
            let (f, t) = only(monitor.poll_at(&fx.path, t0() + secs(s)).unwrap());
            assert_eq!((f.state, t), (FileState::Unstable, Transition::Waiting), "at {s}s");
            // Waiting polls do not move the anchor.
            assert_eq!(f.last_observed_time, t0());
        }

        let (f, t) = only(monitor.poll_at(&fx.path, t0() + secs(61)).unwrap());
        assert_eq!((f.state, t), (FileState::Stable, Transition::Stabilized));
    }

    #[test]
    fn growing_file_never_stabilizes() {
        let fx = fixture(60);
        let file = fx.path.path.join("cell.txt");
        append(&file, b"a");
        let monitor = PathMonitor::new(fx.store.clone(), Arc::new(NeverOpen));
        monitor.poll_at(&fx.path, t0()).unwrap();

        for n in 1..=20 {
            append(&file, b"a");
            let (f, _) = only(monitor.poll_at(&fx.path, t0() + secs(59 * n)).unwrap());
            assert_eq!(f.state, FileState::Unstable);
        }
    }

    #[test]
    fn imported_file_is_not_retriggered_by_changes() {
        let fx = fixture(1);
        let file = fx.path.path.join("cell.txt");
        append(&file, b"abc");
        let monitor = PathMonitor::new(fx.store.clone(), Arc::new(NeverOpen));
        let (f, _) = only(monitor.poll_at(&fx.path, t0()).unwrap());
        monitor.poll_at(&fx.path, t0() + secs(5)).unwrap();
        fx.store
            .compare_and_set_state(&f.key, FileState::Stable, FileState::Importing)
            .unwrap();
        fx.store
            .compare_and_set_state(&f.key, FileState::Importing, FileState::Imported)
            .unwrap();

        append(&file, b"more");
        let (f, t) = only(monitor.poll_at(&fx.path, t0() + secs(10)).unwrap());
        assert_eq!((f.state, t), (FileState::Imported, Transition::AlreadyHandled));
        assert_eq!(f.last_observed_size, 3);
    }

    #[test]
    fn retry_is_demoted_when_the_file_changes() {
        let fx = fixture(1);
        let file = fx.path.path.join("cell.txt");
        append(&file, b"abc");
        let monitor = PathMonitor::new(fx.store.clone(), Arc::new(NeverOpen));
        let (f, _) = only(monitor.poll_at(&fx.path, t0()).unwrap());
        monitor.poll_at(&fx.path, t0() + secs(5)).unwrap();
        for (from, to) in [
            (FileState::Stable, FileState::Importing),
            (FileState::Importing, FileState::ImportFailed),
            (FileState::ImportFailed, FileState::RetryImport),
        ] {
            assert!(fx.store.compare_and_set_state(&f.key, from, to).unwrap());
        }

        let (f2, t) = only(monitor.poll_at(&fx.path, t0() + secs(6)).unwrap());
        assert_eq!((f2.state, t), (FileState::RetryImport, Transition::ReadyForRetry));

        append(&file, b"d");
        let (f2, t) = only(monitor.poll_at(&fx.path, t0() + secs(7)).unwrap());
        assert_eq!(f2.state, FileState::Unstable);
        assert_eq!(t, Transition::SizeChanged { from: FileState::RetryImport });
        assert!(t.changes_state());
    }

    #[test]
    fn open_handle_defers_stability_within_bound() {
        let fx = fixture(60);
        append(&fx.path.path.join("cell.txt"), b"abc");
        let in_use = Arc::new(AtomicBool::new(true));
        let flag = in_use.clone();
        let detector = move |_: &Path| flag.load(Ordering::SeqCst);
        let monitor = PathMonitor::new(fx.store.clone(), Arc::new(detector));

        monitor.poll_at(&fx.path, t0()).unwrap();
        let (f, t) = only(monitor.poll_at(&fx.path, t0() + secs(100)).unwrap());
        assert_eq!((f.state, t), (FileState::Unstable, Transition::InUse));
        assert_eq!(f.last_observed_time, t0() + secs(100));

        in_use.store(false, Ordering::SeqCst);
        let (f, _) = only(monitor.poll_at(&fx.path, t0() + secs(150)).unwrap());
        assert_eq!(f.state, FileState::Unstable);
        let (f, _) = only(monitor.poll_at(&fx.path, t0() + secs(161)).unwrap());
        assert_eq!(f.state, FileState::Stable);
    }

    #[test]
    fn permanently_open_file_stabilizes_after_max_deferral() {
        let threshold = 60;
        let fx = fixture(threshold);
        append(&fx.path.path.join("big.txt"), b"abc");
        let monitor = PathMonitor::new(fx.store.clone(), Arc::new(|_: &Path| true));
        let poll_every = 30;
        let max_delay = (DEFAULT_IN_USE_DEFERRAL_FACTOR as i64 + 1) * threshold as i64 + poll_every;

        let mut stabilized_at = None;
        let mut t = 0;
        while t <= 2 * max_delay {
            let (f, _) = only(monitor.poll_at(&fx.path, t0() + secs(t)).unwrap());
            if f.state == FileState::Stable {
                stabilized_at = Some(t);
                break;
            }
            t += poll_every;
        }
        let at = stabilized_at.expect("file never stabilized");
        assert!(at >= DEFAULT_IN_USE_DEFERRAL_FACTOR as i64 * threshold as i64, "too early: {at}");
        assert!(at <= max_delay, "too late: {at}");
    }

    #[test]
    fn nested_files_use_relative_keys_and_hidden_files_are_skipped() {
        let fx = fixture(60);
        fs::create_dir(fx.path.path.join("cell_a")).unwrap();
        append(&fx.path.path.join("cell_a").join("run1.txt"), b"x");
        append(&fx.path.path.join(".~lock.run1.txt#"), b"x");
        fs::create_dir(fx.path.path.join(".cache")).unwrap();
        append(&fx.path.path.join(".cache").join("x.txt"), b"x");

        let monitor = PathMonitor::new(fx.store.clone(), Arc::new(NeverOpen));
        let (f, _) = only(monitor.poll_at(&fx.path, t0()).unwrap());
        assert_eq!(f.key.relative_path, "cell_a/run1.txt");
    }

    #[test]
    fn missing_directory_is_an_error() {
        let fx = fixture(60);
        let gone = MonitoredPath::new(2, "bench-1", fx.path.path.join("nope"));
        let monitor = PathMonitor::new(fx.store.clone(), Arc::new(NeverOpen));
        assert!(matches!(monitor.poll_at(&gone, t0()), Err(HarvestError::Io(_))));
    }
}
