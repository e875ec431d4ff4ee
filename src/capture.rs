//! Capture backends and the fire-and-forget capture triggers.
//!
//! A trigger owns the whole lifecycle of one capture: it wins the
//! kind's guard flag, spawns a worker thread that produces the
//! artifact, and releases the guard unconditionally when the worker
//! finishes, whether the export succeeded or failed. The guard alone
//! prevents overlapping captures of one kind; triggering never blocks
//! the sampling loop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{error, info};
use serde::Serialize;

use crate::error::CaptureError;

/// The kind of diagnostic artifact a monitor produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureKind {
    /// A CPU profile.
    Cpu,
    /// A memory snapshot.
    Memory,
}

/// Produces a CPU profile artifact.
///
/// The default implementation is a sampling profiler; supply your own
/// to integrate a different profiling mechanism.
pub trait CpuProfiler: Send + Sync + 'static {
    /// Profiles the current process for `duration`, then serializes
    /// the session to `path`.
    ///
    /// Runs on a dedicated capture thread, so blocking for the whole
    /// profiling window is expected.
    fn profile(&self, duration: Duration, path: &Path) -> Result<(), CaptureError>;
}

/// Produces a memory snapshot artifact.
pub trait SnapshotWriter: Send + Sync + 'static {
    /// Writes a snapshot of the current process's memory to `path` and
    /// returns the final path.
    fn write_snapshot(&self, path: &Path) -> Result<PathBuf, CaptureError>;
}

/// Builds `{prefix}-{pid}-{timestamp_millis}.{suffix}` under `dir`.
pub(crate) fn artifact_path(dir: &Path, prefix: &str, suffix: &str) -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0);
    dir.join(format!(
        "{}-{}-{}.{}",
        prefix,
        std::process::id(),
        millis,
        suffix
    ))
}

/// The state of one kind's capture path, shared between the sampling
/// thread, capture workers and (for memory) leak triggers.
pub(crate) struct CaptureState {
    /// The in-flight exclusion flag.
    pub capturing: Arc<AtomicBool>,
    /// Number of artifacts successfully produced.
    pub taken: Arc<AtomicUsize>,
    pub profile_dir: PathBuf,
}

impl CaptureState {
    pub fn new(profile_dir: PathBuf) -> Self {
        Self {
            capturing: Arc::new(AtomicBool::new(false)),
            taken: Arc::new(AtomicUsize::new(0)),
            profile_dir,
        }
    }
}

/// Fire-and-forget CPU capture.
#[derive(Clone)]
pub(crate) struct CpuCapture {
    pub state: Arc<CaptureState>,
    pub profiler: Arc<dyn CpuProfiler>,
    pub duration: Duration,
}

impl CpuCapture {
    /// Attempts to start a capture. Returns `false` without doing
    /// anything if one is already in flight.
    pub fn trigger(&self) -> bool {
        if self
            .state
            .capturing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let capturing = self.state.capturing.clone();
        let taken = self.state.taken.clone();
        let profiler = self.profiler.clone();
        let duration = self.duration;
        let path = artifact_path(&self.state.profile_dir, "cpu", "cpuprofile");

        let spawned = thread::Builder::new()
            .name("procwatch-cpu-capture".into())
            .spawn(move || {
                match profiler.profile(duration, &path) {
                    Ok(()) => {
                        taken.fetch_add(1, Ordering::SeqCst);
                        info!("cpuprofile export success: {}", path.display());
                    }
                    Err(err) => error!("cpuprofile export error: {err}"),
                }
                capturing.store(false, Ordering::SeqCst);
            });

        if let Err(err) = spawned {
            self.state.capturing.store(false, Ordering::SeqCst);
            error!("could not spawn cpu capture worker: {err}");
        }
        true
    }
}

/// Fire-and-forget memory capture.
#[derive(Clone)]
pub(crate) struct MemoryCapture {
    pub state: Arc<CaptureState>,
    pub writer: Arc<dyn SnapshotWriter>,
}

impl MemoryCapture {
    /// Attempts to start a capture named with `prefix` (`"memory"` for
    /// threshold captures, `"leak-memory"` for leak captures). Returns
    /// `false` without doing anything if one is already in flight.
    pub fn trigger(&self, prefix: &'static str) -> bool {
        if self
            .state
            .capturing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let capturing = self.state.capturing.clone();
        let taken = self.state.taken.clone();
        let writer = self.writer.clone();
        let path = artifact_path(&self.state.profile_dir, prefix, "heapsnapshot");

        let spawned = thread::Builder::new()
            .name("procwatch-memory-capture".into())
            .spawn(move || {
                match writer.write_snapshot(&path) {
                    Ok(written) => {
                        taken.fetch_add(1, Ordering::SeqCst);
                        info!("heapsnapshot dump success: {}", written.display());
                    }
                    Err(err) => error!("heapsnapshot dump error: {err}"),
                }
                capturing.store(false, Ordering::SeqCst);
            });

        if let Err(err) = spawned {
            self.state.capturing.store(false, Ordering::SeqCst);
            error!("could not spawn memory capture worker: {err}");
        }
        true
    }
}

/// The built-in CPU profiler.
///
/// Samples the current process at 100 Hz with `pprof` and serializes
/// the session in pprof's protobuf format.
#[cfg(unix)]
#[derive(Debug)]
pub struct PprofProfiler {
    frequency: i32,
}

#[cfg(unix)]
impl PprofProfiler {
    /// Creates a profiler sampling at the default 100 Hz.
    pub fn new() -> Self {
        Self { frequency: 100 }
    }

    /// Creates a profiler sampling at `frequency` Hz.
    pub fn with_frequency(frequency: i32) -> Self {
        Self { frequency }
    }
}

#[cfg(unix)]
impl Default for PprofProfiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl CpuProfiler for PprofProfiler {
    fn profile(&self, duration: Duration, path: &Path) -> Result<(), CaptureError> {
        use pprof::protos::Message;

        let guard = pprof::ProfilerGuardBuilder::default()
            .frequency(self.frequency)
            .blocklist(&["libc", "libgcc", "pthread", "vdso"])
            .build()
            .map_err(|err| CaptureError::ProfilerStart(err.to_string()))?;

        thread::sleep(duration);

        let report = guard
            .report()
            .build()
            .map_err(|err| CaptureError::ProfilerReport(err.to_string()))?;
        let profile = report
            .pprof()
            .map_err(|err| CaptureError::ProfilerReport(err.to_string()))?;
        let bytes = profile
            .write_to_bytes()
            .map_err(|err| CaptureError::ProfilerReport(err.to_string()))?;

        std::fs::write(path, bytes).map_err(|source| CaptureError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// The built-in snapshot writer.
///
/// Rust has no V8-style heap snapshot, so the artifact is a JSON
/// report of the process's memory state: resident set size and, with
/// the `jemalloc` feature, allocator statistics.
#[derive(Debug, Default)]
pub struct MemoryReportWriter {
    _private: (),
}

impl MemoryReportWriter {
    /// Creates a new writer.
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Serialize)]
struct MemoryReport {
    pid: u32,
    timestamp_millis: u64,
    rss_bytes: Option<u64>,
    #[cfg(feature = "jemalloc")]
    heap: Option<HeapStats>,
}

#[cfg(feature = "jemalloc")]
#[derive(Serialize)]
struct HeapStats {
    allocated_bytes: u64,
    resident_bytes: u64,
}

impl SnapshotWriter for MemoryReportWriter {
    fn write_snapshot(&self, path: &Path) -> Result<PathBuf, CaptureError> {
        let report = MemoryReport {
            pid: std::process::id(),
            timestamp_millis: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_millis() as u64)
                .unwrap_or(0),
            rss_bytes: crate::stats::rss_bytes().ok(),
            #[cfg(feature = "jemalloc")]
            heap: jemalloc_stats(),
        };

        let file = std::fs::File::create(path).map_err(|source| CaptureError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::to_writer_pretty(file, &report)?;
        Ok(path.to_path_buf())
    }
}

/// Gets jemalloc memory statistics.
#[cfg(feature = "jemalloc")]
fn jemalloc_stats() -> Option<HeapStats> {
    use tikv_jemalloc_ctl::{epoch, stats};

    // Advance the epoch to get fresh stats
    epoch::advance().ok()?;

    Some(HeapStats {
        allocated_bytes: stats::allocated::read().ok()? as u64,
        resident_bytes: stats::resident::read().ok()? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_artifact_path_naming() {
        let path = artifact_path(Path::new("/tmp/profiles"), "memory", "heapsnapshot");
        let name = path.file_name().unwrap().to_str().unwrap();

        let mut parts = name.splitn(3, '-');
        assert_eq!(parts.next(), Some("memory"));
        assert_eq!(
            parts.next().unwrap(),
            std::process::id().to_string().as_str()
        );
        let rest = parts.next().unwrap();
        let (millis, suffix) = rest.split_once('.').unwrap();
        assert!(millis.parse::<u64>().is_ok());
        assert_eq!(suffix, "heapsnapshot");
    }

    #[test]
    fn test_memory_report_is_valid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory-1-1.heapsnapshot");

        let written = MemoryReportWriter::new().write_snapshot(&path).unwrap();
        assert_eq!(written, path);

        let content = std::fs::read_to_string(&path).unwrap();
        let report: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(report["pid"], std::process::id());
    }

    #[test]
    fn test_trigger_refuses_while_in_flight() {
        struct BlockingWriter(std::sync::Mutex<Option<mpsc::Receiver<()>>>);

        impl SnapshotWriter for BlockingWriter {
            fn write_snapshot(&self, path: &Path) -> Result<PathBuf, CaptureError> {
                let receiver = self.0.lock().unwrap().take();
                if let Some(receiver) = receiver {
                    receiver.recv().ok();
                }
                Ok(path.to_path_buf())
            }
        }

        let (release, blocked_on) = mpsc::channel();
        let capture = MemoryCapture {
            state: Arc::new(CaptureState::new(std::env::temp_dir())),
            writer: Arc::new(BlockingWriter(std::sync::Mutex::new(Some(blocked_on)))),
        };

        assert!(capture.trigger("memory"));
        // The worker holds the guard until the writer returns.
        assert!(!capture.trigger("memory"));
        assert!(!capture.trigger("leak-memory"));

        release.send(()).unwrap();
        while capture.state.capturing.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(capture.trigger("memory"));
    }

    #[test]
    fn test_guard_released_on_writer_error() {
        struct FailingWriter;

        impl SnapshotWriter for FailingWriter {
            fn write_snapshot(&self, path: &Path) -> Result<PathBuf, CaptureError> {
                Err(CaptureError::Write {
                    path: path.to_path_buf(),
                    source: std::io::Error::other("disk full"),
                })
            }
        }

        let capture = MemoryCapture {
            state: Arc::new(CaptureState::new(std::env::temp_dir())),
            writer: Arc::new(FailingWriter),
        };

        assert!(capture.trigger("memory"));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while capture.state.capturing.load(Ordering::SeqCst) {
            assert!(std::time::Instant::now() < deadline, "guard never released");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(capture.state.taken.load(Ordering::SeqCst), 0);
    }
}
