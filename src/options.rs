//! Configuration for the watchdog.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::capture::{CpuProfiler, SnapshotWriter};
use crate::error::ParseBytesError;
use crate::stats::StatProvider;

/// Default sampling interval for both kinds.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);

/// Default length of a CPU profiling session.
pub const DEFAULT_CPU_DURATION: Duration = Duration::from_millis(30_000);

/// Default CPU threshold, in percent.
pub const DEFAULT_CPU_THRESHOLD: f32 = 90.0;

/// Default memory threshold ("1.2gb"), in bytes.
pub const DEFAULT_MEMORY_THRESHOLD: u64 = 1_288_490_188;

/// Default debounce count: a single over-threshold sample triggers.
pub const DEFAULT_DEBOUNCE_COUNT: u32 = 1;

/// The fixed window a rate limit applies to.
///
/// Windows are non-sliding: the token budget fully refills when one
/// window ends and the next begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitWindow {
    /// One second.
    Second,
    /// One minute.
    Minute,
    /// One hour.
    Hour,
    /// One day.
    Day,
}

impl RateLimitWindow {
    pub(crate) fn duration(self) -> Duration {
        match self {
            RateLimitWindow::Second => Duration::from_secs(1),
            RateLimitWindow::Minute => Duration::from_secs(60),
            RateLimitWindow::Hour => Duration::from_secs(60 * 60),
            RateLimitWindow::Day => Duration::from_secs(60 * 60 * 24),
        }
    }
}

/// How many captures a kind may produce per fixed window.
///
/// Defaults to 3 per hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitOptions {
    /// Number of captures permitted per window.
    pub count: u32,
    /// The window the count applies to.
    pub window: RateLimitWindow,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            count: 3,
            window: RateLimitWindow::Hour,
        }
    }
}

impl RateLimitOptions {
    /// Creates a rate limit of `count` captures per `window`.
    pub fn new(count: u32, window: RateLimitWindow) -> Self {
        Self { count, window }
    }
}

/// Configuration for the CPU monitor.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// let options = procwatch::CpuMonitorOptions {
///     threshold: 75.0,
///     debounce_count: 3,
///     ..Default::default()
/// };
/// assert_eq!(options.interval, Duration::from_secs(1));
/// ```
#[derive(Clone)]
pub struct CpuMonitorOptions {
    /// How often to sample CPU usage.
    pub interval: Duration,
    /// How long a profiling session runs once triggered.
    pub duration: Duration,
    /// CPU usage, in percent, above which a sample counts against the
    /// debounce counter.
    pub threshold: f32,
    /// Directory the `.cpuprofile` artifacts are written to.
    ///
    /// Defaults to the current working directory.
    pub profile_dir: PathBuf,
    /// Number of consecutive over-threshold samples required before a
    /// capture is attempted.
    pub debounce_count: u32,
    /// Rate limit on captures of this kind.
    pub limiter: RateLimitOptions,
    /// The statistics source to sample from.
    ///
    /// Defaults to the built-in platform provider.
    pub stat_provider: Option<Arc<dyn StatProvider>>,
    /// The profiler backend producing the artifact.
    ///
    /// Defaults to the built-in sampling profiler where the platform
    /// supports one.
    pub profiler: Option<Arc<dyn CpuProfiler>>,
}

impl Default for CpuMonitorOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            duration: DEFAULT_CPU_DURATION,
            threshold: DEFAULT_CPU_THRESHOLD,
            profile_dir: default_profile_dir(),
            debounce_count: DEFAULT_DEBOUNCE_COUNT,
            limiter: RateLimitOptions::default(),
            stat_provider: None,
            profiler: None,
        }
    }
}

impl CpuMonitorOptions {
    /// Creates options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the sampling interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the profiling session length.
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Sets the CPU threshold in percent.
    #[must_use]
    pub fn with_threshold(mut self, percent: f32) -> Self {
        self.threshold = percent;
        self
    }

    /// Sets the artifact directory.
    #[must_use]
    pub fn with_profile_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.profile_dir = dir.into();
        self
    }

    /// Sets the debounce count.
    #[must_use]
    pub fn with_debounce_count(mut self, count: u32) -> Self {
        self.debounce_count = count;
        self
    }

    /// Sets the rate limit.
    #[must_use]
    pub fn with_limiter(mut self, limiter: RateLimitOptions) -> Self {
        self.limiter = limiter;
        self
    }
}

impl fmt::Debug for CpuMonitorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuMonitorOptions")
            .field("interval", &self.interval)
            .field("duration", &self.duration)
            .field("threshold", &self.threshold)
            .field("profile_dir", &self.profile_dir)
            .field("debounce_count", &self.debounce_count)
            .field("limiter", &self.limiter)
            .field("stat_provider", &self.stat_provider.is_some())
            .field("profiler", &self.profiler.is_some())
            .finish()
    }
}

/// Configuration for the memory monitor.
#[derive(Clone)]
pub struct MemoryMonitorOptions {
    /// How often to sample memory usage.
    pub interval: Duration,
    /// Resident memory, in bytes, above which a sample counts against
    /// the debounce counter.
    ///
    /// See [`MemoryMonitorOptions::with_threshold_str`] for the
    /// human-readable form.
    pub threshold: u64,
    /// Directory the `.heapsnapshot` artifacts are written to.
    ///
    /// Defaults to the current working directory.
    pub profile_dir: PathBuf,
    /// Number of consecutive over-threshold samples required before a
    /// capture is attempted.
    pub debounce_count: u32,
    /// Rate limit on captures of this kind.
    ///
    /// Leak-triggered captures bypass this limit.
    pub limiter: RateLimitOptions,
    /// The statistics source to sample from.
    ///
    /// Defaults to the built-in platform provider.
    pub stat_provider: Option<Arc<dyn StatProvider>>,
    /// The snapshot backend producing the artifact.
    ///
    /// Defaults to the built-in memory report writer.
    pub snapshot_writer: Option<Arc<dyn SnapshotWriter>>,
}

impl Default for MemoryMonitorOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            threshold: DEFAULT_MEMORY_THRESHOLD,
            profile_dir: default_profile_dir(),
            debounce_count: DEFAULT_DEBOUNCE_COUNT,
            limiter: RateLimitOptions::default(),
            stat_provider: None,
            snapshot_writer: None,
        }
    }
}

impl MemoryMonitorOptions {
    /// Creates options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the sampling interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the memory threshold in bytes.
    #[must_use]
    pub fn with_threshold(mut self, bytes: u64) -> Self {
        self.threshold = bytes;
        self
    }

    /// Sets the memory threshold from a human-readable byte size such
    /// as `"1.2gb"` or `"800mb"`.
    pub fn with_threshold_str(mut self, size: &str) -> Result<Self, ParseBytesError> {
        self.threshold = parse_byte_size(size)?;
        Ok(self)
    }

    /// Sets the artifact directory.
    #[must_use]
    pub fn with_profile_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.profile_dir = dir.into();
        self
    }

    /// Sets the debounce count.
    #[must_use]
    pub fn with_debounce_count(mut self, count: u32) -> Self {
        self.debounce_count = count;
        self
    }

    /// Sets the rate limit.
    #[must_use]
    pub fn with_limiter(mut self, limiter: RateLimitOptions) -> Self {
        self.limiter = limiter;
        self
    }
}

impl fmt::Debug for MemoryMonitorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMonitorOptions")
            .field("interval", &self.interval)
            .field("threshold", &self.threshold)
            .field("profile_dir", &self.profile_dir)
            .field("debounce_count", &self.debounce_count)
            .field("limiter", &self.limiter)
            .field("stat_provider", &self.stat_provider.is_some())
            .field("snapshot_writer", &self.snapshot_writer.is_some())
            .finish()
    }
}

/// Top-level watchdog configuration.
///
/// Omitting a kind disables that monitor entirely: no sampling thread
/// is started and, for memory, no leak trigger is available.
#[derive(Debug, Clone, Default)]
pub struct WatchdogOptions {
    /// CPU monitor configuration.
    pub cpu: Option<CpuMonitorOptions>,
    /// Memory monitor configuration.
    pub memory: Option<MemoryMonitorOptions>,
}

fn default_profile_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Parses a human-readable byte size such as `"1.2gb"`, `"800 mb"` or
/// `"4096"` into a byte count.
///
/// Units are powers of 1024 and case-insensitive. Fractional values
/// are truncated to whole bytes.
pub fn parse_byte_size(input: &str) -> Result<u64, ParseBytesError> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| ParseBytesError(input.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ParseBytesError(input.to_string()));
    }

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" => 1 << 10,
        "mb" => 1 << 20,
        "gb" => 1 << 30,
        "tb" => 1 << 40,
        "pb" => 1 << 50,
        _ => return Err(ParseBytesError(input.to_string())),
    };

    Ok((value * multiplier as f64) as u64)
}
