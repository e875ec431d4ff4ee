//! Resource watchdog for the current process.
//!
//! `procwatch` periodically samples the CPU and memory usage of the
//! process it runs in. When usage stays over a configured threshold
//! for a configured number of consecutive samples, it captures a
//! diagnostic artifact (a CPU profile or a memory snapshot) into a
//! directory of your choosing, subject to a per-kind rate limit and
//! per-kind mutual exclusion so captures never pile up or overlap.
//!
//! # Overview
//!
//! Two independent monitors are built from the same primitive, one
//! per kind:
//!
//! - **cpu**: samples CPU usage; on sustained load it runs a sampling
//!   profiler for a fixed window and writes
//!   `cpu-{pid}-{timestamp}.cpuprofile`.
//! - **memory**: samples resident memory; on sustained growth it
//!   writes `memory-{pid}-{timestamp}.heapsnapshot`. An optional
//!   leak-event path writes `leak-memory-...` snapshots on demand.
//!
//! Omitting a kind from the options disables it entirely.
//!
//! # Usage
//!
//! ```no_run
//! use procwatch::{CpuMonitorOptions, MemoryMonitorOptions, WatchdogOptions};
//!
//! let _watchdog = procwatch::init(WatchdogOptions {
//!     cpu: Some(CpuMonitorOptions {
//!         threshold: 85.0,
//!         debounce_count: 3,
//!         ..Default::default()
//!     }),
//!     memory: Some(
//!         MemoryMonitorOptions::new()
//!             .with_threshold_str("1.5gb")
//!             .expect("valid byte size")
//!             .with_debounce_count(5),
//!     ),
//! });
//! ```
//!
//! The returned guard owns the sampling threads; keep it alive for as
//! long as monitoring should run. Outcomes are reported through the
//! [`log`] facade; wire up any `log` subscriber to see them.
//!
//! # Feature Flags
//!
//! - `jemalloc`: include tikv-jemalloc-ctl allocator statistics in
//!   memory snapshots (Unix only).

#![warn(missing_docs)]

mod capture;
mod debounce;
mod error;
mod leak;
mod monitor;
mod options;
mod ratelimit;
mod stats;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error};

use crate::capture::{CaptureState, CpuCapture, MemoryCapture};
use crate::monitor::{MonitorHandle, Sampler, Trigger};
use crate::ratelimit::RateLimiter;

#[cfg(unix)]
pub use crate::capture::PprofProfiler;
pub use crate::capture::{CaptureKind, CpuProfiler, MemoryReportWriter, SnapshotWriter};
pub use crate::error::{CaptureError, ParseBytesError, StatError};
pub use crate::leak::LeakTrigger;
pub use crate::options::{
    parse_byte_size, CpuMonitorOptions, MemoryMonitorOptions, RateLimitOptions, RateLimitWindow,
    WatchdogOptions, DEFAULT_CPU_DURATION, DEFAULT_CPU_THRESHOLD, DEFAULT_DEBOUNCE_COUNT,
    DEFAULT_INTERVAL, DEFAULT_MEMORY_THRESHOLD,
};
pub use crate::stats::{ProcessStats, StatProvider, SystemStatProvider};

/// Helper struct that is returned from [`init`].
///
/// The guard owns the sampling threads. Dropping it stops all
/// sampling; an in-flight capture is not cancelled and runs to
/// completion or error on its own thread. If you cannot keep the
/// guard around, `std::mem::forget` it to monitor for the remaining
/// lifetime of the process.
#[must_use = "dropping the watchdog guard stops all monitoring. \
              If you do want to monitor for the process lifetime use mem::forget on it."]
pub struct WatchdogGuard {
    monitors: Vec<MonitorHandle>,
    leak: Option<LeakTrigger>,
    cpu_taken: Option<Arc<AtomicUsize>>,
    memory_taken: Option<Arc<AtomicUsize>>,
}

impl WatchdogGuard {
    /// Quick check whether any monitor is configured and running.
    pub fn is_enabled(&self) -> bool {
        !self.monitors.is_empty()
    }

    /// Returns the handle for reporting externally detected leaks.
    ///
    /// `None` unless memory monitoring is configured.
    pub fn leak_trigger(&self) -> Option<LeakTrigger> {
        self.leak.clone()
    }

    /// Number of artifacts of `kind` successfully produced so far.
    ///
    /// Leak-triggered snapshots count towards
    /// [`CaptureKind::Memory`]. Returns 0 for a kind that is not
    /// configured.
    pub fn captures_taken(&self, kind: CaptureKind) -> usize {
        let taken = match kind {
            CaptureKind::Cpu => &self.cpu_taken,
            CaptureKind::Memory => &self.memory_taken,
        };
        taken
            .as_ref()
            .map_or(0, |taken| taken.load(Ordering::SeqCst))
    }
}

impl fmt::Debug for WatchdogGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchdogGuard")
            .field("monitors", &self.monitors.len())
            .field("leak_trigger", &self.leak.is_some())
            .finish()
    }
}

/// Starts the watchdog for the given configuration and returns the
/// guard that keeps it running.
///
/// Never fails: a kind that cannot be monitored on this platform is
/// logged and disabled instead. Errors encountered later (a failing
/// stat source, a failing export) are likewise only reported through
/// the [`log`] facade; a stat failure permanently stops that kind's
/// sampling, an export failure leaves future captures possible.
pub fn init(options: WatchdogOptions) -> WatchdogGuard {
    let mut guard = WatchdogGuard {
        monitors: Vec::new(),
        leak: None,
        cpu_taken: None,
        memory_taken: None,
    };

    if let Some(cpu) = options.cpu {
        match cpu_profiler(&cpu) {
            Some(profiler) => {
                let state = Arc::new(CaptureState::new(cpu.profile_dir.clone()));
                guard.cpu_taken = Some(state.taken.clone());

                let sampler = Sampler::new(
                    cpu.stat_provider
                        .unwrap_or_else(|| Arc::new(SystemStatProvider::new())),
                    Trigger::Cpu {
                        threshold: cpu.threshold,
                        capture: CpuCapture {
                            state,
                            profiler,
                            duration: cpu.duration,
                        },
                    },
                    cpu.debounce_count,
                    RateLimiter::new(cpu.limiter.count, cpu.limiter.window.duration()),
                );
                guard
                    .monitors
                    .push(MonitorHandle::spawn("cpu", cpu.interval, sampler));
                debug!(
                    "cpu monitor started: threshold {}%, interval {:?}",
                    cpu.threshold, cpu.interval
                );
            }
            None => {
                error!("cpu monitoring disabled: no profiler backend for this platform");
            }
        }
    }

    if let Some(memory) = options.memory {
        let state = Arc::new(CaptureState::new(memory.profile_dir.clone()));
        guard.memory_taken = Some(state.taken.clone());

        let capture = MemoryCapture {
            state,
            writer: memory
                .snapshot_writer
                .unwrap_or_else(|| Arc::new(MemoryReportWriter::new())),
        };
        guard.leak = Some(LeakTrigger {
            capture: capture.clone(),
        });

        let sampler = Sampler::new(
            memory
                .stat_provider
                .unwrap_or_else(|| Arc::new(SystemStatProvider::new())),
            Trigger::Memory {
                threshold: memory.threshold,
                capture,
            },
            memory.debounce_count,
            RateLimiter::new(memory.limiter.count, memory.limiter.window.duration()),
        );
        guard
            .monitors
            .push(MonitorHandle::spawn("memory", memory.interval, sampler));
        debug!(
            "memory monitor started: threshold {} bytes, interval {:?}",
            memory.threshold, memory.interval
        );
    }

    guard
}

fn cpu_profiler(options: &CpuMonitorOptions) -> Option<Arc<dyn CpuProfiler>> {
    if let Some(profiler) = &options.profiler {
        return Some(profiler.clone());
    }
    #[cfg(unix)]
    {
        Some(Arc::new(PprofProfiler::new()))
    }
    #[cfg(not(unix))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_options_disable_everything() {
        let guard = init(WatchdogOptions::default());
        assert!(!guard.is_enabled());
        assert!(guard.leak_trigger().is_none());
        assert_eq!(guard.captures_taken(CaptureKind::Cpu), 0);
        assert_eq!(guard.captures_taken(CaptureKind::Memory), 0);
    }

    #[test]
    fn test_memory_monitor_provides_leak_trigger() {
        let guard = init(WatchdogOptions {
            memory: Some(MemoryMonitorOptions {
                threshold: u64::MAX,
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(guard.is_enabled());
        assert!(guard.leak_trigger().is_some());
    }
}
