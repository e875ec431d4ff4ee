//! Process statistics sampling.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::StatError;

/// One instantaneous reading of the current process's resource usage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessStats {
    /// CPU usage in percent of one core, averaged since the previous
    /// sample.
    pub cpu_percent: f32,
    /// Resident set size in bytes.
    pub memory_bytes: u64,
}

/// Source of process statistics, queried once per sampling tick.
///
/// Implement this to feed the watchdog from a custom source (a cgroup
/// controller, a test script, ...). The method is called from the
/// monitor's sampling thread and should be fast and non-blocking.
///
/// An error is fatal for the sampling loop that saw it: the loop stops
/// permanently and that kind produces no further captures.
pub trait StatProvider: Send + Sync + 'static {
    /// Takes one sample.
    fn sample(&self) -> Result<ProcessStats, StatError>;
}

/// The built-in statistics source.
///
/// Reads resident memory and cumulative CPU time from the platform
/// (`/proc` on Linux, `getrusage` on macOS, process APIs on Windows)
/// and derives the CPU percentage from the CPU-time delta between
/// consecutive samples. The first sample reports 0% CPU as there is no
/// delta yet.
#[derive(Debug, Default)]
pub struct SystemStatProvider {
    last_cpu: Mutex<Option<CpuReading>>,
}

#[derive(Debug, Clone, Copy)]
struct CpuReading {
    total: Duration,
    at: Instant,
}

impl SystemStatProvider {
    /// Creates a new provider.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatProvider for SystemStatProvider {
    fn sample(&self) -> Result<ProcessStats, StatError> {
        let memory_bytes = rss_bytes()?;
        let total = cpu_time()?;
        let now = Instant::now();

        let mut last = self.last_cpu.lock().unwrap();
        let cpu_percent = match *last {
            Some(prev) => {
                let wall = now.saturating_duration_since(prev.at);
                let busy = total.saturating_sub(prev.total);
                if wall.is_zero() {
                    0.0
                } else {
                    (busy.as_secs_f64() / wall.as_secs_f64() * 100.0) as f32
                }
            }
            None => 0.0,
        };
        *last = Some(CpuReading { total, at: now });

        Ok(ProcessStats {
            cpu_percent,
            memory_bytes,
        })
    }
}

/// Gets the RSS (Resident Set Size) in bytes.
#[cfg(target_os = "linux")]
pub(crate) fn rss_bytes() -> Result<u64, StatError> {
    use std::fs;

    // Read from /proc/self/statm
    // Format: size resident shared text lib data dt
    // Values are in pages
    let statm = fs::read_to_string("/proc/self/statm")?;
    let resident = statm
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| StatError::Malformed("/proc/self/statm is truncated".into()))?;
    let pages: u64 = resident
        .parse()
        .map_err(|_| StatError::Malformed(format!("bad resident page count `{resident}`")))?;

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return Err(StatError::Malformed("sysconf(_SC_PAGESIZE) failed".into()));
    }
    Ok(pages * page_size as u64)
}

/// Gets the RSS (Resident Set Size) in bytes.
#[cfg(target_os = "macos")]
pub(crate) fn rss_bytes() -> Result<u64, StatError> {
    use std::mem;

    unsafe {
        let mut usage: libc::rusage = mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) == 0 {
            // On macOS, ru_maxrss is in bytes
            Ok(usage.ru_maxrss.max(0) as u64)
        } else {
            Err(StatError::Io(std::io::Error::last_os_error()))
        }
    }
}

/// Gets the RSS (Resident Set Size) in bytes.
#[cfg(target_os = "windows")]
pub(crate) fn rss_bytes() -> Result<u64, StatError> {
    use windows_sys::Win32::System::ProcessStatus::{
        GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS,
    };
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    unsafe {
        let process = GetCurrentProcess();
        let mut pmc: PROCESS_MEMORY_COUNTERS = std::mem::zeroed();
        pmc.cb = std::mem::size_of::<PROCESS_MEMORY_COUNTERS>() as u32;

        if GetProcessMemoryInfo(
            process,
            &mut pmc,
            std::mem::size_of::<PROCESS_MEMORY_COUNTERS>() as u32,
        ) != 0
        {
            Ok(pmc.WorkingSetSize as u64)
        } else {
            Err(StatError::Io(std::io::Error::last_os_error()))
        }
    }
}

/// Fallback for unsupported platforms.
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
pub(crate) fn rss_bytes() -> Result<u64, StatError> {
    Err(StatError::Unsupported)
}

/// Gets cumulative CPU time (user + system) of the current process.
#[cfg(unix)]
fn cpu_time() -> Result<Duration, StatError> {
    use std::mem;

    unsafe {
        let mut usage: libc::rusage = mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) == 0 {
            Ok(timeval_duration(usage.ru_utime) + timeval_duration(usage.ru_stime))
        } else {
            Err(StatError::Io(std::io::Error::last_os_error()))
        }
    }
}

#[cfg(unix)]
fn timeval_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// Gets cumulative CPU time (user + system) of the current process.
#[cfg(target_os = "windows")]
fn cpu_time() -> Result<Duration, StatError> {
    use windows_sys::Win32::Foundation::FILETIME;
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, GetProcessTimes};

    unsafe {
        let process = GetCurrentProcess();
        let mut creation: FILETIME = std::mem::zeroed();
        let mut exit: FILETIME = std::mem::zeroed();
        let mut kernel: FILETIME = std::mem::zeroed();
        let mut user: FILETIME = std::mem::zeroed();

        if GetProcessTimes(process, &mut creation, &mut exit, &mut kernel, &mut user) != 0 {
            // FILETIME is in 100-nanosecond intervals
            let user_100ns = ((user.dwHighDateTime as u64) << 32) | (user.dwLowDateTime as u64);
            let kernel_100ns =
                ((kernel.dwHighDateTime as u64) << 32) | (kernel.dwLowDateTime as u64);
            Ok(Duration::from_nanos((user_100ns + kernel_100ns) * 100))
        } else {
            Err(StatError::Io(std::io::Error::last_os_error()))
        }
    }
}

/// Fallback for unsupported platforms.
#[cfg(not(any(unix, target_os = "windows")))]
fn cpu_time() -> Result<Duration, StatError> {
    Err(StatError::Unsupported)
}
