//! The per-kind sampling loop.
//!
//! Each configured kind runs one `Sampler` on a dedicated worker
//! thread. A tick that sees a capture in flight does no work at all,
//! not even a stat query, so an expensive export never has stat calls
//! piling up behind it. A stat error stops the worker permanently:
//! a broken stat source is assumed unrecoverable for the lifetime of
//! the process.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error};

use crate::capture::{CpuCapture, MemoryCapture};
use crate::debounce::Debouncer;
use crate::ratelimit::RateLimiter;
use crate::stats::{ProcessStats, StatProvider};

/// The threshold comparison and capture path of one kind.
pub(crate) enum Trigger {
    Cpu { threshold: f32, capture: CpuCapture },
    Memory { threshold: u64, capture: MemoryCapture },
}

impl Trigger {
    fn kind_name(&self) -> &'static str {
        match self {
            Trigger::Cpu { .. } => "cpu",
            Trigger::Memory { .. } => "memory",
        }
    }

    fn capturing(&self) -> bool {
        use std::sync::atomic::Ordering;
        match self {
            Trigger::Cpu { capture, .. } => capture.state.capturing.load(Ordering::SeqCst),
            Trigger::Memory { capture, .. } => capture.state.capturing.load(Ordering::SeqCst),
        }
    }

    fn is_over(&self, stats: &ProcessStats) -> bool {
        match self {
            Trigger::Cpu { threshold, .. } => stats.cpu_percent > *threshold,
            Trigger::Memory { threshold, .. } => stats.memory_bytes > *threshold,
        }
    }

    fn fire(&self) {
        match self {
            Trigger::Cpu { capture, .. } => {
                capture.trigger();
            }
            Trigger::Memory { capture, .. } => {
                capture.trigger("memory");
            }
        }
    }
}

/// The outcome of one sampling tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    /// A capture is in flight; nothing was sampled.
    Skipped,
    /// The sample was at or under threshold; the streak restarted.
    Reset,
    /// Over threshold, but the streak is not long enough yet.
    Accumulating,
    /// The streak is long enough, but the window's budget is spent.
    RateLimited,
    /// A capture was started and the streak restarted.
    Triggered,
    /// Sampling failed; the loop must stop permanently.
    Fatal,
}

/// The sampling state machine of one kind.
pub(crate) struct Sampler {
    provider: Arc<dyn StatProvider>,
    trigger: Trigger,
    debouncer: Debouncer,
    limiter: RateLimiter,
}

impl Sampler {
    pub fn new(
        provider: Arc<dyn StatProvider>,
        trigger: Trigger,
        debounce_count: u32,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            provider,
            trigger,
            debouncer: Debouncer::new(debounce_count),
            limiter,
        }
    }

    pub fn tick(&mut self) -> Tick {
        if self.trigger.capturing() {
            return Tick::Skipped;
        }

        let stats = match self.provider.sample() {
            Ok(stats) => stats,
            Err(err) => {
                error!("{} stat error: {err}", self.trigger.kind_name());
                return Tick::Fatal;
            }
        };

        if !self.trigger.is_over(&stats) {
            self.debouncer.reset();
            return Tick::Reset;
        }

        if !self.debouncer.record_over() {
            return Tick::Accumulating;
        }

        match self.limiter.try_remove_token() {
            None => {
                debug!(
                    "{} capture suppressed: rate limit exhausted for this window",
                    self.trigger.kind_name()
                );
                Tick::RateLimited
            }
            Some(remaining) => {
                debug!(
                    "{} capture permitted, {remaining} tokens left in window",
                    self.trigger.kind_name()
                );
                self.trigger.fire();
                self.debouncer.reset();
                Tick::Triggered
            }
        }
    }
}

enum Status {
    Running,
    Shutdown,
}

/// Owns one kind's sampling thread; dropping it stops the thread.
pub(crate) struct MonitorHandle {
    status: Arc<(Mutex<Status>, Condvar)>,
    worker: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Spawns the sampling thread, ticking every `interval`.
    pub fn spawn(kind: &'static str, interval: Duration, mut sampler: Sampler) -> Self {
        let status = Arc::new((Mutex::new(Status::Running), Condvar::new()));
        let worker_status = status.clone();

        let worker = thread::Builder::new()
            .name(format!("procwatch-{kind}"))
            .spawn(move || loop {
                let shutdown = {
                    let (lock, cvar) = worker_status.as_ref();
                    let guard = lock.lock().unwrap();
                    let (guard, _timeout) = cvar
                        .wait_timeout_while(guard, interval, |status| {
                            matches!(*status, Status::Running)
                        })
                        .unwrap();
                    matches!(*guard, Status::Shutdown)
                };
                if shutdown {
                    return;
                }
                if matches!(sampler.tick(), Tick::Fatal) {
                    return;
                }
            })
            .ok();

        Self { status, worker }
    }

    fn shutdown(&mut self) {
        {
            let (lock, cvar) = self.status.as_ref();
            *lock.lock().unwrap() = Status::Shutdown;
            cvar.notify_one();
        }
        if let Some(worker) = self.worker.take() {
            worker.join().ok();
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
