//! The leak event path.

use std::fmt;

use log::{debug, warn};

use crate::capture::MemoryCapture;

/// Handle for reporting externally detected memory leaks.
///
/// Cloneable and cheap to hand to whatever leak detector the
/// application runs. Each notification immediately fires a memory
/// capture with the `leak-memory` artifact prefix, bypassing the
/// sampling loop, the debounce counter and the rate limiter entirely.
/// Only the memory capture guard still applies: a notification that
/// arrives while a memory capture is in flight is silently dropped,
/// never queued.
///
/// Returned by [`WatchdogGuard::leak_trigger`](crate::WatchdogGuard::leak_trigger)
/// when memory monitoring is configured.
///
/// # Examples
///
/// ```no_run
/// let guard = procwatch::init(procwatch::WatchdogOptions {
///     memory: Some(Default::default()),
///     ..Default::default()
/// });
///
/// if let Some(trigger) = guard.leak_trigger() {
///     // e.g. from an allocator hook or a periodic leak-check task:
///     trigger.notify("heap grew over 3 consecutive checks");
/// }
/// ```
#[derive(Clone)]
pub struct LeakTrigger {
    pub(crate) capture: MemoryCapture,
}

impl LeakTrigger {
    /// Reports one leak event.
    ///
    /// `info` carries the detector's diagnostic payload; it is logged,
    /// not interpreted.
    pub fn notify(&self, info: &str) {
        warn!("memory leak: {info}");
        if !self.capture.trigger("leak-memory") {
            debug!("leak snapshot skipped: a memory capture is already in flight");
        }
    }
}

impl fmt::Debug for LeakTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeakTrigger").finish()
    }
}
