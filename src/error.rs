//! Error types surfaced through the watchdog's reporting channel.
//!
//! None of these propagate to the caller of [`init`](crate::init); they
//! are logged at the point of occurrence and decide only how much of
//! the watchdog keeps running (see the per-variant docs).

use std::path::PathBuf;

use thiserror::Error;

/// An error produced while sampling process statistics.
///
/// Stat errors are fatal for the sampling loop that encountered them:
/// the loop stops permanently and the affected kind produces no further
/// captures for the lifetime of the process.
#[derive(Debug, Error)]
pub enum StatError {
    /// Reading the platform's process statistics source failed.
    #[error("failed to read process statistics: {0}")]
    Io(#[from] std::io::Error),
    /// The statistics source returned data we could not interpret.
    #[error("malformed process statistics: {0}")]
    Malformed(String),
    /// No statistics source exists for this platform.
    #[error("process statistics are not available on this platform")]
    Unsupported,
}

/// An error produced while exporting a capture artifact.
///
/// Capture errors are non-fatal: the capture guard is released and
/// future captures remain possible.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The profiler session could not be started.
    #[error("profiler could not be started: {0}")]
    ProfilerStart(String),
    /// The profiler session could not be serialized.
    #[error("profile serialization failed: {0}")]
    ProfilerReport(String),
    /// Writing the artifact file failed.
    #[error("failed to write {path}: {source}")]
    Write {
        /// The artifact path that could not be written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Serializing the snapshot report failed.
    #[error("snapshot serialization failed: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// The error returned when parsing a human-readable byte size fails.
#[derive(Debug, Error)]
#[error("invalid byte size `{0}`")]
pub struct ParseBytesError(pub(crate) String);
