//! # Shelfwatch Telemetry
//!
//! Embedded observability engine for long-running catalog batch jobs.
//!
//! ## Features
//!
//! - **Structured Logging**: JSON-Lines log files split by level, colorized console via `tracing`
//! - **File Rotation**: Size-based rotation to timestamped archives, with archive retention
//! - **Operation Tracing**: Trace/span lifecycle with explicit, request-scoped context
//! - **Hourly Metrics**: Per-operation counts, durations and p50/p90/p95/p99 percentiles
//! - **Alerting**: Per-operation latency thresholds with a bounded alert history
//! - **Export**: Prometheus exposition text and JSON snapshots, periodic JSON reports
//!
//! Every public operation on [`TelemetrySystem`] is fail-open: I/O problems are
//! reported on the console and never surface to the calling pipeline.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shelfwatch_telemetry::{TelemetryConfig, TelemetrySystem};
//!
//! #[tokio::main]
//! async fn main() -> shelfwatch_telemetry::Result<()> {
//!     let telemetry = TelemetrySystem::new(TelemetryConfig::default())?;
//!     telemetry.start_background_tasks();
//!
//!     let ctx = telemetry.start_trace("batchUpsert", None);
//!     telemetry.add_span(&ctx.trace_id, "validate", None);
//!     telemetry.end_trace(&ctx.trace_id, None, None);
//!
//!     telemetry.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod alerts;
pub mod clock;
pub mod config;
pub mod export;
pub mod logger;
pub mod metrics;
pub mod process;
pub mod report;
pub mod retention;
pub mod rotation;
pub mod sanitization;
pub mod scheduler;
pub mod system;
pub mod tracer;

#[cfg(test)]
mod tests;

pub use alerts::{Alert, AlertKind, AlertManager};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LogFormat, LogLevel, TelemetryConfig};
pub use export::ExportFormat;
pub use logger::{LogEntry, Logger};
pub use metrics::{MetricsAggregator, OperationStatus, PerformanceSummary};
pub use report::PerformanceReport;
pub use system::TelemetrySystem;
pub use tracer::{CapturedError, Span, Trace, TraceContext, TraceId, TraceStatus, Tracer};

/// Free-form key/value payload attached to log entries, traces and spans
pub type Fields = std::collections::HashMap<String, serde_json::Value>;

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Telemetry-specific errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Log rotation error: {message}")]
    Rotation { message: String },

    #[error("Retention policy error: {message}")]
    Retention { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Report error: {message}")]
    Report { message: String },

    #[error("Telemetry system error: {message}")]
    System { message: String },
}

/// Acquire a mutex guard, recovering the data if a previous holder panicked.
///
/// Instrumentation must keep working after a panic elsewhere in the host.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &std::sync::RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &std::sync::RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}
