//! Structured log entries, console emission and JSON-Lines file sinks

use crate::{
    clock::Clock,
    config::{LogLevel, LoggingConfig, TelemetryConfig},
    metrics::MetricsAggregator,
    process::{self, MemorySnapshot},
    rotation::LogRotator,
    sanitization::DataSanitizer,
    tracer::TraceContext,
    Fields, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::Level;

/// File receiving audit entries
pub const AUDIT_FILE: &str = "audit.log";

/// Every file the logger appends to
pub const LOG_FILES: [&str; 4] = ["application.log", "errors.log", "performance.log", AUDIT_FILE];

/// One structured log record, written once as a single JSON line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Fields::is_empty")]
    pub context: Fields,
    #[serde(default, skip_serializing_if = "Fields::is_empty")]
    pub metadata: Fields,
    pub pid: u32,
    pub memory: MemorySnapshot,
    /// Trace the entry was emitted under, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

impl LogEntry {
    pub fn trace_id(&self) -> Option<&str> {
        self.trace.as_ref().map(|t| t.trace_id.as_str())
    }
}

/// Level-routed logger writing to the console (via `tracing`) and to files
#[derive(Debug)]
pub struct Logger {
    config: LoggingConfig,
    clock: Arc<dyn Clock>,
    sanitizer: Option<DataSanitizer>,
    metrics: Arc<MetricsAggregator>,
    // One writer lock per file so rotate-then-append is atomic
    writers: HashMap<&'static str, Mutex<()>>,
}

impl Logger {
    pub fn new(
        config: &TelemetryConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsAggregator>,
    ) -> Result<Self> {
        let sanitizer = if config.privacy.sanitize_enabled {
            Some(DataSanitizer::new(&config.privacy)?)
        } else {
            None
        };

        Ok(Self {
            config: config.logging.clone(),
            clock,
            sanitizer,
            metrics,
            writers: LOG_FILES.iter().map(|name| (*name, Mutex::new(()))).collect(),
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.config.log_dir
    }

    pub fn file_logging_enabled(&self) -> bool {
        self.config.file_enabled
    }

    pub fn level(&self) -> LogLevel {
        self.config.level
    }

    /// Log without trace attribution
    ///
    /// Entries below the configured level are returned as given, without
    /// redaction or a memory snapshot, and go nowhere.
    pub fn log(
        &self,
        level: LogLevel,
        message: &str,
        context: Option<Fields>,
        metadata: Option<Fields>,
    ) -> LogEntry {
        self.emit(level, message, context, metadata, None)
    }

    /// Log on behalf of the trace identified by `ctx`
    pub fn log_in(
        &self,
        ctx: &TraceContext,
        level: LogLevel,
        message: &str,
        context: Option<Fields>,
        metadata: Option<Fields>,
    ) -> LogEntry {
        self.emit(level, message, context, metadata, Some(ctx.clone()))
    }

    /// Record an audit event in `audit.log`, whatever the configured level
    pub fn audit(&self, action: &str, context: Option<Fields>) -> LogEntry {
        let entry = self.build(LogLevel::Info, action, context, None, None);

        tracing::info!(
            telemetry.event = "audit",
            action = %entry.message,
            "Audit event recorded"
        );

        if self.config.file_enabled {
            self.append_or_report(AUDIT_FILE, &entry);
        }

        entry
    }

    fn emit(
        &self,
        level: LogLevel,
        message: &str,
        context: Option<Fields>,
        metadata: Option<Fields>,
        trace: Option<TraceContext>,
    ) -> LogEntry {
        if !level.passes(self.config.level) {
            return LogEntry {
                timestamp: self.clock.now(),
                level,
                message: message.to_string(),
                context: context.unwrap_or_default(),
                metadata: metadata.unwrap_or_default(),
                pid: process::pid(),
                memory: MemorySnapshot::default(),
                trace,
            };
        }

        let entry = self.build(level, message, context, metadata, trace);

        self.metrics.record_log(level);

        if self.config.console_enabled {
            emit_console(&entry);
        }

        if self.config.file_enabled {
            self.append_or_report(level.file_name(), &entry);
        }

        entry
    }

    fn build(
        &self,
        level: LogLevel,
        message: &str,
        context: Option<Fields>,
        metadata: Option<Fields>,
        trace: Option<TraceContext>,
    ) -> LogEntry {
        let mut context = context.unwrap_or_default();
        let mut metadata = metadata.unwrap_or_default();
        let message = match &self.sanitizer {
            Some(sanitizer) => {
                sanitizer.sanitize_fields(&mut context);
                sanitizer.sanitize_fields(&mut metadata);
                sanitizer.sanitize_text(message)
            }
            None => message.to_string(),
        };

        LogEntry {
            timestamp: self.clock.now(),
            level,
            message,
            context,
            metadata,
            pid: process::pid(),
            memory: MemorySnapshot::capture(),
            trace,
        }
    }

    fn append_or_report(&self, file_name: &'static str, entry: &LogEntry) {
        if let Err(e) = self.append(file_name, entry) {
            tracing::warn!(
                telemetry.event = "log_write_failed",
                file = file_name,
                error = %e,
                "Failed to write log entry to file"
            );
        }
    }

    fn append(&self, file_name: &'static str, entry: &LogEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let path = self.config.log_dir.join(file_name);
        let _guard = self.writers.get(file_name).map(crate::lock);

        std::fs::create_dir_all(&self.config.log_dir)?;

        // A failed rotation must not lose the entry
        if let Err(e) =
            LogRotator::maybe_rotate_for(&path, self.config.max_file_size_bytes, line.len() as u64)
        {
            tracing::warn!(
                telemetry.event = "log_rotation_failed",
                file = %path.display(),
                error = %e,
                "Log rotation failed, appending to the current file"
            );
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;

        Ok(())
    }

    /// Rotate every log file that has grown past the size limit
    pub fn rotate_oversized(&self) -> Vec<PathBuf> {
        let mut archives = Vec::new();

        for file_name in LOG_FILES {
            let path = self.config.log_dir.join(file_name);
            let _guard = self.writers.get(file_name).map(crate::lock);

            match LogRotator::maybe_rotate(&path, self.config.max_file_size_bytes) {
                Ok(Some(archive)) => archives.push(archive),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        telemetry.event = "log_rotation_failed",
                        file = %path.display(),
                        error = %e,
                        "Scheduled log rotation failed"
                    );
                }
            }
        }

        archives
    }

    /// Write a standalone artifact (such as a report) into the log directory
    pub fn write_artifact(&self, file_name: &str, contents: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.config.log_dir)?;
        let path = self.config.log_dir.join(file_name);
        std::fs::write(&path, contents)?;
        Ok(path)
    }
}

fn emit_console(entry: &LogEntry) {
    let trace_id = entry.trace.as_ref().map(|t| t.trace_id.as_str());
    let operation = entry.trace.as_ref().map(|t| t.operation.as_str());
    let context = (!entry.context.is_empty())
        .then(|| serde_json::to_string(&entry.context).ok())
        .flatten();

    macro_rules! console {
        ($level:expr) => {
            tracing::event!(
                target: "shelfwatch",
                $level,
                trace_id = trace_id,
                operation = operation,
                context = context.as_deref(),
                "{}",
                entry.message
            )
        };
    }

    match entry.level {
        LogLevel::Error => console!(Level::ERROR),
        LogLevel::Warn => console!(Level::WARN),
        LogLevel::Info => console!(Level::INFO),
        LogLevel::Debug => console!(Level::DEBUG),
        LogLevel::Trace => console!(Level::TRACE),
    }
}

/// Parse a JSON-Lines log file, skipping lines that are not log entries
pub fn read_entries(path: &Path) -> Result<Vec<LogEntry>> {
    let content = std::fs::read_to_string(path)?;

    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}
