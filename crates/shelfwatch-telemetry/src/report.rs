//! Periodic performance reports

use crate::{
    alerts::{Alert, AlertManager},
    clock::Clock,
    config::LogLevel,
    logger::Logger,
    metrics::{MetricsAggregator, PerformanceSummary},
    process::{self, MemorySnapshot},
    tracer::Tracer,
    Error, Fields, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Hours of metrics included in every report
pub const REPORT_WINDOW_HOURS: u32 = 24;

const REPORT_PREFIX: &str = "performance-report-";

/// Process health at report time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub uptime_seconds: u64,
    pub pid: u32,
    pub memory: MemorySnapshot,
    pub active_traces: usize,
    pub tracked_traces: usize,
}

/// Contents of a `performance-report-<epochMs>.json` file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub window_hours: u32,
    pub metrics: PerformanceSummary,
    /// Alerts nobody has acknowledged yet
    pub alerts: Vec<Alert>,
    pub health: HealthSnapshot,
    /// Where the report was written; not part of the file itself
    #[serde(skip)]
    pub written_to: Option<PathBuf>,
}

impl PerformanceReport {
    pub fn file_name(&self) -> String {
        report_file_name(self.generated_at)
    }
}

/// `performance-report-<epochMs>.json`
pub fn report_file_name(at: DateTime<Utc>) -> String {
    format!("{}{}.json", REPORT_PREFIX, at.timestamp_millis())
}

/// Assembles reports from the live engine state
#[derive(Debug)]
pub struct ReportGenerator {
    clock: Arc<dyn Clock>,
    logger: Arc<Logger>,
    metrics: Arc<MetricsAggregator>,
    alerts: Arc<AlertManager>,
    tracer: Arc<Tracer>,
}

impl ReportGenerator {
    pub fn new(
        clock: Arc<dyn Clock>,
        logger: Arc<Logger>,
        metrics: Arc<MetricsAggregator>,
        alerts: Arc<AlertManager>,
        tracer: Arc<Tracer>,
    ) -> Self {
        Self {
            clock,
            logger,
            metrics,
            alerts,
            tracer,
        }
    }

    /// Build a report without writing it
    pub fn snapshot(&self) -> PerformanceReport {
        PerformanceReport {
            generated_at: self.clock.now(),
            window_hours: REPORT_WINDOW_HOURS,
            metrics: self.metrics.query(REPORT_WINDOW_HOURS),
            alerts: self.alerts.unacknowledged(),
            health: HealthSnapshot {
                uptime_seconds: process::uptime_seconds(),
                pid: process::pid(),
                memory: MemorySnapshot::capture(),
                active_traces: self.tracer.active_count(),
                tracked_traces: self.tracer.tracked_count(),
            },
            written_to: None,
        }
    }

    /// Build a report, write it when file logging is on, and log a summary
    pub fn generate(&self) -> PerformanceReport {
        let mut report = self.snapshot();

        if self.logger.file_logging_enabled() {
            match self.write(&report) {
                Ok(path) => report.written_to = Some(path),
                Err(e) => {
                    tracing::warn!(
                        telemetry.event = "report_write_failed",
                        error = %e,
                        "Failed to write performance report"
                    );
                }
            }
        }

        let mut context = Fields::new();
        context.insert("total_requests".to_string(), json!(report.metrics.total_requests));
        context.insert("total_errors".to_string(), json!(report.metrics.total_errors));
        context.insert(
            "average_response_time_ms".to_string(),
            json!(report.metrics.average_response_time_ms),
        );
        context.insert("open_alerts".to_string(), json!(report.alerts.len()));
        context.insert("active_traces".to_string(), json!(report.health.active_traces));
        if let Some(path) = &report.written_to {
            context.insert("path".to_string(), json!(path.display().to_string()));
        }

        self.logger.log(
            LogLevel::Info,
            "Performance report generated",
            Some(context),
            None,
        );

        report
    }

    fn write(&self, report: &PerformanceReport) -> Result<PathBuf> {
        let contents = serde_json::to_string_pretty(report)?;
        self.logger
            .write_artifact(&report.file_name(), &contents)
            .map_err(|e| Error::Report {
                message: format!("Failed to write {}: {}", report.file_name(), e),
            })
    }
}

/// Newest report in `dir`, judged by the timestamp in its file name
pub fn latest_report(dir: &Path) -> Result<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }

    let mut newest: Option<(i64, PathBuf)> = None;

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| Error::Report {
            message: format!("Failed to read {}: {}", dir.display(), e),
        })?;

        let Some(epoch_ms) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.strip_prefix(REPORT_PREFIX))
            .and_then(|rest| rest.strip_suffix(".json"))
            .and_then(|ms| ms.parse::<i64>().ok())
        else {
            continue;
        };

        if newest.as_ref().map_or(true, |(best, _)| epoch_ms > *best) {
            newest = Some((epoch_ms, entry.path().to_path_buf()));
        }
    }

    Ok(newest.map(|(_, path)| path))
}

/// Read a report file back
pub fn read_report(path: &Path) -> Result<PerformanceReport> {
    let content = std::fs::read_to_string(path)?;
    let mut report: PerformanceReport = serde_json::from_str(&content)?;
    report.written_to = Some(path.to_path_buf());
    Ok(report)
}
