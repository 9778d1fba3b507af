//! Rendering of metric summaries as JSON or Prometheus exposition text

use crate::{metrics::PerformanceSummary, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hours of metrics covered by an export
pub const EXPORT_WINDOW_HOURS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Prometheus,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Json => f.write_str("json"),
            ExportFormat::Prometheus => f.write_str("prometheus"),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "prometheus" | "prom" => Ok(ExportFormat::Prometheus),
            other => Err(Error::Config {
                message: format!("Unknown export format '{}'", other),
            }),
        }
    }
}

/// Render `summary` in `format`; metric names are prefixed with `namespace`
pub fn render(summary: &PerformanceSummary, namespace: &str, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(summary)?),
        ExportFormat::Prometheus => Ok(to_prometheus(summary, namespace)),
    }
}

/// Prometheus text exposition format
pub fn to_prometheus(summary: &PerformanceSummary, namespace: &str) -> String {
    let mut out = String::new();

    let requests = format!("{}_requests_total", namespace);
    out.push_str(&format!("# HELP {} Total completed operations\n", requests));
    out.push_str(&format!("# TYPE {} counter\n", requests));
    out.push_str(&format!("{} {}\n", requests, summary.total_requests));

    let errors = format!("{}_errors_total", namespace);
    out.push_str(&format!("# HELP {} Total failed operations\n", errors));
    out.push_str(&format!("# TYPE {} counter\n", errors));
    out.push_str(&format!("{} {}\n", errors, summary.total_errors));

    let average = format!("{}_average_response_time_seconds", namespace);
    out.push_str(&format!("# HELP {} Mean operation duration\n", average));
    out.push_str(&format!("# TYPE {} gauge\n", average));
    out.push_str(&format!(
        "{} {:?}\n",
        average,
        summary.average_response_time_ms / 1000.0
    ));

    if !summary.operations.is_empty() {
        let op_requests = format!("{}_operation_requests_total", namespace);
        out.push_str(&format!("# HELP {} Completed operations by name\n", op_requests));
        out.push_str(&format!("# TYPE {} counter\n", op_requests));
        for (operation, stats) in &summary.operations {
            out.push_str(&format!(
                "{}{{operation=\"{}\"}} {}\n",
                op_requests,
                escape_label(operation),
                stats.requests
            ));
        }

        let op_errors = format!("{}_operation_errors_total", namespace);
        out.push_str(&format!("# HELP {} Failed operations by name\n", op_errors));
        out.push_str(&format!("# TYPE {} counter\n", op_errors));
        for (operation, stats) in &summary.operations {
            out.push_str(&format!(
                "{}{{operation=\"{}\"}} {}\n",
                op_errors,
                escape_label(operation),
                stats.errors
            ));
        }

        let response_time = format!("{}_response_time_seconds", namespace);
        out.push_str(&format!(
            "# HELP {} Operation duration percentiles over recent samples\n",
            response_time
        ));
        out.push_str(&format!("# TYPE {} gauge\n", response_time));
        for (operation, stats) in &summary.operations {
            for (quantile, value_ms) in stats.percentiles.quantiles() {
                out.push_str(&format!(
                    "{}{{operation=\"{}\",quantile=\"{}\"}} {:?}\n",
                    response_time,
                    escape_label(operation),
                    quantile,
                    value_ms as f64 / 1000.0
                ));
            }
        }
    }

    if !summary.log_levels.is_empty() {
        let log_entries = format!("{}_log_entries_total", namespace);
        out.push_str(&format!("# HELP {} Emitted log entries by level\n", log_entries));
        out.push_str(&format!("# TYPE {} counter\n", log_entries));
        for (level, count) in &summary.log_levels {
            out.push_str(&format!("{}{{level=\"{}\"}} {}\n", log_entries, level, count));
        }
    }

    out
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
