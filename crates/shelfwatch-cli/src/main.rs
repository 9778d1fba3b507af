use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use rand::Rng;
use serde_json::json;
use shelfwatch_telemetry::{
    logger::read_entries,
    report::{latest_report, read_report},
    CapturedError, ExportFormat, Fields, LogEntry, LogLevel, ManualClock, TelemetryConfig,
    TelemetrySystem,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(
    after_help = "LOG FILES:\n  application   info and warn entries\n  errors        error entries\n  performance   debug and trace entries\n  audit         audit trail\n\nEnvironment variables prefixed with SHELFWATCH_ override the configuration file."
)]
struct Cli {
    /// Telemetry configuration file
    #[arg(long, global = true, help = "Path to telemetry configuration file")]
    config: Option<PathBuf>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(long, global = true, help = "Set log level")]
    log_level: Option<String>,

    /// Set log format (json, pretty, compact)
    #[arg(long, global = true, help = "Set console log format")]
    log_format: Option<String>,

    /// Set log directory
    #[arg(long, global = true, help = "Directory for log files and reports")]
    log_dir: Option<PathBuf>,

    /// Disable file logging
    #[arg(long, global = true, help = "Disable logging to files")]
    no_file_logging: bool,

    /// Disable log sanitization (WARNING: may log sensitive data)
    #[arg(long, global = true, help = "Disable log data sanitization (UNSAFE)")]
    no_sanitize: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect or create the telemetry configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Print entries from a JSON-Lines log file
    Logs {
        /// Log directory (defaults to the configured one)
        #[arg(long)]
        dir: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "application")]
        file: LogFile,

        /// Only entries at this severity or worse
        #[arg(long)]
        level: Option<String>,

        /// Only entries emitted under this trace id
        #[arg(long)]
        trace: Option<String>,

        /// Show at most this many of the newest matching entries
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Print the newest performance report
    Report {
        /// Report directory (defaults to the configured log directory)
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Print the raw report JSON
        #[arg(long)]
        json: bool,
    },

    /// Drive the engine with a synthetic batch pipeline and print the export
    Simulate {
        #[arg(long, default_value_t = 25)]
        operations: usize,

        #[arg(long, value_enum, default_value = "prometheus")]
        format: OutputFormat,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,

    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFile {
    Application,
    Errors,
    Performance,
    Audit,
}

impl LogFile {
    fn file_name(self) -> &'static str {
        match self {
            LogFile::Application => "application.log",
            LogFile::Errors => "errors.log",
            LogFile::Performance => "performance.log",
            LogFile::Audit => "audit.log",
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Json,
    Prometheus,
}

impl From<OutputFormat> for ExportFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Json => ExportFormat::Json,
            OutputFormat::Prometheus => ExportFormat::Prometheus,
        }
    }
}

/// Synthetic operations with their typical duration in milliseconds
const PIPELINE_OPERATIONS: [(&str, u64); 5] = [
    ("batchUpsert", 20_000),
    ("uploadImage", 6_000),
    ("generateSeoContent", 18_000),
    ("categorizeProducts", 9_000),
    ("search", 2_500),
];

/// Create telemetry configuration from CLI arguments
async fn create_telemetry_config(cli: &Cli) -> Result<TelemetryConfig> {
    // Env overrides are applied by load
    let mut config = TelemetryConfig::load(cli.config.as_deref())
        .await
        .context("Failed to load telemetry configuration")?;

    if let Some(log_level_str) = &cli.log_level {
        config.logging.level = match log_level_str.parse() {
            Ok(level) => level,
            Err(_) => {
                warn!("Invalid log level '{}', using default", log_level_str);
                config.logging.level
            }
        };
    }

    if let Some(log_format_str) = &cli.log_format {
        config.logging.format = match log_format_str.parse() {
            Ok(format) => format,
            Err(_) => {
                warn!("Invalid log format '{}', using default", log_format_str);
                config.logging.format
            }
        };
    }

    if cli.no_file_logging {
        config.logging.file_enabled = false;
    }

    if let Some(log_dir) = &cli.log_dir {
        config.logging.log_dir = log_dir.clone();
    }

    if cli.no_sanitize {
        warn!("Log sanitization disabled - sensitive data may be logged!");
        config.privacy.sanitize_enabled = false;
    }

    Ok(config)
}

async fn config_command(cli: &Cli, config: &TelemetryConfig, action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Init { force } => {
            let path = match &cli.config {
                Some(path) => path.clone(),
                None => TelemetryConfig::default_config_path()?,
            };

            if path.exists() && !force {
                bail!(
                    "{} already exists, pass --force to overwrite it",
                    path.display()
                );
            }

            TelemetryConfig::default()
                .save(Some(&path))
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote default configuration to {}", path.display());
        }
    }

    Ok(())
}

/// Newest `limit` entries at `level` or worse, optionally from one trace
fn select_entries(
    entries: Vec<LogEntry>,
    level: Option<LogLevel>,
    trace: Option<&str>,
    limit: usize,
) -> Vec<LogEntry> {
    let matching: Vec<LogEntry> = entries
        .into_iter()
        .filter(|e| level.map_or(true, |threshold| e.level.passes(threshold)))
        .filter(|e| trace.map_or(true, |id| e.trace_id() == Some(id)))
        .collect();

    let skip = matching.len().saturating_sub(limit);
    matching.into_iter().skip(skip).collect()
}

fn format_entry(entry: &LogEntry) -> String {
    let mut line = format!(
        "{} {:<5} ",
        entry.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        entry.level.as_str().to_uppercase()
    );

    if let Some(trace) = &entry.trace {
        line.push_str(&format!("[{} {}] ", trace.operation, trace.trace_id));
    }
    line.push_str(&entry.message);

    if !entry.context.is_empty() {
        if let Ok(context) = serde_json::to_string(&entry.context) {
            line.push(' ');
            line.push_str(&context);
        }
    }

    line
}

fn logs_command(
    dir: &Path,
    file: LogFile,
    level: Option<&str>,
    trace: Option<&str>,
    limit: usize,
) -> Result<()> {
    let path = dir.join(file.file_name());
    if !path.exists() {
        bail!("No log file at {}", path.display());
    }

    let level: Option<LogLevel> = level.map(str::parse::<LogLevel>).transpose()?;
    let entries = read_entries(&path).with_context(|| format!("Failed to read {}", path.display()))?;

    for entry in select_entries(entries, level, trace, limit) {
        println!("{}", format_entry(&entry));
    }

    Ok(())
}

fn report_command(dir: &Path, raw_json: bool) -> Result<()> {
    let Some(path) = latest_report(dir)? else {
        bail!("No performance reports in {}", dir.display());
    };

    if raw_json {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        println!("{}", content);
        return Ok(());
    }

    let report = read_report(&path).with_context(|| format!("Failed to parse {}", path.display()))?;
    let metrics = &report.metrics;

    println!("Report:        {}", path.display());
    println!("Generated at:  {}", report.generated_at.to_rfc3339());
    println!("Window:        {}h", report.window_hours);
    println!(
        "Requests:      {} ({} errors, {:.1}% error rate)",
        metrics.total_requests,
        metrics.total_errors,
        metrics.error_rate * 100.0
    );
    println!("Avg response:  {:.1}ms", metrics.average_response_time_ms);
    println!(
        "Process:       pid {}, up {}s, {} active / {} tracked traces",
        report.health.pid,
        report.health.uptime_seconds,
        report.health.active_traces,
        report.health.tracked_traces
    );

    if !metrics.operations.is_empty() {
        println!();
        println!(
            "{:<22} {:>8} {:>7} {:>9} {:>9} {:>9}",
            "operation", "requests", "errors", "p50 ms", "p95 ms", "p99 ms"
        );
        for (operation, stats) in &metrics.operations {
            println!(
                "{:<22} {:>8} {:>7} {:>9} {:>9} {:>9}",
                operation,
                stats.requests,
                stats.errors,
                stats.percentiles.p50,
                stats.percentiles.p95,
                stats.percentiles.p99
            );
        }
    }

    if !report.alerts.is_empty() {
        println!();
        println!("Open alerts:");
        for alert in &report.alerts {
            println!(
                "  {} {} {}",
                alert.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
                alert.code,
                alert.message
            );
        }
    }

    Ok(())
}

async fn simulate_command(config: TelemetryConfig, operations: usize, format: OutputFormat) -> Result<()> {
    // Simulated time, so long operations finish instantly
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let telemetry = TelemetrySystem::with_clock(config, clock.clone())
        .context("Failed to start telemetry engine")?;

    let mut audit = Fields::new();
    audit.insert("operations".to_string(), json!(operations));
    telemetry.audit("simulation.started", Some(audit));

    let mut rng = rand::thread_rng();

    for batch in 0..operations {
        let (operation, typical_ms) = PIPELINE_OPERATIONS[rng.gen_range(0..PIPELINE_OPERATIONS.len())];

        let mut metadata = Fields::new();
        metadata.insert("batch".to_string(), json!(batch));
        let ctx = telemetry.start_trace(operation, Some(metadata));

        telemetry.add_span(&ctx.trace_id, "prepare", None);
        let duration_ms = rng.gen_range(typical_ms / 4..=typical_ms * 2);
        clock.advance(chrono::Duration::milliseconds(duration_ms as i64));
        telemetry.add_span(&ctx.trace_id, "commit", None);

        if rng.gen_bool(0.1) {
            let error = CapturedError::new(format!("{} rejected by upstream", operation));
            telemetry.end_trace(&ctx.trace_id, None, Some(error));
        } else {
            telemetry.end_trace(&ctx.trace_id, Some(json!({ "items": rng.gen_range(1..=250) })), None);
        }
    }

    println!("{}", telemetry.export_metrics(format.into()));

    info!(
        operations = operations,
        open_alerts = telemetry.alerts().unacknowledged().len(),
        "Simulation finished"
    );

    telemetry.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables before parsing configuration
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = create_telemetry_config(&cli).await?;

    if let Err(e) = TelemetrySystem::init_console(&config) {
        eprintln!("Failed to initialize console logging: {}", e);
    }

    match &cli.command {
        Command::Config { action } => config_command(&cli, &config, action).await,
        Command::Logs {
            dir,
            file,
            level,
            trace,
            limit,
        } => logs_command(
            dir.as_deref().unwrap_or(&config.logging.log_dir),
            *file,
            level.as_deref(),
            trace.as_deref(),
            *limit,
        ),
        Command::Report { dir, json } => {
            report_command(dir.as_deref().unwrap_or(&config.logging.log_dir), *json)
        }
        Command::Simulate { operations, format } => {
            simulate_command(config, *operations, *format).await
        }
    }
}
