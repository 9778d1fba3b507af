//! Main telemetry system implementation

use crate::{
    alerts::AlertManager,
    clock::{Clock, SystemClock},
    config::{LogFormat, LogLevel, TelemetryConfig},
    export::{self, ExportFormat, EXPORT_WINDOW_HOURS},
    logger::{LogEntry, Logger, LOG_FILES},
    metrics::{MetricsAggregator, PerformanceSummary},
    process,
    report::{PerformanceReport, ReportGenerator},
    retention::{CleanupReport, RetentionManager},
    scheduler::Scheduler,
    tracer::{CapturedError, Trace, TraceCompletion, TraceContext, TraceId, Tracer},
    Error, Fields, Result,
};
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// Entry point to the engine: every public operation is fail-open
///
/// Cloning is cheap and every clone drives the same engine.
#[derive(Debug, Clone)]
pub struct TelemetrySystem {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: TelemetryConfig,
    logger: Arc<Logger>,
    metrics: Arc<MetricsAggregator>,
    alerts: Arc<AlertManager>,
    tracer: Arc<Tracer>,
    reports: ReportGenerator,
    retention: RetentionManager,
    scheduler: Scheduler,
    shut_down: AtomicBool,
}

/// Outcome of one run of the hourly cleanup task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub buckets_removed: usize,
    pub traces_removed: usize,
}

/// Outcome of one run of the daily rotation task
#[derive(Debug, Clone, Default)]
pub struct RotationOutcome {
    pub rotated: Vec<PathBuf>,
    pub retention: CleanupReport,
}

impl TelemetrySystem {
    /// Build the engine on the system clock
    pub fn new(config: TelemetryConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build the engine on a caller-supplied clock
    pub fn with_clock(config: TelemetryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        process::mark_start();

        let metrics = Arc::new(MetricsAggregator::new(&config.metrics, clock.clone()));
        let logger = Arc::new(Logger::new(&config, clock.clone(), metrics.clone())?);
        let alerts = Arc::new(
            AlertManager::new(&config.alerts, clock.clone()).with_logger(logger.clone()),
        );
        let tracer = Arc::new(Tracer::new(
            &config.tracing,
            clock.clone(),
            logger.clone(),
            metrics.clone(),
            alerts.clone(),
        ));
        let reports = ReportGenerator::new(
            clock,
            logger.clone(),
            metrics.clone(),
            alerts.clone(),
            tracer.clone(),
        );
        let retention = RetentionManager::new(config.retention.clone());

        tracing::info!(
            telemetry.event = "system_initialized",
            telemetry.version = env!("CARGO_PKG_VERSION"),
            log_dir = %config.logging.log_dir.display(),
            file_logging = config.logging.file_enabled,
            "Telemetry system initialized successfully"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                logger,
                metrics,
                alerts,
                tracer,
                reports,
                retention,
                scheduler: Scheduler::new(),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Install a global console subscriber for `config`
    ///
    /// Fails if a global subscriber is already set.
    pub fn init_console(config: &TelemetryConfig) -> Result<()> {
        let console = Self::build_console_layer(config);

        Registry::default()
            .with(console)
            .with(Self::build_env_filter(config)?)
            .try_init()
            .map_err(|e| Error::System {
                message: format!("Failed to initialize tracing subscriber: {}", e),
            })
    }

    /// Build environment filter for log level filtering
    fn build_env_filter(config: &TelemetryConfig) -> Result<EnvFilter> {
        // Allow environment override
        if std::env::var("RUST_LOG").is_ok() {
            return EnvFilter::try_from_default_env().map_err(|e| Error::Config {
                message: format!("Invalid RUST_LOG filter: {}", e),
            });
        }

        let level: Level = config.logging.level.into();
        let mut filter = EnvFilter::new(level.to_string());

        for directive in ["hyper=warn", "reqwest=warn", "h2=warn"] {
            filter = filter.add_directive(directive.parse().map_err(|e| Error::Config {
                message: format!("Invalid filter directive '{}': {}", directive, e),
            })?);
        }

        Ok(filter)
    }

    /// Build console logging layer
    fn build_console_layer(config: &TelemetryConfig) -> Option<Box<dyn Layer<Registry> + Send + Sync>> {
        if !config.logging.console_enabled {
            return None;
        }

        let layer = match config.logging.format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_target(true)
                .boxed(),
            LogFormat::Pretty => fmt::layer().pretty().with_target(true).boxed(),
            LogFormat::Compact => fmt::layer().compact().with_target(false).boxed(),
        };

        Some(layer)
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.inner.config
    }

    pub fn logger(&self) -> &Logger {
        &self.inner.logger
    }

    pub fn metrics(&self) -> &MetricsAggregator {
        &self.inner.metrics
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.inner.alerts
    }

    pub fn tracer(&self) -> &Tracer {
        &self.inner.tracer
    }

    pub fn log(
        &self,
        level: LogLevel,
        message: &str,
        context: Option<Fields>,
        metadata: Option<Fields>,
    ) -> LogEntry {
        self.inner.logger.log(level, message, context, metadata)
    }

    /// Log tagged with the trace behind `ctx`
    pub fn log_in(
        &self,
        ctx: &TraceContext,
        level: LogLevel,
        message: &str,
        context: Option<Fields>,
        metadata: Option<Fields>,
    ) -> LogEntry {
        self.inner.logger.log_in(ctx, level, message, context, metadata)
    }

    pub fn audit(&self, action: &str, context: Option<Fields>) -> LogEntry {
        self.inner.logger.audit(action, context)
    }

    pub fn start_trace(&self, operation: &str, metadata: Option<Fields>) -> TraceContext {
        self.inner.tracer.start(operation, metadata)
    }

    pub fn add_span(&self, trace_id: &TraceId, name: &str, data: Option<Fields>) -> bool {
        self.inner.tracer.add_span(trace_id, name, data)
    }

    pub fn end_trace(
        &self,
        trace_id: &TraceId,
        result: Option<Value>,
        error: Option<CapturedError>,
    ) -> Option<Trace> {
        self.inner.tracer.end(trace_id, result, error)
    }

    pub fn get_trace(&self, trace_id: &TraceId) -> Option<Trace> {
        self.inner.tracer.get(trace_id)
    }

    pub fn active_traces(&self) -> Vec<TraceContext> {
        self.inner.tracer.active_contexts()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TraceCompletion> {
        self.inner.tracer.subscribe()
    }

    /// Run `operation` inside a trace, ending it with the outcome
    pub async fn traced<T, E, F, Fut>(&self, operation: &str, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(TraceContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let ctx = self.start_trace(operation, None);
        let trace_id = ctx.trace_id.clone();

        let outcome = f(ctx).await;
        match &outcome {
            Ok(_) => self.end_trace(&trace_id, None, None),
            Err(e) => self.end_trace(&trace_id, None, Some(CapturedError::from_error(e))),
        };

        outcome
    }

    pub fn get_performance_metrics(&self, hours: u32) -> PerformanceSummary {
        self.inner.metrics.query(hours)
    }

    /// Render the last hour of metrics; empty on failure
    pub fn export_metrics(&self, format: ExportFormat) -> String {
        let summary = self.inner.metrics.query(EXPORT_WINDOW_HOURS);

        match export::render(&summary, &self.inner.config.metrics.namespace, format) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(
                    telemetry.event = "export_failed",
                    format = %format,
                    error = %e,
                    "Failed to export metrics"
                );
                String::new()
            }
        }
    }

    pub fn generate_report(&self) -> PerformanceReport {
        self.inner.reports.generate()
    }

    pub fn acknowledge_alert(&self, alert_id: &str) -> bool {
        self.inner.alerts.acknowledge(alert_id)
    }

    /// Evict expired metric buckets and traces
    pub fn run_cleanup(&self) -> CleanupOutcome {
        let outcome = CleanupOutcome {
            buckets_removed: self
                .inner
                .metrics
                .cleanup(self.inner.config.metrics.retention_days),
            traces_removed: self.inner.tracer.cleanup(),
        };

        tracing::info!(
            telemetry.event = "cleanup_completed",
            buckets_removed = outcome.buckets_removed,
            traces_removed = outcome.traces_removed,
            "Telemetry cleanup completed"
        );

        outcome
    }

    /// Rotate oversized log files and apply archive retention
    pub async fn run_rotation(&self) -> RotationOutcome {
        if !self.inner.config.logging.file_enabled {
            return RotationOutcome::default();
        }

        let rotated = self.inner.logger.rotate_oversized();
        let stems: Vec<&str> = LOG_FILES
            .iter()
            .filter_map(|name| name.strip_suffix(".log"))
            .collect();
        let retention = self
            .inner
            .retention
            .cleanup_all(self.inner.logger.log_dir(), &stems)
            .await;

        RotationOutcome { rotated, retention }
    }

    /// Start the cleanup, rotation and report timers
    ///
    /// Returns false when there is no Tokio runtime or after shutdown.
    pub fn start_background_tasks(&self) -> bool {
        let schedule = &self.inner.config.schedule;
        let scheduler = &self.inner.scheduler;

        let cleanup = self.weak();
        let rotation = self.weak();
        let report = self.weak();

        scheduler.spawn_periodic(
            "metrics_cleanup",
            Duration::from_secs(schedule.cleanup_interval_secs),
            move || {
                let system = upgrade(&cleanup);
                async move {
                    if let Some(system) = system {
                        system.run_cleanup();
                    }
                }
            },
        ) && scheduler.spawn_periodic(
            "log_rotation",
            Duration::from_secs(schedule.rotation_interval_secs),
            move || {
                let system = upgrade(&rotation);
                async move {
                    if let Some(system) = system {
                        system.run_rotation().await;
                    }
                }
            },
        ) && scheduler.spawn_periodic(
            "performance_report",
            Duration::from_secs(schedule.report_interval_secs),
            move || {
                let system = upgrade(&report);
                async move {
                    if let Some(system) = system {
                        system.generate_report();
                    }
                }
            },
        )
    }

    fn weak(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    /// Stop background tasks, write a final report and clear in-memory state
    ///
    /// Only the first call does anything; the engine stays usable afterwards.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.scheduler.shutdown().await;

        let report = self.generate_report();

        self.inner.tracer.clear();
        self.inner.metrics.clear();
        self.inner.alerts.clear();

        tracing::info!(
            telemetry.event = "system_shutdown",
            final_report = ?report.written_to,
            "Telemetry system shut down"
        );
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<TelemetrySystem> {
    weak.upgrade().map(|inner| TelemetrySystem { inner })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn quiet_config(dir: &std::path::Path) -> TelemetryConfig {
        let mut config = TelemetryConfig::with_log_dir(dir);
        config.logging.console_enabled = false;
        config.metrics.facade_enabled = false;
        config
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = quiet_config(temp_dir.path());
        config.alerts.max_alerts = 0;

        assert!(TelemetrySystem::new(config).is_err());
    }

    #[test]
    #[serial]
    fn test_env_filter_honours_rust_log() {
        let config = TelemetryConfig::default();

        std::env::remove_var("RUST_LOG");
        assert!(TelemetrySystem::build_env_filter(&config).is_ok());

        std::env::set_var("RUST_LOG", "shelfwatch=debug");
        assert!(TelemetrySystem::build_env_filter(&config).is_ok());
        std::env::remove_var("RUST_LOG");
    }

    #[test]
    fn test_console_layer_respects_toggle() {
        let mut config = TelemetryConfig::default();
        assert!(TelemetrySystem::build_console_layer(&config).is_some());

        config.logging.console_enabled = false;
        assert!(TelemetrySystem::build_console_layer(&config).is_none());
    }

    #[tokio::test]
    async fn test_traced_wraps_outcome() {
        let temp_dir = TempDir::new().unwrap();
        let telemetry = TelemetrySystem::new(quiet_config(temp_dir.path())).unwrap();

        let ok: std::result::Result<u32, std::io::Error> =
            telemetry.traced("search", |_ctx| async { Ok(3) }).await;
        let failed: std::result::Result<u32, std::io::Error> = telemetry
            .traced("search", |_ctx| async {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "index offline"))
            })
            .await;

        assert_eq!(ok.unwrap(), 3);
        assert!(failed.is_err());

        let search = &telemetry.get_performance_metrics(1).operations["search"];
        assert_eq!(search.requests, 2);
        assert_eq!(search.errors, 1);
    }

    #[test]
    fn test_background_tasks_need_a_runtime() {
        let temp_dir = TempDir::new().unwrap();
        let telemetry = TelemetrySystem::new(quiet_config(temp_dir.path())).unwrap();

        assert!(!telemetry.start_background_tasks());
    }
}
