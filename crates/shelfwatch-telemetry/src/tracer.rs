//! Trace and span lifecycle for tracked operations
//!
//! A trace is opened with [`Tracer::start`], which hands back a
//! [`TraceContext`]. The caller threads that context through its own call
//! path and passes it to [`Logger::log_in`](crate::Logger::log_in); there is
//! no ambient "current operation", so overlapping traces never borrow each
//! other's id.

use crate::{
    alerts::AlertManager,
    clock::Clock,
    config::{LogLevel, TracingConfig},
    logger::Logger,
    metrics::{MetricsAggregator, OperationStatus},
    Fields,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Unique identifier of one trace
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(String);

impl TraceId {
    /// Generate a new random trace ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TraceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for TraceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Request-scoped handle identifying the trace a call path belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: TraceId,
    pub operation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Active,
    Success,
    Error,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceStatus::Active => "active",
            TraceStatus::Success => "success",
            TraceStatus::Error => "error",
        }
    }
}

/// A named checkpoint inside a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Fields::is_empty")]
    pub data: Fields,
}

/// A caller error captured at trace completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedError {
    pub message: String,
    /// Type name of the original error
    pub kind: String,
    /// Messages of the `source()` chain, outermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
}

impl CapturedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: "Error".to_string(),
            chain: Vec::new(),
        }
    }

    pub fn from_error<E: std::error::Error + 'static>(error: &E) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        Self {
            message: error.to_string(),
            kind: std::any::type_name::<E>().to_string(),
            chain,
        }
    }
}

impl fmt::Display for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One tracked operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: TraceId,
    pub operation: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: TraceStatus,
    pub spans: Vec<Span>,
    #[serde(default, skip_serializing_if = "Fields::is_empty")]
    pub metadata: Fields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CapturedError>,
}

impl Trace {
    pub fn context(&self) -> TraceContext {
        TraceContext {
            trace_id: self.trace_id.clone(),
            operation: self.operation.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TraceStatus::Active
    }

    /// `end_time - start_time`, once finalized
    pub fn duration_ms(&self) -> Option<u64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds().max(0) as u64)
    }
}

/// Published to subscribers whenever a trace is finalized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceCompletion {
    pub context: TraceContext,
    pub status: TraceStatus,
    pub duration_ms: u64,
    pub error: Option<CapturedError>,
}

/// Owns every trace and drives logging, metrics and alerts on completion
#[derive(Debug)]
pub struct Tracer {
    enabled: bool,
    retention: Duration,
    clock: Arc<dyn Clock>,
    logger: Arc<Logger>,
    metrics: Arc<MetricsAggregator>,
    alerts: Arc<AlertManager>,
    traces: RwLock<HashMap<TraceId, Arc<Mutex<Trace>>>>,
    active: Mutex<HashMap<TraceId, String>>,
    completions: broadcast::Sender<TraceCompletion>,
}

impl Tracer {
    pub fn new(
        config: &TracingConfig,
        clock: Arc<dyn Clock>,
        logger: Arc<Logger>,
        metrics: Arc<MetricsAggregator>,
        alerts: Arc<AlertManager>,
    ) -> Self {
        let (completions, _) = broadcast::channel(config.completion_channel_capacity.max(1));

        Self {
            enabled: config.enabled,
            retention: Duration::hours(i64::from(config.trace_retention_hours)),
            clock,
            logger,
            metrics,
            alerts,
            traces: RwLock::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            completions,
        }
    }

    /// Open a trace for `operation`
    ///
    /// With tracing disabled a context is still returned, but nothing is
    /// registered and the other operations treat its id as unknown.
    pub fn start(&self, operation: &str, metadata: Option<Fields>) -> TraceContext {
        let ctx = TraceContext {
            trace_id: TraceId::new(),
            operation: operation.to_string(),
        };

        if !self.enabled {
            return ctx;
        }

        let metadata = metadata.unwrap_or_default();
        let trace = Trace {
            trace_id: ctx.trace_id.clone(),
            operation: ctx.operation.clone(),
            start_time: self.clock.now(),
            end_time: None,
            status: TraceStatus::Active,
            spans: Vec::new(),
            metadata: metadata.clone(),
            result: None,
            error: None,
        };

        crate::write(&self.traces).insert(ctx.trace_id.clone(), Arc::new(Mutex::new(trace)));
        crate::lock(&self.active).insert(ctx.trace_id.clone(), ctx.operation.clone());

        let mut context = Fields::new();
        context.insert("operation".to_string(), json!(operation));
        self.logger.log_in(
            &ctx,
            LogLevel::Trace,
            &format!("Trace started: {}", operation),
            Some(context),
            Some(metadata),
        );

        ctx
    }

    fn find(&self, trace_id: &TraceId) -> Option<Arc<Mutex<Trace>>> {
        crate::read(&self.traces).get(trace_id).map(Arc::clone)
    }

    /// Append a span to an active trace; returns false if it was not recorded
    pub fn add_span(&self, trace_id: &TraceId, name: &str, data: Option<Fields>) -> bool {
        let Some(trace) = self.find(trace_id) else {
            return false;
        };

        let mut trace = crate::lock(&trace);
        if !trace.is_active() {
            return false;
        }

        trace.spans.push(Span {
            name: name.to_string(),
            timestamp: self.clock.now(),
            data: data.unwrap_or_default(),
        });
        true
    }

    /// Finalize a trace
    ///
    /// Returns the finalized trace, or `None` when the id is unknown or the
    /// trace was already finalized. Only the first call records anything.
    pub fn end(
        &self,
        trace_id: &TraceId,
        result: Option<Value>,
        error: Option<CapturedError>,
    ) -> Option<Trace> {
        let trace = self.find(trace_id)?;

        let finished = {
            let mut trace = crate::lock(&trace);
            if !trace.is_active() {
                return None;
            }

            let now = self.clock.now();
            trace.end_time = Some(now.max(trace.start_time));
            trace.status = if error.is_some() {
                TraceStatus::Error
            } else {
                TraceStatus::Success
            };
            trace.result = result;
            trace.error = error;
            trace.clone()
        };

        crate::lock(&self.active).remove(trace_id);

        let ctx = finished.context();
        let duration_ms = finished.duration_ms().unwrap_or(0);
        let status = match finished.status {
            TraceStatus::Error => OperationStatus::Error,
            _ => OperationStatus::Success,
        };

        self.log_completion(&finished, duration_ms);
        self.metrics.record(&ctx.operation, duration_ms, status);
        self.alerts
            .evaluate_traced(&ctx.operation, duration_ms, Some(&ctx));

        // No subscribers is not an error
        let _ = self.completions.send(TraceCompletion {
            context: ctx,
            status: finished.status,
            duration_ms,
            error: finished.error.clone(),
        });

        Some(finished)
    }

    fn log_completion(&self, trace: &Trace, duration_ms: u64) {
        let mut context = Fields::new();
        context.insert("operation".to_string(), json!(trace.operation));
        context.insert("duration_ms".to_string(), json!(duration_ms));
        context.insert("status".to_string(), json!(trace.status.as_str()));
        context.insert("spans".to_string(), json!(trace.spans.len()));

        let (level, message) = match &trace.error {
            Some(error) => {
                context.insert("error".to_string(), json!(error));
                (
                    LogLevel::Error,
                    format!(
                        "Trace failed: {} after {}ms: {}",
                        trace.operation, duration_ms, error.message
                    ),
                )
            }
            None => (
                LogLevel::Info,
                format!("Trace completed: {} in {}ms", trace.operation, duration_ms),
            ),
        };

        self.logger
            .log_in(&trace.context(), level, &message, Some(context), None);
    }

    /// Copy of a trace, active or finished
    pub fn get(&self, trace_id: &TraceId) -> Option<Trace> {
        let trace = self.find(trace_id)?;
        let snapshot = crate::lock(&trace).clone();
        Some(snapshot)
    }

    /// Contexts of every trace that has not been ended
    pub fn active_contexts(&self) -> Vec<TraceContext> {
        crate::lock(&self.active)
            .iter()
            .map(|(trace_id, operation)| TraceContext {
                trace_id: trace_id.clone(),
                operation: operation.clone(),
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        crate::lock(&self.active).len()
    }

    /// Traces held in memory, finished or not
    pub fn tracked_count(&self) -> usize {
        crate::read(&self.traces).len()
    }

    /// Receive a [`TraceCompletion`] for every trace finalized from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TraceCompletion> {
        self.completions.subscribe()
    }

    /// Evict traces that started before the retention horizon
    ///
    /// Age is the only criterion, so a trace that was never ended is evicted
    /// too once it is old enough.
    pub fn cleanup(&self) -> usize {
        let cutoff = self.clock.now() - self.retention;

        let expired: Vec<TraceId> = {
            let mut traces = crate::write(&self.traces);
            let expired: Vec<TraceId> = traces
                .iter()
                .filter(|(_, trace)| crate::lock(trace).start_time < cutoff)
                .map(|(trace_id, _)| trace_id.clone())
                .collect();
            for trace_id in &expired {
                traces.remove(trace_id);
            }
            expired
        };

        if !expired.is_empty() {
            let mut active = crate::lock(&self.active);
            for trace_id in &expired {
                active.remove(trace_id);
            }

            tracing::debug!(
                telemetry.event = "traces_evicted",
                removed = expired.len(),
                "Evicted expired traces"
            );
        }

        expired.len()
    }

    pub fn clear(&self) {
        crate::write(&self.traces).clear();
        crate::lock(&self.active).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::TelemetryConfig;
    use tempfile::TempDir;

    struct Harness {
        tracer: Tracer,
        clock: Arc<ManualClock>,
        metrics: Arc<MetricsAggregator>,
        alerts: Arc<AlertManager>,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = TelemetryConfig::with_log_dir(dir.path());
        config.logging.console_enabled = false;
        config.metrics.facade_enabled = false;

        let clock = Arc::new(ManualClock::default());
        let metrics = Arc::new(MetricsAggregator::new(&config.metrics, clock.clone()));
        let logger = Arc::new(Logger::new(&config, clock.clone(), metrics.clone()).unwrap());
        let alerts = Arc::new(AlertManager::new(&config.alerts, clock.clone()));
        let tracer = Tracer::new(
            &config.tracing,
            clock.clone(),
            logger,
            metrics.clone(),
            alerts.clone(),
        );

        Harness {
            tracer,
            clock,
            metrics,
            alerts,
            _dir: dir,
        }
    }

    #[test]
    fn test_trace_lifecycle_success() {
        let h = harness();

        let ctx = h.tracer.start("uploadImage", None);
        assert_eq!(h.tracer.active_count(), 1);
        assert!(h.tracer.add_span(&ctx.trace_id, "resize", None));

        h.clock.advance(Duration::milliseconds(1_250));
        let trace = h
            .tracer
            .end(&ctx.trace_id, Some(json!({ "url": "cdn/1.jpg" })), None)
            .unwrap();

        assert_eq!(trace.status, TraceStatus::Success);
        assert_eq!(trace.duration_ms(), Some(1_250));
        assert_eq!(trace.spans.len(), 1);
        assert_eq!(h.tracer.active_count(), 0);
        assert_eq!(h.tracer.tracked_count(), 1);
        assert_eq!(h.metrics.query(0).operations["uploadImage"].requests, 1);
    }

    #[test]
    fn test_end_is_idempotent() {
        let h = harness();
        let ctx = h.tracer.start("search", None);
        h.clock.advance(Duration::milliseconds(6_000));

        assert!(h.tracer.end(&ctx.trace_id, None, None).is_some());
        assert!(h
            .tracer
            .end(&ctx.trace_id, None, Some(CapturedError::new("late")))
            .is_none());

        let trace = h.tracer.get(&ctx.trace_id).unwrap();
        assert_eq!(trace.status, TraceStatus::Success);
        assert!(trace.error.is_none());
        assert_eq!(h.metrics.query(0).operations["search"].requests, 1);
        assert_eq!(h.alerts.len(), 1);
    }

    #[test]
    fn test_spans_only_while_active_and_unknown_ids_are_ignored() {
        let h = harness();
        let ctx = h.tracer.start("categorizeProducts", None);
        h.tracer.end(&ctx.trace_id, None, None);

        assert!(!h.tracer.add_span(&ctx.trace_id, "late", None));
        assert!(!h.tracer.add_span(&TraceId::from("missing"), "x", None));
        assert!(h.tracer.end(&TraceId::from("missing"), None, None).is_none());
        assert!(h.tracer.get(&ctx.trace_id).unwrap().spans.is_empty());
    }

    #[test]
    fn test_error_completion_captures_error() {
        let h = harness();
        let ctx = h.tracer.start("batchUpsert", None);

        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout");
        let trace = h
            .tracer
            .end(&ctx.trace_id, None, Some(CapturedError::from_error(&io)))
            .unwrap();

        assert_eq!(trace.status, TraceStatus::Error);
        let error = trace.error.unwrap();
        assert_eq!(error.message, "timeout");
        assert!(error.kind.ends_with("Error"));
        assert_eq!(h.metrics.query(0).operations["batchUpsert"].errors, 1);
    }

    #[test]
    fn test_clock_stepping_back_keeps_duration_non_negative() {
        let h = harness();
        let ctx = h.tracer.start("search", None);
        h.clock.advance(Duration::seconds(-5));

        let trace = h.tracer.end(&ctx.trace_id, None, None).unwrap();

        assert!(trace.end_time.unwrap() >= trace.start_time);
        assert_eq!(trace.duration_ms(), Some(0));
    }

    #[test]
    fn test_cleanup_evicts_by_age_only() {
        let h = harness();
        let stale = h.tracer.start("batchUpsert", None);
        h.clock.advance(Duration::hours(20));
        let fresh = h.tracer.start("batchUpsert", None);
        h.tracer.end(&fresh.trace_id, None, None);
        h.clock.advance(Duration::hours(5));

        assert_eq!(h.tracer.cleanup(), 1);
        assert!(h.tracer.get(&stale.trace_id).is_none());
        assert!(h.tracer.get(&fresh.trace_id).is_some());
        assert_eq!(h.tracer.active_count(), 0);
    }

    #[test]
    fn test_concurrent_traces_keep_their_own_context() {
        let h = harness();
        let first = h.tracer.start("uploadImage", None);
        let second = h.tracer.start("generateSeoContent", None);

        h.tracer.add_span(&first.trace_id, "upload", None);
        h.tracer.end(&second.trace_id, None, None);

        let active = h.tracer.active_contexts();
        assert_eq!(active, vec![first.clone()]);
        assert_eq!(h.tracer.get(&first.trace_id).unwrap().spans[0].name, "upload");
    }

    #[tokio::test]
    async fn test_completion_subscribers() {
        let h = harness();
        let mut completions = h.tracer.subscribe();

        let ctx = h.tracer.start("search", None);
        h.tracer.end(&ctx.trace_id, None, Some(CapturedError::new("index offline")));

        let completion = completions.recv().await.unwrap();
        assert_eq!(completion.context, ctx);
        assert_eq!(completion.status, TraceStatus::Error);
    }

    #[test]
    fn test_disabled_tracing_records_nothing() {
        let h = harness();
        let config = TracingConfig {
            enabled: false,
            ..TracingConfig::default()
        };
        let tracer = Tracer::new(
            &config,
            h.clock.clone(),
            h.tracer.logger.clone(),
            h.metrics.clone(),
            h.alerts.clone(),
        );

        let ctx = tracer.start("search", None);
        assert!(tracer.end(&ctx.trace_id, None, None).is_none());
        assert_eq!(tracer.tracked_count(), 0);
    }
}
