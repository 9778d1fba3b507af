//! Latency threshold alerts

use crate::{
    clock::Clock,
    config::{AlertConfig, LogLevel},
    logger::Logger,
    tracer::TraceContext,
    Fields,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Code attached to latency threshold breaches
pub const HIGH_LATENCY: &str = "high_latency";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Performance,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertKind::Performance => f.write_str("performance"),
        }
    }
}

/// What was measured when the alert fired
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertDetails {
    pub operation: String,
    pub duration_ms: u64,
    pub threshold_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// An informational alert; only `acknowledged` ever changes after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub code: String,
    pub message: String,
    pub details: AlertDetails,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
}

/// Evaluates operation durations against per-operation thresholds
#[derive(Debug)]
pub struct AlertManager {
    enabled: bool,
    default_threshold_ms: u64,
    thresholds: HashMap<String, u64>,
    max_alerts: usize,
    clock: Arc<dyn Clock>,
    logger: Option<Arc<Logger>>,
    alerts: Mutex<VecDeque<Alert>>,
}

impl AlertManager {
    pub fn new(config: &AlertConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            enabled: config.enabled,
            default_threshold_ms: config.default_threshold_ms,
            thresholds: config.thresholds.clone(),
            max_alerts: config.max_alerts.max(1),
            clock,
            logger: None,
            alerts: Mutex::new(VecDeque::new()),
        }
    }

    /// Surface new alerts as `warn` log entries through `logger`
    pub fn with_logger(mut self, logger: Arc<Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn threshold_for(&self, operation: &str) -> u64 {
        self.thresholds
            .get(operation)
            .copied()
            .unwrap_or(self.default_threshold_ms)
    }

    /// Raise an alert if `duration_ms` is over the operation's threshold
    pub fn evaluate(&self, operation: &str, duration_ms: u64) -> Option<Alert> {
        self.evaluate_traced(operation, duration_ms, None)
    }

    /// Like [`evaluate`](Self::evaluate), attributing the alert to a trace
    pub fn evaluate_traced(
        &self,
        operation: &str,
        duration_ms: u64,
        trace: Option<&TraceContext>,
    ) -> Option<Alert> {
        if !self.enabled {
            return None;
        }

        let threshold_ms = self.threshold_for(operation);
        if duration_ms <= threshold_ms {
            return None;
        }

        let alert = Alert {
            id: uuid::Uuid::new_v4().to_string(),
            kind: AlertKind::Performance,
            code: HIGH_LATENCY.to_string(),
            message: format!(
                "{} took {}ms, exceeding its {}ms threshold",
                operation, duration_ms, threshold_ms
            ),
            details: AlertDetails {
                operation: operation.to_string(),
                duration_ms,
                threshold_ms,
                trace_id: trace.map(|t| t.trace_id.to_string()),
            },
            timestamp: self.clock.now(),
            acknowledged: false,
        };

        {
            let mut alerts = crate::lock(&self.alerts);
            alerts.push_back(alert.clone());
            while alerts.len() > self.max_alerts {
                alerts.pop_front();
            }
        }

        if let Some(logger) = &self.logger {
            let mut context = Fields::new();
            context.insert("alert_id".to_string(), json!(alert.id));
            context.insert("code".to_string(), json!(alert.code));
            context.insert("operation".to_string(), json!(operation));
            context.insert("duration_ms".to_string(), json!(duration_ms));
            context.insert("threshold_ms".to_string(), json!(threshold_ms));

            match trace {
                Some(ctx) => logger.log_in(ctx, LogLevel::Warn, &alert.message, Some(context), None),
                None => logger.log(LogLevel::Warn, &alert.message, Some(context), None),
            };
        }

        Some(alert)
    }

    /// All retained alerts, oldest first
    pub fn alerts(&self) -> Vec<Alert> {
        crate::lock(&self.alerts).iter().cloned().collect()
    }

    /// The `n` most recent alerts, newest first
    pub fn recent(&self, n: usize) -> Vec<Alert> {
        crate::lock(&self.alerts).iter().rev().take(n).cloned().collect()
    }

    pub fn unacknowledged(&self) -> Vec<Alert> {
        crate::lock(&self.alerts)
            .iter()
            .filter(|a| !a.acknowledged)
            .cloned()
            .collect()
    }

    /// Mark an alert as seen; returns false for unknown ids
    pub fn acknowledge(&self, alert_id: &str) -> bool {
        match crate::lock(&self.alerts).iter_mut().find(|a| a.id == alert_id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        crate::lock(&self.alerts).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        crate::lock(&self.alerts).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manager() -> AlertManager {
        AlertManager::new(&AlertConfig::default(), Arc::new(ManualClock::default()))
    }

    #[test]
    fn test_threshold_breach_raises_one_alert() {
        let alerts = manager();

        let alert = alerts.evaluate("uploadImage", 10_001).unwrap();

        assert_eq!(alerts.len(), 1);
        assert_eq!(alert.code, HIGH_LATENCY);
        assert_eq!(alert.kind, AlertKind::Performance);
        assert_eq!(alert.details.threshold_ms, 10_000);
        assert!(!alert.acknowledged);
    }

    #[test]
    fn test_at_or_below_threshold_is_quiet() {
        let alerts = manager();

        assert!(alerts.evaluate("uploadImage", 9_999).is_none());
        assert!(alerts.evaluate("uploadImage", 10_000).is_none());
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_unknown_operation_uses_default_threshold() {
        let alerts = manager();

        assert_eq!(alerts.threshold_for("syncInventory"), 10_000);
        assert!(alerts.evaluate("syncInventory", 10_500).is_some());
        assert!(alerts.evaluate("search", 5_001).is_some());
    }

    #[test]
    fn test_history_keeps_most_recent() {
        let alerts = manager();

        for i in 0..150u64 {
            alerts.evaluate("search", 6_000 + i);
        }

        let retained = alerts.alerts();
        assert_eq!(retained.len(), 100);
        assert_eq!(retained[0].details.duration_ms, 6_050);
        assert_eq!(alerts.recent(1)[0].details.duration_ms, 6_149);
    }

    #[test]
    fn test_acknowledge() {
        let alerts = manager();
        let first = alerts.evaluate("batchUpsert", 45_000).unwrap();
        alerts.evaluate("batchUpsert", 50_000);

        assert!(alerts.acknowledge(&first.id));
        assert!(!alerts.acknowledge("missing"));

        let open = alerts.unacknowledged();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].details.duration_ms, 50_000);
    }

    #[test]
    fn test_alert_serializes_type_field() {
        let alerts = manager();
        let alert = alerts.evaluate("categorizeProducts", 20_000).unwrap();

        let value = serde_json::to_value(&alert).unwrap();
        assert_eq!(value["type"], "performance");
        assert_eq!(value["code"], "high_latency");
    }
}
