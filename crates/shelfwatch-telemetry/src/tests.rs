//! End-to-end scenarios across the telemetry components

#[cfg(test)]
mod integration_tests {
    use crate::{
        clock::{Clock, ManualClock},
        config::{LogLevel, TelemetryConfig},
        export::ExportFormat,
        logger::read_entries,
        report::{latest_report, read_report},
        system::TelemetrySystem,
        tracer::{CapturedError, TraceStatus},
        Fields,
    };
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn quiet_config(dir: &Path) -> TelemetryConfig {
        let mut config = TelemetryConfig::with_log_dir(dir);
        config.logging.console_enabled = false;
        config.metrics.facade_enabled = false;
        config
    }

    fn system_at(dir: &Path) -> (TelemetrySystem, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 11, 4, 9, 30, 0).unwrap(),
        ));
        let telemetry = TelemetrySystem::with_clock(quiet_config(dir), clock.clone()).unwrap();
        (telemetry, clock)
    }

    #[test]
    fn test_batch_upsert_timeout_scenario() {
        let temp_dir = TempDir::new().unwrap();
        let (telemetry, clock) = system_at(temp_dir.path());

        let ctx = telemetry.start_trace("batchUpsert", None);
        assert!(telemetry.add_span(&ctx.trace_id, "validate", None));
        clock.advance(Duration::milliseconds(31_000));

        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout");
        telemetry.end_trace(&ctx.trace_id, None, Some(CapturedError::from_error(&timeout)));

        let trace = telemetry.get_trace(&ctx.trace_id).unwrap();
        assert_eq!(trace.status, TraceStatus::Error);
        assert_eq!(trace.duration_ms(), Some(31_000));
        assert_eq!(trace.spans[0].name, "validate");

        let bucket = telemetry.metrics().bucket_snapshot(clock.current_hour()).unwrap();
        assert_eq!(bucket.operations["batchUpsert"].errors, 1);
        assert_eq!(bucket.operations["batchUpsert"].requests, 1);

        let alerts = telemetry.alerts().alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].code, "high_latency");
        assert_eq!(alerts[0].details.threshold_ms, 30_000);
        assert_eq!(alerts[0].details.trace_id.as_deref(), Some(ctx.trace_id.as_str()));

        // Completion log and the alert warning both carry the trace id
        let errors = read_entries(&temp_dir.path().join("errors.log")).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].trace_id(), Some(ctx.trace_id.as_str()));
        assert_eq!(errors[0].context["duration_ms"], json!(31_000));
        assert_eq!(errors[0].context["error"]["message"], json!("timeout"));

        let application = read_entries(&temp_dir.path().join("application.log")).unwrap();
        let warning = application
            .iter()
            .find(|e| e.level == LogLevel::Warn)
            .unwrap();
        assert_eq!(warning.trace_id(), Some(ctx.trace_id.as_str()));
    }

    #[test]
    fn test_search_prometheus_export_scenario() {
        let temp_dir = TempDir::new().unwrap();
        let (telemetry, clock) = system_at(temp_dir.path());

        for (duration, failed) in [(100, false), (200, false), (300, false), (5_000, true)] {
            let ctx = telemetry.start_trace("search", None);
            clock.advance(Duration::milliseconds(duration));
            let error = failed.then(|| CapturedError::new("index offline"));
            telemetry.end_trace(&ctx.trace_id, None, error);
        }

        let text = telemetry.export_metrics(ExportFormat::Prometheus);

        let requests: u64 = text
            .lines()
            .find_map(|line| line.strip_prefix("shelfwatch_requests_total "))
            .unwrap()
            .parse()
            .unwrap();
        assert!(requests >= 4);
        assert!(text.contains(
            "shelfwatch_response_time_seconds{operation=\"search\",quantile=\"0.99\"} 5.0"
        ));
        assert!(text.contains("shelfwatch_errors_total 1"));

        // Exporting is read-only
        let again = telemetry.export_metrics(ExportFormat::Prometheus);
        assert_eq!(text, again);
    }

    #[test]
    fn test_double_end_records_once() {
        let temp_dir = TempDir::new().unwrap();
        let (telemetry, clock) = system_at(temp_dir.path());

        let ctx = telemetry.start_trace("uploadImage", None);
        clock.advance(Duration::milliseconds(12_000));
        assert!(telemetry.end_trace(&ctx.trace_id, None, None).is_some());
        assert!(telemetry.end_trace(&ctx.trace_id, None, None).is_none());

        let summary = telemetry.get_performance_metrics(1);
        assert_eq!(summary.operations["uploadImage"].requests, 1);
        assert_eq!(telemetry.alerts().len(), 1);

        let completions: Vec<_> = read_entries(&temp_dir.path().join("application.log"))
            .unwrap()
            .into_iter()
            .filter(|e| e.message.starts_with("Trace completed"))
            .collect();
        assert_eq!(completions.len(), 1);
    }

    #[test]
    fn test_cleanup_keeps_seven_days() {
        let temp_dir = TempDir::new().unwrap();
        let (telemetry, clock) = system_at(temp_dir.path());

        // One completed trace every 12 hours for ten days
        for _ in 0..20 {
            let ctx = telemetry.start_trace("categorizeProducts", None);
            telemetry.end_trace(&ctx.trace_id, None, None);
            clock.advance(Duration::hours(12));
        }

        let now_hour = clock.current_hour();
        let outcome = telemetry.run_cleanup();

        let hours = telemetry.metrics().bucket_hours();
        assert!(outcome.buckets_removed > 0);
        assert!(hours.iter().all(|h| *h >= now_hour - 7 * 24));
        assert_eq!(hours.len(), 14);
        // Traces older than 24 hours are gone too
        assert_eq!(telemetry.tracer().tracked_count(), 2);
    }

    #[test]
    fn test_rotation_through_logging() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = quiet_config(temp_dir.path());
        config.logging.max_file_size_bytes = 1_024;
        let telemetry = TelemetrySystem::new(config).unwrap();

        let mut context = Fields::new();
        context.insert("sku".to_string(), json!("AME-TWR-001"));
        for i in 0..40 {
            telemetry.log(LogLevel::Info, &format!("upserted page {}", i), Some(context.clone()), None);
        }

        let current = temp_dir.path().join("application.log");
        assert!(std::fs::metadata(&current).unwrap().len() <= 1_024);

        let archives = crate::rotation::LogFileManager::find_archives(temp_dir.path(), "application").unwrap();
        let archived: usize = archives
            .iter()
            .map(|a| read_entries(&a.path).unwrap().len())
            .sum();
        assert_eq!(archived + read_entries(&current).unwrap().len(), 40);
    }

    #[test]
    fn test_concurrent_traces_do_not_mix_attribution() {
        let temp_dir = TempDir::new().unwrap();
        let telemetry = TelemetrySystem::new(quiet_config(temp_dir.path())).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let telemetry = telemetry.clone();
                std::thread::spawn(move || {
                    let ctx = telemetry.start_trace("generateSeoContent", None);
                    for step in 0..5 {
                        telemetry.add_span(&ctx.trace_id, &format!("step-{}", step), None);
                        let mut context = Fields::new();
                        context.insert("worker".to_string(), json!(i));
                        telemetry.log_in(&ctx, LogLevel::Info, "progress", Some(context), None);
                    }
                    telemetry.end_trace(&ctx.trace_id, None, None);
                    (i, ctx)
                })
            })
            .collect();

        let contexts: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let entries = read_entries(&temp_dir.path().join("application.log")).unwrap();
        for (worker, ctx) in &contexts {
            let progress: Vec<_> = entries
                .iter()
                .filter(|e| e.message == "progress" && e.trace_id() == Some(ctx.trace_id.as_str()))
                .collect();
            assert_eq!(progress.len(), 5);
            assert!(progress.iter().all(|e| e.context["worker"] == json!(worker)));
            assert_eq!(telemetry.get_trace(&ctx.trace_id).unwrap().spans.len(), 5);
        }

        let summary = telemetry.get_performance_metrics(1);
        assert_eq!(summary.operations["generateSeoContent"].requests, 8);
        assert_eq!(telemetry.tracer().active_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_writes_final_report_and_clears_state() {
        let temp_dir = TempDir::new().unwrap();
        let telemetry = TelemetrySystem::new(quiet_config(temp_dir.path())).unwrap();
        assert!(telemetry.start_background_tasks());

        let ctx = telemetry.start_trace("search", None);
        telemetry.end_trace(&ctx.trace_id, Some(json!({ "hits": 12 })), None);
        telemetry.start_trace("batchUpsert", None);

        telemetry.shutdown().await;

        let report = read_report(&latest_report(temp_dir.path()).unwrap().unwrap()).unwrap();
        assert_eq!(report.metrics.operations["search"].requests, 1);
        assert_eq!(report.health.active_traces, 1);

        assert!(telemetry.get_trace(&ctx.trace_id).is_none());
        assert_eq!(telemetry.get_performance_metrics(24).total_requests, 0);
        assert!(!telemetry.start_background_tasks());

        // Still usable after shutdown
        let late = telemetry.start_trace("search", None);
        assert!(telemetry.end_trace(&late.trace_id, None, None).is_some());
        telemetry.shutdown().await;
    }

    #[tokio::test]
    async fn test_rotation_task_rotates_and_prunes() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = quiet_config(temp_dir.path());
        config.logging.max_file_size_bytes = 64;
        config.retention.max_archives = 2;
        config.retention.compress_archives = false;
        let telemetry = TelemetrySystem::new(config).unwrap();

        for i in 0..3 {
            std::fs::write(
                temp_dir
                    .path()
                    .join(format!("errors-2024-01-0{}T00-00-00-000Z.log", i + 1)),
                "old",
            )
            .unwrap();
        }
        std::fs::write(temp_dir.path().join("errors.log"), "x".repeat(128)).unwrap();

        let outcome = telemetry.run_rotation().await;

        assert_eq!(outcome.rotated.len(), 1);
        assert_eq!(std::fs::metadata(temp_dir.path().join("errors.log")).unwrap().len(), 0);
        assert_eq!(outcome.retention.removed_by_count, 2);
        assert_eq!(
            crate::rotation::LogFileManager::find_archives(temp_dir.path(), "errors")
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_file_logging_disabled_keeps_everything_in_memory() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = quiet_config(temp_dir.path());
        config.logging.file_enabled = false;
        let telemetry = TelemetrySystem::new(config).unwrap();

        let ctx = telemetry.start_trace("search", None);
        telemetry.end_trace(&ctx.trace_id, None, None);
        let report = telemetry.generate_report();

        assert!(report.written_to.is_none());
        assert_eq!(report.metrics.total_requests, 1);
        assert!(std::fs::read_dir(temp_dir.path()).unwrap().next().is_none());
    }
}
