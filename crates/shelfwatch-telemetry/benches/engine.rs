/// Benchmarks for the telemetry hot paths
///
/// Metric recording and trace completion run inline with pipeline work, so
/// their cost is tracked here alongside export rendering.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shelfwatch_telemetry::{
    config::MetricsConfig, ExportFormat, ManualClock, MetricsAggregator, OperationStatus,
    TelemetryConfig, TelemetrySystem,
};
use std::sync::Arc;

fn quiet_system() -> (TelemetrySystem, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = TelemetryConfig::with_log_dir(dir.path());
    config.logging.console_enabled = false;
    config.logging.file_enabled = false;
    config.metrics.facade_enabled = false;
    (TelemetrySystem::new(config).unwrap(), dir)
}

/// Benchmark recording into the current hour bucket
fn bench_metric_record(c: &mut Criterion) {
    let config = MetricsConfig {
        facade_enabled: false,
        ..MetricsConfig::default()
    };
    let metrics = MetricsAggregator::new(&config, Arc::new(ManualClock::default()));

    c.bench_function("metrics_record", |b| {
        let mut duration = 0u64;
        b.iter(|| {
            duration = (duration + 37) % 60_000;
            metrics.record(black_box("uploadImage"), duration, OperationStatus::Success)
        })
    });
}

/// Benchmark a full start, span, end cycle
fn bench_trace_cycle(c: &mut Criterion) {
    let (telemetry, _dir) = quiet_system();

    c.bench_function("trace_start_span_end", |b| {
        b.iter(|| {
            let ctx = telemetry.start_trace(black_box("search"), None);
            telemetry.add_span(&ctx.trace_id, "query", None);
            telemetry.end_trace(&ctx.trace_id, None, None)
        })
    });
}

/// Benchmark export rendering by number of operations
fn bench_export(c: &mut Criterion) {
    let mut group = c.benchmark_group("export_metrics");

    for operations in [1usize, 10, 50] {
        let (telemetry, _dir) = quiet_system();
        for op in 0..operations {
            for ms in 0..100u64 {
                telemetry
                    .metrics()
                    .record(&format!("operation{}", op), ms * 10, OperationStatus::Success);
            }
        }

        group.bench_with_input(
            BenchmarkId::new("prometheus", operations),
            &telemetry,
            |b, telemetry| b.iter(|| black_box(telemetry.export_metrics(ExportFormat::Prometheus))),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_metric_record, bench_trace_cycle, bench_export);
criterion_main!(benches);
