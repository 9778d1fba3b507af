//! Instrumenting a catalog batch job
//!
//! Runs a few traced pipeline steps, logs inside their trace context, then
//! prints the Prometheus export and writes a report to ./example_logs.
//!
//! Run with: cargo run --example batch_pipeline

use serde_json::json;
use shelfwatch_telemetry::{
    CapturedError, ExportFormat, Fields, LogFormat, LogLevel, TelemetryConfig, TelemetrySystem,
};
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, thiserror::Error)]
#[error("supplier feed returned {status}")]
struct FeedError {
    status: u16,
}

async fn upload_image(sku: &str) -> Result<String, FeedError> {
    sleep(Duration::from_millis(40)).await;
    if sku.ends_with('7') {
        return Err(FeedError { status: 502 });
    }
    Ok(format!("https://cdn.example.com/{}.jpg", sku))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = TelemetryConfig::with_log_dir("./example_logs");
    config.logging.level = LogLevel::Debug;
    config.logging.format = LogFormat::Compact;
    config.schedule.report_interval_secs = 60;

    TelemetrySystem::init_console(&config)?;
    let telemetry = TelemetrySystem::new(config)?;
    telemetry.start_background_tasks();

    let mut completions = telemetry.subscribe();
    tokio::spawn(async move {
        while let Ok(done) = completions.recv().await {
            println!(
                "completed {} ({}) in {}ms",
                done.context.operation,
                done.status.as_str(),
                done.duration_ms
            );
        }
    });

    // One trace for the whole batch
    let mut metadata = Fields::new();
    metadata.insert("supplier".to_string(), json!("acme-minerals"));
    let batch = telemetry.start_trace("batchUpsert", Some(metadata));

    for sku in ["AME-001", "AME-002", "AME-007"] {
        telemetry.add_span(&batch.trace_id, &format!("upload:{}", sku), None);

        let upload = telemetry.start_trace("uploadImage", None);
        match upload_image(sku).await {
            Ok(url) => {
                let mut context = Fields::new();
                context.insert("sku".to_string(), json!(sku));
                context.insert("url".to_string(), json!(url));
                telemetry.log_in(&upload, LogLevel::Debug, "Image uploaded", Some(context), None);
                telemetry.end_trace(&upload.trace_id, Some(json!({ "url": url })), None);
            }
            Err(e) => {
                telemetry.end_trace(&upload.trace_id, None, Some(CapturedError::from_error(&e)));
            }
        }
    }

    // The closure form ends the trace with whatever the step returns
    let categories: Result<usize, FeedError> = telemetry
        .traced("categorizeProducts", |ctx| {
            let telemetry = telemetry.clone();
            async move {
                telemetry.log_in(&ctx, LogLevel::Info, "Categorizing 3 products", None, None);
                sleep(Duration::from_millis(25)).await;
                Ok(3)
            }
        })
        .await;

    telemetry.end_trace(&batch.trace_id, Some(json!({ "categorized": categories.ok() })), None);

    println!("{}", telemetry.export_metrics(ExportFormat::Prometheus));

    let report = telemetry.generate_report();
    if let Some(path) = &report.written_to {
        println!("report written to {}", path.display());
    }

    telemetry.shutdown().await;
    Ok(())
}
