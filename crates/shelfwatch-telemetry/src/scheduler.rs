//! Periodic background maintenance tasks

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs named jobs on independent fixed-period timers until shut down
#[derive(Debug, Default)]
pub struct Scheduler {
    token: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` every `period`, first after one full period
    ///
    /// Returns false without spawning when called outside a Tokio runtime or
    /// after [`shutdown`](Self::shutdown).
    pub fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, job: F) -> bool
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            return false;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                telemetry.event = "scheduler_no_runtime",
                task = name,
                "No Tokio runtime, background task not started"
            );
            return false;
        };

        let period = period.max(Duration::from_millis(1));
        let token = self.token.clone();

        let handle = runtime.spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                telemetry.event = "background_task_started",
                task = name,
                period_secs = period.as_secs(),
                "Background task started"
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        debug!(telemetry.event = "background_task_tick", task = name);
                        job().await;
                    }
                }
            }

            info!(
                telemetry.event = "background_task_stopped",
                task = name,
                "Background task stopped"
            );
        });

        crate::lock(&self.tasks).push((name, handle));
        true
    }

    /// Number of tasks spawned and not yet shut down
    pub fn task_count(&self) -> usize {
        crate::lock(&self.tasks).len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel every task and wait for the in-flight runs to finish
    pub async fn shutdown(&self) {
        self.token.cancel();

        let tasks = std::mem::take(&mut *crate::lock(&self.tasks));
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                warn!(
                    telemetry.event = "background_task_failed",
                    task = name,
                    error = %e,
                    "Background task ended abnormally"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_job(counter: &Arc<AtomicUsize>) -> impl Fn() -> std::future::Ready<()> + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_run_on_independent_periods() {
        let scheduler = Scheduler::new();
        let hourly = Arc::new(AtomicUsize::new(0));
        let six_hourly = Arc::new(AtomicUsize::new(0));

        assert!(scheduler.spawn_periodic("cleanup", Duration::from_secs(3600), counting_job(&hourly)));
        assert!(scheduler.spawn_periodic("report", Duration::from_secs(6 * 3600), counting_job(&six_hourly)));

        time::sleep(Duration::from_secs(30 * 60)).await;
        assert_eq!(hourly.load(Ordering::SeqCst), 0);

        time::sleep(Duration::from_secs(6 * 3600)).await;
        assert_eq!(hourly.load(Ordering::SeqCst), 6);
        assert_eq!(six_hourly.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_ticks() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.spawn_periodic("rotation", Duration::from_secs(60), counting_job(&runs));

        time::sleep(Duration::from_secs(150)).await;
        scheduler.shutdown().await;
        let after_shutdown = runs.load(Ordering::SeqCst);

        time::sleep(Duration::from_secs(600)).await;

        assert_eq!(after_shutdown, 2);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.task_count(), 0);
        assert!(!scheduler.spawn_periodic("late", Duration::from_secs(1), counting_job(&runs)));
    }

    #[test]
    fn test_spawn_outside_runtime_is_refused() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));

        assert!(!scheduler.spawn_periodic("cleanup", Duration::from_secs(1), counting_job(&runs)));
        assert_eq!(scheduler.task_count(), 0);
    }
}
