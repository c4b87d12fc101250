//! Fixed-interval job runner with a single-flight guard.
//!
//! A trigger that arrives while the previous run is still in progress is
//! counted as skipped and dropped, never queued. Job errors are recorded in
//! [`JobStatus`] and logged; they never stop the loop.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ---

/// Observable outcome history of one scheduled job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub last_duration_ms: Option<u64>,
    pub runs: u64,
    pub skipped: u64,
}

impl JobStatus {
    /// True when the most recent completed run failed.
    pub fn is_failing(&self) -> bool {
        match (self.last_error_at, self.last_success_at) {
            (Some(err), Some(ok)) => err > ok,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    Skipped,
}

/// Resets the in-flight flag even if the job future is dropped mid-run.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct Scheduler {
    name: &'static str,
    interval: Duration,
    running: AtomicBool,
    status: RwLock<JobStatus>,
}

impl Scheduler {
    // ---
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            running: AtomicBool::new(false),
            status: RwLock::new(JobStatus::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn status(&self) -> JobStatus {
        self.status.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run `job` unless a previous run is still in flight.
    pub async fn execute_if_idle<F>(&self, job: F) -> RunOutcome
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        // ---
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.status.write().skipped += 1;
            debug!(job = self.name, "previous run still in flight, trigger skipped");
            return RunOutcome::Skipped;
        }
        let _guard = InFlight(&self.running);

        let started = Instant::now();
        let result = job.await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut status = self.status.write();
        status.runs += 1;
        status.last_duration_ms = Some(elapsed_ms);
        match result {
            Ok(()) => {
                status.last_success_at = Some(Utc::now());
                debug!(job = self.name, elapsed_ms, "run completed");
                RunOutcome::Completed
            }
            Err(e) => {
                let message = format!("{e:#}");
                warn!(job = self.name, elapsed_ms, error = %message, "run failed");
                status.last_error_at = Some(Utc::now());
                status.last_error_message = Some(message);
                RunOutcome::Failed
            }
        }
    }

    /// Spawn the interval loop. The first tick fires immediately; the loop
    /// exits when `cancel` fires.
    pub fn spawn<F, Fut>(self: &Arc<Self>, cancel: CancellationToken, make_job: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        // ---
        let scheduler = Arc::clone(self);
        let period = self.interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(job = scheduler.name, interval_ms = period.as_millis() as u64, "scheduler started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        scheduler.execute_if_idle(make_job()).await;
                    }
                }
            }

            info!(job = scheduler.name, "scheduler stopped");
        })
    }
}
