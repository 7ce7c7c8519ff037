//! The scheduling loop

use crate::job::{FunctionRegistry, JobFunction, ScheduleJob};
use crate::timing;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, warn};
use trubble_core::{Error, Result};
use trubble_returner::{deliver_with_retry, DeliverySink, JobReturn, RetryPolicy, SinkRegistry};

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Minion id stamped on every job return
    pub minion_id: String,
    /// Concurrent job firings
    pub max_workers: usize,
    /// How long in-flight jobs may finish after shutdown is requested
    pub shutdown_grace: Duration,
    /// Policy for jobs with `returner_retry`
    pub retry: RetryPolicy,
}

impl SchedulerSettings {
    pub fn new(minion_id: impl Into<String>) -> Self {
        Self {
            minion_id: minion_id.into(),
            max_workers: 4,
            shutdown_grace: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// What happened during one scheduler lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Firings dispatched
    pub fired: u64,
    /// Firings skipped because the previous one was still running
    pub skipped: u64,
    /// In-flight firings abandoned after the grace period
    pub aborted: usize,
}

/// Loop-owned state of one job
struct JobSlot {
    job: Arc<ScheduleJob>,
    function: Arc<dyn JobFunction>,
    sink: Option<Arc<dyn DeliverySink>>,
    next_fire: Instant,
    last_fire: Option<Instant>,
    running: Option<JoinHandle<()>>,
}

impl JobSlot {
    fn is_running(&self) -> bool {
        self.running.as_ref().map_or(false, |h| !h.is_finished())
    }
}

/// Recurring job scheduler
pub struct Scheduler {
    jobs: Vec<ScheduleJob>,
    functions: FunctionRegistry,
    sinks: SinkRegistry,
    settings: SchedulerSettings,
}

impl Scheduler {
    /// Validate the job table against the registered functions and returners
    pub fn new(
        jobs: Vec<ScheduleJob>,
        functions: FunctionRegistry,
        sinks: SinkRegistry,
        settings: SchedulerSettings,
    ) -> Result<Self> {
        if settings.max_workers == 0 {
            return Err(Error::config("max_workers must be at least 1"));
        }

        for job in &jobs {
            if job.interval.is_zero() {
                return Err(Error::Config(format!("Job '{}' has a zero interval", job.name)));
            }
            if !functions.contains(&job.function) {
                return Err(Error::Config(format!(
                    "Job '{}' references unknown function '{}' (available: {})",
                    job.name,
                    job.function,
                    functions.names().join(", ")
                )));
            }
            if let Some(returner) = &job.returner {
                if !sinks.contains(returner) {
                    return Err(Error::Config(format!(
                        "Job '{}' references unknown returner '{}' (available: {})",
                        job.name,
                        returner,
                        sinks.names().join(", ")
                    )));
                }
            }
        }

        Ok(Self {
            jobs,
            functions,
            sinks,
            settings,
        })
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Run until `shutdown` resolves, then drain in-flight jobs
    pub async fn run<F>(self, shutdown: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        let Scheduler {
            jobs,
            functions,
            sinks,
            settings,
        } = self;

        let start = Instant::now();
        let mut slots: Vec<JobSlot> = Vec::with_capacity(jobs.len());
        for job in jobs {
            // validated in new()
            let Some(function) = functions.get(&job.function) else {
                continue;
            };
            let sink = job.returner.as_deref().and_then(|r| sinks.get(r));
            let next_fire = if job.run_on_start {
                start
            } else {
                timing::next_fire(start, job.interval, job.splay)
            };
            slots.push(JobSlot {
                job: Arc::new(job),
                function,
                sink,
                next_fire,
                last_fire: None,
                running: None,
            });
        }

        info!(
            jobs = slots.len(),
            max_workers = settings.max_workers,
            "Scheduler started"
        );

        let settings = Arc::new(settings);
        let workers = Arc::new(Semaphore::new(settings.max_workers));
        let mut report = ShutdownReport::default();
        tokio::pin!(shutdown);

        loop {
            let wake = slots.iter().map(|s| s.next_fire).min();
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Scheduler shutdown requested");
                    break;
                }
                _ = sleep_or_pending(wake) => {
                    let now = Instant::now();
                    for slot in slots.iter_mut().filter(|s| s.next_fire <= now) {
                        if slot.is_running() {
                            warn!(
                                job = %slot.job.name,
                                since_last = ?slot.last_fire.map(|t| now - t),
                                "Previous firing still running, skipping this one"
                            );
                            report.skipped += 1;
                        } else {
                            slot.running = Some(dispatch(slot, &workers, &settings));
                            report.fired += 1;
                        }
                        slot.last_fire = Some(now);
                        slot.next_fire = timing::next_fire(now, slot.job.interval, slot.job.splay);
                        debug!(
                            job = %slot.job.name,
                            next_in = ?slot.next_fire.saturating_duration_since(now),
                            "Job rescheduled"
                        );
                    }
                }
            }
        }

        report.aborted = drain(slots, settings.shutdown_grace).await;
        info!(
            fired = report.fired,
            skipped = report.skipped,
            aborted = report.aborted,
            "Scheduler stopped"
        );
        report
    }
}

async fn sleep_or_pending(wake: Option<Instant>) {
    match wake {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Spawn one firing: wait for a worker, call the function, deliver the result
fn dispatch(
    slot: &JobSlot,
    workers: &Arc<Semaphore>,
    settings: &Arc<SchedulerSettings>,
) -> JoinHandle<()> {
    let job = Arc::clone(&slot.job);
    let function = Arc::clone(&slot.function);
    let sink = slot.sink.clone();
    let workers = Arc::clone(workers);
    let settings = Arc::clone(settings);

    tokio::spawn(async move {
        let _permit = match workers.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        debug!(job = %job.name, function = %job.function, "Firing job");

        // inner task so a panicking function is contained and reported
        let call = tokio::spawn({
            let job = Arc::clone(&job);
            async move { function.call(job).await }
        });
        let _cancel = AbortOnDrop(call.abort_handle());

        let value = match call.await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                error!(job = %job.name, error = %e, "Job failed");
                return;
            }
            Err(e) if e.is_panic() => {
                error!(job = %job.name, "Job panicked");
                return;
            }
            Err(e) => {
                warn!(job = %job.name, error = %e, "Job cancelled");
                return;
            }
        };

        if let Some(sink) = sink {
            deliver(&job, sink.as_ref(), value, &settings).await;
        }
    })
}

/// Aborts the job call when the firing that awaits it is dropped
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn deliver(job: &ScheduleJob, sink: &dyn DeliverySink, value: Value, settings: &SchedulerSettings) {
    let ret = JobReturn::new(settings.minion_id.as_str(), job.function.as_str(), value)
        .with_args(job.args.clone())
        .with_retry(job.returner_retry);

    let policy = if job.returner_retry {
        settings.retry.clone()
    } else {
        RetryPolicy::single_attempt()
    };

    if let Err(e) = deliver_with_retry(sink, &ret, &policy).await {
        warn!(
            job = %job.name,
            returner = sink.name(),
            jid = %ret.jid,
            error = %e,
            "Dropping job result after failed delivery"
        );
    }
}

/// Wait for in-flight firings until the grace period ends; returns how many were aborted
async fn drain(slots: Vec<JobSlot>, grace: Duration) -> usize {
    let deadline = Instant::now() + grace;
    let mut aborted = 0;

    for slot in slots {
        let Some(mut handle) = slot.running else {
            continue;
        };
        if handle.is_finished() {
            continue;
        }
        debug!(job = %slot.job.name, "Waiting for in-flight job");
        if timeout_at(deadline, &mut handle).await.is_err() {
            warn!(job = %slot.job.name, "Grace period elapsed, abandoning job");
            handle.abort();
            aborted += 1;
        }
    }
    aborted
}
