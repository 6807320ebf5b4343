//! Fixed worker pool over a bounded job queue.
//!
//! The producer offers every job with a non-blocking send; jobs that do not
//! fit are dropped and reported. Closing the queue is the normal stop signal.
//! A supervisor races the pool's completion against `deadline`.
//!
//! Known limitation: cancellation is cooperative. Workers check the shared
//! token before taking the next job, never mid-install. When the deadline
//! fires, `run` returns while in-flight installs keep running in detached
//! tasks; they are not awaited and may outlive the call. Jobs that never
//! started are listed in `DispatchReport::abandoned`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Result};
use metrics::counter;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Catalog, Component, Release};

/// Upper bound on queue capacity; the channel's permit count stays far
/// below tokio's semaphore limit.
const MAX_QUEUE_CAPACITY: usize = 100_000;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub deadline: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { workers: 4, queue_capacity: 30, deadline: Duration::from_secs(600) }
    }
}

impl DispatchConfig {
    /// Defaults overridden by `HYDRO_INSTALL_WORKERS`, `HYDRO_INSTALL_QUEUE_CAP`
    /// and `HYDRO_INSTALL_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_or("HYDRO_INSTALL_WORKERS", d.workers),
            queue_capacity: env_or("HYDRO_INSTALL_QUEUE_CAP", d.queue_capacity),
            deadline: Duration::from_secs(env_or("HYDRO_INSTALL_TIMEOUT_SECS", d.deadline.as_secs())),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.workers > 0, "worker count must be at least 1");
        ensure!(self.queue_capacity > 0, "queue capacity must be at least 1");
        ensure!(
            self.queue_capacity <= MAX_QUEUE_CAPACITY,
            "queue capacity {} exceeds {}",
            self.queue_capacity,
            MAX_QUEUE_CAPACITY
        );
        Ok(())
    }
}

#[derive(Debug)]
pub struct JobResult {
    pub component: Component,
    pub worker: usize,
    pub result: Result<Release, String>,
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    pub submitted: usize,
    pub enqueued: usize,
    /// Names of jobs rejected by a full queue.
    pub dropped: Vec<String>,
    /// Jobs that finished before `run` returned.
    pub finished: Vec<JobResult>,
    /// Enqueued jobs that never started because the deadline fired first.
    pub abandoned: Vec<String>,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl DispatchReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &JobResult> {
        self.finished.iter().filter(|r| r.result.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &JobResult> {
        self.finished.iter().filter(|r| r.result.is_err())
    }
}

/// Offer a job without blocking. A full or closed queue hands the job back.
pub fn enqueue(job: Component, queue: &mpsc::Sender<Component>) -> Result<(), Component> {
    queue.try_send(job).map_err(|e| match e {
        mpsc::error::TrySendError::Full(j) | mpsc::error::TrySendError::Closed(j) => j,
    })
}

pub struct Dispatcher {
    catalog: Arc<Catalog>,
    cfg: DispatchConfig,
}

impl Dispatcher {
    pub fn new(catalog: Arc<Catalog>, cfg: DispatchConfig) -> Self {
        Self { catalog, cfg }
    }

    pub async fn run(&self, jobs: Vec<Component>) -> Result<DispatchReport> {
        self.cfg.validate()?;
        let t0 = Instant::now();
        let mut report = DispatchReport { submitted: jobs.len(), ..Default::default() };

        let (tx, rx) = mpsc::channel::<Component>(self.cfg.queue_capacity);
        for job in jobs {
            match enqueue(job, &tx) {
                Ok(()) => report.enqueued += 1,
                Err(job) => {
                    counter!("install_dropped", 1u64);
                    warn!(component = %job.name, capacity = self.cfg.queue_capacity, "max capacity reached, component dismissed");
                    report.dropped.push(job.name);
                }
            }
        }
        // Closing the queue lets workers exit once it is drained.
        drop(tx);

        let queue = Arc::new(Mutex::new(rx));
        let cancel = CancellationToken::new();
        let (res_tx, mut res_rx) = mpsc::unbounded_channel::<JobResult>();
        let (skip_tx, mut skip_rx) = mpsc::unbounded_channel::<String>();
        let handles: Vec<_> = (0..self.cfg.workers)
            .map(|id| {
                let ch = WorkerChannels { results: res_tx.clone(), skipped: skip_tx.clone() };
                tokio::spawn(worker(id, queue.clone(), self.catalog.clone(), cancel.clone(), ch))
            })
            .collect();
        drop(res_tx);
        drop(skip_tx);

        let (done_tx, done_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            futures::future::join_all(handles).await;
            let _ = done_tx.send(());
        });

        report.timed_out = tokio::select! {
            _ = done_rx => false,
            _ = tokio::time::sleep(self.cfg.deadline) => true,
        };
        if report.timed_out {
            counter!("install_timeouts", 1u64);
            warn!(deadline = ?self.cfg.deadline, "timeout occurred; in-flight installs are left running");
        }
        cancel.cancel();

        // Workers only take jobs while holding the queue lock, so once we own
        // it every job is either in flight, skipped or still queued.
        {
            let mut rx = queue.lock().await;
            while let Ok(job) = skip_rx.try_recv() {
                report.abandoned.push(job);
            }
            while let Ok(job) = rx.try_recv() {
                report.abandoned.push(job.name);
            }
        }
        while let Ok(r) = res_rx.try_recv() {
            report.finished.push(r);
        }
        report.elapsed = t0.elapsed();
        info!(
            submitted = report.submitted,
            enqueued = report.enqueued,
            dropped = report.dropped.len(),
            finished = report.finished.len(),
            abandoned = report.abandoned.len(),
            timed_out = report.timed_out,
            elapsed = ?report.elapsed,
            "dispatch finished"
        );
        Ok(report)
    }
}

struct WorkerChannels {
    results: mpsc::UnboundedSender<JobResult>,
    skipped: mpsc::UnboundedSender<String>,
}

async fn worker(
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<Component>>>,
    catalog: Arc<Catalog>,
    cancel: CancellationToken,
    ch: WorkerChannels,
) {
    loop {
        let next = {
            let mut rx = queue.lock().await;
            let job = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                job = rx.recv() => job,
            };
            match job {
                Some(job) if cancel.is_cancelled() => {
                    debug!(worker = id, component = %job.name, "cancelled before install");
                    let _ = ch.skipped.send(job.name);
                    None
                }
                other => other,
            }
        };
        let Some(job) = next else { break };
        let result = catalog.install(&job).await.map_err(|e| format!("{e:#}"));
        let _ = ch.results.send(JobResult { component: job, worker: id, result });
    }
    debug!(worker = id, "worker exiting");
}
