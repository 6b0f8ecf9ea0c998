//! A bounded worker pool for OCR jobs.
//!
//! The key concepts here are borrowed from ["Queues Don't Fix
//! Overload"](https://ferd.ca/queues-don-t-fix-overload.html). We limit the
//! number of jobs that may be "in flight" at any one time, and once that limit
//! is reached, submitting more jobs blocks until one of the in-flight jobs
//! completes.
//!
//! Every job submitted to a [`WorkerPool`] produces exactly one [`JobResult`],
//! no matter what happens to it: the engine may fail, panic, hang past its
//! timeout, or get caught by a cancellation. Those are all turned into results
//! at the per-job boundary, and the pool keeps going.

use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures::{
    FutureExt as _, SinkExt as _, StreamExt as _,
    channel::{mpsc, oneshot},
    stream,
};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::{
    async_utils::{BoxedStream, JoinWorker, panic_message},
    engines::{Completion, ProcessingEngine, process_job},
    job::JobDescriptor,
    outcome::{FailureKind, JobFailure, JobOutcome, JobResult},
    prelude::*,
};

/// Per-job time limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobPolicy {
    /// How long a single job may run. `None` means forever.
    pub timeout: Option<Duration>,

    /// After a cancellation, how long running jobs get to finish before we
    /// abandon them.
    pub grace_period: Duration,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            timeout: None,
            grace_period: Duration::from_secs(10),
        }
    }
}

/// Counters for a single batch run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolState {
    /// How many jobs are running right now?
    pub active_worker_count: usize,

    /// How many jobs succeeded?
    pub completed_count: usize,

    /// How many jobs ended in any other way?
    pub failed_count: usize,
}

/// We actually want to put methods in `Mutex<PoolState>`, because that's the
/// type we actually share. To do that, we need to define an extension trait
/// with the methods we want.
pub trait PoolStateExt {
    /// A worker picked up a job.
    fn job_started(&self);

    /// A job that was started has finished.
    fn job_finished(&self, result: &JobResult);

    /// A job reached a terminal state without ever being started.
    fn job_never_started(&self, result: &JobResult);

    /// A copy of the current counters.
    fn snapshot(&self) -> PoolState;
}

impl PoolStateExt for Mutex<PoolState> {
    fn job_started(&self) {
        // Hold a sync lock, but just for an instant to update counters.
        let mut state = self.lock().expect("lock poisoned");
        state.active_worker_count += 1;
    }

    fn job_finished(&self, result: &JobResult) {
        let mut state = self.lock().expect("lock poisoned");
        state.active_worker_count = state.active_worker_count.saturating_sub(1);
        state.count(result);
    }

    fn job_never_started(&self, result: &JobResult) {
        self.lock().expect("lock poisoned").count(result);
    }

    fn snapshot(&self) -> PoolState {
        *self.lock().expect("lock poisoned")
    }
}

impl PoolState {
    fn count(&mut self, result: &JobResult) {
        if result.outcome.is_success() {
            self.completed_count += 1;
        } else {
            self.failed_count += 1;
        }
    }
}

/// A job on its way to a worker, with a one-shot channel on which to return
/// the result.
struct WorkItem {
    job: JobDescriptor,
    tx: oneshot::Sender<JobResult>,
}

/// Runs jobs on a bounded number of workers.
pub struct WorkerPool {
    /// Queue for submitting jobs.
    tx: mpsc::Sender<WorkItem>,

    /// How many jobs may run at once.
    workers: NonZeroUsize,

    /// Shared counters.
    state: Arc<Mutex<PoolState>>,

    /// Tripped when the user asks us to stop.
    cancel: CancellationToken,

    /// The background task that pulls jobs from the queue.
    worker: JoinWorker,
}

impl WorkerPool {
    /// Create a new pool running up to `workers` jobs at a time.
    ///
    /// Note that up to `workers` jobs may be waiting in the queue, and another
    /// `workers` jobs may be running.
    pub fn new(
        workers: NonZeroUsize,
        policy: JobPolicy,
        engine: Arc<dyn ProcessingEngine>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<WorkItem>(workers.get());
        let state = Arc::new(Mutex::new(PoolState::default()));
        let handle = tokio::spawn({
            let state = state.clone();
            let cancel = cancel.clone();
            async move {
                rx.for_each_concurrent(workers.get(), |item| {
                    let engine = engine.clone();
                    let state = state.clone();
                    let cancel = cancel.clone();
                    async move {
                        let result = run_job(item.job, engine, &state, policy, &cancel).await;
                        if let Err(_sent_value) = item.tx.send(result) {
                            debug!("failed to send job result because receiver was dropped");
                        }
                    }
                })
                .await;
                Ok(())
            }
        });
        Self {
            tx,
            workers,
            state,
            cancel,
            worker: JoinWorker::from_handle(handle),
        }
    }

    /// A copy of the pool's counters.
    pub fn state(&self) -> PoolState {
        self.state.snapshot()
    }

    /// Submit a batch of jobs, returning a stream of results in the order
    /// they complete.
    ///
    /// Jobs are fed to the workers lazily as the stream is polled. Once the
    /// pool's cancellation token trips, jobs that have not been started are
    /// reported as [`JobOutcome::Skipped`].
    pub fn submit(&self, jobs: Vec<JobDescriptor>) -> BoxedStream<JobResult> {
        let tx = self.tx.clone();
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        stream::iter(jobs)
            .map(move |job| {
                let mut tx = tx.clone();
                let state = state.clone();
                let cancel = cancel.clone();
                async move {
                    let job_ref = job.job_ref();
                    if cancel.is_cancelled() {
                        let result =
                            JobResult::skipped(job_ref, "batch cancelled before job started");
                        state.job_never_started(&result);
                        return result;
                    }

                    let (result_tx, result_rx) = oneshot::channel();
                    let item = WorkItem { job, tx: result_tx };
                    let lost = if tx.send(item).await.is_err() {
                        "worker pool is not accepting jobs"
                    } else {
                        match result_rx.await {
                            Ok(result) => return result,
                            Err(_canceled) => "worker pool dropped job",
                        }
                    };

                    // The pool's background task is gone. This should not
                    // happen, but the job still needs a result.
                    error!(id = job_ref.id, "{}", lost);
                    let result = JobResult {
                        job: job_ref,
                        outcome: JobFailure::new(FailureKind::Unknown, lost).into(),
                        elapsed: Duration::ZERO,
                        diagnostic: None,
                    };
                    state.job_never_started(&result);
                    result
                }
                .boxed()
            })
            .buffer_unordered(2 * self.workers.get())
            .boxed()
    }

    /// Close the pool and wait for its background task to exit. Any streams
    /// returned by [`WorkerPool::submit`] must be finished or dropped first.
    pub async fn close(self) -> Result<()> {
        let Self { tx, worker, .. } = self;
        drop(tx);
        worker.join().await
    }
}

/// Why we stopped waiting on a job.
enum Stop {
    Joined(Result<Result<Completion, JobFailure>, JoinError>),
    TimedOut(Duration),
    Interrupted,
}

/// Run a single job on the current worker, and turn whatever happens into a
/// [`JobResult`].
#[instrument(level = "debug", skip_all, fields(id = job.id(), path = %job.source_path().display()))]
async fn run_job(
    job: JobDescriptor,
    engine: Arc<dyn ProcessingEngine>,
    state: &Mutex<PoolState>,
    policy: JobPolicy,
    cancel: &CancellationToken,
) -> JobResult {
    let job_ref = job.job_ref();
    if cancel.is_cancelled() {
        let result = JobResult::skipped(job_ref, "batch cancelled before job started");
        state.job_never_started(&result);
        return result;
    }

    state.job_started();
    let started = Instant::now();

    // Run the job in its own task, so that a panic only takes down this job,
    // and so that we can abort it.
    let mut handle =
        tokio::spawn(async move { process_job(engine.as_ref(), &job).await });

    let deadline = async {
        match policy.timeout {
            Some(timeout) => {
                tokio::time::sleep(timeout).await;
                timeout
            }
            None => futures::future::pending().await,
        }
    };
    let interrupted = async {
        cancel.cancelled().await;
        tokio::time::sleep(policy.grace_period).await;
    };
    let stop = tokio::select! {
        biased;
        joined = &mut handle => Stop::Joined(joined),
        timeout = deadline => Stop::TimedOut(timeout),
        () = interrupted => Stop::Interrupted,
    };

    let (outcome, diagnostic) = match stop {
        Stop::Joined(Ok(Ok(completion))) => (JobOutcome::Success, completion.diagnostic),
        Stop::Joined(Ok(Err(failure))) => (failure.into(), None),
        Stop::Joined(Err(err)) if err.is_panic() => {
            let msg = panic_message(err.into_panic().as_ref());
            let failure = JobFailure::new(FailureKind::Unknown, format!("job panicked: {msg}"));
            (failure.into(), None)
        }
        Stop::Joined(Err(err)) => {
            let failure =
                JobFailure::new(FailureKind::Unknown, format!("job task failed: {err}"));
            (failure.into(), None)
        }
        Stop::TimedOut(timeout) => {
            // Aborting drops the engine call, which kills its process. We
            // don't wait around for that, so the slot is free right away.
            handle.abort();
            let msg = format!("no result after {:.1}s, abandoned", timeout.as_secs_f64());
            (JobOutcome::TimedOut, Some(msg))
        }
        Stop::Interrupted => {
            handle.abort();
            let failure = JobFailure::new(
                FailureKind::Interrupted,
                "still running when the batch was cancelled",
            );
            (failure.into(), None)
        }
    };

    let result = JobResult {
        job: job_ref,
        outcome,
        elapsed: started.elapsed(),
        diagnostic,
    };
    match &result.outcome {
        JobOutcome::Success => info!(
            elapsed = ?result.elapsed,
            "Finished {}",
            result.job.destination_path.display()
        ),
        JobOutcome::Failure { kind, reason } => {
            warn!(%kind, "Failed {}: {}", result.job.source_path.display(), reason)
        }
        JobOutcome::TimedOut => warn!("Timed out {}", result.job.source_path.display()),
        JobOutcome::Skipped => debug!("Skipped {}", result.job.source_path.display()),
    }
    state.job_finished(&result);
    result
}
