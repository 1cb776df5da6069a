//! Execution engine: turns pending jobs into adapter invocations.
//!
//! A run starts `QueueConfig::slots` slot tasks. Each slot repeatedly takes
//! the lowest-position pending job, resolves credentials, calls the adapter
//! in its own task, and records the outcome. A failing or panicking adapter
//! only fails its own job. Slots sleep while other jobs are still running
//! and exit once nothing is pending or running, or after `cancel_all`.

use std::any::Any;
use std::sync::{Arc, Weak};

use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::event::JobEvent;
use crate::job::{JobError, JobErrorKind, JobId, JobStatus, percent_of};
use crate::queue::{JobQueue, RunState, RunSummary, Shared};
use crate::source::{SourceOutput, SourceRef};
use crate::traits::{CredentialStore, EventSink, SourceAdapter};

/// Receives progress for a running job.
trait ProgressTarget: Send + Sync {
    fn progress(&self, job_id: JobId, value: u8);
}

impl<A, K, S> ProgressTarget for Shared<A, K, S>
where
    A: SourceAdapter,
    K: CredentialStore,
    S: EventSink,
{
    fn progress(&self, job_id: JobId, value: u8) {
        let mut state = self.lock();
        let Ok(idx) = state.index_of(job_id) else {
            return;
        };
        let job = &mut state.jobs[idx].job;
        match job.update_progress(value) {
            Ok(true) => self.sink.emit(&JobEvent::Update {
                job_id,
                status: job.status(),
                progress: job.progress(),
            }),
            Ok(false) => {}
            Err(e) => tracing::trace!(%job_id, error = %e, "Ignoring late progress report"),
        }
    }
}

/// Progress callback handed to an adapter for one job.
///
/// Holds a weak reference, so an adapter keeping it around does not keep
/// the queue alive.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: Option<JobId>,
    target: Option<Weak<dyn ProgressTarget>>,
}

impl ProgressReporter {
    /// A reporter attached to no job; every report is dropped.
    pub fn detached() -> Self {
        Self {
            job_id: None,
            target: None,
        }
    }

    fn attached(job_id: JobId, target: Weak<dyn ProgressTarget>) -> Self {
        Self {
            job_id: Some(job_id),
            target: Some(target),
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        self.job_id
    }

    /// Report completion as a percentage (0-100).
    pub fn report(&self, percent: u8) {
        if let (Some(job_id), Some(target)) = (self.job_id, &self.target)
            && let Some(target) = target.upgrade()
        {
            target.progress(job_id, percent);
        }
    }

    /// Report completion as `done` out of `total` steps.
    pub fn report_steps(&self, done: u64, total: u64) {
        self.report(percent_of(done, total));
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job_id", &self.job_id)
            .finish()
    }
}

/// Handle to an active run.
pub struct RunHandle {
    handle: JoinHandle<RunSummary>,
}

impl RunHandle {
    /// Wait for the run to end and return what it did.
    ///
    /// Fails with [`QueueError::RunAborted`] if the run's supervising task
    /// panicked or was aborted.
    pub async fn wait(self) -> Result<RunSummary, QueueError> {
        self.handle.await.map_err(|e| {
            tracing::error!(error = %e, "Queue run supervisor failed");
            QueueError::RunAborted(e.to_string())
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// A job claimed by a slot.
struct Claim {
    job_id: JobId,
    source: Arc<SourceRef>,
    cancel: CancellationToken,
}

enum Next {
    Job(Claim),
    /// Nothing pending yet, but other slots are still busy.
    Idle,
    /// The slot should exit. Carries the summary if it was the last one.
    Done(Option<RunSummary>),
}

enum Outcome {
    Succeeded(SourceOutput),
    Failed(JobError),
    Cancelled,
}

impl<A, K, S> JobQueue<A, K, S>
where
    A: SourceAdapter,
    K: CredentialStore,
    S: EventSink,
{
    /// Start executing pending jobs in position order.
    ///
    /// Fails with [`QueueError::NoRuntime`] outside a Tokio runtime and with
    /// [`QueueError::AlreadyRunning`] while a previous run is active.
    /// Individual job failures never fail the run.
    pub fn run(&self) -> Result<RunHandle, QueueError> {
        let runtime = Handle::try_current().map_err(|_| QueueError::NoRuntime)?;
        let slots = self.shared.config.slots.max(1);
        let (run_id, pending) = {
            let mut state = self.shared.lock();
            if state.run.is_some() {
                return Err(QueueError::AlreadyRunning);
            }
            state.runs_started += 1;
            let run_id = state.runs_started;
            state.run = Some(RunState {
                id: run_id,
                active_slots: slots,
                stopping: false,
                summary: RunSummary::default(),
            });
            let pending = state
                .jobs
                .iter()
                .filter(|e| e.job.status() == JobStatus::Pending)
                .count();
            (run_id, pending)
        };

        tracing::info!(%run_id, %slots, %pending, "Queue run started");
        let handle = runtime.spawn(supervise(Arc::clone(&self.shared), run_id, slots));
        Ok(RunHandle { handle })
    }
}

async fn supervise<A, K, S>(shared: Arc<Shared<A, K, S>>, run_id: u64, slots: usize) -> RunSummary
where
    A: SourceAdapter,
    K: CredentialStore,
    S: EventSink,
{
    let mut set = JoinSet::new();
    for slot in 0..slots {
        set.spawn(slot_loop(Arc::clone(&shared), slot));
    }

    let mut summary = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Some(s)) => summary = Some(s),
            Ok(None) => {}
            Err(e) => tracing::error!(%run_id, error = %e, "Slot task failed"),
        }
    }

    // A slot that died without finishing leaves the run open; close it.
    let summary = summary.unwrap_or_else(|| {
        let mut state = shared.lock();
        match state.run.take_if(|run| run.id == run_id) {
            Some(run) => run.summary,
            None => RunSummary::default(),
        }
    });

    tracing::info!(
        %run_id,
        succeeded = summary.succeeded,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "Queue run finished"
    );
    summary
}

async fn slot_loop<A, K, S>(shared: Arc<Shared<A, K, S>>, slot: usize) -> Option<RunSummary>
where
    A: SourceAdapter,
    K: CredentialStore,
    S: EventSink,
{
    tracing::debug!(%slot, "Slot started");
    loop {
        // Register for wake-ups before inspecting the queue so a
        // notification between the check and the wait is not lost.
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match next_job(&shared) {
            Next::Job(claim) => execute(&shared, slot, claim).await,
            Next::Idle => notified.await,
            Next::Done(summary) => {
                tracing::debug!(%slot, "Slot stopped");
                return summary;
            }
        }
    }
}

/// Pick the lowest-position pending job and mark it running.
fn next_job<A, K, S>(shared: &Shared<A, K, S>) -> Next
where
    A: SourceAdapter,
    K: CredentialStore,
    S: EventSink,
{
    let mut state = shared.lock();
    let stopping = state.run.as_ref().is_none_or(|run| run.stopping);

    if !stopping
        && let Some(idx) = state
            .jobs
            .iter()
            .position(|e| e.job.status() == JobStatus::Pending)
    {
        if let Err(e) = state.transition(&shared.sink, idx, JobStatus::Running, None) {
            // Unreachable for a pending job; leave it for the next scan.
            tracing::error!(error = %e, "Failed to start job");
            return Next::Idle;
        }
        let cancel = CancellationToken::new();
        let entry = &mut state.jobs[idx];
        entry.cancel = Some(cancel.clone());
        return Next::Job(Claim {
            job_id: entry.job.id(),
            source: Arc::clone(entry.job.source()),
            cancel,
        });
    }

    let busy = state
        .jobs
        .iter()
        .any(|e| e.job.status() == JobStatus::Running);
    if busy && !stopping {
        return Next::Idle;
    }

    let Some(run) = state.run.as_mut() else {
        return Next::Done(None);
    };
    run.active_slots = run.active_slots.saturating_sub(1);
    if run.active_slots > 0 {
        return Next::Done(None);
    }
    Next::Done(state.run.take().map(|run| run.summary))
}

async fn execute<A, K, S>(shared: &Arc<Shared<A, K, S>>, slot: usize, claim: Claim)
where
    A: SourceAdapter,
    K: CredentialStore,
    S: EventSink,
{
    let Claim {
        job_id,
        source,
        cancel,
    } = claim;
    tracing::info!(%slot, %job_id, source = %source.name, kind = %source.kind, "Job started");

    // Both the key lookup and the adapter call run in tasks of their own so
    // a panic in either fails this job instead of killing the slot.
    let keys = shared.keys.clone();
    let key_source = Arc::clone(&source);
    let resolved = tokio::spawn(async move { keys.resolve(&key_source).await }).await;

    let outcome = match resolved {
        Err(e) => Outcome::Failed(task_failure(
            JobErrorKind::CredentialError,
            "credential store",
            &source,
            e,
        )),
        Ok(Err(e)) => Outcome::Failed(JobError::from_app_error(
            JobErrorKind::CredentialError,
            &source,
            &e,
        )),
        Ok(Ok(_)) if cancel.is_cancelled() => Outcome::Cancelled,
        Ok(Ok(credentials)) => {
            let weak: Weak<Shared<A, K, S>> = Arc::downgrade(shared);
            let weak: Weak<dyn ProgressTarget> = weak;
            let progress = ProgressReporter::attached(job_id, weak);
            let adapter = shared.adapter.clone();
            let task_source = Arc::clone(&source);
            let task_cancel = cancel.clone();
            let task = tokio::spawn(async move {
                adapter
                    .run(&task_source, &credentials, progress, task_cancel)
                    .await
            });

            match task.await {
                Ok(Ok(output)) => Outcome::Succeeded(output),
                Ok(Err(e)) if e.is_cancellation() => Outcome::Cancelled,
                Ok(Err(e)) => Outcome::Failed(JobError::from_app_error(
                    JobErrorKind::AdapterError,
                    &source,
                    &e,
                )),
                Err(e) => Outcome::Failed(task_failure(
                    JobErrorKind::AdapterError,
                    "adapter",
                    &source,
                    e,
                )),
            }
        }
    };

    finish(shared, job_id, &source, &cancel, outcome);
    shared.notify.notify_waiters();
}

/// Record the outcome of a job. A fired cancellation token wins over
/// whatever the adapter produced.
fn finish<A, K, S>(
    shared: &Shared<A, K, S>,
    job_id: JobId,
    source: &SourceRef,
    cancel: &CancellationToken,
    outcome: Outcome,
) where
    A: SourceAdapter,
    K: CredentialStore,
    S: EventSink,
{
    let mut state = shared.lock();
    let Ok(idx) = state.index_of(job_id) else {
        tracing::error!(%job_id, "Finished job is no longer in the queue");
        return;
    };

    let outcome = if cancel.is_cancelled() {
        Outcome::Cancelled
    } else {
        outcome
    };

    let result = match outcome {
        Outcome::Succeeded(output) => {
            let records = output.len();
            shared.sink.emit(&JobEvent::Output {
                job_id,
                source: source.name.clone(),
                output,
            });
            tracing::info!(%job_id, %records, "Job succeeded");
            state.transition(&shared.sink, idx, JobStatus::Succeeded, None)
        }
        Outcome::Failed(error) => {
            tracing::warn!(%job_id, error = %error.summary(), "Job failed");
            state.transition(&shared.sink, idx, JobStatus::Failed, Some(error))
        }
        Outcome::Cancelled => {
            tracing::info!(%job_id, "Job cancelled");
            state.transition(&shared.sink, idx, JobStatus::Cancelled, None)
        }
    };

    if let Err(e) = result {
        tracing::error!(%job_id, error = %e, "Failed to record job outcome");
    }
}

/// Job error for a helper task that panicked or was aborted.
fn task_failure(kind: JobErrorKind, what: &str, source: &SourceRef, error: JoinError) -> JobError {
    if !error.is_panic() {
        return JobError::new(kind, format!("{what} task aborted: {error}"));
    }
    let message = panic_message(error.into_panic());
    JobError::new(kind, format!("{what} panicked: {message}")).with_detail(format!(
        "{what} panicked while running source '{}' (kind: {}): {message}",
        source.name, source.kind
    ))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
