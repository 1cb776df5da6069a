//! Ordered job collection and its control API.
//!
//! All structural mutations (add, remove, reorder) and every job transition
//! happen inside one critical section guarded by [`Shared::lock`], which is
//! also where the execution engine picks its next job. Events are emitted
//! from inside that section so each job's event stream keeps the order of
//! its transitions.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::event::JobEvent;
use crate::job::{Job, JobError, JobId, JobStatus};
use crate::source::SourceRef;
use crate::traits::{CredentialStore, EventSink, SourceAdapter};

/// Terminal transitions made during one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl RunSummary {
    fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
            JobStatus::Pending | JobStatus::Running => {}
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.cancelled
    }
}

pub(crate) struct Entry {
    pub(crate) job: Job,
    /// Present while the job is running.
    pub(crate) cancel: Option<CancellationToken>,
}

pub(crate) struct RunState {
    pub(crate) id: u64,
    pub(crate) active_slots: usize,
    /// Set by `cancel_all`: slots stop picking up new jobs.
    pub(crate) stopping: bool,
    pub(crate) summary: RunSummary,
}

#[derive(Default)]
pub(crate) struct QueueState {
    pub(crate) jobs: Vec<Entry>,
    pub(crate) run: Option<RunState>,
    pub(crate) runs_started: u64,
}

impl QueueState {
    pub(crate) fn index_of(&self, job_id: JobId) -> Result<usize, QueueError> {
        self.jobs
            .iter()
            .position(|e| e.job.id() == job_id)
            .ok_or(QueueError::NotFound(job_id))
    }

    fn reindex(&mut self) {
        for (position, entry) in self.jobs.iter_mut().enumerate() {
            entry.job.set_position(position);
        }
    }

    /// Apply a transition to the job at `idx` and publish its events.
    pub(crate) fn transition<S: EventSink>(
        &mut self,
        sink: &S,
        idx: usize,
        to: JobStatus,
        error: Option<JobError>,
    ) -> Result<(), QueueError> {
        let entry = &mut self.jobs[idx];
        entry.job.transition_to(to, error)?;

        let job = &entry.job;
        sink.emit(&JobEvent::Update {
            job_id: job.id(),
            status: job.status(),
            progress: job.progress(),
        });
        if let Some(err) = job.error() {
            sink.emit(&JobEvent::Error {
                job_id: job.id(),
                summary: err.summary(),
            });
            sink.emit(&JobEvent::ErrorLog {
                job_id: job.id(),
                detail: err.diagnostic(),
            });
        }

        if to.is_terminal() {
            entry.cancel = None;
            if let Some(run) = self.run.as_mut() {
                run.summary.record(to);
            }
        }
        Ok(())
    }

    fn ensure_pending(&self, idx: usize, operation: &'static str) -> Result<(), QueueError> {
        let job = &self.jobs[idx].job;
        if job.status() != JobStatus::Pending {
            return Err(QueueError::InvalidState {
                job_id: job.id(),
                status: job.status(),
                operation,
            });
        }
        Ok(())
    }
}

pub(crate) struct Shared<A, K, S> {
    pub(crate) state: Mutex<QueueState>,
    /// Wakes idle slots when there may be new work or the run should end.
    pub(crate) notify: Notify,
    pub(crate) adapter: A,
    pub(crate) keys: K,
    pub(crate) sink: S,
    pub(crate) config: QueueConfig,
}

impl<A, K, S> Shared<A, K, S> {
    /// Acquires the state lock, recovering from poison if necessary.
    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned queue mutex");
            poisoned.into_inner()
        })
    }
}

/// An ordered queue of extraction jobs.
///
/// Cheap to clone: every clone is a handle to the same queue, so the same
/// instance can be shared between a UI thread and the engine. All control
/// operations are safe to call while a run is in progress.
pub struct JobQueue<A, K, S> {
    pub(crate) shared: Arc<Shared<A, K, S>>,
}

impl<A, K, S> Clone for JobQueue<A, K, S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<A, K, S> JobQueue<A, K, S>
where
    A: SourceAdapter,
    K: CredentialStore,
    S: EventSink,
{
    pub fn new(adapter: A, keys: K, sink: S, config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                adapter,
                keys,
                sink,
                config,
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Append a new pending job and return its id.
    ///
    /// Publishes an initial `Pending` update so consumers can show the job.
    /// A run in progress picks the job up without being restarted.
    pub fn add(&self, source: impl Into<Arc<SourceRef>>) -> JobId {
        let mut job = Job::new(source.into());
        let job_id = job.id();
        {
            let mut state = self.shared.lock();
            job.set_position(state.jobs.len());
            tracing::debug!(%job_id, source = %job.source().name, position = job.position(), "Job added");
            self.shared.sink.emit(&JobEvent::Update {
                job_id,
                status: job.status(),
                progress: job.progress(),
            });
            state.jobs.push(Entry { job, cancel: None });
        }
        self.shared.notify.notify_waiters();
        job_id
    }

    /// Remove a job that is not running and re-compact positions.
    pub fn remove(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut state = self.shared.lock();
        let idx = state.index_of(job_id)?;
        let status = state.jobs[idx].job.status();
        if status == JobStatus::Running {
            return Err(QueueError::InvalidState {
                job_id,
                status,
                operation: "remove",
            });
        }
        state.jobs.remove(idx);
        state.reindex();
        tracing::debug!(%job_id, "Job removed");
        Ok(())
    }

    /// Swap a pending job with the nearest pending job above it.
    ///
    /// A no-op when there is none.
    pub fn move_up(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut state = self.shared.lock();
        let idx = state.index_of(job_id)?;
        state.ensure_pending(idx, "move")?;
        let target = (0..idx)
            .rev()
            .find(|&i| state.jobs[i].job.status() == JobStatus::Pending);
        if let Some(target) = target {
            state.jobs.swap(idx, target);
            state.reindex();
        }
        Ok(())
    }

    /// Swap a pending job with the nearest pending job below it.
    ///
    /// A no-op when there is none.
    pub fn move_down(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut state = self.shared.lock();
        let idx = state.index_of(job_id)?;
        state.ensure_pending(idx, "move")?;
        let target = (idx + 1..state.jobs.len())
            .find(|&i| state.jobs[i].job.status() == JobStatus::Pending);
        if let Some(target) = target {
            state.jobs.swap(idx, target);
            state.reindex();
        }
        Ok(())
    }

    /// Cancel one job.
    ///
    /// A pending job is cancelled immediately. A running job gets its
    /// cancellation token fired and becomes `Cancelled` once its adapter
    /// returns. Terminal jobs cannot be cancelled.
    pub fn cancel(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut state = self.shared.lock();
        let idx = state.index_of(job_id)?;
        match state.jobs[idx].job.status() {
            JobStatus::Pending => {
                state.transition(&self.shared.sink, idx, JobStatus::Cancelled, None)?;
                tracing::info!(%job_id, "Pending job cancelled");
                Ok(())
            }
            JobStatus::Running => {
                if let Some(token) = &state.jobs[idx].cancel {
                    token.cancel();
                }
                tracing::info!(%job_id, "Cancellation requested for running job");
                Ok(())
            }
            status => Err(QueueError::InvalidState {
                job_id,
                status,
                operation: "cancel",
            }),
        }
    }

    /// Cancel every non-terminal job and stop the current run from picking
    /// up further work. Returns the number of jobs affected.
    pub fn cancel_all(&self) -> usize {
        let affected = {
            let mut state = self.shared.lock();
            let mut affected = 0;
            for idx in 0..state.jobs.len() {
                match state.jobs[idx].job.status() {
                    JobStatus::Pending => {
                        // Pending -> Cancelled is always a valid edge.
                        if state
                            .transition(&self.shared.sink, idx, JobStatus::Cancelled, None)
                            .is_ok()
                        {
                            affected += 1;
                        }
                    }
                    JobStatus::Running => {
                        if let Some(token) = &state.jobs[idx].cancel {
                            token.cancel();
                        }
                        affected += 1;
                    }
                    _ => {}
                }
            }
            if let Some(run) = state.run.as_mut() {
                run.stopping = true;
            }
            affected
        };
        self.shared.notify.notify_waiters();
        tracing::info!(%affected, "Cancelled all jobs");
        affected
    }

    /// Forward adapter progress to a running job.
    ///
    /// Publishes an update only when the stored value changes.
    pub fn update_progress(&self, job_id: JobId, value: u8) -> Result<(), QueueError> {
        let mut state = self.shared.lock();
        let idx = state.index_of(job_id)?;
        let job = &mut state.jobs[idx].job;
        if job.update_progress(value)? {
            self.shared.sink.emit(&JobEvent::Update {
                job_id,
                status: job.status(),
                progress: job.progress(),
            });
        }
        Ok(())
    }

    /// Remove every terminal job. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let mut state = self.shared.lock();
        let before = state.jobs.len();
        state.jobs.retain(|e| !e.job.status().is_terminal());
        state.reindex();
        before - state.jobs.len()
    }

    /// Snapshot of every job, in position order.
    pub fn jobs(&self) -> Vec<Job> {
        self.shared.lock().jobs.iter().map(|e| e.job.clone()).collect()
    }

    pub fn get(&self, job_id: JobId) -> Result<Job, QueueError> {
        let state = self.shared.lock();
        let idx = state.index_of(job_id)?;
        Ok(state.jobs[idx].job.clone())
    }

    pub fn len(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().jobs.is_empty()
    }

    /// Whether a run is currently active.
    pub fn is_running(&self) -> bool {
        self.shared.lock().run.is_some()
    }
}
