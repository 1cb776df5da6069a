use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, QueueError};
use crate::source::SourceRef;

/// Stable identifier assigned to a job when it is added to a queue.
pub type JobId = Uuid;

/// Highest progress a job can report while still running.
///
/// 100 is reserved for `Succeeded`.
pub const MAX_RUNNING_PROGRESS: u8 = 99;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self -> to` is an edge of the forward-only state machine.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Where an execution-time failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// The key for the source could not be resolved.
    CredentialError,
    /// The adapter reported a failure or panicked.
    AdapterError,
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobErrorKind::CredentialError => write!(f, "credential error"),
            JobErrorKind::AdapterError => write!(f, "adapter error"),
        }
    }
}

/// Error recorded on a job when it enters `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
    /// Full diagnostic for the error log, when richer than `message`.
    pub detail: Option<String>,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Build a job error from an adapter or credential store failure.
    pub fn from_app_error(kind: JobErrorKind, source: &SourceRef, error: &AppError) -> Self {
        let detail = format!(
            "{kind} while running source '{}' (kind: {}): [{}] {error}\n{error:#?}",
            source.name,
            source.kind,
            error.label()
        );
        Self::new(kind, error.to_string()).with_detail(detail)
    }

    /// One-line text for a terse notification.
    pub fn summary(&self) -> String {
        format!("{}: {}", self.kind, self.message)
    }

    /// Everything known about the failure.
    pub fn diagnostic(&self) -> String {
        self.detail.clone().unwrap_or_else(|| self.summary())
    }
}

/// Convert a step counter into a percentage, rounding down.
pub fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = u128::from(done.min(total)) * 100 / u128::from(total);
    pct as u8
}

/// One unit of extraction work bound to a source configuration.
#[derive(Debug, Clone)]
pub struct Job {
    id: JobId,
    source: Arc<SourceRef>,
    status: JobStatus,
    progress: u8,
    error: Option<JobError>,
    position: usize,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(source: Arc<SourceRef>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            status: JobStatus::Pending,
            progress: 0,
            error: None,
            position: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn source(&self) -> &Arc<SourceRef> {
        &self.source
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Completion percentage, 0 while pending and 100 once succeeded.
    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn error(&self) -> Option<&JobError> {
        self.error.as_ref()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub(crate) fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    /// Move the job along the state machine.
    ///
    /// An error must accompany a transition into `Failed` and must not
    /// accompany any other transition.
    pub fn transition_to(
        &mut self,
        to: JobStatus,
        error: Option<JobError>,
    ) -> Result<(), QueueError> {
        let invalid = QueueError::InvalidTransition {
            from: self.status,
            to,
        };
        if !self.status.can_transition_to(to) {
            return Err(invalid);
        }
        if (to == JobStatus::Failed) != error.is_some() {
            return Err(invalid);
        }

        let now = Utc::now();
        match to {
            JobStatus::Running => self.started_at = Some(now),
            JobStatus::Succeeded => {
                self.progress = 100;
                self.finished_at = Some(now);
            }
            JobStatus::Failed | JobStatus::Cancelled => self.finished_at = Some(now),
            JobStatus::Pending => {}
        }
        self.status = to;
        self.error = error;
        Ok(())
    }

    /// Record progress reported by the adapter.
    ///
    /// Returns `Ok(true)` if the stored value changed. Values below the
    /// current progress are ignored and values above 99 are capped.
    pub fn update_progress(&mut self, value: u8) -> Result<bool, QueueError> {
        if self.status != JobStatus::Running {
            return Err(QueueError::InvalidState {
                job_id: self.id,
                status: self.status,
                operation: "update progress of",
            });
        }
        let value = value.min(MAX_RUNNING_PROGRESS);
        if value <= self.progress {
            return Ok(false);
        }
        self.progress = value;
        Ok(true)
    }
}
