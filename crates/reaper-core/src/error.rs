use thiserror::Error;

use crate::job::{JobId, JobStatus};

/// Failures raised by source adapters, credential stores, and configuration.
///
/// These never escape a queue run: the engine folds them into a
/// [`JobError`](crate::job::JobError) on the job that hit them.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// The source answered with something the adapter could not interpret.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// No key is stored for a source that requires one.
    #[error("No API key configured for '{0}'")]
    MissingCredential(String),

    /// The credential store itself failed.
    #[error("Credential error: {0}")]
    CredentialError(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No adapter is registered for the source kind.
    #[error("Unknown source kind: {0}")]
    UnknownSourceKind(String),

    /// The adapter observed its cancellation token and stopped.
    #[error("Cancelled")]
    Cancelled,

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error only reports a cooperative stop.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }

    /// Short machine-friendly label used in diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            AppError::HttpError(_) => "http",
            AppError::NetworkError(_) => "network",
            AppError::Timeout(_) => "timeout",
            AppError::ParseError(_) => "parse",
            AppError::MissingCredential(_) => "missing_credential",
            AppError::CredentialError(_) => "credential",
            AppError::ConfigError(_) => "config",
            AppError::UnknownSourceKind(_) => "unknown_source_kind",
            AppError::Cancelled => "cancelled",
            AppError::SerializationError(_) => "serialization",
            AppError::Generic(_) => "generic",
        }
    }
}

/// Structural faults returned synchronously by queue operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The requested status change is not an edge of the job state machine.
    #[error("Invalid transition for job: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// The job's current status forbids the operation.
    #[error("Cannot {operation} job {job_id} while it is {status}")]
    InvalidState {
        job_id: JobId,
        status: JobStatus,
        operation: &'static str,
    },

    /// The job id is not (or no longer) in the queue.
    #[error("Job {0} not found")]
    NotFound(JobId),

    /// `run()` was called while a run is still active.
    #[error("Queue is already running")]
    AlreadyRunning,

    /// `run()` was called outside a Tokio runtime.
    #[error("No Tokio runtime available to run the queue")]
    NoRuntime,

    /// The task supervising a run failed before reporting its summary.
    #[error("Queue run aborted: {0}")]
    RunAborted(String),
}
