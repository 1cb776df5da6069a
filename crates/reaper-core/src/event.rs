//! Job events and the stock sinks that consume them.
//!
//! Every status transition produces one [`JobEvent::Update`]. A transition
//! into `Failed` is followed by one [`JobEvent::Error`] carrying a terse
//! summary and one [`JobEvent::ErrorLog`] carrying the full diagnostic, so a
//! consumer can notify briefly and log in detail elsewhere.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::job::{JobId, JobStatus};
use crate::source::SourceOutput;
use crate::traits::EventSink;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// Status or progress changed.
    #[serde(rename = "job_update")]
    Update {
        job_id: JobId,
        status: JobStatus,
        progress: u8,
    },
    /// Short, user-facing failure notice.
    #[serde(rename = "job_error")]
    Error { job_id: JobId, summary: String },
    /// Full failure diagnostic.
    #[serde(rename = "job_error_log")]
    ErrorLog { job_id: JobId, detail: String },
    /// Records produced by a successful run, published before `Succeeded`.
    #[serde(rename = "job_output")]
    Output {
        job_id: JobId,
        source: String,
        output: SourceOutput,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Update { job_id, .. }
            | JobEvent::Error { job_id, .. }
            | JobEvent::ErrorLog { job_id, .. }
            | JobEvent::Output { job_id, .. } => *job_id,
        }
    }
}

/// Sink that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &JobEvent) {
        match event {
            JobEvent::Update {
                job_id,
                status: JobStatus::Running,
                progress,
            } => {
                tracing::debug!(%job_id, %progress, "Job progress");
            }
            JobEvent::Update {
                job_id,
                status,
                progress,
            } => {
                tracing::info!(%job_id, %status, %progress, "Job update");
            }
            JobEvent::Error { job_id, summary } => {
                tracing::warn!(%job_id, %summary, "Job failed");
            }
            JobEvent::ErrorLog { job_id, detail } => {
                tracing::error!(%job_id, %detail, "Job error log");
            }
            JobEvent::Output {
                job_id,
                source,
                output,
            } => {
                tracing::info!(%job_id, %source, records = output.len(), "Job output");
            }
        }
    }
}

/// Forwards events to an unbounded Tokio channel.
///
/// Sends never block; events are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: &JobEvent) {
        if self.tx.send(event.clone()).is_err() {
            tracing::trace!(job_id = %event.job_id(), "Event receiver dropped");
        }
    }
}

/// Delivers each event to several sinks, in registration order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl EventSink) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &JobEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

/// One failed job as seen by the error log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEntry {
    pub job_id: JobId,
    pub summary: String,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Keeps every reported job failure for later inspection.
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    entries: Arc<Mutex<Vec<ErrorEntry>>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ErrorEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned error log mutex");
            poisoned.into_inner()
        })
    }

    pub fn entries(&self) -> Vec<ErrorEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl EventSink for ErrorLog {
    fn emit(&self, event: &JobEvent) {
        match event {
            JobEvent::Error { job_id, summary } => {
                self.lock().push(ErrorEntry {
                    job_id: *job_id,
                    summary: summary.clone(),
                    detail: None,
                    recorded_at: Utc::now(),
                });
            }
            JobEvent::ErrorLog { job_id, detail } => {
                let mut entries = self.lock();
                match entries.iter_mut().rev().find(|e| e.job_id == *job_id) {
                    Some(entry) => entry.detail = Some(detail.clone()),
                    None => entries.push(ErrorEntry {
                        job_id: *job_id,
                        summary: detail.lines().next().unwrap_or_default().to_string(),
                        detail: Some(detail.clone()),
                        recorded_at: Utc::now(),
                    }),
                }
            }
            _ => {}
        }
    }
}
