//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit and integration
//! tests. All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::engine::ProgressReporter;
use crate::error::AppError;
use crate::event::JobEvent;
use crate::job::{JobId, JobStatus};
use crate::source::{Credentials, SourceOutput, SourceRef};
use crate::traits::{CredentialStore, EventSink, SourceAdapter};

// ---------------------------------------------------------------------------
// MockAdapter
// ---------------------------------------------------------------------------

/// What the mock adapter does for a source.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Report each progress value in turn, then return one record.
    Succeed(Vec<u8>),
    /// Return `AppError::Generic` with the message.
    Fail(String),
    /// Panic with the message.
    Panic(String),
    /// Sleep, then succeed. Stops early with `Cancelled` if cancelled.
    Delay(Duration),
    /// Block until the token is cancelled, then return `Cancelled`.
    WaitForCancel,
    /// Block until the gate token fires, then succeed.
    Gate(CancellationToken),
    /// Block until the gate fires, then succeed without looking at the
    /// job's own cancellation token.
    IgnoreCancel(CancellationToken),
}

/// Scripted adapter keyed by source name.
#[derive(Clone)]
pub struct MockAdapter {
    behaviors: Arc<Mutex<HashMap<String, MockBehavior>>>,
    default: Arc<Mutex<MockBehavior>>,
    calls: Arc<Mutex<Vec<String>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    /// Adapter that succeeds for every source.
    pub fn new() -> Self {
        Self {
            behaviors: Arc::new(Mutex::new(HashMap::new())),
            default: Arc::new(Mutex::new(MockBehavior::Succeed(vec![50]))),
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_default(self, behavior: MockBehavior) -> Self {
        *self.default.lock().unwrap() = behavior;
        self
    }

    /// Script the behaviour for sources named `source`.
    pub fn on(self, source: &str, behavior: MockBehavior) -> Self {
        self.behaviors
            .lock()
            .unwrap()
            .insert(source.to_string(), behavior);
        self
    }

    /// Source names in invocation order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of simultaneous invocations observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn behavior_for(&self, source: &str) -> MockBehavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(source)
            .cloned()
            .unwrap_or_else(|| self.default.lock().unwrap().clone())
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn record(source: &SourceRef) -> SourceOutput {
    SourceOutput::new(vec![serde_json::json!({ "source": source.name })])
}

impl SourceAdapter for MockAdapter {
    fn describe(&self) -> String {
        "mock".to_string()
    }

    async fn run(
        &self,
        source: &SourceRef,
        _credentials: &Credentials,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<SourceOutput, AppError> {
        self.calls.lock().unwrap().push(source.name.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(Arc::clone(&self.in_flight));

        match self.behavior_for(&source.name) {
            MockBehavior::Succeed(steps) => {
                for value in steps {
                    progress.report(value);
                    tokio::task::yield_now().await;
                }
                Ok(record(source))
            }
            MockBehavior::Fail(message) => Err(AppError::Generic(message)),
            MockBehavior::Panic(message) => panic!("{message}"),
            MockBehavior::Delay(delay) => {
                tokio::select! {
                    () = tokio::time::sleep(delay) => Ok(record(source)),
                    () = cancel.cancelled() => Err(AppError::Cancelled),
                }
            }
            MockBehavior::WaitForCancel => {
                cancel.cancelled().await;
                Err(AppError::Cancelled)
            }
            MockBehavior::Gate(gate) => {
                tokio::select! {
                    () = gate.cancelled() => Ok(record(source)),
                    () = cancel.cancelled() => Err(AppError::Cancelled),
                }
            }
            MockBehavior::IgnoreCancel(gate) => {
                gate.cancelled().await;
                Ok(record(source))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MockKeyStore
// ---------------------------------------------------------------------------

/// Key store that hands out a fixed key, except for keys marked as failing
/// or panicking.
#[derive(Clone, Default)]
pub struct MockKeyStore {
    failing: Arc<Mutex<HashSet<String>>>,
    panicking: Arc<Mutex<HashSet<String>>>,
    lookups: Arc<Mutex<Vec<String>>>,
}

impl MockKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolving a source whose key is `key` fails with `MissingCredential`.
    pub fn failing_for(self, key: &str) -> Self {
        self.failing.lock().unwrap().insert(key.to_string());
        self
    }

    /// Resolving a source whose key is `key` panics.
    pub fn panicking_for(self, key: &str) -> Self {
        self.panicking.lock().unwrap().insert(key.to_string());
        self
    }

    /// Source names looked up, in order.
    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }
}

impl CredentialStore for MockKeyStore {
    async fn resolve(&self, source: &SourceRef) -> Result<Credentials, AppError> {
        self.lookups.lock().unwrap().push(source.name.clone());
        let panics = source
            .key
            .as_deref()
            .is_some_and(|key| self.panicking.lock().unwrap().contains(key));
        if panics {
            panic!("key store exploded for '{}'", source.name);
        }
        match source.key.as_deref() {
            None => Ok(Credentials::none()),
            Some(key) if self.failing.lock().unwrap().contains(key) => {
                Err(AppError::MissingCredential(key.to_string()))
            }
            Some(_) => Ok(Credentials::api_key("test-key")),
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

/// Sink that records every event.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<JobEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Events for one job, in emission order.
    pub fn events_for(&self, job_id: JobId) -> Vec<JobEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.job_id() == job_id)
            .collect()
    }

    /// `(status, progress)` of every update for a job.
    pub fn updates_for(&self, job_id: JobId) -> Vec<(JobStatus, u8)> {
        self.events_for(job_id)
            .into_iter()
            .filter_map(|e| match e {
                JobEvent::Update {
                    status, progress, ..
                } => Some((status, progress)),
                _ => None,
            })
            .collect()
    }

    pub fn errors_for(&self, job_id: JobId) -> Vec<String> {
        self.events_for(job_id)
            .into_iter()
            .filter_map(|e| match e {
                JobEvent::Error { summary, .. } => Some(summary),
                _ => None,
            })
            .collect()
    }

    pub fn error_logs_for(&self, job_id: JobId) -> Vec<String> {
        self.events_for(job_id)
            .into_iter()
            .filter_map(|e| match e {
                JobEvent::ErrorLog { detail, .. } => Some(detail),
                _ => None,
            })
            .collect()
    }

    pub fn outputs_for(&self, job_id: JobId) -> Vec<SourceOutput> {
        self.events_for(job_id)
            .into_iter()
            .filter_map(|e| match e {
                JobEvent::Output { output, .. } => Some(output),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &JobEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
