use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::engine::ProgressReporter;
use crate::error::AppError;
use crate::event::JobEvent;
use crate::source::{Credentials, SourceOutput, SourceRef};

/// Performs the actual extraction for one kind of source.
///
/// Implementations should check `cancel` at every I/O boundary and return
/// [`AppError::Cancelled`] promptly once it fires.
pub trait SourceAdapter: Send + Sync + Clone + 'static {
    /// Human-readable name of the adapter (e.g., "HTTP JSON").
    fn describe(&self) -> String;

    fn run(
        &self,
        source: &SourceRef,
        credentials: &Credentials,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<SourceOutput, AppError>> + Send;
}

/// Resolves the API key a source needs before its adapter is invoked.
pub trait CredentialStore: Send + Sync + Clone + 'static {
    fn resolve(
        &self,
        source: &SourceRef,
    ) -> impl Future<Output = Result<Credentials, AppError>> + Send;
}

/// Receives job events (decoupled from any rendering).
///
/// Called while the queue holds its lock: implementations must not block
/// and must not call back into the queue.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, _event: &JobEvent) {}
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn emit(&self, event: &JobEvent) {
        (**self).emit(event);
    }
}

/// A sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {}
