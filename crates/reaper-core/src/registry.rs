//! Routing of jobs to adapters by source kind.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::engine::ProgressReporter;
use crate::error::AppError;
use crate::source::{Credentials, SourceOutput, SourceRef};
use crate::traits::SourceAdapter;

/// Object-safe view of a [`SourceAdapter`].
trait ErasedAdapter: Send + Sync {
    fn describe(&self) -> String;

    fn run<'a>(
        &'a self,
        source: &'a SourceRef,
        credentials: &'a Credentials,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<SourceOutput, AppError>>;
}

impl<A: SourceAdapter> ErasedAdapter for A {
    fn describe(&self) -> String {
        SourceAdapter::describe(self)
    }

    fn run<'a>(
        &'a self,
        source: &'a SourceRef,
        credentials: &'a Credentials,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<SourceOutput, AppError>> {
        Box::pin(SourceAdapter::run(self, source, credentials, progress, cancel))
    }
}

/// Adapter that dispatches each job on `SourceRef::kind`.
///
/// New source types plug in with [`register`](Self::register); the queue
/// only ever sees the registry.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Arc<BTreeMap<String, Arc<dyn ErasedAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` for sources of `kind`, replacing any previous one.
    pub fn register(mut self, kind: impl Into<String>, adapter: impl SourceAdapter) -> Self {
        Arc::make_mut(&mut self.adapters).insert(kind.into(), Arc::new(adapter));
        self
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.adapters.contains_key(kind)
    }
}

impl SourceAdapter for AdapterRegistry {
    fn describe(&self) -> String {
        let names: Vec<String> = self
            .adapters
            .iter()
            .map(|(kind, adapter)| format!("{kind}: {}", adapter.describe()))
            .collect();
        format!("registry [{}]", names.join(", "))
    }

    async fn run(
        &self,
        source: &SourceRef,
        credentials: &Credentials,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<SourceOutput, AppError> {
        let adapter = self
            .adapters
            .get(&source.kind)
            .ok_or_else(|| AppError::UnknownSourceKind(source.kind.clone()))?;
        adapter.run(source, credentials, progress, cancel).await
    }
}
