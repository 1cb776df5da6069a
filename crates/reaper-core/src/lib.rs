pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod event;
pub mod job;
pub mod queue;
pub mod registry;
pub mod source;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use config::QueueConfig;
pub use credentials::{EnvKeyStore, StaticKeyStore};
pub use engine::{ProgressReporter, RunHandle};
pub use error::{AppError, QueueError};
pub use event::{ChannelEventSink, ErrorLog, FanoutSink, JobEvent, TracingEventSink};
pub use job::{Job, JobError, JobErrorKind, JobId, JobStatus};
pub use queue::{JobQueue, RunSummary};
pub use registry::AdapterRegistry;
pub use source::{Credentials, SourceOutput, SourceRef};
pub use traits::{CredentialStore, EventSink, NullSink, SourceAdapter};
