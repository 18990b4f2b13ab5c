#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod backoff;
pub mod chat;
pub mod config;
pub mod connection;
pub mod constants;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod sse;
pub mod tracker;
pub mod transcript;
pub mod transport;
pub mod types;

pub use types::*;

pub use backoff::{BackoffPolicy, Debouncer};
pub use config::SyncConfig;
pub use connection::{CloseReason, ConnectionEvent, ConnectionState, StreamConnection};
pub use registry::{JobRegistry, JobSnapshot};
pub use retry::{RetryExecutor, RetryOptions};
pub use tracker::{JobKind, JobProgressTracker, JobState};
pub use transcript::{ChatMessage, ChatTranscriptReconciler, TranscriptStore, TranscriptUpdate};
