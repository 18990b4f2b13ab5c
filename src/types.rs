use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JobId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConversationId(pub String);

/// Correlates one client-side stream session with server logs (`?t=` query parameter).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TraceId(pub String);

fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

impl JobId {
    pub fn short(&self) -> &str {
        prefix_chars(&self.0, 8)
    }
}

impl ConversationId {
    pub fn short(&self) -> &str {
        prefix_chars(&self.0, 6)
    }
}

const TEMP_ID_PREFIX: &str = "tmp-";

impl MessageId {
    /// Locally generated id for an optimistic message.
    pub fn temporary() -> Self {
        Self(format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4().simple()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }
}

impl TraceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! string_id {
    ($($name:ident),*) => {
        $(
            impl From<String> for $name {
                fn from(s: String) -> Self {
                    Self(s)
                }
            }

            impl From<&str> for $name {
                fn from(s: &str) -> Self {
                    Self(s.to_string())
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

string_id!(JobId, MessageId, ConversationId, TraceId);

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(StatusCode, String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Job failed [{code}]: {message}")]
    JobFailed { code: String, message: String },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Connection closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No failed message {0} to resend")]
    NothingToResend(MessageId),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl SyncError {
    /// Network failures and 5xx/429 responses are worth another attempt; client
    /// errors and anything the server told us about the job itself are not.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Network(e) => match e.status() {
                Some(status) => is_retryable_status(status),
                None => true,
            },
            SyncError::Io(_) | SyncError::ConnectionLost(_) => true,
            SyncError::Upstream(status, _) => is_retryable_status(*status),
            SyncError::Serialization(_)
            | SyncError::Protocol(_)
            | SyncError::JobFailed { .. }
            | SyncError::Closed
            | SyncError::Config(_)
            | SyncError::NothingToResend(_)
            | SyncError::Internal(_, _) => false,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        SyncError::Internal(msg.into(), SpanTrace::capture())
    }
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    crate::constants::RETRYABLE_STATUS_CODES.contains(&status.as_u16()) || status.is_server_error()
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: SyncError,
    pub span_trace: SpanTrace,
}

impl ObservedError {
    pub fn is_transient(&self) -> bool {
        self.inner.is_transient()
    }
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<SyncError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
