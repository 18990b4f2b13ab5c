use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CACHE_CONTROL};
use reqwest::{StatusCode, Url};
use std::collections::VecDeque;
use std::sync::Mutex;
use thiserror::Error;

use crate::constants::TRACE_QUERY_PARAM;
use crate::sse::{frame_stream, FrameStream, SseFrame};
use crate::types::{JobId, Result, SyncError, TraceId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub url: String,
    pub last_event_id: Option<String>,
}

/// Why a stream could not be opened. Drives the reconnect decision.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OpenError {
    #[error("Event endpoint not found (status {0})")]
    NotFound(StatusCode),

    #[error("Event endpoint rejected the request (status {0}): {1}")]
    Rejected(StatusCode, String),

    #[error("Transient open failure: {0}")]
    Transient(String),
}

impl OpenError {
    pub fn from_status(status: StatusCode, body: String) -> Self {
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            OpenError::NotFound(status)
        } else if crate::types::is_retryable_status(status) {
            OpenError::Transient(format!("status {}: {}", status, body))
        } else {
            OpenError::Rejected(status, body)
        }
    }
}

/// Opens one server-push stream. Implementations must not retry internally; the
/// reconnect policy lives in the connection.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn open(&self, request: &OpenRequest) -> std::result::Result<FrameStream, OpenError>;
}

/// `<base><path>?t=<trace>` where `path` contains a `{job_id}` placeholder.
pub fn events_url(base_url: &str, path_template: &str, job_id: &JobId, trace_id: &TraceId) -> Result<String> {
    let path = path_template.replace("{job_id}", &job_id.0);
    let raw = format!("{}{}", base_url.trim_end_matches('/'), path);
    let mut url = Url::parse(&raw)
        .map_err(|e| SyncError::Config(format!("invalid events url {}: {}", raw, e)))?;
    url.query_pairs_mut()
        .append_pair(TRACE_QUERY_PARAM, &trace_id.0);
    Ok(url.to_string())
}

pub struct HttpTransport {
    client: reqwest::Client,
    headers: HeaderMap,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_bearer(mut self, token: &str) -> Result<Self> {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| SyncError::Config(format!("invalid bearer token: {}", e)))?;
        self.headers.insert(AUTHORIZATION, value);
        Ok(self)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| SyncError::Config(format!("invalid header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| SyncError::Config(format!("invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }
}

#[async_trait]
impl EventTransport for HttpTransport {
    async fn open(&self, request: &OpenRequest) -> std::result::Result<FrameStream, OpenError> {
        let mut builder = self
            .client
            .get(&request.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = &request.last_event_id {
            builder = builder.header("Last-Event-ID", id.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| OpenError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(text) => text,
                Err(e) => format!("(body unreadable: {})", e),
            };
            tracing::warn!("[SSE] Open failed with status {}: {}", status, body);
            return Err(OpenError::from_status(status, body));
        }

        let bytes_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        Ok(frame_stream(tokio_util::io::StreamReader::new(bytes_stream)))
    }
}

/// What one `open` call on a [`ScriptedTransport`] does.
#[derive(Debug)]
pub enum ScriptedOpen {
    /// Fail to open.
    Fail(OpenError),
    /// Open, deliver the frames, then end the stream (server-side close).
    Deliver(Vec<std::io::Result<SseFrame>>),
    /// Open, deliver the frames, then stay open without further data.
    DeliverAndHold(Vec<std::io::Result<SseFrame>>),
    /// Open, decode the raw body as SSE, then stay open.
    RawAndHold(Vec<u8>),
}

/// In-memory transport that replays a script of opens, for tests and offline demos.
/// Opens past the end of the script fail transiently.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<ScriptedOpen>>,
    requests: Mutex<Vec<OpenRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<ScriptedOpen>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<OpenRequest> {
        match self.requests.lock() {
            Ok(requests) => requests.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn open_count(&self) -> usize {
        self.requests().len()
    }
}

/// Builds a frame the way the decoder would, for scripting.
pub fn frame(event: &str, data: &str) -> std::io::Result<SseFrame> {
    Ok(SseFrame {
        event: Some(event.to_string()),
        data: data.to_string(),
        id: None,
        retry_ms: None,
        invalid: None,
    })
}

#[async_trait]
impl EventTransport for ScriptedTransport {
    async fn open(&self, request: &OpenRequest) -> std::result::Result<FrameStream, OpenError> {
        match self.requests.lock() {
            Ok(mut requests) => requests.push(request.clone()),
            Err(poisoned) => poisoned.into_inner().push(request.clone()),
        }
        let next = match self.script.lock() {
            Ok(mut script) => script.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        match next {
            Some(ScriptedOpen::Fail(e)) => Err(e),
            Some(ScriptedOpen::Deliver(frames)) => Ok(Box::pin(futures_util::stream::iter(frames))),
            Some(ScriptedOpen::DeliverAndHold(frames)) => Ok(Box::pin(
                futures_util::stream::iter(frames).chain(futures_util::stream::pending()),
            )),
            Some(ScriptedOpen::RawAndHold(body)) => Ok(Box::pin(
                frame_stream(std::io::Cursor::new(body)).chain(futures_util::stream::pending()),
            )),
            None => Err(OpenError::Transient("script exhausted".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_url_substitutes_job_and_trace() {
        let url = events_url(
            "https://api.example.com/",
            "/events/{job_id}",
            &JobId::from("job 42"),
            &TraceId::from("tr-1"),
        )
        .unwrap();
        assert_eq!(url, "https://api.example.com/events/job%2042?t=tr-1");
    }

    #[test]
    fn test_events_url_rejects_garbage_base() {
        let result = events_url("not a url", "/events/{job_id}", &JobId::from("j"), &TraceId::from("t"));
        match result {
            Err(e) => assert!(matches!(e.inner, SyncError::Config(_))),
            Ok(url) => panic!("Expected config error, got {}", url),
        }
    }

    #[test]
    fn test_open_error_classification() {
        assert_eq!(
            OpenError::from_status(StatusCode::NOT_FOUND, String::new()),
            OpenError::NotFound(StatusCode::NOT_FOUND)
        );
        assert!(matches!(
            OpenError::from_status(StatusCode::FORBIDDEN, "no".into()),
            OpenError::Rejected(StatusCode::FORBIDDEN, _)
        ));
        assert!(matches!(
            OpenError::from_status(StatusCode::BAD_GATEWAY, String::new()),
            OpenError::Transient(_)
        ));
        assert!(matches!(
            OpenError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            OpenError::Transient(_)
        ));
    }

    #[tokio::test]
    async fn test_scripted_transport_replays_in_order() {
        let transport = ScriptedTransport::new(vec![
            ScriptedOpen::Fail(OpenError::Transient("boom".into())),
            ScriptedOpen::Deliver(vec![frame("meta", "{}")]),
        ]);
        let request = OpenRequest {
            url: "http://localhost/events/j".into(),
            last_event_id: None,
        };

        assert!(transport.open(&request).await.is_err());
        let mut frames = match transport.open(&request).await {
            Ok(f) => f,
            Err(e) => panic!("Expected stream, got {}", e),
        };
        assert!(frames.next().await.is_some());
        assert!(frames.next().await.is_none());
        assert!(transport.open(&request).await.is_err());
        assert_eq!(transport.open_count(), 3);
    }
}
