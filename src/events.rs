use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{
    EVENT_FAILED, EVENT_HEARTBEAT, EVENT_MESSAGE, EVENT_META, EVENT_PROGRESS, EVENT_READY,
};
use crate::sse::SseFrame;
use crate::types::{JobId, Result, SyncError};

/// One pushed event for one job. Transient: consumed by the tracker, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub event_type: String,
    pub job_id: JobId,
    pub payload: Map<String, Value>,
    pub progress_pct: Option<f64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MetaPayload {
    #[serde(default)]
    pub pct: Option<f64>,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReadyPayload {
    #[serde(default)]
    pub pages: Option<u32>,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub code: String,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedPayload {
    pub error: FailureDetail,
}

/// Typed view of a [`StreamEvent`]'s named sub-event.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Meta(MetaPayload),
    Progress(ProgressPayload),
    Ready(ReadyPayload),
    Failed(FailedPayload),
    Heartbeat,
    Message(Map<String, Value>),
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Ready(_) | JobEvent::Failed(_))
    }
}

pub fn is_terminal_event_type(event_type: &str) -> bool {
    event_type == EVENT_READY || event_type == EVENT_FAILED
}

fn is_known_sub_event(name: &str) -> bool {
    matches!(
        name,
        EVENT_META | EVENT_PROGRESS | EVENT_READY | EVENT_FAILED | EVENT_HEARTBEAT
    )
}

impl StreamEvent {
    pub fn new(event_type: &str, job_id: JobId, payload: Map<String, Value>) -> Self {
        let progress_pct = payload.get("pct").and_then(Value::as_f64);
        let timestamp = payload
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Self {
            event_type: event_type.to_string(),
            job_id,
            payload,
            progress_pct,
            timestamp,
            last_event_id: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        is_terminal_event_type(&self.event_type)
    }

    pub fn decode(&self) -> Result<JobEvent> {
        let body = Value::Object(self.payload.clone());
        let event = match self.event_type.as_str() {
            EVENT_META => JobEvent::Meta(serde_json::from_value(body)?),
            EVENT_PROGRESS => JobEvent::Progress(serde_json::from_value(body)?),
            EVENT_READY => JobEvent::Ready(serde_json::from_value(body)?),
            EVENT_FAILED => JobEvent::Failed(serde_json::from_value(body)?),
            EVENT_HEARTBEAT => JobEvent::Heartbeat,
            _ => JobEvent::Message(self.payload.clone()),
        };
        Ok(event)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedFrame {
    Event(StreamEvent),
    Malformed { event_type: String, reason: String },
}

/// Turns a decoded SSE frame into a job event. A generic `message` frame whose body
/// names a known sub-event in `type` (or `event`) is dispatched as that sub-event.
pub fn parse_frame(frame: &SseFrame, job_id: &JobId) -> ParsedFrame {
    let mut event_type = frame.event_name().to_string();
    if let Some(reason) = &frame.invalid {
        return ParsedFrame::Malformed {
            event_type,
            reason: reason.clone(),
        };
    }

    let payload = if event_type == EVENT_HEARTBEAT {
        Map::new()
    } else if frame.data.trim().is_empty() {
        Map::new()
    } else {
        match serde_json::from_str::<Value>(&frame.data) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return ParsedFrame::Malformed {
                    event_type,
                    reason: format!("expected JSON object, got {}", json_kind(&other)),
                }
            }
            Err(e) => {
                return ParsedFrame::Malformed {
                    event_type,
                    reason: e.to_string(),
                }
            }
        }
    };

    if event_type == EVENT_MESSAGE {
        let named = payload
            .get("type")
            .or_else(|| payload.get("event"))
            .and_then(Value::as_str)
            .filter(|name| is_known_sub_event(name))
            .map(str::to_string);
        if let Some(name) = named {
            event_type = name;
        }
    }

    let mut event = StreamEvent::new(&event_type, job_id.clone(), payload);
    event.last_event_id = frame.id.clone();

    match event.decode() {
        Ok(_) => ParsedFrame::Event(event),
        Err(e) => ParsedFrame::Malformed {
            event_type,
            reason: e.inner.to_string(),
        },
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl From<FailureDetail> for SyncError {
    fn from(detail: FailureDetail) -> Self {
        SyncError::JobFailed {
            message: detail.detail.unwrap_or_else(|| detail.code.clone()),
            code: detail.code,
        }
    }
}
