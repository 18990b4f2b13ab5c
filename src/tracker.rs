use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::TrackerConfig;
use crate::constants::{META_DEFAULT_PCT, PROGRESS_CEILING_PCT};
use crate::events::{FailedPayload, JobEvent, ReadyPayload, StreamEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Upload,
    Review,
    Research,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Upload => write!(f, "upload"),
            JobKind::Review => write!(f, "review"),
            JobKind::Research => write!(f, "research"),
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "upload" => Ok(JobKind::Upload),
            "review" => Ok(JobKind::Review),
            "research" => Ok(JobKind::Research),
            other => Err(format!("unknown job kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FileMetadata {
    pub pages: Option<u32>,
    pub mimetype: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobResult {
    /// Output of an upload/ingestion job.
    File(FileMetadata),
    /// Output of a review or research job, passed through as the server sent it.
    Document { fields: Map<String, Value> },
}

impl JobResult {
    pub(crate) fn from_ready(kind: JobKind, payload: ReadyPayload) -> Self {
        match kind {
            JobKind::Upload => JobResult::File(FileMetadata {
                pages: payload.pages,
                mimetype: payload.mimetype,
                extra: payload.fields,
            }),
            JobKind::Review | JobKind::Research => {
                let mut fields = payload.fields;
                if let Some(pages) = payload.pages {
                    fields.insert("pages".to_string(), Value::from(pages));
                }
                if let Some(mimetype) = payload.mimetype {
                    fields.insert("mimetype".to_string(), Value::from(mimetype));
                }
                JobResult::Document { fields }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    Uploading,
    Processing { pct: f64 },
    Ready(JobResult),
    Failed { code: String, message: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Ready(_) | JobState::Failed { .. })
    }
}

/// Cancellable deadline for clearing a recoverable issue. A newer event or error bumps
/// the tracker's generation, which invalidates every token handed out before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryToken {
    pub generation: u64,
    pub deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Stream dropped; the job may still finish server-side. Clears on its own.
    Interrupted,
    /// Reconnects gave up. Stays until the caller retries or clears the job.
    Lost,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionIssue {
    pub kind: IssueKind,
    pub message: String,
    pub expiry: Option<ExpiryToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Updated,
    Unchanged,
    Terminal,
    Ignored,
}

pub struct JobProgressTracker {
    job_id: crate::types::JobId,
    kind: JobKind,
    config: TrackerConfig,
    state: JobState,
    last_pct: f64,
    metadata: Map<String, Value>,
    issue: Option<ConnectionIssue>,
    generation: u64,
    last_event_at: Instant,
    /// Start of the current liveness window: the last event, reset or cleared issue.
    liveness_from: Instant,
}

impl JobProgressTracker {
    pub fn new(job_id: crate::types::JobId, kind: JobKind, config: TrackerConfig, now: Instant) -> Self {
        Self {
            job_id,
            kind,
            config,
            state: JobState::Uploading,
            last_pct: 0.0,
            metadata: Map::new(),
            issue: None,
            generation: 0,
            last_event_at: now,
            liveness_from: now,
        }
    }

    /// Tracker for a job the server already resolved when it was created.
    pub fn resolved(
        job_id: crate::types::JobId,
        kind: JobKind,
        config: TrackerConfig,
        state: JobState,
        now: Instant,
    ) -> Self {
        let mut tracker = Self::new(job_id, kind, config, now);
        if matches!(state, JobState::Ready(_)) {
            tracker.last_pct = 100.0;
        }
        tracker.state = state;
        tracker
    }

    pub fn job_id(&self) -> &crate::types::JobId {
        &self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn pct(&self) -> f64 {
        match self.state {
            JobState::Ready(_) => 100.0,
            _ => self.last_pct,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn issue(&self) -> Option<&ConnectionIssue> {
        self.issue.as_ref()
    }

    pub fn apply(&mut self, event: &StreamEvent, now: Instant) -> Reduction {
        if self.is_terminal() {
            tracing::debug!(
                "Ignoring '{}' for job {}: already terminal",
                event.event_type,
                self.job_id.short()
            );
            return Reduction::Ignored;
        }

        let decoded = match event.decode() {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(
                    "Ignoring malformed '{}' for job {}: {}",
                    event.event_type,
                    self.job_id.short(),
                    e.inner
                );
                return Reduction::Ignored;
            }
        };

        self.last_event_at = now;
        self.liveness_from = now;
        if self.issue.take().is_some() {
            self.generation += 1;
            tracing::info!("Job {} stream recovered", self.job_id.short());
        }

        match decoded {
            JobEvent::Meta(meta) => {
                for (key, value) in meta.metadata {
                    self.metadata.insert(key, value);
                }
                self.raise_pct(meta.pct.unwrap_or(META_DEFAULT_PCT))
            }
            JobEvent::Progress(progress) => self.raise_pct(progress.pct),
            JobEvent::Ready(ready) => {
                self.state = JobState::Ready(JobResult::from_ready(self.kind, ready));
                tracing::info!("Job {} ({}) ready", self.job_id.short(), self.kind);
                Reduction::Terminal
            }
            JobEvent::Failed(FailedPayload { error }) => {
                let message = error.detail.unwrap_or_else(|| error.code.clone());
                tracing::warn!(
                    "Job {} ({}) failed [{}]: {}",
                    self.job_id.short(),
                    self.kind,
                    error.code,
                    message
                );
                self.state = JobState::Failed {
                    code: error.code,
                    message,
                };
                Reduction::Terminal
            }
            JobEvent::Heartbeat | JobEvent::Message(_) => Reduction::Unchanged,
        }
    }

    /// Progress never moves backwards and never reaches 100 without a terminal event.
    fn raise_pct(&mut self, incoming: f64) -> Reduction {
        if !incoming.is_finite() {
            return Reduction::Ignored;
        }
        let clamped = incoming.clamp(0.0, PROGRESS_CEILING_PCT);
        let next = self.last_pct.max(clamped);
        let was_processing = matches!(self.state, JobState::Processing { .. });
        if was_processing && next == self.last_pct {
            return Reduction::Unchanged;
        }
        self.last_pct = next;
        self.state = JobState::Processing { pct: next };
        Reduction::Updated
    }

    /// Records a dropped stream. Returns false if the job is already resolved.
    pub fn on_transport_error(&mut self, reason: &str, now: Instant) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(self.issue.as_ref().map(|i| i.kind), Some(IssueKind::Lost)) {
            return false;
        }
        self.generation += 1;
        self.issue = Some(ConnectionIssue {
            kind: IssueKind::Interrupted,
            message: reason.to_string(),
            expiry: Some(ExpiryToken {
                generation: self.generation,
                deadline: now + self.config.error_grace,
            }),
        });
        true
    }

    /// Records that reconnection gave up while the job was unresolved.
    pub fn on_connection_lost(&mut self, reason: &str) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.generation += 1;
        self.issue = Some(ConnectionIssue {
            kind: IssueKind::Lost,
            message: reason.to_string(),
            expiry: None,
        });
        true
    }

    /// Caller-initiated retry: forget the issue and restart the liveness clock.
    pub fn reset_issue(&mut self, now: Instant) {
        if self.issue.take().is_some() {
            self.generation += 1;
        }
        self.last_event_at = now;
        self.liveness_from = now;
    }

    /// Clears an interrupted issue whose token is still current and past its deadline.
    pub fn expire(&mut self, now: Instant) -> bool {
        let expired = match &self.issue {
            Some(ConnectionIssue {
                expiry: Some(token),
                ..
            }) => token.generation == self.generation && now >= token.deadline,
            _ => false,
        };
        if expired {
            self.issue = None;
            self.liveness_from = now;
            tracing::debug!("Cleared stale connection issue for job {}", self.job_id.short());
        }
        expired
    }

    /// Silence longer than the liveness timeout counts as a transport error, even if the
    /// connection still reports itself open.
    pub fn check_liveness(&mut self, now: Instant) -> bool {
        if self.is_terminal() || self.issue.is_some() {
            return false;
        }
        if now.saturating_duration_since(self.liveness_from) < self.config.liveness_timeout {
            return false;
        }
        let silent_for = self.silence(now);
        tracing::warn!(
            "Job {} silent for {:?}, treating as disconnected",
            self.job_id.short(),
            silent_for
        );
        self.on_transport_error(&format!("no events for {}s", silent_for.as_secs()), now)
    }

    /// Earliest instant at which `expire` or `check_liveness` could change something.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.is_terminal() {
            return None;
        }
        match &self.issue {
            Some(ConnectionIssue {
                expiry: Some(token),
                ..
            }) => Some(token.deadline),
            Some(_) => None,
            None => Some(self.liveness_from + self.config.liveness_timeout),
        }
    }

    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_event_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobId;
    use serde_json::json;

    fn config() -> TrackerConfig {
        TrackerConfig {
            error_grace: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(30),
        }
    }

    fn event(event_type: &str, payload: Value) -> StreamEvent {
        let map = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        StreamEvent::new(event_type, JobId::from("job-1"), map)
    }

    fn tracker(kind: JobKind) -> (JobProgressTracker, Instant) {
        let now = Instant::now();
        (JobProgressTracker::new(JobId::from("job-1"), kind, config(), now), now)
    }

    #[test]
    fn test_meta_defaults_to_ten_percent() {
        let (mut t, now) = tracker(JobKind::Upload);
        assert_eq!(t.apply(&event("meta", json!({"filename": "a.pdf"})), now), Reduction::Updated);
        assert_eq!(t.state(), &JobState::Processing { pct: 10.0 });
        assert_eq!(t.metadata().get("filename"), Some(&json!("a.pdf")));
    }

    #[test]
    fn test_progress_is_clamped_below_completion() {
        let (mut t, now) = tracker(JobKind::Upload);
        t.apply(&event("progress", json!({"pct": 100})), now);
        assert_eq!(t.state(), &JobState::Processing { pct: 95.0 });
        assert!(!t.is_terminal());
    }

    #[test]
    fn test_pct_never_decreases() {
        let (mut t, now) = tracker(JobKind::Review);
        t.apply(&event("meta", json!({"pct": 5})), now);
        t.apply(&event("progress", json!({"pct": 40})), now);
        assert_eq!(t.apply(&event("progress", json!({"pct": 30})), now), Reduction::Unchanged);
        assert_eq!(t.apply(&event("meta", json!({})), now), Reduction::Unchanged);
        assert_eq!(t.pct(), 40.0);
    }

    #[test]
    fn test_ready_extracts_file_metadata_for_uploads() {
        let (mut t, now) = tracker(JobKind::Upload);
        let r = t.apply(
            &event("ready", json!({"pages": 3, "mimetype": "application/pdf", "name": "a.pdf"})),
            now,
        );
        assert_eq!(r, Reduction::Terminal);
        match t.state() {
            JobState::Ready(JobResult::File(meta)) => {
                assert_eq!(meta.pages, Some(3));
                assert_eq!(meta.mimetype.as_deref(), Some("application/pdf"));
                assert_eq!(meta.extra.get("name"), Some(&json!("a.pdf")));
            }
            other => panic!("Expected file result, got {:?}", other),
        }
        assert_eq!(t.pct(), 100.0);
    }

    #[test]
    fn test_ready_for_review_keeps_document_fields() {
        let (mut t, now) = tracker(JobKind::Review);
        t.apply(&event("ready", json!({"summary": "ok", "pages": 2})), now);
        match t.state() {
            JobState::Ready(JobResult::Document { fields }) => {
                assert_eq!(fields.get("summary"), Some(&json!("ok")));
                assert_eq!(fields.get("pages"), Some(&json!(2)));
            }
            other => panic!("Expected document result, got {:?}", other),
        }
    }

    #[test]
    fn test_exactly_one_terminal_transition() {
        let (mut t, now) = tracker(JobKind::Upload);
        assert_eq!(
            t.apply(&event("failed", json!({"error": {"code": "E_SIZE", "detail": "too big"}})), now),
            Reduction::Terminal
        );
        assert_eq!(t.apply(&event("ready", json!({})), now), Reduction::Ignored);
        assert_eq!(t.apply(&event("progress", json!({"pct": 50})), now), Reduction::Ignored);
        assert_eq!(
            t.state(),
            &JobState::Failed {
                code: "E_SIZE".into(),
                message: "too big".into()
            }
        );
    }

    #[test]
    fn test_failed_without_detail_uses_code_as_message() {
        let (mut t, now) = tracker(JobKind::Research);
        t.apply(&event("failed", json!({"error": {"code": "E_TIMEOUT"}})), now);
        assert_eq!(
            t.state(),
            &JobState::Failed {
                code: "E_TIMEOUT".into(),
                message: "E_TIMEOUT".into()
            }
        );
    }

    #[test]
    fn test_malformed_event_is_ignored() {
        let (mut t, now) = tracker(JobKind::Upload);
        assert_eq!(t.apply(&event("progress", json!({"pct": "lots"})), now), Reduction::Ignored);
        assert_eq!(t.state(), &JobState::Uploading);
    }

    #[test]
    fn test_heartbeat_resets_liveness() {
        let (mut t, start) = tracker(JobKind::Upload);
        let later = start + Duration::from_secs(25);
        assert_eq!(t.apply(&event("heartbeat", json!({})), later), Reduction::Unchanged);
        assert!(!t.check_liveness(start + Duration::from_secs(50)));
        assert!(t.check_liveness(start + Duration::from_secs(56)));
        assert_eq!(t.issue().map(|i| i.kind), Some(IssueKind::Interrupted));
    }

    #[test]
    fn test_interrupted_issue_expires_after_grace() {
        let (mut t, now) = tracker(JobKind::Upload);
        assert!(t.on_transport_error("reset", now));
        assert!(!t.expire(now + Duration::from_secs(9)));
        assert!(t.issue().is_some());
        assert!(t.expire(now + Duration::from_secs(10)));
        assert!(t.issue().is_none());
    }

    #[test]
    fn test_expired_silence_issue_waits_a_full_window_before_returning() {
        let (mut t, start) = tracker(JobKind::Upload);
        let raised = start + Duration::from_secs(30);
        assert!(t.check_liveness(raised));
        let cleared = raised + Duration::from_secs(10);
        assert!(t.expire(cleared));
        assert_eq!(t.next_deadline(), Some(cleared + Duration::from_secs(30)));
        assert!(!t.check_liveness(cleared));
        assert!(!t.check_liveness(cleared + Duration::from_secs(29)));
        assert!(t.check_liveness(cleared + Duration::from_secs(30)));
        assert_eq!(t.silence(cleared + Duration::from_secs(30)), Duration::from_secs(70));
    }

    #[test]
    fn test_newer_error_invalidates_older_token() {
        let (mut t, now) = tracker(JobKind::Upload);
        t.on_transport_error("first", now);
        let first = t.issue().and_then(|i| i.expiry).unwrap();
        t.on_transport_error("second", now + Duration::from_secs(5));
        let second = t.issue().and_then(|i| i.expiry).unwrap();
        assert!(second.generation > first.generation);
        assert!(!t.expire(now + Duration::from_secs(12)));
        assert!(t.expire(now + Duration::from_secs(15)));
    }

    #[test]
    fn test_event_clears_issue_immediately() {
        let (mut t, now) = tracker(JobKind::Upload);
        t.on_transport_error("reset", now);
        t.apply(&event("progress", json!({"pct": 20})), now + Duration::from_secs(1));
        assert!(t.issue().is_none());
    }

    #[test]
    fn test_lost_issue_stays_until_reset() {
        let (mut t, now) = tracker(JobKind::Upload);
        t.on_connection_lost("reconnect attempts exhausted");
        assert!(!t.expire(now + Duration::from_secs(3600)));
        assert!(!t.on_transport_error("again", now));
        assert_eq!(t.issue().map(|i| i.kind), Some(IssueKind::Lost));
        assert_eq!(t.next_deadline(), None);
        t.reset_issue(now);
        assert!(t.issue().is_none());
    }

    #[test]
    fn test_terminal_job_ignores_transport_errors() {
        let (mut t, now) = tracker(JobKind::Upload);
        t.apply(&event("ready", json!({})), now);
        assert!(!t.on_transport_error("late", now));
        assert!(!t.on_connection_lost("late"));
        assert_eq!(t.next_deadline(), None);
    }

    #[test]
    fn test_resolved_ready_reports_full_progress() {
        let t = JobProgressTracker::resolved(
            JobId::from("j"),
            JobKind::Upload,
            config(),
            JobState::Ready(JobResult::File(FileMetadata::default())),
            Instant::now(),
        );
        assert!(t.is_terminal());
        assert_eq!(t.pct(), 100.0);
    }

    #[test]
    fn test_job_kind_parses_case_insensitively() {
        assert_eq!("Upload".parse::<JobKind>(), Ok(JobKind::Upload));
        assert!("bogus".parse::<JobKind>().is_err());
    }
}
