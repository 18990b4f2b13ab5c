//! Owns every tracked job of a session: its tracker, its single live stream and the
//! results persisted when a job completes. UI code observes jobs through watch channels.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::{SyncConfig, TrackerConfig};
use crate::connection::{CloseReason, ConnectionEvent, ConnectionState, StreamConnection};
use crate::events::{FailedPayload, ReadyPayload};
use crate::metrics::SyncMetrics;
use crate::tracker::{
    ConnectionIssue, FileMetadata, JobKind, JobProgressTracker, JobResult, JobState, Reduction,
};
use crate::transport::EventTransport;
use crate::types::{JobId, Result, TraceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartStatus {
    Ready,
    Processing,
    Failed,
}

/// Response of the upload / start-job endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartJobResponse {
    pub job_id: JobId,
    pub status: StartStatus,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What the UI sees of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub pct: f64,
    pub issue: Option<ConnectionIssue>,
    pub connection: ConnectionState,
    pub metadata: Map<String, Value>,
}

impl JobSnapshot {
    fn of(tracker: &JobProgressTracker, connection: ConnectionState) -> Self {
        Self {
            job_id: tracker.job_id().clone(),
            kind: tracker.kind(),
            state: tracker.state().clone(),
            pct: tracker.pct(),
            issue: tracker.issue().cloned(),
            connection,
            metadata: tracker.metadata().clone(),
        }
    }
}

pub type ResultStore = Arc<RwLock<HashMap<JobId, JobResult>>>;

enum PumpCommand {
    ResetIssue,
}

struct JobHandle {
    kind: JobKind,
    snapshot_rx: watch::Receiver<JobSnapshot>,
    connection: Option<StreamConnection>,
    control_tx: Option<mpsc::UnboundedSender<PumpCommand>>,
    pump: Option<JoinHandle<()>>,
}

impl JobHandle {
    fn shutdown(&mut self) {
        if let Some(connection) = self.connection.as_mut() {
            connection.close();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct JobRegistry {
    config: SyncConfig,
    tracker_config: TrackerConfig,
    transport: Arc<dyn EventTransport>,
    jobs: HashMap<JobId, JobHandle>,
    results: ResultStore,
    metrics: Arc<SyncMetrics>,
}

impl JobRegistry {
    pub fn new(config: SyncConfig, transport: Arc<dyn EventTransport>, metrics: Arc<SyncMetrics>) -> Self {
        Self {
            tracker_config: config.tracker(),
            config,
            transport,
            jobs: HashMap::new(),
            results: Arc::new(RwLock::new(HashMap::new())),
            metrics,
        }
    }

    /// Registers a freshly created job. Jobs the server already resolved skip the stream.
    pub fn start(&mut self, response: StartJobResponse, kind: JobKind) -> Result<watch::Receiver<JobSnapshot>> {
        let job_id = response.job_id.clone();
        match response.status {
            StartStatus::Processing => self.watch(job_id, kind),
            StartStatus::Ready => {
                let payload: ReadyPayload = serde_json::from_value(Value::Object(response.extra))?;
                let result = JobResult::from_ready(kind, payload);
                tracing::info!("Job {} ({}) ready on creation, no stream needed", job_id.short(), kind);
                self.metrics.record_terminal(kind, true);
                self.store_result_now(&job_id, &result);
                Ok(self.insert_resolved(job_id, kind, JobState::Ready(result)))
            }
            StartStatus::Failed => {
                let (code, message) = match serde_json::from_value::<FailedPayload>(Value::Object(response.extra)) {
                    Ok(FailedPayload { error }) => {
                        let message = error.detail.unwrap_or_else(|| error.code.clone());
                        (error.code, message)
                    }
                    Err(_) => ("FAILED".to_string(), "job failed on creation".to_string()),
                };
                tracing::warn!("Job {} ({}) failed on creation [{}]: {}", job_id.short(), kind, code, message);
                self.metrics.record_terminal(kind, false);
                Ok(self.insert_resolved(job_id, kind, JobState::Failed { code, message }))
            }
        }
    }

    /// Opens the job's stream, closing any connection already open for it.
    pub fn watch(&mut self, job_id: JobId, kind: JobKind) -> Result<watch::Receiver<JobSnapshot>> {
        self.watch_traced(job_id, kind, TraceId::new())
    }

    /// Like [`JobRegistry::watch`], reusing a trace id the caller already has for the job.
    pub fn watch_traced(
        &mut self,
        job_id: JobId,
        kind: JobKind,
        trace_id: TraceId,
    ) -> Result<watch::Receiver<JobSnapshot>> {
        if let Some(mut existing) = self.jobs.remove(&job_id) {
            tracing::info!("Replacing existing stream for job {}", job_id.short());
            existing.shutdown();
        }

        let (mut connection, events_rx) = StreamConnection::new(
            job_id.clone(),
            &self.config.connection(trace_id.clone()),
            self.transport.clone(),
        )?;
        let state_rx = connection.subscribe_state();
        connection.connect();
        self.metrics.record_stream_opened(kind);

        let tracker = JobProgressTracker::new(job_id.clone(), kind, self.tracker_config, Instant::now());
        let (snapshot_tx, snapshot_rx) = watch::channel(JobSnapshot::of(&tracker, connection.ready_state()));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let pump = Pump {
            tracker,
            events_rx,
            state_rx,
            control_rx,
            snapshot_tx,
            results: self.results.clone(),
            metrics: self.metrics.clone(),
        };
        let span = tracing::info_span!("job_pump", job_id = %job_id.short(), kind = %kind, trace_id = %trace_id);
        let pump = tokio::spawn(pump.run().instrument(span));

        self.jobs.insert(
            job_id,
            JobHandle {
                kind,
                snapshot_rx: snapshot_rx.clone(),
                connection: Some(connection),
                control_tx: Some(control_tx),
                pump: Some(pump),
            },
        );
        Ok(snapshot_rx)
    }

    /// Caller-initiated retry after the connection gave up. Returns false for unknown
    /// or already-resolved jobs.
    pub fn retry(&mut self, job_id: &JobId) -> bool {
        let handle = match self.jobs.get_mut(job_id) {
            Some(handle) => handle,
            None => return false,
        };
        if handle.snapshot_rx.borrow().state.is_terminal() {
            return false;
        }
        let connection = match handle.connection.as_mut() {
            Some(connection) => connection,
            None => return false,
        };
        if connection.ready_state().is_active() {
            return true;
        }
        if let Some(control) = &handle.control_tx {
            if control.send(PumpCommand::ResetIssue).is_err() {
                tracing::debug!("Pump for job {} already stopped", job_id.short());
            }
        }
        connection.connect();
        self.metrics.record_stream_opened(handle.kind);
        tracing::info!("Retrying stream for job {}", job_id.short());
        true
    }

    /// Drops the job: closes its stream and forgets its state. Persisted results stay.
    pub fn clear(&mut self, job_id: &JobId) -> bool {
        match self.jobs.remove(job_id) {
            Some(mut handle) => {
                handle.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self, job_id: &JobId) -> Option<JobSnapshot> {
        self.jobs.get(job_id).map(|h| h.snapshot_rx.borrow().clone())
    }

    pub fn subscribe(&self, job_id: &JobId) -> Option<watch::Receiver<JobSnapshot>> {
        self.jobs.get(job_id).map(|h| h.snapshot_rx.clone())
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.keys().cloned().collect()
    }

    pub fn active_connections(&self) -> usize {
        self.jobs
            .values()
            .filter(|h| {
                h.connection
                    .as_ref()
                    .map(|c| c.ready_state().is_active())
                    .unwrap_or(false)
            })
            .count()
    }

    pub fn results(&self) -> ResultStore {
        self.results.clone()
    }

    pub async fn result(&self, job_id: &JobId) -> Option<JobResult> {
        self.results.read().await.get(job_id).cloned()
    }

    pub async fn file(&self, job_id: &JobId) -> Option<FileMetadata> {
        match self.result(job_id).await {
            Some(JobResult::File(meta)) => Some(meta),
            _ => None,
        }
    }

    fn insert_resolved(&mut self, job_id: JobId, kind: JobKind, state: JobState) -> watch::Receiver<JobSnapshot> {
        if let Some(mut existing) = self.jobs.remove(&job_id) {
            existing.shutdown();
        }
        let tracker = JobProgressTracker::resolved(job_id.clone(), kind, self.tracker_config, state, Instant::now());
        let (_snapshot_tx, snapshot_rx) = watch::channel(JobSnapshot::of(&tracker, ConnectionState::Idle));
        self.jobs.insert(
            job_id,
            JobHandle {
                kind,
                snapshot_rx: snapshot_rx.clone(),
                connection: None,
                control_tx: None,
                pump: None,
            },
        );
        snapshot_rx
    }

    fn store_result_now(&self, job_id: &JobId, result: &JobResult) {
        match self.results.try_write() {
            Ok(mut results) => {
                results.insert(job_id.clone(), result.clone());
            }
            Err(_) => {
                let results = self.results.clone();
                let job_id = job_id.clone();
                let result = result.clone();
                tokio::spawn(async move {
                    results.write().await.insert(job_id, result);
                });
            }
        }
    }
}

impl Drop for JobRegistry {
    fn drop(&mut self) {
        for handle in self.jobs.values_mut() {
            handle.shutdown();
        }
    }
}

/// Reduces one job's connection events into its tracker and publishes snapshots.
struct Pump {
    tracker: JobProgressTracker,
    events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    state_rx: watch::Receiver<ConnectionState>,
    control_rx: mpsc::UnboundedReceiver<PumpCommand>,
    snapshot_tx: watch::Sender<JobSnapshot>,
    results: ResultStore,
    metrics: Arc<SyncMetrics>,
}

impl Pump {
    async fn run(mut self) {
        loop {
            let deadline = self.tracker.next_deadline();
            let timer = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => {
                        if self.handle(event).await {
                            self.publish_resolved();
                            tracing::debug!("Job resolved, pump exiting");
                            return;
                        }
                    }
                    None => {
                        tracing::debug!("Connection dropped, pump exiting");
                        return;
                    }
                },
                Some(command) = self.control_rx.recv() => match command {
                    PumpCommand::ResetIssue => self.tracker.reset_issue(Instant::now()),
                },
                Ok(()) = self.state_rx.changed() => {}
                _ = timer => {
                    let now = Instant::now();
                    self.tracker.expire(now);
                    self.tracker.check_liveness(now);
                }
            }
            self.publish();
        }
    }

    /// Returns true once the job is resolved.
    async fn handle(&mut self, event: ConnectionEvent) -> bool {
        let kind = self.tracker.kind();
        match event {
            ConnectionEvent::Opened => {
                self.tracker.reset_issue(Instant::now());
                false
            }
            ConnectionEvent::Event(event) => {
                match self.tracker.apply(&event, Instant::now()) {
                    Reduction::Terminal => {
                        let ready = matches!(self.tracker.state(), JobState::Ready(_));
                        self.metrics.record_terminal(kind, ready);
                        if let JobState::Ready(result) = self.tracker.state() {
                            self.results
                                .write()
                                .await
                                .insert(self.tracker.job_id().clone(), result.clone());
                        }
                        true
                    }
                    _ => false,
                }
            }
            ConnectionEvent::Malformed { .. } => {
                self.metrics.record_malformed(kind);
                false
            }
            ConnectionEvent::Disconnected { reason } => {
                self.tracker.on_transport_error(&reason, Instant::now());
                false
            }
            ConnectionEvent::Reconnecting { .. } => {
                self.metrics.record_reconnect(kind);
                false
            }
            ConnectionEvent::Closed(reason) => {
                match reason {
                    CloseReason::Manual | CloseReason::Terminal => {}
                    other => {
                        if self.tracker.on_connection_lost(&other.to_string()) {
                            self.metrics.record_connection_lost(kind);
                            tracing::error!("Job {} stream gave up: {}", self.tracker.job_id().short(), other);
                        }
                    }
                }
                self.tracker.is_terminal()
            }
        }
    }

    fn publish(&self) {
        let connection = *self.state_rx.borrow();
        self.snapshot_tx
            .send_replace(JobSnapshot::of(&self.tracker, connection));
    }

    /// Final snapshot. The connection closes itself after a terminal event, possibly
    /// after the pump has stopped listening, so an active state is reported as closed.
    fn publish_resolved(&self) {
        let connection = match *self.state_rx.borrow() {
            state if state.is_active() => ConnectionState::Closed(CloseReason::Terminal),
            state => state,
        };
        self.snapshot_tx
            .send_replace(JobSnapshot::of(&self.tracker, connection));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::FrameStream;
    use crate::tracker::IssueKind;
    use crate::transport::{frame, OpenError, OpenRequest, ScriptedOpen, ScriptedTransport};
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    fn config() -> SyncConfig {
        SyncConfig {
            base_url: "http://sync.test".to_string(),
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            ..SyncConfig::default()
        }
    }

    fn registry(script: Vec<ScriptedOpen>) -> (JobRegistry, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new(script));
        let registry = JobRegistry::new(config(), transport.clone(), Arc::new(SyncMetrics::new()));
        (registry, transport)
    }

    /// Tight timing windows: 5s of silence raises an issue that clears after 2s.
    fn timed_registry(transport: Arc<dyn EventTransport>) -> JobRegistry {
        let config = SyncConfig {
            liveness_timeout_ms: 5_000,
            error_grace_ms: 2_000,
            ..config()
        };
        JobRegistry::new(config, transport, Arc::new(SyncMetrics::new()))
    }

    /// Opens once, sends `meta`, then a heartbeat every `every` forever.
    struct HeartbeatTransport {
        every: Duration,
    }

    #[async_trait]
    impl EventTransport for HeartbeatTransport {
        async fn open(&self, _request: &OpenRequest) -> std::result::Result<FrameStream, OpenError> {
            let every = self.every;
            let heartbeats = futures_util::stream::unfold((), move |()| async move {
                tokio::time::sleep(every).await;
                Some((frame("heartbeat", ""), ()))
            });
            Ok(Box::pin(
                futures_util::stream::iter(vec![frame("meta", "{}")]).chain(heartbeats),
            ))
        }
    }

    fn issue_kind(snapshot: &JobSnapshot) -> Option<IssueKind> {
        snapshot.issue.as_ref().map(|i| i.kind)
    }

    fn start_response(value: Value) -> StartJobResponse {
        serde_json::from_value(value).unwrap()
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<JobSnapshot>, mut pred: F) -> JobSnapshot
    where
        F: FnMut(&JobSnapshot) -> bool,
    {
        loop {
            if pred(&rx.borrow()) {
                return rx.borrow().clone();
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_creation_skips_stream() {
        let (mut registry, transport) = registry(vec![]);
        let rx = registry
            .start(
                start_response(json!({"job_id": "j1", "status": "READY", "pages": 4, "mimetype": "text/plain"})),
                JobKind::Upload,
            )
            .unwrap();

        assert!(matches!(rx.borrow().state, JobState::Ready(_)));
        assert_eq!(transport.open_count(), 0);
        assert_eq!(registry.active_connections(), 0);
        let file = registry.file(&JobId::from("j1")).await.unwrap();
        assert_eq!(file.pages, Some(4));
        assert_eq!(file.mimetype.as_deref(), Some("text/plain"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_on_creation_reports_error() {
        let (mut registry, transport) = registry(vec![]);
        let rx = registry
            .start(
                start_response(json!({"job_id": "j2", "status": "FAILED", "error": {"code": "E_TYPE", "detail": "unsupported"}})),
                JobKind::Upload,
            )
            .unwrap();
        assert_eq!(
            rx.borrow().state,
            JobState::Failed {
                code: "E_TYPE".into(),
                message: "unsupported".into()
            }
        );
        assert_eq!(transport.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_processing_job_streams_to_ready() {
        let (mut registry, _transport) = registry(vec![ScriptedOpen::Deliver(vec![
            frame("meta", r#"{"pct":5}"#),
            frame("progress", r#"{"pct":60}"#),
            frame("ready", r#"{"pages":9}"#),
        ])]);
        let mut rx = registry
            .start(start_response(json!({"job_id": "j3", "status": "PROCESSING"})), JobKind::Upload)
            .unwrap();

        let snap = wait_for(&mut rx, |s| s.state.is_terminal()).await;
        assert!(matches!(snap.state, JobState::Ready(JobResult::File(ref f)) if f.pages == Some(9)));
        assert_eq!(snap.pct, 100.0);
        assert_eq!(snap.connection, ConnectionState::Closed(CloseReason::Terminal));
        assert_eq!(
            registry.file(&JobId::from("j3")).await.and_then(|f| f.pages),
            Some(9)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_watching_same_job_twice_replaces_connection() {
        let (mut registry, transport) = registry(vec![
            ScriptedOpen::DeliverAndHold(vec![]),
            ScriptedOpen::DeliverAndHold(vec![]),
        ]);
        let job = JobId::from("j4");
        let first = registry.watch(job.clone(), JobKind::Review).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        let _second = registry.watch(job.clone(), JobKind::Review).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(registry.job_ids().len(), 1);
        assert_eq!(registry.active_connections(), 1);
        assert_eq!(transport.open_count(), 2);
        // the replaced pump is gone, so its subscribers see the channel close
        assert!(first.has_changed().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reconnects_surface_lost_then_retry() {
        let (mut registry, transport) = registry(vec![
            ScriptedOpen::Fail(crate::transport::OpenError::Transient("down".into())),
            ScriptedOpen::Fail(crate::transport::OpenError::Transient("down".into())),
            ScriptedOpen::Fail(crate::transport::OpenError::Transient("down".into())),
            ScriptedOpen::Fail(crate::transport::OpenError::Transient("down".into())),
            ScriptedOpen::Fail(crate::transport::OpenError::Transient("down".into())),
            ScriptedOpen::Fail(crate::transport::OpenError::Transient("down".into())),
            ScriptedOpen::Deliver(vec![frame("ready", "{}")]),
        ]);
        let job = JobId::from("j5");
        let mut rx = registry.watch(job.clone(), JobKind::Research).unwrap();

        let snap = wait_for(&mut rx, |s| {
            matches!(s.issue.as_ref().map(|i| i.kind), Some(crate::tracker::IssueKind::Lost))
        })
        .await;
        assert_eq!(snap.connection, ConnectionState::Closed(CloseReason::Exhausted));
        assert!(!snap.state.is_terminal());
        assert_eq!(transport.open_count(), 6);

        assert!(registry.retry(&job));
        let snap = wait_for(&mut rx, |s| s.state.is_terminal()).await;
        assert!(matches!(snap.state, JobState::Ready(_)));
        assert!(snap.issue.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_raises_then_clears_interrupted_issue() {
        let transport = Arc::new(ScriptedTransport::new(vec![ScriptedOpen::DeliverAndHold(vec![
            frame("meta", r#"{"pct":12}"#),
        ])]));
        let mut registry = timed_registry(transport.clone());
        let job = JobId::from("j7");
        let mut rx = registry.watch(job.clone(), JobKind::Upload).unwrap();
        wait_for(&mut rx, |s| s.pct == 12.0).await;

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        let snap = registry.snapshot(&job).unwrap();
        assert_eq!(issue_kind(&snap), Some(IssueKind::Interrupted));
        assert_eq!(snap.connection, ConnectionState::Open);
        assert_eq!(snap.state, JobState::Processing { pct: 12.0 });

        // grace window ends at ~7s
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(issue_kind(&registry.snapshot(&job).unwrap()), Some(IssueKind::Interrupted));
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(issue_kind(&registry.snapshot(&job).unwrap()), None);

        // the next silence issue needs a full window after the clear
        tokio::time::sleep(Duration::from_millis(4_000)).await;
        assert_eq!(issue_kind(&registry.snapshot(&job).unwrap()), None);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(issue_kind(&registry.snapshot(&job).unwrap()), Some(IssueKind::Interrupted));
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_liveness_issue_clear() {
        let mut registry = timed_registry(Arc::new(HeartbeatTransport {
            every: Duration::from_secs(2),
        }));
        let job = JobId::from("j8");
        let mut rx = registry.watch(job.clone(), JobKind::Upload).unwrap();
        wait_for(&mut rx, |s| s.pct == 10.0).await;

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let snap = registry.snapshot(&job).unwrap();
            assert_eq!(issue_kind(&snap), None);
            assert_eq!(snap.connection, ConnectionState::Open);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_closes_stream_and_forgets_job() {
        let (mut registry, _transport) = registry(vec![ScriptedOpen::DeliverAndHold(vec![frame(
            "meta", "{}",
        )])]);
        let job = JobId::from("j6");
        let _rx = registry.watch(job.clone(), JobKind::Upload).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(registry.active_connections(), 1);

        assert!(registry.clear(&job));
        assert!(!registry.clear(&job));
        assert_eq!(registry.active_connections(), 0);
        assert!(registry.snapshot(&job).is_none());
    }
}
