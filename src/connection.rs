//! Reconnecting event-stream client for one job.
//!
//! `ReconnectMachine` is the pure state machine; `StreamConnection` drives it with a
//! spawned task and reports everything over a typed `ConnectionEvent` channel.

use futures_util::StreamExt;
use reqwest::StatusCode;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::backoff::BackoffPolicy;
use crate::config::ConnectionConfig;
use crate::events::{parse_frame, ParsedFrame, StreamEvent};
use crate::transport::{events_url, EventTransport, OpenError, OpenRequest};
use crate::types::{JobId, Result, TraceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the caller.
    Manual,
    /// The job reached `ready` or `failed`.
    Terminal,
    /// Reconnect budget used up.
    Exhausted,
    /// Server refused the stream with a non-retryable status.
    Rejected(StatusCode),
    /// Neither the primary nor the legacy endpoint exists.
    NotFound,
    /// Disconnected while reconnection is turned off.
    ReconnectDisabled,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Manual => write!(f, "closed"),
            CloseReason::Terminal => write!(f, "job finished"),
            CloseReason::Exhausted => write!(f, "reconnect attempts exhausted"),
            CloseReason::Rejected(status) => write!(f, "rejected by server ({})", status),
            CloseReason::NotFound => write!(f, "event endpoint not found"),
            CloseReason::ReconnectDisabled => write!(f, "disconnected (reconnect disabled)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting { attempt: u32, next_delay: Duration },
    Closed(CloseReason),
}

impl ConnectionState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Reconnecting { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// Network error, stream error or server-initiated close.
    Transport(String),
    NotFound(StatusCode),
    Rejected(StatusCode),
}

impl From<OpenError> for Disconnect {
    fn from(e: OpenError) -> Self {
        match e {
            OpenError::NotFound(status) => Disconnect::NotFound(status),
            OpenError::Rejected(status, _) => Disconnect::Rejected(status),
            OpenError::Transient(msg) => Disconnect::Transport(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Reconnect { attempt: u32, delay: Duration },
    UseFallback { attempt: u32 },
    Close(CloseReason),
}

/// Transition rules of one stream connection, free of I/O and timers.
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    state: ConnectionState,
    attempts: u32,
    max_attempts: u32,
    reconnect: bool,
    backoff: BackoffPolicy,
    manual_close: bool,
    ever_opened: bool,
    has_fallback: bool,
    fallback_used: bool,
}

impl ReconnectMachine {
    pub fn new(max_attempts: u32, reconnect: bool, backoff: BackoffPolicy, has_fallback: bool) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempts: 0,
            max_attempts,
            reconnect,
            backoff,
            manual_close: false,
            ever_opened: false,
            has_fallback,
            fallback_used: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_manually_closed(&self) -> bool {
        self.manual_close
    }

    pub fn fallback_used(&self) -> bool {
        self.fallback_used
    }

    /// Returns false when a connection is already open or in progress.
    pub fn begin_connect(&mut self) -> bool {
        if self.state.is_active() {
            return false;
        }
        self.manual_close = false;
        self.attempts = 0;
        self.state = ConnectionState::Connecting;
        true
    }

    pub fn on_open(&mut self) {
        if self.manual_close {
            return;
        }
        self.attempts = 0;
        self.ever_opened = true;
        self.state = ConnectionState::Open;
    }

    pub fn on_terminal(&mut self) {
        if self.manual_close {
            return;
        }
        self.state = ConnectionState::Closed(CloseReason::Terminal);
    }

    pub fn on_disconnect(&mut self, cause: Disconnect) -> Decision {
        if self.manual_close {
            return Decision::Close(CloseReason::Manual);
        }

        let decision = match cause {
            Disconnect::NotFound(_) if !self.ever_opened && self.has_fallback && !self.fallback_used => {
                self.fallback_used = true;
                self.attempts += 1;
                if self.attempts > self.max_attempts {
                    Decision::Close(CloseReason::Exhausted)
                } else {
                    Decision::UseFallback {
                        attempt: self.attempts,
                    }
                }
            }
            Disconnect::NotFound(_) => Decision::Close(CloseReason::NotFound),
            Disconnect::Rejected(status) => Decision::Close(CloseReason::Rejected(status)),
            Disconnect::Transport(_) if !self.reconnect => {
                Decision::Close(CloseReason::ReconnectDisabled)
            }
            Disconnect::Transport(_) if self.attempts >= self.max_attempts => {
                Decision::Close(CloseReason::Exhausted)
            }
            Disconnect::Transport(_) => {
                self.attempts += 1;
                Decision::Reconnect {
                    attempt: self.attempts,
                    delay: self.backoff.compute_delay(self.attempts),
                }
            }
        };

        self.state = match decision {
            Decision::Reconnect { attempt, delay } => ConnectionState::Reconnecting {
                attempt,
                next_delay: delay,
            },
            Decision::UseFallback { .. } => ConnectionState::Connecting,
            Decision::Close(reason) => ConnectionState::Closed(reason),
        };
        decision
    }

    pub fn on_reconnect_due(&mut self) {
        if self.manual_close {
            return;
        }
        if matches!(self.state, ConnectionState::Reconnecting { .. }) {
            self.state = ConnectionState::Connecting;
        }
    }

    /// Returns false if the connection was already closed, by the caller or otherwise.
    /// A connection that closed itself keeps its original reason.
    pub fn close(&mut self) -> bool {
        if self.manual_close {
            return false;
        }
        self.manual_close = true;
        if matches!(self.state, ConnectionState::Closed(_)) {
            return false;
        }
        self.state = ConnectionState::Closed(CloseReason::Manual);
        true
    }
}

/// Everything a subscriber learns about one connection, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Opened,
    Event(StreamEvent),
    /// A frame that could not be decoded; the connection stays up.
    Malformed { event_type: String, reason: String },
    /// Transport-level error; a reconnect decision follows.
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    Closed(CloseReason),
}

struct Shared {
    job_id: JobId,
    trace_id: TraceId,
    machine: Mutex<ReconnectMachine>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    transport: Arc<dyn EventTransport>,
    primary_url: String,
    fallback_url: Option<String>,
}

impl Shared {
    fn machine(&self) -> MutexGuard<'_, ReconnectMachine> {
        match self.machine.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Applies `f` under the lock, publishes the new state and emits `event` unless
    /// the caller closed the connection in the meantime.
    fn transition<T>(
        &self,
        f: impl FnOnce(&mut ReconnectMachine) -> T,
        event: impl FnOnce(&T) -> Option<ConnectionEvent>,
    ) -> Option<T> {
        let mut machine = self.machine();
        if machine.is_manually_closed() {
            return None;
        }
        let out = f(&mut machine);
        self.state_tx.send_replace(machine.state());
        if let Some(ev) = event(&out) {
            self.emit(ev);
        }
        Some(out)
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events_tx.send(event).is_err() {
            tracing::trace!("Connection subscriber dropped for job {}", self.job_id.short());
        }
    }
}

pub struct StreamConnection {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl StreamConnection {
    /// Builds a connection for one job. Events are delivered on the returned receiver.
    pub fn new(
        job_id: JobId,
        config: &ConnectionConfig,
        transport: Arc<dyn EventTransport>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        let primary_url = events_url(&config.base_url, &config.events_path, &job_id, &config.trace_id)?;
        let fallback_url = match &config.legacy_events_path {
            Some(path) => Some(events_url(&config.base_url, path, &job_id, &config.trace_id)?),
            None => None,
        };
        let machine = ReconnectMachine::new(
            config.max_reconnect_attempts,
            config.reconnect,
            config.backoff,
            fallback_url.is_some(),
        );
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            job_id,
            trace_id: config.trace_id.clone(),
            machine: Mutex::new(machine),
            state_tx,
            events_tx,
            transport,
            primary_url,
            fallback_url,
        });
        Ok((Self { shared, task: None }, events_rx))
    }

    pub fn job_id(&self) -> &JobId {
        &self.shared.job_id
    }

    /// Opens the stream. No-op while a connection is open or in progress.
    pub fn connect(&mut self) {
        let started = self.shared.machine().begin_connect();
        if !started {
            tracing::debug!(
                "connect() ignored for job {}: already {:?}",
                self.shared.job_id.short(),
                self.ready_state()
            );
            return;
        }
        self.shared.state_tx.send_replace(ConnectionState::Connecting);

        let shared = self.shared.clone();
        let span = tracing::info_span!(
            "job_stream",
            job_id = %shared.job_id.short(),
            trace_id = %shared.trace_id,
        );
        self.task = Some(tokio::spawn(drive(shared).instrument(span)));
    }

    /// Releases the transport and cancels any pending reconnect. Safe to call from
    /// teardown paths; calling it twice is a no-op.
    pub fn close(&mut self) {
        let changed = self.shared.machine().close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if changed {
            self.shared
                .state_tx
                .send_replace(ConnectionState::Closed(CloseReason::Manual));
            self.shared.emit(ConnectionEvent::Closed(CloseReason::Manual));
            tracing::debug!("Closed stream for job {}", self.shared.job_id.short());
        }
    }

    pub fn ready_state(&self) -> ConnectionState {
        self.shared.machine().state()
    }

    pub fn is_connected(&self) -> bool {
        self.ready_state() == ConnectionState::Open
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.machine().attempts()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn drive(shared: Arc<Shared>) {
    let mut url = shared.primary_url.clone();
    let mut last_event_id: Option<String> = None;

    loop {
        tracing::debug!("[SSE] Opening {}", url);
        let request = OpenRequest {
            url: url.clone(),
            last_event_id: last_event_id.clone(),
        };

        let cause = match shared.transport.open(&request).await {
            Err(e) => {
                tracing::warn!("[SSE] Failed to open stream: {}", e);
                Disconnect::from(e)
            }
            Ok(mut frames) => {
                if shared
                    .transition(|m| m.on_open(), |_| Some(ConnectionEvent::Opened))
                    .is_none()
                {
                    return;
                }
                tracing::info!("[SSE] Stream open");

                loop {
                    match frames.next().await {
                        Some(Ok(frame)) => {
                            // Malformed frames still advance the replay position.
                            if frame.id.is_some() {
                                last_event_id = frame.id.clone();
                            }
                            match parse_frame(&frame, &shared.job_id) {
                                ParsedFrame::Event(event) => {
                                    if shared.machine().is_manually_closed() {
                                        return;
                                    }
                                    let terminal = event.is_terminal();
                                    shared.emit(ConnectionEvent::Event(event));
                                    if terminal {
                                        shared.transition(
                                            |m| m.on_terminal(),
                                            |_| Some(ConnectionEvent::Closed(CloseReason::Terminal)),
                                        );
                                        tracing::info!("[SSE] Terminal event received, closing stream");
                                        return;
                                    }
                                }
                                ParsedFrame::Malformed { event_type, reason } => {
                                    tracing::warn!(
                                        "[SSE] Ignoring malformed '{}' event: {}",
                                        event_type,
                                        reason
                                    );
                                    shared.emit(ConnectionEvent::Malformed { event_type, reason });
                                }
                            }
                        }
                        Some(Err(e)) => break Disconnect::Transport(e.to_string()),
                        None => break Disconnect::Transport("server closed the stream".to_string()),
                    }
                }
            }
        };

        if let Disconnect::Transport(reason) = &cause {
            shared.emit(ConnectionEvent::Disconnected {
                reason: reason.clone(),
            });
        }

        let decision = match shared.transition(
            |m| m.on_disconnect(cause),
            |d| match d {
                Decision::Reconnect { attempt, delay } => Some(ConnectionEvent::Reconnecting {
                    attempt: *attempt,
                    delay: *delay,
                }),
                Decision::UseFallback { .. } => None,
                Decision::Close(reason) => Some(ConnectionEvent::Closed(*reason)),
            },
        ) {
            Some(decision) => decision,
            None => return,
        };

        match decision {
            Decision::Reconnect { attempt, delay } => {
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "[SSE] Reconnecting in {:?} (attempt {})",
                    delay,
                    attempt
                );
                tokio::time::sleep(delay).await;
                if shared.transition(|m| m.on_reconnect_due(), |_| None).is_none() {
                    return;
                }
            }
            Decision::UseFallback { attempt } => match &shared.fallback_url {
                Some(fallback) => {
                    tracing::warn!(
                        attempt,
                        "[SSE] Primary endpoint not found, falling back to {}",
                        fallback
                    );
                    url = fallback.clone();
                }
                None => return,
            },
            Decision::Close(reason) => {
                tracing::error!("[SSE] Stream closed: {}", reason);
                return;
            }
        }
    }
}
