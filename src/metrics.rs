//! Aggregated counters for the sync layer.
//!
//! Counts reconnects, retries, dropped frames and reconciliation decisions so the
//! noisy per-event logs can stay at debug level while a summary is still available.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::tracker::JobKind;
use crate::transcript::ReconcileOutcome;

/// Stream-side counters for one job kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamMetrics {
    pub streams_opened: u64,
    pub reconnects: u64,
    pub malformed_events: u64,
    pub connections_lost: u64,
    pub jobs_ready: u64,
    pub jobs_failed: u64,
}

/// Transcript-side counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptMetrics {
    pub fetches_applied: u64,
    pub fetches_rejected_streaming: u64,
    pub fetches_preserved_local: u64,
    pub sends_confirmed: u64,
    pub sends_failed: u64,
    pub request_retries: u64,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<JobKind, StreamMetrics>,
    transcript: TranscriptMetrics,
}

/// Shared metrics aggregator. Cheap to call from sync observers.
#[derive(Default)]
pub struct SyncMetrics {
    inner: Mutex<Inner>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn with_stream(&self, kind: JobKind, f: impl FnOnce(&mut StreamMetrics)) {
        let mut inner = self.lock();
        f(inner.streams.entry(kind).or_default());
    }

    pub fn record_stream_opened(&self, kind: JobKind) {
        self.with_stream(kind, |m| m.streams_opened += 1);
    }

    pub fn record_reconnect(&self, kind: JobKind) {
        self.with_stream(kind, |m| m.reconnects += 1);
    }

    pub fn record_malformed(&self, kind: JobKind) {
        self.with_stream(kind, |m| m.malformed_events += 1);
    }

    pub fn record_connection_lost(&self, kind: JobKind) {
        self.with_stream(kind, |m| m.connections_lost += 1);
    }

    pub fn record_terminal(&self, kind: JobKind, ready: bool) {
        self.with_stream(kind, |m| {
            if ready {
                m.jobs_ready += 1;
            } else {
                m.jobs_failed += 1;
            }
        });
    }

    pub fn record_reconcile(&self, outcome: ReconcileOutcome) {
        let mut inner = self.lock();
        match outcome {
            ReconcileOutcome::Replaced => inner.transcript.fetches_applied += 1,
            ReconcileOutcome::RejectedWhileStreaming => {
                inner.transcript.fetches_rejected_streaming += 1
            }
            ReconcileOutcome::PreservedLocal => inner.transcript.fetches_preserved_local += 1,
            _ => {}
        }
    }

    pub fn record_send(&self, confirmed: bool) {
        let mut inner = self.lock();
        if confirmed {
            inner.transcript.sends_confirmed += 1;
        } else {
            inner.transcript.sends_failed += 1;
        }
    }

    pub fn record_retry(&self) {
        self.lock().transcript.request_retries += 1;
    }

    pub fn stream(&self, kind: JobKind) -> StreamMetrics {
        self.lock().streams.get(&kind).cloned().unwrap_or_default()
    }

    pub fn transcript(&self) -> TranscriptMetrics {
        self.lock().transcript.clone()
    }

    pub fn log_summary(&self) {
        let inner = self.lock();
        if inner.streams.is_empty() && inner.transcript == TranscriptMetrics::default() {
            return;
        }

        tracing::info!("=== SYNC METRICS ===");
        for (kind, m) in inner.streams.iter() {
            tracing::info!(
                "Jobs {}: {} streams | {} reconnects | {} malformed | {} lost | {} ready | {} failed",
                kind,
                m.streams_opened,
                m.reconnects,
                m.malformed_events,
                m.connections_lost,
                m.jobs_ready,
                m.jobs_failed
            );
        }
        let t = &inner.transcript;
        tracing::info!(
            "Transcript: {} fetches applied | {} rejected (streaming) | {} preserved (local) | {} sent | {} send failures | {} retries",
            t.fetches_applied,
            t.fetches_rejected_streaming,
            t.fetches_preserved_local,
            t.sends_confirmed,
            t.sends_failed,
            t.request_retries
        );
        tracing::info!("====================");
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.streams.clear();
        inner.transcript = TranscriptMetrics::default();
    }
}
