use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::backoff::Debouncer;
use crate::metrics::SyncMetrics;
use crate::retry::{RetryExecutor, RetryOptions};
use crate::transcript::{ChatMessage, MessageStatus, ReconcileOutcome, TranscriptStore, TranscriptUpdate};
use crate::types::{ConversationId, MessageId, ObservedError, Result, SyncError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Temporary id of the optimistic entry, echoed back so duplicates can be detected.
    pub client_id: MessageId,
    pub content: String,
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_history(&self, conversation_id: &ConversationId) -> Result<Vec<ChatMessage>>;

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        request: &SendRequest,
    ) -> Result<ChatMessage>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryBody {
    Wrapped { messages: Vec<ChatMessage> },
    Bare(Vec<ChatMessage>),
}

pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpChatApi {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
        }
    }

    fn messages_url(&self, conversation_id: &ConversationId) -> String {
        format!("{}/conversations/{}/messages", self.base_url, conversation_id)
    }
}

async fn read_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = match response.text().await {
        Ok(text) => text,
        Err(_) => "Unknown error".to_string(),
    };
    Err(SyncError::Upstream(status, body).into())
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_history(&self, conversation_id: &ConversationId) -> Result<Vec<ChatMessage>> {
        let response = self
            .client
            .get(self.messages_url(conversation_id))
            .timeout(self.request_timeout)
            .send()
            .await?;
        let body: HistoryBody = read_success(response).await?.json().await?;
        Ok(match body {
            HistoryBody::Wrapped { messages } => messages,
            HistoryBody::Bare(messages) => messages,
        })
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        request: &SendRequest,
    ) -> Result<ChatMessage> {
        let response = self
            .client
            .post(self.messages_url(conversation_id))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await?;
        Ok(read_success(response).await?.json().await?)
    }
}

/// Send and refresh pipeline for one conversation. All transcript changes go through
/// the shared [`TranscriptStore`].
pub struct ChatSession {
    conversation_id: ConversationId,
    api: Arc<dyn ChatApi>,
    store: Arc<Mutex<TranscriptStore>>,
    retry: RetryExecutor,
    metrics: Arc<SyncMetrics>,
}

impl ChatSession {
    pub fn new(
        conversation_id: ConversationId,
        api: Arc<dyn ChatApi>,
        store: Arc<Mutex<TranscriptStore>>,
        options: RetryOptions,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        let counter = metrics.clone();
        let inner = options.on_retry.clone();
        let options = options.with_observer(move |err: &ObservedError, attempt: u32, delay: Duration| {
            counter.record_retry();
            if let Some(observer) = &inner {
                observer(err, attempt, delay);
            }
        });
        Self {
            conversation_id,
            api,
            store,
            retry: RetryExecutor::new(options),
            metrics,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    fn store(&self) -> MutexGuard<'_, TranscriptStore> {
        match self.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Single entry point for transcript changes, including the assistant's
    /// streaming pipeline.
    pub fn apply(&self, update: TranscriptUpdate) -> ReconcileOutcome {
        let outcome = self.store().apply(&self.conversation_id, update);
        self.metrics.record_reconcile(outcome);
        outcome
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.store().messages(&self.conversation_id)
    }

    /// Appends an optimistic message and delivers it. On failure the message stays in
    /// the transcript with status `Error` so the user can resend it.
    pub async fn send(&self, content: impl Into<String>) -> Result<MessageId> {
        let message = ChatMessage::optimistic(content);
        self.apply(TranscriptUpdate::LocalSend(message.clone()));
        self.deliver(message).await
    }

    /// Resends a failed optimistic message in place.
    pub async fn retry(&self, temp_id: &MessageId) -> Result<MessageId> {
        let message = {
            let store = self.store();
            match store.transcript(&self.conversation_id).and_then(|t| t.get(temp_id)) {
                Some(message) if message.status == MessageStatus::Error => message.clone(),
                _ => return Err(SyncError::NothingToResend(temp_id.clone()).into()),
            }
        };
        self.apply(TranscriptUpdate::Resend {
            temp_id: temp_id.clone(),
        });
        self.deliver(message).await
    }

    async fn deliver(&self, message: ChatMessage) -> Result<MessageId> {
        let temp_id = message.id.clone();
        let request = SendRequest {
            client_id: temp_id.clone(),
            content: message.content.clone(),
        };
        let api = self.api.clone();
        let conversation_id = self.conversation_id.clone();

        let span = tracing::info_span!("send_message", conversation_id = %conversation_id.short());
        let sent = self
            .retry
            .run(|| {
                let api = api.clone();
                let conversation_id = conversation_id.clone();
                let request = request.clone();
                async move { api.send_message(&conversation_id, &request).await }
            })
            .instrument(span)
            .await;

        match sent {
            Ok(confirmed) => {
                let id = confirmed.id.clone();
                self.apply(TranscriptUpdate::SendAcknowledged { temp_id, confirmed });
                self.metrics.record_send(true);
                Ok(id)
            }
            Err(e) => {
                tracing::warn!(
                    conversation_id = %self.conversation_id.short(),
                    "Send failed, keeping {} for resend: {}",
                    temp_id,
                    e.inner
                );
                self.apply(TranscriptUpdate::SendFailed {
                    message,
                    error: e.inner.to_string(),
                });
                self.metrics.record_send(false);
                Err(e)
            }
        }
    }

    /// Fetches history and hands it to the reconciler, which may discard it.
    pub async fn refresh(&self) -> Result<ReconcileOutcome> {
        let api = self.api.clone();
        let conversation_id = self.conversation_id.clone();
        let history = self
            .retry
            .run(|| {
                let api = api.clone();
                let conversation_id = conversation_id.clone();
                async move { api.fetch_history(&conversation_id).await }
            })
            .await?;
        Ok(self.apply(TranscriptUpdate::ServerFetch(history)))
    }

    /// Starts a task that coalesces bursts of refresh requests into single fetches.
    pub fn spawn_refresher(self: &Arc<Self>, debouncer: Debouncer) -> RefreshHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let span = tracing::info_span!("refresher", conversation_id = %self.conversation_id.short());
        let task = tokio::spawn(refresh_loop(self.clone(), debouncer, rx).instrument(span));
        RefreshHandle { tx, task }
    }
}

pub struct RefreshHandle {
    tx: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl RefreshHandle {
    /// Returns false once the refresher has stopped.
    pub fn request(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn refresh_loop(
    session: Arc<ChatSession>,
    mut debouncer: Debouncer,
    mut rx: mpsc::UnboundedReceiver<()>,
) {
    while rx.recv().await.is_some() {
        let now = Instant::now();
        let mut deadline = now + debouncer.call(now);
        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(()) => {
                        let now = Instant::now();
                        deadline = now + debouncer.call(now);
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        debouncer.fire();
        match session.refresh().await {
            Ok(outcome) => tracing::debug!("Refresh applied: {:?}", outcome),
            Err(e) => tracing::warn!("Refresh failed: {}", e.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::transcript::Role;
    use reqwest::StatusCode;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeApi {
        history: Mutex<VecDeque<Result<Vec<ChatMessage>>>>,
        sends: Mutex<VecDeque<Result<ChatMessage>>>,
        fetch_calls: AtomicU32,
        send_calls: AtomicU32,
    }

    impl FakeApi {
        fn with_sends(sends: Vec<Result<ChatMessage>>) -> Self {
            Self {
                sends: Mutex::new(sends.into()),
                ..Self::default()
            }
        }

        fn with_history(history: Vec<Result<Vec<ChatMessage>>>) -> Self {
            Self {
                history: Mutex::new(history.into()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ChatApi for FakeApi {
        async fn fetch_history(&self, _conversation_id: &ConversationId) -> Result<Vec<ChatMessage>> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            self.history
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn send_message(
            &self,
            _conversation_id: &ConversationId,
            request: &SendRequest,
        ) -> Result<ChatMessage> {
            self.send_calls.fetch_add(1, Ordering::SeqCst);
            match self.sends.lock().unwrap().pop_front() {
                Some(result) => result,
                None => Ok(ChatMessage::delivered("srv-default", Role::User, request.content.clone())),
            }
        }
    }

    fn unavailable() -> ObservedError {
        SyncError::Upstream(StatusCode::SERVICE_UNAVAILABLE, "busy".into()).into()
    }

    fn session(api: Arc<FakeApi>, max_retries: u32) -> (Arc<ChatSession>, Arc<SyncMetrics>) {
        let metrics = Arc::new(SyncMetrics::new());
        let session = ChatSession::new(
            ConversationId::from("conv-1"),
            api,
            Arc::new(Mutex::new(TranscriptStore::new())),
            RetryOptions::new(max_retries, BackoffPolicy::from_millis(10, 100)),
            metrics.clone(),
        );
        (Arc::new(session), metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_replaces_optimistic_entry() {
        let api = Arc::new(FakeApi::with_sends(vec![Ok(ChatMessage::delivered(
            "srv-1",
            Role::User,
            "hi",
        ))]));
        let (session, metrics) = session(api, 3);

        let id = session.send("hi").await.unwrap();
        assert_eq!(id, MessageId::from("srv-1"));
        let messages = session.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, id);
        assert_eq!(messages[0].status, MessageStatus::Delivered);
        assert_eq!(metrics.transcript().sends_confirmed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_send_failures_are_retried() {
        let api = Arc::new(FakeApi::with_sends(vec![
            Err(unavailable()),
            Err(unavailable()),
            Ok(ChatMessage::delivered("srv-2", Role::User, "again")),
        ]));
        let (session, metrics) = session(api.clone(), 3);

        session.send("again").await.unwrap();
        assert_eq!(api.send_calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.transcript().request_retries, 2);
        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_send_keeps_message_for_resend() {
        let api = Arc::new(FakeApi::with_sends(vec![
            Err(SyncError::Upstream(StatusCode::BAD_REQUEST, "too long".into()).into()),
            Ok(ChatMessage::delivered("srv-3", Role::User, "hello")),
        ]));
        let (session, metrics) = session(api.clone(), 3);

        assert!(session.send("hello").await.is_err());
        assert_eq!(api.send_calls.load(Ordering::SeqCst), 1);
        let failed = session.messages()[0].clone();
        assert_eq!(failed.status, MessageStatus::Error);
        assert!(failed.error().unwrap_or_default().contains("too long"));
        assert_eq!(metrics.transcript().sends_failed, 1);

        let id = session.retry(&failed.id).await.unwrap();
        let messages = session.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, id);
        assert_eq!(messages[0].status, MessageStatus::Delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_survives_fetch_that_landed_mid_flight() {
        let api = Arc::new(FakeApi {
            history: Mutex::new(
                vec![Ok(vec![ChatMessage::delivered("m1", Role::Assistant, "welcome")])].into(),
            ),
            sends: Mutex::new(
                vec![
                    Err(unavailable()),
                    Err(SyncError::Upstream(StatusCode::BAD_REQUEST, "rejected".into()).into()),
                ]
                .into(),
            ),
            ..FakeApi::default()
        });
        let (session, _) = session(api.clone(), 3);

        let sending = tokio::spawn({
            let session = session.clone();
            async move { session.send("hello?").await }
        });
        // first attempt has failed and the send is backing off
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.refresh().await.unwrap(), ReconcileOutcome::Replaced);
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.messages()[0].id, MessageId::from("m1"));

        assert!(sending.await.unwrap().is_err());
        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "hello?");
        assert_eq!(messages[1].status, MessageStatus::Error);

        let id = session.retry(&messages[1].id).await.unwrap();
        assert_eq!(id, MessageId::from("srv-default"));
        assert_eq!(session.messages()[1].status, MessageStatus::Delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_unknown_message_is_an_error() {
        let (session, _) = session(Arc::new(FakeApi::default()), 0);
        match session.retry(&MessageId::from("tmp-missing")).await {
            Err(e) => assert!(matches!(e.inner, SyncError::NothingToResend(_))),
            Ok(_) => panic!("Expected NothingToResend"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_is_discarded_while_streaming() {
        let api = Arc::new(FakeApi::with_history(vec![Ok(vec![ChatMessage::delivered(
            "m1",
            Role::User,
            "stale",
        )])]));
        let (session, metrics) = session(api, 0);
        session.apply(TranscriptUpdate::StreamStarted(ChatMessage::streaming("a1")));

        let outcome = session.refresh().await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::RejectedWhileStreaming);
        assert_eq!(session.messages()[0].id, MessageId::from("a1"));
        assert_eq!(metrics.transcript().fetches_rejected_streaming, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresher_coalesces_bursts() {
        let api = Arc::new(FakeApi::default());
        let (session, _) = session(api.clone(), 0);
        let refresher = session.spawn_refresher(
            Debouncer::new(Duration::from_millis(200)).with_max_wait(Duration::from_secs(1)),
        );

        for _ in 0..5 {
            assert!(refresher.request());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 1);

        assert!(refresher.request());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresher_max_wait_forces_fetch_during_long_burst() {
        let api = Arc::new(FakeApi::default());
        let (session, _) = session(api.clone(), 0);
        let refresher = session.spawn_refresher(
            Debouncer::new(Duration::from_millis(200)).with_max_wait(Duration::from_millis(500)),
        );

        for _ in 0..8 {
            refresher.request();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(api.fetch_calls.load(Ordering::SeqCst) >= 1);
    }
}
