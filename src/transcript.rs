//! Transcript reconciliation.
//!
//! Three sources feed a conversation's transcript in any order: server history
//! fetches, local optimistic sends, and the assistant's streaming pipeline.
//! [`ChatTranscriptReconciler::apply`] is the only way to mutate it, and it keeps two
//! invariants: ids are unique, and no fetch replaces the transcript while a message
//! is still streaming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

use crate::types::{ConversationId, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Streaming,
    #[default]
    Delivered,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ChatMessage {
    /// Confirmed message as the server returns it.
    pub fn delivered(id: impl Into<MessageId>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            status: MessageStatus::Delivered,
            timestamp: Utc::now(),
            is_streaming: false,
            metadata: Map::new(),
        }
    }

    /// Local user message awaiting server confirmation, under a temporary id.
    pub fn optimistic(content: impl Into<String>) -> Self {
        Self {
            status: MessageStatus::Sending,
            ..Self::delivered(MessageId::temporary(), Role::User, content)
        }
    }

    /// Empty assistant message that the streaming pipeline fills in.
    pub fn streaming(id: impl Into<MessageId>) -> Self {
        Self {
            status: MessageStatus::Streaming,
            is_streaming: true,
            ..Self::delivered(id, Role::Assistant, String::new())
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.metadata.get("error").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptUpdate {
    /// Result of a history fetch, whenever it resolves.
    ServerFetch(Vec<ChatMessage>),
    /// Optimistic append for a message the user just sent.
    LocalSend(ChatMessage),
    /// A failed optimistic message is being sent again.
    Resend { temp_id: MessageId },
    SendAcknowledged {
        temp_id: MessageId,
        confirmed: ChatMessage,
    },
    /// Delivery of an optimistic message gave up. Carries the message itself so it can
    /// be restored if a fetch replaced the transcript while the send was in flight.
    SendFailed { message: ChatMessage, error: String },
    StreamStarted(ChatMessage),
    StreamDelta { id: MessageId, delta: String },
    StreamFinished {
        id: MessageId,
        final_id: Option<MessageId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A non-empty fetch replaced the transcript.
    Replaced,
    /// An empty fetch confirmed an empty conversation.
    AcceptedEmpty,
    /// An empty fetch arrived while local messages exist; they were kept.
    PreservedLocal,
    /// A fetch arrived while a message was streaming and was discarded.
    RejectedWhileStreaming,
    Appended,
    Updated,
    /// Refers to a message that is not in the transcript, or duplicates one that is.
    Ignored,
}

#[derive(Debug, Clone, Default)]
pub struct ChatTranscriptReconciler {
    messages: Vec<ChatMessage>,
}

impl ChatTranscriptReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn has_active_stream(&self) -> bool {
        self.messages.iter().any(|m| m.is_streaming)
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    pub fn apply(&mut self, update: TranscriptUpdate) -> ReconcileOutcome {
        match update {
            TranscriptUpdate::ServerFetch(fetched) => self.apply_fetch(fetched),
            TranscriptUpdate::LocalSend(mut message) => {
                if self.position(&message.id).is_some() {
                    return ReconcileOutcome::Ignored;
                }
                message.status = MessageStatus::Sending;
                message.is_streaming = false;
                self.messages.push(message);
                ReconcileOutcome::Appended
            }
            TranscriptUpdate::Resend { temp_id } => match self.position(&temp_id) {
                Some(idx) if self.messages[idx].status == MessageStatus::Error => {
                    let message = &mut self.messages[idx];
                    message.status = MessageStatus::Sending;
                    message.metadata.remove("error");
                    ReconcileOutcome::Updated
                }
                _ => ReconcileOutcome::Ignored,
            },
            TranscriptUpdate::SendAcknowledged { temp_id, confirmed } => {
                self.acknowledge(temp_id, confirmed)
            }
            TranscriptUpdate::SendFailed { message, error } => self.fail_send(message, error),
            TranscriptUpdate::StreamStarted(mut message) => {
                message.is_streaming = true;
                message.status = MessageStatus::Streaming;
                match self.position(&message.id) {
                    Some(idx) if self.messages[idx].is_streaming => {
                        self.messages[idx] = message;
                        ReconcileOutcome::Updated
                    }
                    Some(_) => {
                        tracing::debug!("Not restarting stream over settled message {}", message.id);
                        ReconcileOutcome::Ignored
                    }
                    None => {
                        self.messages.push(message);
                        ReconcileOutcome::Appended
                    }
                }
            }
            TranscriptUpdate::StreamDelta { id, delta } => match self.position(&id) {
                Some(idx) if self.messages[idx].is_streaming => {
                    self.messages[idx].content.push_str(&delta);
                    ReconcileOutcome::Updated
                }
                _ => {
                    tracing::debug!("Dropping delta for {}: not streaming", id);
                    ReconcileOutcome::Ignored
                }
            },
            TranscriptUpdate::StreamFinished { id, final_id } => self.finish_stream(id, final_id),
        }
    }

    fn apply_fetch(&mut self, fetched: Vec<ChatMessage>) -> ReconcileOutcome {
        if self.has_active_stream() {
            tracing::debug!(
                "Discarding fetch of {} message(s): a response is still streaming",
                fetched.len()
            );
            return ReconcileOutcome::RejectedWhileStreaming;
        }
        if fetched.is_empty() {
            if self.messages.is_empty() {
                return ReconcileOutcome::AcceptedEmpty;
            }
            tracing::debug!(
                "Empty fetch ignored, keeping {} local message(s)",
                self.messages.len()
            );
            return ReconcileOutcome::PreservedLocal;
        }

        let mut seen = HashSet::with_capacity(fetched.len());
        let mut deduped: Vec<ChatMessage> = Vec::with_capacity(fetched.len());
        for message in fetched {
            if seen.insert(message.id.clone()) {
                deduped.push(message);
            } else if let Some(existing) = deduped.iter_mut().find(|m| m.id == message.id) {
                // later copy wins, first position is kept
                *existing = message;
            }
        }
        self.messages = deduped;
        ReconcileOutcome::Replaced
    }

    fn acknowledge(&mut self, temp_id: MessageId, mut confirmed: ChatMessage) -> ReconcileOutcome {
        confirmed.is_streaming = false;
        if confirmed.status == MessageStatus::Sending {
            confirmed.status = MessageStatus::Delivered;
        }

        let temp_idx = self.position(&temp_id);
        let confirmed_idx = self.position(&confirmed.id);
        match (temp_idx, confirmed_idx) {
            (Some(idx), None) => {
                self.messages[idx] = confirmed;
                ReconcileOutcome::Updated
            }
            (Some(idx), Some(existing)) if idx == existing => {
                self.messages[idx] = confirmed;
                ReconcileOutcome::Updated
            }
            (Some(idx), Some(_)) => {
                // the confirmed copy already arrived through a fetch
                self.messages.remove(idx);
                ReconcileOutcome::Updated
            }
            (None, Some(_)) => ReconcileOutcome::Ignored,
            (None, None) => {
                self.messages.push(confirmed);
                ReconcileOutcome::Appended
            }
        }
    }

    fn fail_send(&mut self, mut failed: ChatMessage, error: String) -> ReconcileOutcome {
        let (message, outcome) = match self.position(&failed.id) {
            Some(idx) => (&mut self.messages[idx], ReconcileOutcome::Updated),
            None => {
                tracing::debug!("Restoring failed message {} dropped by a fetch", failed.id);
                failed.metadata.remove("error");
                self.messages.push(failed);
                let last = self.messages.len() - 1;
                (&mut self.messages[last], ReconcileOutcome::Appended)
            }
        };
        message.status = MessageStatus::Error;
        message.is_streaming = false;
        message.metadata.insert("error".to_string(), Value::String(error));
        outcome
    }

    fn finish_stream(&mut self, id: MessageId, final_id: Option<MessageId>) -> ReconcileOutcome {
        let mut idx = match self.position(&id) {
            Some(idx) => idx,
            None => return ReconcileOutcome::Ignored,
        };
        if let Some(final_id) = final_id.filter(|f| *f != id) {
            if let Some(other) = self.position(&final_id) {
                self.messages.remove(other);
                if other < idx {
                    idx -= 1;
                }
            }
            self.messages[idx].id = final_id;
        }
        let message = &mut self.messages[idx];
        message.is_streaming = false;
        message.status = MessageStatus::Delivered;
        ReconcileOutcome::Updated
    }
}

/// One reconciler per conversation, so a late fetch for one conversation can never
/// touch another's transcript.
#[derive(Debug, Default)]
pub struct TranscriptStore {
    conversations: HashMap<ConversationId, ChatTranscriptReconciler>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, conversation_id: &ConversationId, update: TranscriptUpdate) -> ReconcileOutcome {
        let outcome = self
            .conversations
            .entry(conversation_id.clone())
            .or_default()
            .apply(update);
        tracing::trace!(
            conversation_id = %conversation_id.short(),
            "Transcript update: {:?}",
            outcome
        );
        outcome
    }

    pub fn transcript(&self, conversation_id: &ConversationId) -> Option<&ChatTranscriptReconciler> {
        self.conversations.get(conversation_id)
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<ChatMessage> {
        self.conversations
            .get(conversation_id)
            .map(|t| t.messages().to_vec())
            .unwrap_or_default()
    }

    pub fn remove(&mut self, conversation_id: &ConversationId) -> Option<ChatTranscriptReconciler> {
        self.conversations.remove(conversation_id)
    }

    pub fn conversations(&self) -> impl Iterator<Item = &ConversationId> {
        self.conversations.keys()
    }
}
