//! Conversation timeline.
//!
//! An append-ordered list of messages with two rules:
//!
//! - a message carrying a dedupe key replaces any earlier message with the
//!   same key (the replacement lands at the end, never in the old slot);
//! - appending a non-transient message first evicts every transient status
//!   marker.
//!
//! Mutations are published as [`TimelineEvent`]s so front ends can render
//! incrementally without diffing snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::backend::ScanType;

const EVENT_CAPACITY: usize = 256;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }
}

/// Rendered summary of an account, or an error-flavored stub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AccountDetails {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub is_wallet: bool,
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// UTC, e.g. `Tue, 14 Nov 2023 22:13:20`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
    /// Whole coins with two decimals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<String>,
    #[serde(default)]
    pub is_scam: bool,
    #[serde(default)]
    pub error: bool,
}

/// Renderable message payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: String },
    AccountDetails(AccountDetails),
    ScanTypePrompt {
        address: String,
        options: Vec<ScanType>,
    },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// One entry in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
    /// Status marker; evicted by the next substantive message, never persisted.
    #[serde(default)]
    pub transient: bool,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub accumulated_text: String,
    #[serde(default)]
    pub accumulated_reasoning: String,
    #[serde(default)]
    pub analyzing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Suppresses feedback and copy actions.
    #[serde(default)]
    pub system: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: MessageContent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            created_at: Utc::now(),
            transient: false,
            streaming: false,
            accumulated_text: String::new(),
            accumulated_reasoning: String::new(),
            analyzing: false,
            trace_id: None,
            system: false,
            dedupe_key: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, MessageContent::text(text))
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self::new(Role::Agent, MessageContent::text(text))
    }

    /// Empty agent message that frames of a token stream are written into.
    pub fn streaming_placeholder() -> Self {
        Self {
            streaming: true,
            ..Self::agent("")
        }
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self.system = true;
        self
    }

    pub fn system(mut self) -> Self {
        self.system = true;
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Plain text of the message; the live text while streaming.
    pub fn text(&self) -> Option<&str> {
        if self.streaming {
            return Some(&self.accumulated_text);
        }
        self.content.as_text()
    }
}

/// Change notification for subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEvent {
    Appended(Message),
    Updated(Message),
    Removed { id: String },
    Cleared,
}

/// Ordered conversation messages.
#[derive(Debug)]
pub struct Timeline {
    messages: Vec<Message>,
    events: broadcast::Sender<TimelineEvent>,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Timeline {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            messages: Vec::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimelineEvent> {
        self.events.subscribe()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn find_by_dedupe_key(&self, key: &str) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| m.dedupe_key.as_deref() == Some(key))
    }

    /// Append `message`, replacing any message with the same dedupe key and
    /// evicting transient markers when `message` is substantive.
    pub fn upsert(&mut self, message: Message) {
        if let Some(key) = message.dedupe_key.as_deref() {
            self.remove_where(|m| m.dedupe_key.as_deref() == Some(key));
        }
        if !message.transient {
            self.remove_transient();
        }
        self.messages.push(message.clone());
        let _ = self.events.send(TimelineEvent::Appended(message));
    }

    /// Drop every transient status marker.
    pub fn remove_transient(&mut self) {
        self.remove_where(|m| m.transient);
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let index = self.messages.iter().position(|m| m.id == id)?;
        let removed = self.messages.remove(index);
        let _ = self.events.send(TimelineEvent::Removed {
            id: removed.id.clone(),
        });
        Some(removed)
    }

    pub fn remove_by_dedupe_key(&mut self, key: &str) {
        self.remove_where(|m| m.dedupe_key.as_deref() == Some(key));
    }

    /// Mutate one message in place. Order is untouched.
    pub fn update<F>(&mut self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Message),
    {
        let Some(message) = self.messages.iter_mut().find(|m| m.id == id) else {
            return false;
        };
        f(message);
        let _ = self.events.send(TimelineEvent::Updated(message.clone()));
        true
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        let _ = self.events.send(TimelineEvent::Cleared);
    }

    fn remove_where<P>(&mut self, predicate: P)
    where
        P: Fn(&Message) -> bool,
    {
        let mut removed = Vec::new();
        self.messages.retain(|m| {
            if predicate(m) {
                removed.push(m.id.clone());
                false
            } else {
                true
            }
        });
        for id in removed {
            let _ = self.events.send(TimelineEvent::Removed { id });
        }
    }
}
