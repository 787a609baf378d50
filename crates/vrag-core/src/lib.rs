use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod engine;
pub mod wire;

pub use engine::{SessionEngine, SessionEvent, SessionState, StatusProjection};
pub use wire::{
    classify, decode_frame, ChatRequest, ClassifiedFrame, FrameError, FrameEvent, RequestError,
    RetrievalMode, ServerFrame, StreamKind, DEFAULT_MAX_FRAME_BYTES, MAX_ATTACHMENTS,
    STATUS_STAGE_KEY,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Reasoning,
    Answer,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Reasoning => "reasoning",
            Self::Answer => "answer",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRecord {
    pub kind: MessageKind,
    pub content: String,
}

impl MessageRecord {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }
}

/// Ordered, append-only log of message records. Insertion order is display
/// order; the only in-place mutation is extending a record the engine holds
/// open while a response streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    records: Vec<MessageRecord>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record and returns its index.
    pub fn push(&mut self, record: MessageRecord) -> usize {
        self.records.push(record);
        self.records.len() - 1
    }

    /// Extends the content of the record at `index`. Indices come from
    /// `push`, so an out-of-range index is a logic bug upstream; the
    /// extension is silently skipped rather than panicking mid-session.
    pub fn extend(&mut self, index: usize, text: &str) {
        if let Some(record) = self.records.get_mut(index) {
            record.content.push_str(text);
        }
    }

    pub fn records(&self) -> &[MessageRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&MessageRecord> {
        self.records.last()
    }
}

/// One entry of the conversation history returned by the history service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryMessage {
    pub role: HistoryRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRole {
    User,
    Assistant,
    Thinking,
    #[serde(other)]
    Unknown,
}

impl HistoryRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Thinking => "thinking",
            Self::Unknown => "unknown",
        }
    }

    /// History roles map onto transcript kinds; anything unrecognized is
    /// skipped by the caller.
    pub fn message_kind(self) -> Option<MessageKind> {
        match self {
            Self::User => Some(MessageKind::Text),
            Self::Assistant => Some(MessageKind::Answer),
            Self::Thinking => Some(MessageKind::Reasoning),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for HistoryRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistoryRole {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "thinking" => Ok(Self::Thinking),
            other => Err(format!("Unknown history role: {other}")),
        }
    }
}
