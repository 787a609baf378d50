use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const MAX_ATTACHMENTS: usize = 3;

/// Key a status payload must carry for the projection to render it.
pub const STATUS_STAGE_KEY: &str = "stage";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Reasoning,
    Answer,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reasoning => "reasoning",
            Self::Answer => "answer",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inbound frame off the channel. Every field is optional on the wire;
/// senders attach arbitrary extra keys, so unknown fields are preserved
/// rather than rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServerFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<StreamKind>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

/// What one frame means to the engine. `Tick` is the explicit fallthrough
/// for frames carrying neither content nor a usable status payload.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    Delta { kind: StreamKind, text: String },
    Status(BTreeMap<String, String>),
    Tick,
}

/// Classification result. Completion is orthogonal to the event: a single
/// frame may carry both a final delta and the terminator flag.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedFrame {
    pub event: FrameEvent,
    pub done: bool,
}

/// Classifies a decoded frame. A recognized discriminator always wins; a
/// status-only frame forwards its payload whenever it is non-empty.
pub fn classify(frame: ServerFrame) -> ClassifiedFrame {
    let done = frame.done;
    let event = if let Some(kind) = frame.kind {
        FrameEvent::Delta {
            kind,
            text: frame.content,
        }
    } else {
        match frame.status {
            Some(status) if !status.is_empty() => FrameEvent::Status(status),
            _ => FrameEvent::Tick,
        }
    };
    ClassifiedFrame { event, done }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn decode_frame<T: DeserializeOwned>(
    raw: &str,
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    Summary,
    Query,
    Timestamps,
    Ignore,
    #[default]
    None,
}

impl RetrievalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Query => "query",
            Self::Timestamps => "timestamps",
            Self::Ignore => "ignore",
            Self::None => "none",
        }
    }
}

impl fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetrievalMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "summary" => Ok(Self::Summary),
            "query" => Ok(Self::Query),
            "timestamps" => Ok(Self::Timestamps),
            "ignore" => Ok(Self::Ignore),
            "none" | "" => Ok(Self::None),
            other => Err(format!("Unknown retrieval mode: {other}")),
        }
    }
}

/// One outbound chat turn, transmitted as a single JSON text frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    pub conversation_id: i64,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub model_id: String,
    #[serde(default)]
    pub reasoning_enabled: bool,
    #[serde(default)]
    pub retrieval_mode: RetrievalMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request text must not be empty")]
    EmptyText,
    #[error("too many attachments: {count} > {MAX_ATTACHMENTS}")]
    TooManyAttachments { count: usize },
}

impl ChatRequest {
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.text.trim().is_empty() {
            return Err(RequestError::EmptyText);
        }
        if self.attachments.len() > MAX_ATTACHMENTS {
            return Err(RequestError::TooManyAttachments {
                count: self.attachments.len(),
            });
        }
        Ok(())
    }
}
