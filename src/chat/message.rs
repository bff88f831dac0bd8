use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::state::{State, StateDelta};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(rename = "sessionState", default, skip_serializing_if = "Option::is_none")]
    pub session_state: Option<String>,
    /// Backend conversation memory, echoed upstream on the next turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpt_history: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_steps: Option<Vec<ThinkingStep>>,
}

impl MessageMetadata {
    pub fn session_state(&self) -> Option<&str> {
        self.session_state.as_deref().filter(|s| !s.is_empty())
    }

    fn is_empty(&self) -> bool {
        self.session_state().is_none()
            && self.gpt_history.as_ref().map_or(true, BTreeMap::is_empty)
            && self.thinking_steps.as_ref().map_or(true, Vec::is_empty)
    }

    /// The part of the metadata the backend expects back. `gpt_history` is
    /// always present upstream, empty when the backend never sent one.
    fn outbound(&self) -> MessageMetadata {
        MessageMetadata {
            session_state: self.session_state.clone(),
            gpt_history: Some(self.gpt_history.clone().unwrap_or_default()),
            thinking_steps: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingStep {
    pub title: String,
    pub content: Option<String>,
    #[serde(default)]
    pub search_content: Option<Vec<SearchQuery>>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub id: String,
    pub content: String,
}

impl UserMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub id: String,
    pub content: String,
    pub thinking: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    User(UserMessage),
    Assistant(AssistantMessage),
}

impl ChatMessage {
    pub fn content(&self) -> &str {
        match self {
            ChatMessage::User(m) => &m.content,
            ChatMessage::Assistant(m) => &m.content,
        }
    }

    /// Wire form sent upstream. Assistant turns lose their `thinking` and
    /// thinking steps but keep the backend's session metadata.
    pub fn to_outbound(&self) -> OutboundMessage {
        match self {
            ChatMessage::User(m) => OutboundMessage {
                role: Role::User,
                content: m.content.clone(),
                metadata: None,
            },
            ChatMessage::Assistant(m) => OutboundMessage {
                role: Role::Assistant,
                content: m.content.clone(),
                metadata: Some(
                    m.metadata
                        .as_ref()
                        .map_or_else(|| MessageMetadata::default().outbound(), MessageMetadata::outbound),
                ),
            },
        }
    }
}

impl From<UserMessage> for ChatMessage {
    fn from(m: UserMessage) -> Self {
        ChatMessage::User(m)
    }
}

impl From<AssistantMessage> for ChatMessage {
    fn from(m: AssistantMessage) -> Self {
        ChatMessage::Assistant(m)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<OutboundMessage>,
    pub stream: bool,
}

/// Project history to its wire form, keeping the last `keep_last_n`
/// exchanges plus the newest message.
pub fn outbound_messages(history: &[ChatMessage], keep_last_n: usize) -> Vec<OutboundMessage> {
    let keep = 2 * keep_last_n + 1;
    let skip = history.len().saturating_sub(keep);
    history[skip..].iter().map(ChatMessage::to_outbound).collect()
}

/// The running view of the assistant turn being streamed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub thinking: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Snapshot {
    /// Non-empty incoming fields replace, everything else is kept.
    pub fn fold(&self, incoming: &EnvelopeMessage) -> Snapshot {
        let pick = |new: &Option<String>, old: &String| match new.as_deref() {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => old.clone(),
        };
        let metadata = match &incoming.metadata {
            Some(m) if !m.is_empty() => Some(m.clone()),
            _ => self.metadata.clone(),
        };
        Snapshot {
            thinking: pick(&incoming.thinking, &self.thinking),
            content: pick(&incoming.content, &self.content),
            metadata,
        }
    }

    pub fn session_state(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(MessageMetadata::session_state)
    }

    pub fn into_message(self, id: impl Into<String>) -> AssistantMessage {
        AssistantMessage {
            id: id.into(),
            content: self.content,
            thinking: self.thinking,
            metadata: self.metadata,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMessage {
    pub role: Role,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub metadata: Option<MessageMetadata>,
}

impl EnvelopeMessage {
    /// Read the assistant fields out of a delta-protocol state map.
    pub fn from_state(state: &State) -> EnvelopeMessage {
        let text = |key: &str| state.get(key).and_then(Value::as_str).map(str::to_string);
        let session_state = state
            .get("metadata")
            .and_then(|m| m.get("sessionState"))
            .or_else(|| state.get("session_state"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let metadata = MessageMetadata {
            session_state,
            gpt_history: state
                .get("gpt_history")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
            thinking_steps: state
                .get("thinking_steps")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
        };
        EnvelopeMessage {
            role: Role::Assistant,
            thinking: text("thinking"),
            content: text("content"),
            metadata: Some(metadata).filter(|m| !m.is_empty()),
        }
    }
}

/// Fields a settled delta-protocol state must carry to be an assistant turn.
#[derive(Debug, Deserialize)]
struct SettledState {
    #[serde(rename = "content")]
    _content: String,
    #[serde(rename = "gpt_history")]
    _gpt_history: BTreeMap<String, String>,
    #[serde(rename = "thinking_steps", default)]
    _thinking_steps: Option<Vec<ThinkingStep>>,
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidState {
    #[error("mode must be \"chat\", got {0}")]
    Mode(Value),
    #[error(transparent)]
    Shape(#[from] serde_json::Error),
}

/// Check that the accumulated state of a finished delta-protocol round is a
/// chat-mode assistant message.
pub fn validate_settled_state(state: &State) -> Result<(), InvalidState> {
    match state.get("mode") {
        Some(Value::String(mode)) if mode == "chat" => {}
        other => return Err(InvalidState::Mode(other.cloned().unwrap_or(Value::Null))),
    }
    serde_json::from_value::<SettledState>(Value::Object(state.clone()))?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<Value>,
    pub message: EnvelopeMessage,
}

/// Payload of an inline `error` frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorFrame {
    Status { status: String, message: String },
    Bare(String),
}

impl ErrorFrame {
    fn from_value(data: Value) -> Self {
        let field = |key: &str| data.get(key).and_then(Value::as_str).map(str::to_string);
        if let (Some(status), Some(message)) = (field("status"), field("message")) {
            return ErrorFrame::Status { status, message };
        }
        ErrorFrame::Bare(match data {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }
}

/// One decoded SSE `message` payload.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Message(StreamEnvelope),
    StateDelta(StateDelta),
    Error(ErrorFrame),
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("payload is not JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected message role: {0}")]
    Role(String),
}

impl StreamFrame {
    /// Decode one payload. The discriminating `type` field is read first and
    /// the envelope's `role` is checked before its shape is validated.
    pub fn decode(data: &str) -> Result<StreamFrame, FrameError> {
        let mut value: Value = serde_json::from_str(data)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("message")
            .to_string();

        match kind.as_str() {
            "message" => {
                let role = value
                    .get("message")
                    .and_then(|m| m.get("role"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if role != "assistant" {
                    return Err(FrameError::Role(role.to_string()));
                }
                Ok(StreamFrame::Message(serde_json::from_value(value)?))
            }
            "state_delta" => Ok(StreamFrame::StateDelta(serde_json::from_value(
                value["data"].take(),
            )?)),
            "error" => Ok(StreamFrame::Error(ErrorFrame::from_value(value["data"].take()))),
            _ => Ok(StreamFrame::Other(kind)),
        }
    }
}
