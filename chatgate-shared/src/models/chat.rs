use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::session::{ChatMessage, MessageRole};

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// A document the backend drew on for a fragment of its answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct SourceReference {
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// One incremental piece of a streamed answer. The same shape is received
/// from the generation backend and relayed to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ChatChunk {
    #[serde(default)]
    pub answer_fragment: String,
    #[serde(default)]
    pub source_references: Vec<SourceReference>,
    #[serde(default)]
    pub processing_time_ms: u64,
}

impl ChatChunk {
    #[must_use]
    pub fn fragment(text: impl Into<String>) -> Self {
        Self {
            answer_fragment: text.into(),
            source_references: Vec::new(),
            processing_time_ms: 0,
        }
    }
}

/// Role/content pair forwarded to the backend as prior conversation context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct HistoryEntry {
    pub role: MessageRole,
    pub content: String,
}

impl From<&ChatMessage> for HistoryEntry {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// Body of `GET /api/sessions/{id}/history`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct SessionHistory {
    pub session_id: String,
    pub messages: Vec<ChatMessage>,
}

/// First event of every chat stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct SessionStartedEvent {
    pub session_id: String,
    pub created: bool,
}

/// Last event of a completed chat stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct StreamDoneEvent {
    pub session_id: String,
}

/// Server-sent events emitted on the chat stream, in order:
/// one `session`, zero or more `chunk`, and `done` on a clean finish.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChatStreamEvent {
    Session(SessionStartedEvent),
    Chunk(ChatChunk),
    Done(StreamDoneEvent),
}

impl ChatStreamEvent {
    /// SSE `event:` name for this payload.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Session(_) => "session",
            Self::Chunk(_) => "chunk",
            Self::Done(_) => "done",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_request_session_id_is_optional() {
        let request: ChatRequest = serde_json::from_value(json!({ "query": "hi" })).unwrap();
        assert_eq!(request.session_id, None);
    }

    #[test]
    fn backend_chunk_tolerates_missing_fields() {
        let chunk: ChatChunk = serde_json::from_str(r#"{"answer_fragment":"Hel"}"#).unwrap();
        assert_eq!(chunk, ChatChunk::fragment("Hel"));
    }

    #[test]
    fn stream_event_is_tagged() {
        let event = ChatStreamEvent::Chunk(ChatChunk::fragment("lo"));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "chunk");
        assert_eq!(value["payload"]["answer_fragment"], "lo");
        assert_eq!(event.event_name(), "chunk");
    }

    #[test]
    fn history_entry_drops_ids_and_timestamps() {
        let message = ChatMessage::new("s1", MessageRole::Assistant, "answer");
        let entry = HistoryEntry::from(&message);
        assert_eq!(
            serde_json::to_value(entry).unwrap(),
            json!({ "role": "assistant", "content": "answer" })
        );
    }
}
