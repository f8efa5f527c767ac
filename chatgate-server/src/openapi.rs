#![allow(clippy::needless_for_each)] // Derive macro emits a for_each internally

use shared::models::{
    ChatChunk, ChatMessage, ChatRequest, ChatStreamEvent, MessageRole, QuotaExceeded,
    QuotaStatus, SessionHistory, SessionStartedEvent, SourceReference, StreamDoneEvent,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "ChatGate API",
        version = "0.1.0",
        description = "Quota-enforced, history-aware streaming chat gateway"
    ),
    paths(
        crate::handlers::chat::chat,
        crate::handlers::chat::quota,
        crate::handlers::sessions::get_history,
        crate::handlers::sessions::delete_history,
    ),
    components(
        schemas(
            ChatRequest,
            ChatChunk,
            SourceReference,
            ChatStreamEvent,
            SessionStartedEvent,
            StreamDoneEvent,
            QuotaStatus,
            QuotaExceeded,
            SessionHistory,
            ChatMessage,
            MessageRole,
        )
    ),
    tags(
        (name = "Chat", description = "Streaming chat and quota"),
        (name = "Sessions", description = "Conversation history")
    )
)]
/// OpenAPI document for the public API.
pub struct ApiDoc;
