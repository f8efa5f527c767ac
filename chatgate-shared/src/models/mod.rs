//! # Models
//!
//! Request, response and stream payloads exchanged by the gateway, its callers
//! and the generation backend.

pub mod chat;
pub mod quota;
pub mod session;

pub use chat::{
    ChatChunk, ChatRequest, ChatStreamEvent, HistoryEntry, SessionHistory, SessionStartedEvent,
    SourceReference, StreamDoneEvent,
};
pub use quota::{QuotaExceeded, QuotaStatus};
pub use session::{ChatMessage, MessageRole, Session, SessionIdError, validate_session_id};
