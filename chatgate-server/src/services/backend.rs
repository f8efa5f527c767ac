//! Generation backend client.
//!
//! The backend answers one query with a stream of [`ChatChunk`]s. Caller scope
//! and prior history travel as request metadata; the body carries only the
//! query.

use std::{pin::Pin, time::Duration};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{
    Client,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use serde::Serialize;
use shared::models::{ChatChunk, HistoryEntry};
use thiserror::Error;
use tracing::debug;

/// Call metadata header names.
pub const USER_ID_METADATA: &str = "x-chatgate-user-id";
pub const TENANT_ID_METADATA: &str = "x-chatgate-tenant-id";
pub const GROUP_IDS_METADATA: &str = "x-chatgate-group-ids";
pub const HISTORY_METADATA: &str = "x-chatgate-history";

/// Failure reaching or reading from the generation backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Transport(String),
    #[error("backend responded with status {0}")]
    Status(u16),
    #[error("invalid chunk from backend: {0}")]
    Decode(String),
    #[error("invalid call metadata: {0}")]
    Metadata(String),
}

/// Everything the backend needs for one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationCall {
    pub query: String,
    pub session_id: String,
    pub user_id: String,
    pub tenant_id: Option<String>,
    pub group_ids: Vec<String>,
    pub history: Vec<HistoryEntry>,
}

impl GenerationCall {
    /// Call metadata as `(name, value)` pairs. Values are ASCII-only.
    pub fn metadata(&self) -> Result<Vec<(&'static str, String)>, BackendError> {
        let mut pairs = vec![(USER_ID_METADATA, self.user_id.clone())];
        if let Some(tenant) = &self.tenant_id {
            pairs.push((TENANT_ID_METADATA, tenant.clone()));
        }
        if !self.group_ids.is_empty() {
            pairs.push((GROUP_IDS_METADATA, self.group_ids.join(",")));
        }
        let history = serde_json::to_string(&self.history)
            .map_err(|err| BackendError::Metadata(err.to_string()))?;
        pairs.push((HISTORY_METADATA, escape_non_ascii(&history)));
        Ok(pairs)
    }
}

/// Rewrites every non-ASCII character of a JSON document as `\uXXXX`.
///
/// Outside string literals JSON is ASCII, so the result stays valid JSON.
fn escape_non_ascii(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for ch in json.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}

/// Answer chunks of one generation, in order.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, BackendError>> + Send>>;

/// Streaming client for the generation backend.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Opens the stream. Errors here mean nothing was generated.
    async fn open_stream(&self, call: GenerationCall) -> Result<ChunkStream, BackendError>;
}

#[derive(Serialize)]
struct GenerationBody<'a> {
    query: &'a str,
    session_id: &'a str,
}

/// Talks to a backend that answers `POST` with newline-delimited JSON chunks.
#[derive(Debug, Clone)]
pub struct HttpGenerationBackend {
    client: Client,
    endpoint: String,
}

impl HttpGenerationBackend {
    /// Client posting to `endpoint`.
    ///
    /// # Errors
    /// Returns [`BackendError::Transport`] if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, connect_timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|err| BackendError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    async fn open_stream(&self, call: GenerationCall) -> Result<ChunkStream, BackendError> {
        let mut headers = HeaderMap::new();
        for (name, value) in call.metadata()? {
            let value = HeaderValue::from_str(&value)
                .map_err(|err| BackendError::Metadata(format!("{name}: {err}")))?;
            headers.insert(HeaderName::from_static(name), value);
        }

        let response = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .json(&GenerationBody {
                query: &call.query,
                session_id: &call.session_id,
            })
            .send()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status(status.as_u16()));
        }
        debug!(session_id = %call.session_id, "backend stream opened");

        let mut body = response.bytes_stream();
        let stream = try_stream! {
            let mut decoder = NdjsonDecoder::default();
            while let Some(bytes) = body.next().await {
                let bytes = bytes.map_err(|err| BackendError::Transport(err.to_string()))?;
                for chunk in decoder.feed(&bytes) {
                    yield chunk?;
                }
            }
            if let Some(chunk) = decoder.finish() {
                yield chunk?;
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Splits a byte stream into JSON lines, tolerating lines cut across reads.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    /// Consumes `bytes` and returns every chunk completed by it.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<ChatChunk, BackendError>> {
        self.buffer.extend_from_slice(bytes);
        let mut chunks = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(chunk) = decode_line(&line) {
                chunks.push(chunk);
            }
        }
        chunks
    }

    /// Decodes whatever is left once the body ends without a final newline.
    pub fn finish(&mut self) -> Option<Result<ChatChunk, BackendError>> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Option<Result<ChatChunk, BackendError>> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(serde_json::from_str(trimmed).map_err(|err| BackendError::Decode(err.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::models::MessageRole;

    fn call() -> GenerationCall {
        GenerationCall {
            query: "hi".into(),
            session_id: "s1".into(),
            user_id: "u1".into(),
            tenant_id: Some("t1".into()),
            group_ids: vec!["g1".into(), "g2".into()],
            history: vec![HistoryEntry {
                role: MessageRole::User,
                content: "héllo".into(),
            }],
        }
    }

    #[test]
    fn metadata_carries_scope_and_history() {
        let pairs = call().metadata().unwrap();
        let lookup = |name| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.clone())
        };

        assert_eq!(lookup(USER_ID_METADATA).as_deref(), Some("u1"));
        assert_eq!(lookup(TENANT_ID_METADATA).as_deref(), Some("t1"));
        assert_eq!(lookup(GROUP_IDS_METADATA).as_deref(), Some("g1,g2"));

        let history = lookup(HISTORY_METADATA).unwrap();
        assert!(history.is_ascii());
        let decoded: Vec<HistoryEntry> = serde_json::from_str(&history).unwrap();
        assert_eq!(decoded[0].content, "héllo");
    }

    #[test]
    fn metadata_omits_absent_scope() {
        let mut call = call();
        call.tenant_id = None;
        call.group_ids.clear();
        let names: Vec<_> = call.metadata().unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(names, [USER_ID_METADATA, HISTORY_METADATA]);
    }

    #[test]
    fn escape_handles_astral_characters() {
        let escaped = escape_non_ascii("\"🙂\"");
        assert_eq!(escaped, "\"\\ud83d\\ude42\"");
        let back: String = serde_json::from_str(&escaped).unwrap();
        assert_eq!(back, "🙂");
    }

    #[test]
    fn decoder_reassembles_split_lines() {
        let mut decoder = NdjsonDecoder::default();
        assert!(decoder.feed(br#"{"answer_fragment":"Hel"#).is_empty());

        let chunks = decoder.feed(b"\"}\n{\"answer_fragment\":\"lo\",\"processing_time_ms\":7}\n");
        let fragments: Vec<_> = chunks
            .into_iter()
            .map(|chunk| chunk.unwrap())
            .collect();
        assert_eq!(fragments[0].answer_fragment, "Hel");
        assert_eq!(fragments[1].answer_fragment, "lo");
        assert_eq!(fragments[1].processing_time_ms, 7);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn decoder_flushes_trailing_line_and_skips_blanks() {
        let mut decoder = NdjsonDecoder::default();
        assert!(decoder.feed(b"\n\r\n").is_empty());
        assert!(decoder.feed(br#"{"answer_fragment":"end"}"#).is_empty());
        let last = decoder.finish().unwrap().unwrap();
        assert_eq!(last.answer_fragment, "end");
    }

    #[test]
    fn decoder_reports_garbage() {
        let mut decoder = NdjsonDecoder::default();
        let chunks = decoder.feed(b"not json\n");
        assert!(matches!(chunks[0], Err(BackendError::Decode(_))));
    }
}
