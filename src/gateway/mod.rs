//! Boundaries to the two remote services the conversation depends on.

mod gemini_chat;
mod gemini_speech;

pub use gemini_chat::GeminiChat;
pub use gemini_speech::GeminiSpeech;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use uuid::Uuid;

use crate::error::Result;

/// Opaque conversational context handed out by a [`ChatGateway`].
///
/// Two handles are equal only if they came from the same `create_session`
/// call; the engine uses this to drop deltas of an abandoned session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    id: Uuid,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Document sent alongside the text of a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineDocument {
    pub mime_type: String,
    pub data: Bytes,
}

/// One outgoing user turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnRequest {
    pub text: Option<String>,
    pub document: Option<InlineDocument>,
}

/// An incremental fragment of the streamed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDelta {
    pub text: String,
}

impl TextDelta {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Lazily produced reply; any item may be the transport error that ends it.
pub type DeltaStream = BoxStream<'static, Result<TextDelta>>;

#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn create_session(&self) -> Result<SessionHandle>;

    /// Called once a handle has been replaced; the handle is never used again.
    fn discard_session(&self, _handle: &SessionHandle) {}

    async fn send_turn(&self, handle: &SessionHandle, turn: TurnRequest) -> Result<DeltaStream>;
}

#[async_trait]
pub trait SynthesisGateway: Send + Sync {
    /// Returns base64-encoded 16-bit PCM for `text`.
    async fn synthesize(&self, text: &str) -> Result<String>;
}
