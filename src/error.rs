//! Error types shared by the session engine, gateways and audio stack.

use thiserror::Error;

/// Failures the conversation core can observe.
///
/// Only `Transport` and `MalformedPayload` reach the user, and then only
/// indirectly: as an error bubble in the log for chat turns, or as an
/// aborted playback attempt for synthesis.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Gateway unreachable, non-success status, or a stream that broke off.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Synthesis payload (or a streamed chunk) that could not be decoded.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Document rejected at the ingestion boundary.
    #[error("invalid attachment: {0}")]
    InvalidAttachment(String),

    /// A turn was submitted while another reply is still awaited.
    #[error("a reply is already being awaited")]
    ConcurrentSubmitRejected,

    /// The sound device could not be opened, resumed or written.
    #[error("audio output error: {0}")]
    AudioOutput(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}

impl From<base64::DecodeError> for ChatError {
    fn from(err: base64::DecodeError) -> Self {
        ChatError::MalformedPayload(err.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::MalformedPayload(err.to_string())
    }
}
