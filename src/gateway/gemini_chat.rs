//! Streaming chat over the Gemini REST API.
//!
//! The REST endpoint is stateless, so the conversation history of every live
//! session is kept here, keyed by the handle id. A turn is committed to the
//! history only when its stream completes without error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use futures_util::StreamExt;
use reqwest::{Client, Response};
use tokio::sync::mpsc;
use url::Url;
use uuid::Uuid;

use super::{ChatGateway, DeltaStream, SessionHandle, TextDelta, TurnRequest};
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::protocol::{Content, ErrorWrapper, GenerateContentRequest, GenerateContentResponse, Part, SseLines};

type Histories = Arc<Mutex<HashMap<Uuid, Vec<Content>>>>;

pub struct GeminiChat {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    system_instruction: Option<String>,
    histories: Histories,
}

impl GeminiChat {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
            system_instruction: None,
            histories: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.request_timeout)
            .build()?;
        let mut chat = Self::new(config.api_key.clone(), config.base_url, config.chat_model);
        chat.client = client;
        if !config.system_instruction.trim().is_empty() {
            chat.system_instruction = Some(config.system_instruction.clone());
        }
        Ok(chat)
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    fn endpoint(&self) -> Result<Url> {
        let raw = format!(
            "{}/{}:streamGenerateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        Url::parse_with_params(&raw, &[("alt", "sse"), ("key", self.api_key.as_str())])
            .map_err(|e| ChatError::Config(format!("invalid Gemini URL {}: {}", raw, e)))
    }

    fn user_content(turn: &TurnRequest) -> Content {
        let mut parts = Vec::new();
        if let Some(doc) = &turn.document {
            parts.push(Part::inline(doc.mime_type.clone(), BASE64_STANDARD.encode(&doc.data)));
        }
        if let Some(text) = &turn.text {
            parts.push(Part::text(text.clone()));
        }
        Content::user(parts)
    }
}

#[async_trait]
impl ChatGateway for GeminiChat {
    async fn create_session(&self) -> Result<SessionHandle> {
        let handle = SessionHandle::new();
        lock(&self.histories).insert(handle.id(), Vec::new());
        log::info!("Gemini chat session {} created (model {})", handle.id(), self.model);
        Ok(handle)
    }

    fn discard_session(&self, handle: &SessionHandle) {
        if lock(&self.histories).remove(&handle.id()).is_some() {
            log::info!("Gemini chat session {} discarded", handle.id());
        }
    }

    async fn send_turn(&self, handle: &SessionHandle, turn: TurnRequest) -> Result<DeltaStream> {
        let user = Self::user_content(&turn);
        if user.parts.is_empty() {
            return Err(ChatError::Transport("turn has neither text nor document".into()));
        }

        let mut contents = lock(&self.histories)
            .get(&handle.id())
            .cloned()
            .ok_or_else(|| ChatError::Transport(format!("unknown session {}", handle.id())))?;
        contents.push(user.clone());

        let request = GenerateContentRequest {
            contents,
            system_instruction: self.system_instruction.as_ref().map(|text| Content {
                role: None,
                parts: vec![Part::text(text.clone())],
            }),
            generation_config: None,
        };

        let response = self
            .client
            .post(self.endpoint()?)
            .json(&request)
            .send()
            .await?;
        let response = check_status(response).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let histories = self.histories.clone();
        let session = handle.id();
        tokio::spawn(async move {
            if let Some(reply) = pump_sse(response, tx).await {
                // Abandoned sessions are gone from the map and stay gone
                if let Some(history) = lock(&histories).get_mut(&session) {
                    history.push(user);
                    history.push(Content::model(reply));
                }
            }
        });

        Ok(receiver_stream(rx))
    }
}

/// Forwards every text delta; returns the full reply if the stream ended cleanly.
async fn pump_sse(
    response: Response,
    tx: mpsc::UnboundedSender<Result<TextDelta>>,
) -> Option<String> {
    let mut sse = SseLines::new();
    let mut reply = String::new();
    let mut bytes = response.bytes_stream();

    while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                log::warn!("Gemini stream broke off: {}", e);
                let _ = tx.send(Err(ChatError::Transport(e.to_string())));
                return None;
            }
        };
        for payload in sse.push(&chunk) {
            if !forward(&payload, &mut reply, &tx) {
                return None;
            }
        }
    }
    if let Some(payload) = sse.finish() {
        if !forward(&payload, &mut reply, &tx) {
            return None;
        }
    }
    Some(reply)
}

fn forward(payload: &str, reply: &mut String, tx: &mpsc::UnboundedSender<Result<TextDelta>>) -> bool {
    let chunk: GenerateContentResponse = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            let _ = tx.send(Err(ChatError::MalformedPayload(e.to_string())));
            return false;
        }
    };
    if let Some(error) = chunk.error {
        let _ = tx.send(Err(ChatError::Transport(error.describe())));
        return false;
    }
    let text = chunk.text();
    if !text.is_empty() {
        reply.push_str(&text);
        if tx.send(Ok(TextDelta::new(text))).is_err() {
            // Consumer went away; nothing left to deliver to
            return false;
        }
    }
    true
}

pub(super) fn receiver_stream<T: Send + 'static>(
    rx: mpsc::UnboundedReceiver<T>,
) -> futures_util::stream::BoxStream<'static, T> {
    futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

/// Maps a non-success response onto a transport error with Gemini's message.
pub(super) async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read Gemini error body".to_string());
    let message = serde_json::from_str::<ErrorWrapper>(&body)
        .map(|wrapper| wrapper.error.describe())
        .unwrap_or(body);
    log::warn!("Gemini API returned {}: {}", status, message);
    Err(ChatError::Transport(format!("HTTP {}: {}", status.as_u16(), message)))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InlineDocument;
    use bytes::Bytes;

    fn chat() -> GeminiChat {
        GeminiChat::new("secret", "https://example.test/v1beta/models/", "gemini-2.5-flash")
    }

    #[test]
    fn endpoint_requests_sse_and_carries_the_key() {
        let url = chat().endpoint().unwrap();
        assert_eq!(url.path(), "/v1beta/models/gemini-2.5-flash:streamGenerateContent");
        let query: Vec<_> = url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
        assert!(query.contains(&("alt".into(), "sse".into())));
        assert!(query.contains(&("key".into(), "secret".into())));
    }

    #[test]
    fn document_goes_before_text() {
        let turn = TurnRequest {
            text: Some("riassumi".into()),
            document: Some(InlineDocument {
                mime_type: "application/pdf".into(),
                data: Bytes::from_static(b"%PDF"),
            }),
        };
        let content = GeminiChat::user_content(&turn);
        assert_eq!(content.parts.len(), 2);
        let inline = content.parts[0].inline_data.as_ref().unwrap();
        assert_eq!(inline.data, "JVBERg==");
        assert_eq!(content.parts[1].text.as_deref(), Some("riassumi"));
    }

    #[tokio::test]
    async fn sessions_are_tracked_until_discarded() {
        let chat = chat();
        let handle = chat.create_session().await.unwrap();
        assert!(lock(&chat.histories).contains_key(&handle.id()));
        chat.discard_session(&handle);
        assert!(!lock(&chat.histories).contains_key(&handle.id()));

        let err = match chat.send_turn(&handle, TurnRequest { text: Some("x".into()), document: None }).await {
            Err(e) => e,
            Ok(_) => panic!("discarded session must not accept turns"),
        };
        assert!(matches!(err, ChatError::Transport(_)));
    }

    #[test]
    fn forward_stops_on_an_error_chunk() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reply = String::new();
        assert!(forward(
            r#"{"candidates":[{"content":{"parts":[{"text":"Ciao"}]}}]}"#,
            &mut reply,
            &tx
        ));
        assert!(!forward(
            r#"{"error":{"code":429,"message":"quota","status":"RESOURCE_EXHAUSTED"}}"#,
            &mut reply,
            &tx
        ));
        assert_eq!(reply, "Ciao");
        assert_eq!(rx.try_recv().unwrap(), Ok(TextDelta::new("Ciao")));
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(ChatError::Transport("RESOURCE_EXHAUSTED: quota".into()))
        );
    }
}
