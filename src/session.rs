//! Conversational session engine.
//!
//! Owns the message log and the live chat session handle. A turn appends
//! the user message, streams the reply into a single sentinel message,
//! finalizes it under a permanent id and, with autoplay on, hands it to the
//! playback controller exactly once.

use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::attachment::Attachment;
use crate::audio::{PlaybackController, PlaybackOutcome};
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::gateway::{ChatGateway, SessionHandle, TurnRequest};
use crate::message::{FinalId, Fold, Message, MessageLog};

/// User-facing texts the engine writes into the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTexts {
    /// Seeded when the engine starts.
    pub welcome: String,
    /// Seeded after a reset.
    pub reset: String,
    /// Body of the error message appended when a turn fails.
    pub error: String,
    /// Sent in place of the text when only a document is submitted.
    pub attachment_prompt: String,
    /// Shown as the user message for a document-only turn; `{name}` is replaced.
    pub attachment_placeholder: String,
}

impl SessionTexts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            welcome: config.welcome_text.clone(),
            reset: config.reset_text.clone(),
            error: config.error_text.clone(),
            attachment_prompt: config.attachment_prompt.clone(),
            attachment_placeholder: config.attachment_placeholder.clone(),
        }
    }

    fn placeholder(&self, name: &str) -> String {
        self.attachment_placeholder.replace("{name}", name)
    }
}

/// Changes to the log, in the order they were applied.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    MessageAppended { index: usize, message: Message },
    /// The streaming reply at `index` now reads `text`.
    MessageUpdated { index: usize, text: String },
    MessageFinalized { index: usize, id: FinalId },
    /// A partial reply was removed after its stream failed.
    MessageDiscarded { index: usize },
    AwaitingReply(bool),
    /// The log was replaced by the single seeded reset message.
    Reset,
}

/// How a call to [`SessionEngine::submit_turn`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Nothing to send, or another turn was still in flight.
    Ignored,
    /// The reply was finalized under this id.
    Completed(FinalId),
    /// The stream ended without any text.
    NoReply,
    /// The turn failed; an error message was appended.
    Failed,
    /// The session was reset while the reply was streaming.
    Abandoned,
}

struct EngineState {
    log: MessageLog,
    handle: SessionHandle,
    /// Ticket of the turn currently awaiting its reply.
    in_flight: Option<u64>,
    next_ticket: u64,
    autoplay: bool,
    pending: Option<Attachment>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EngineState {
    fn emit(&mut self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                self.events = None;
            }
        }
    }

    fn append_user(&mut self, text: String) {
        let message = self.log.push_user(text).clone();
        let index = self.log.len() - 1;
        self.emit(SessionEvent::MessageAppended { index, message });
    }

    fn append_error(&mut self, text: String) {
        let message = self.log.push_error(text).clone();
        let index = self.log.len() - 1;
        self.emit(SessionEvent::MessageAppended { index, message });
    }

    fn is_live(&self, handle: &SessionHandle) -> bool {
        self.handle == *handle
    }
}

/// Clears the awaiting-reply flag when the turn that set it ends, however it ends.
struct AwaitingReply<'a> {
    engine: &'a SessionEngine,
    ticket: u64,
}

impl Drop for AwaitingReply<'_> {
    fn drop(&mut self) {
        let mut state = self.engine.lock();
        if state.in_flight == Some(self.ticket) {
            // A turn dropped mid-stream must not leave its sentinel behind
            if let Some(index) = state.log.discard_streaming() {
                state.emit(SessionEvent::MessageDiscarded { index });
            }
            state.in_flight = None;
            state.emit(SessionEvent::AwaitingReply(false));
        }
    }
}

pub struct SessionEngine {
    chat: Arc<dyn ChatGateway>,
    playback: Arc<PlaybackController>,
    texts: SessionTexts,
    state: Mutex<EngineState>,
}

impl SessionEngine {
    /// Opens the first chat session and seeds the welcome message.
    pub async fn start(
        chat: Arc<dyn ChatGateway>,
        playback: Arc<PlaybackController>,
        texts: SessionTexts,
        autoplay: bool,
    ) -> Result<Self> {
        let handle = chat.create_session().await?;
        log::info!("Chat session {} started", handle.id());
        let log = MessageLog::seeded(texts.welcome.clone());
        Ok(Self {
            chat,
            playback,
            texts,
            state: Mutex::new(EngineState {
                log,
                handle,
                in_flight: None,
                next_ticket: 0,
                autoplay,
                pending: None,
                events: None,
            }),
        })
    }

    /// Routes log changes to the returned receiver.
    ///
    /// Only the latest subscriber receives events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().events = Some(tx);
        rx
    }

    pub fn playback(&self) -> &Arc<PlaybackController> {
        &self.playback
    }

    /// Snapshot of the log.
    pub fn messages(&self) -> Vec<Message> {
        self.lock().log.messages().to_vec()
    }

    pub fn message(&self, index: usize) -> Option<Message> {
        self.lock().log.get(index).cloned()
    }

    pub fn is_awaiting_reply(&self) -> bool {
        self.lock().in_flight.is_some()
    }

    pub fn autoplay(&self) -> bool {
        self.lock().autoplay
    }

    pub fn set_autoplay(&self, enabled: bool) {
        self.lock().autoplay = enabled;
        log::info!("Autoplay {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Sets the document for the next [`submit_pending`], returning the one it replaces.
    ///
    /// [`submit_pending`]: SessionEngine::submit_pending
    pub fn attach(&self, attachment: Attachment) -> Option<Attachment> {
        log::info!("Attached {} ({} bytes)", attachment.name(), attachment.len());
        self.lock().pending.replace(attachment)
    }

    pub fn detach(&self) -> Option<Attachment> {
        self.lock().pending.take()
    }

    /// Name of the pending document, if any.
    pub fn pending_attachment(&self) -> Option<String> {
        self.lock().pending.as_ref().map(|a| a.name().to_string())
    }

    /// Submits `text` together with the pending document, if one is set.
    ///
    /// The document is taken out of the slot before anything is sent, so it
    /// is consumed whether the turn succeeds or fails. A call that would be
    /// ignored leaves the slot untouched.
    pub async fn submit_pending(&self, text: &str) -> TurnOutcome {
        let attachment = {
            let mut state = self.lock();
            if state.in_flight.is_some() {
                None
            } else {
                state.pending.take()
            }
        };
        self.submit_turn(text, attachment).await
    }

    /// Runs one full turn: user message, streamed reply, optional autoplay.
    ///
    /// Returns [`TurnOutcome::Ignored`] without touching the log when there is
    /// nothing to send or a reply is already awaited.
    pub async fn submit_turn(&self, text: &str, attachment: Option<Attachment>) -> TurnOutcome {
        let text = text.trim();
        if text.is_empty() && attachment.is_none() {
            return TurnOutcome::Ignored;
        }

        let (handle, awaiting) = {
            let mut state = self.lock();
            if state.in_flight.is_some() {
                log::debug!("Submit ignored: {}", ChatError::ConcurrentSubmitRejected);
                return TurnOutcome::Ignored;
            }

            let shown = match &attachment {
                Some(attachment) if text.is_empty() => self.texts.placeholder(attachment.name()),
                _ => text.to_string(),
            };
            state.append_user(shown);

            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.in_flight = Some(ticket);
            state.emit(SessionEvent::AwaitingReply(true));
            (
                state.handle.clone(),
                AwaitingReply {
                    engine: self,
                    ticket,
                },
            )
        };

        let turn = match attachment {
            Some(attachment) => TurnRequest {
                text: Some(if text.is_empty() {
                    self.texts.attachment_prompt.clone()
                } else {
                    text.to_string()
                }),
                document: Some(attachment.to_document()),
            },
            None => TurnRequest {
                text: Some(text.to_string()),
                document: None,
            },
        };

        let outcome = self.run_turn(&handle, turn).await;
        drop(awaiting);

        if let TurnOutcome::Completed(id) = outcome {
            self.autoplay_reply(&handle, id).await;
        }
        outcome
    }

    /// Replaces the session: new handle, reseeded log, empty speech cache.
    ///
    /// A reply still streaming from the old handle is ignored from here on.
    /// If no new session can be opened nothing changes.
    pub async fn reset(&self) -> Result<()> {
        let fresh = self.chat.create_session().await?;
        let old = {
            let mut state = self.lock();
            let old = std::mem::replace(&mut state.handle, fresh);
            state.log.reseed(self.texts.reset.clone());
            let was_awaiting = state.in_flight.take().is_some();
            state.emit(SessionEvent::Reset);
            if was_awaiting {
                state.emit(SessionEvent::AwaitingReply(false));
            }
            old
        };
        self.chat.discard_session(&old);
        self.playback.reset();
        log::info!("Session reset, old handle {} discarded", old.id());
        Ok(())
    }

    /// Toggles speech for the message at `index`.
    ///
    /// Returns `Ok(None)` when that message cannot be spoken: a user
    /// message, an error message or a reply still streaming.
    pub async fn play(&self, index: usize) -> Result<Option<PlaybackOutcome>> {
        let target = self
            .lock()
            .log
            .get(index)
            .and_then(|m| m.speakable_id().map(|id| (id, m.text().to_string())));
        match target {
            Some((id, text)) => self.playback.request_playback(id, &text).await.map(Some),
            None => Ok(None),
        }
    }

    async fn run_turn(&self, handle: &SessionHandle, turn: TurnRequest) -> TurnOutcome {
        let mut stream = match self.chat.send_turn(handle, turn).await {
            Ok(stream) => stream,
            Err(e) => return self.fail_turn(handle, e),
        };

        let mut reply = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(delta) if delta.is_empty() => continue,
                Ok(delta) => {
                    reply.push_str(&delta.text);
                    if !self.fold(handle, &reply) {
                        return TurnOutcome::Abandoned;
                    }
                }
                Err(e) => return self.fail_turn(handle, e),
            }
        }
        self.finalize(handle)
    }

    /// Returns false once `handle` is no longer the live session.
    fn fold(&self, handle: &SessionHandle, reply: &str) -> bool {
        let mut state = self.lock();
        if !state.is_live(handle) {
            log::debug!("Dropping delta from abandoned session {}", handle.id());
            return false;
        }
        match state.log.fold_streaming(reply) {
            Fold::Appended(index) => {
                if let Some(message) = state.log.get(index).cloned() {
                    state.emit(SessionEvent::MessageAppended { index, message });
                }
            }
            Fold::Replaced(index) => state.emit(SessionEvent::MessageUpdated {
                index,
                text: reply.to_string(),
            }),
        }
        true
    }

    fn finalize(&self, handle: &SessionHandle) -> TurnOutcome {
        let mut state = self.lock();
        if !state.is_live(handle) {
            return TurnOutcome::Abandoned;
        }
        match state.log.finalize_streaming() {
            Some((index, id)) => {
                state.emit(SessionEvent::MessageFinalized { index, id });
                TurnOutcome::Completed(id)
            }
            None => {
                log::info!("Reply stream ended without text");
                TurnOutcome::NoReply
            }
        }
    }

    fn fail_turn(&self, handle: &SessionHandle, error: ChatError) -> TurnOutcome {
        let mut state = self.lock();
        if !state.is_live(handle) {
            log::debug!("Ignoring failure of abandoned session: {}", error);
            return TurnOutcome::Abandoned;
        }
        log::warn!("Chat turn failed: {}", error);
        if let Some(index) = state.log.discard_streaming() {
            state.emit(SessionEvent::MessageDiscarded { index });
        }
        state.append_error(self.texts.error.clone());
        TurnOutcome::Failed
    }

    async fn autoplay_reply(&self, handle: &SessionHandle, id: FinalId) {
        let text = {
            let state = self.lock();
            if !state.autoplay || !state.is_live(handle) {
                return;
            }
            state.log.find(id).map(|m| m.text().to_string())
        };
        let Some(text) = text.filter(|t| !t.is_empty()) else {
            return;
        };
        match self.playback.request_playback(id, &text).await {
            Ok(outcome) => log::debug!("Autoplay of {}: {:?}", id, outcome),
            Err(e) => log::warn!("Autoplay of {} failed: {}", id, e),
        }

        // Reset while playback was starting: the reply no longer exists
        if !self.lock().is_live(handle) {
            log::debug!("Reply {} was reset away during autoplay", id);
            self.playback.discard(id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
