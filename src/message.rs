//! Conversation messages and the append-only log that holds them.

use std::fmt;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

/// Permanent, time-derived identifier of a finalized message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FinalId(i64);

impl FinalId {
    pub fn as_millis(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for FinalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Either the sentinel of the reply still streaming, or a permanent id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Streaming,
    Final(FinalId),
}

impl MessageId {
    pub fn final_id(&self) -> Option<FinalId> {
        match self {
            MessageId::Final(id) => Some(*id),
            MessageId::Streaming => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, MessageId::Streaming)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Streaming => f.write_str("streaming"),
            MessageId::Final(id) => id.fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: MessageId,
    role: Role,
    text: String,
    created_at: DateTime<Utc>,
    is_error: bool,
}

impl Message {
    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_error(&self) -> bool {
        self.is_error
    }

    /// Finalized, non-error model replies are the only speakable messages.
    pub fn speakable_id(&self) -> Option<FinalId> {
        match (self.role, self.is_error) {
            (Role::Model, false) => self.id.final_id(),
            _ => None,
        }
    }
}

/// Hands out strictly increasing millisecond ids, even within one millisecond.
#[derive(Debug, Default)]
struct IdClock {
    last: i64,
}

impl IdClock {
    fn next(&mut self, now: DateTime<Utc>) -> FinalId {
        let id = now.timestamp_millis().max(self.last + 1);
        self.last = id;
        FinalId(id)
    }
}

/// Result of folding a delta into the streaming reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fold {
    /// First delta: the sentinel message was appended at this index.
    Appended(usize),
    /// Later delta: the sentinel at this index got the new text.
    Replaced(usize),
}

/// Ordered, append-only message log.
///
/// At most one message carries [`MessageId::Streaming`]; its position is
/// held in `streaming` instead of being re-derived from the tail.
#[derive(Debug)]
pub struct MessageLog {
    messages: Vec<Message>,
    streaming: Option<usize>,
    clock: IdClock,
}

impl MessageLog {
    /// A log holding only the seeded welcome message.
    pub fn seeded(welcome: impl Into<String>) -> Self {
        let mut log = Self {
            messages: Vec::new(),
            streaming: None,
            clock: IdClock::default(),
        };
        log.push_final(Role::Model, welcome.into(), false);
        log
    }

    /// Drops every message and seeds a new welcome message.
    ///
    /// The id clock survives so ids never repeat within the process.
    pub fn reseed(&mut self, welcome: impl Into<String>) {
        self.messages.clear();
        self.streaming = None;
        self.push_final(Role::Model, welcome.into(), false);
    }

    pub fn push_user(&mut self, text: impl Into<String>) -> &Message {
        self.push_final(Role::User, text.into(), false)
    }

    pub fn push_error(&mut self, text: impl Into<String>) -> &Message {
        self.push_final(Role::Model, text.into(), true)
    }

    fn push_final(&mut self, role: Role, text: String, is_error: bool) -> &Message {
        let now = Utc::now();
        let id = self.clock.next(now);
        self.messages.push(Message {
            id: MessageId::Final(id),
            role,
            text,
            created_at: now,
            is_error,
        });
        &self.messages[self.messages.len() - 1]
    }

    /// Upserts the streaming reply with the full text accumulated so far.
    pub fn fold_streaming(&mut self, text: &str) -> Fold {
        match self.streaming {
            Some(index) => {
                let message = &mut self.messages[index];
                message.text.clear();
                message.text.push_str(text);
                Fold::Replaced(index)
            }
            None => {
                self.messages.push(Message {
                    id: MessageId::Streaming,
                    role: Role::Model,
                    text: text.to_string(),
                    created_at: Utc::now(),
                    is_error: false,
                });
                let index = self.messages.len() - 1;
                self.streaming = Some(index);
                Fold::Appended(index)
            }
        }
    }

    /// Swaps the sentinel for a permanent id in place, text untouched.
    ///
    /// Returns `None` when no delta was ever folded.
    pub fn finalize_streaming(&mut self) -> Option<(usize, FinalId)> {
        let index = self.streaming.take()?;
        let id = self.clock.next(Utc::now());
        self.messages[index].id = MessageId::Final(id);
        Some((index, id))
    }

    /// Removes a partially streamed reply. Returns its former index.
    pub fn discard_streaming(&mut self) -> Option<usize> {
        let index = self.streaming.take()?;
        self.messages.remove(index);
        Some(index)
    }

    pub fn streaming(&self) -> Option<&Message> {
        self.streaming.map(|i| &self.messages[i])
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn find(&self, id: FinalId) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| m.id == MessageId::Final(id))
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
