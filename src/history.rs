//! Bounded conversation history.
//!
//! The history is trimmed after every turn so repeated turns never outgrow
//! the model's context.  Trimming drops the oldest messages first, but only
//! ever cuts in front of a user message.  That keeps an assistant message's
//! tool calls together with the tool results that answer them.

use crate::types::{Message, MessageRole};

/// Default number of messages kept between turns.
pub const DEFAULT_HISTORY_LIMIT: usize = 30;

/// An ordered, bounded log of conversation messages.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationHistory {
    messages: Vec<Message>,
    limit: usize,
}

impl ConversationHistory {
    /// Create an empty history holding at most `limit` messages.
    pub fn new(limit: usize) -> Self {
        Self {
            messages: Vec::new(),
            limit: limit.max(1),
        }
    }

    /// The maximum number of messages kept.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Change the limit; takes effect at the next trim.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.max(1);
    }

    /// The messages, oldest first.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages held.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true if no messages are held.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop every message.
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Append the messages of one completed turn, then trim.
    pub fn commit_turn(&mut self, turn: impl IntoIterator<Item = Message>) {
        self.messages.extend(turn);
        self.trim();
    }

    /// Trim to the limit, oldest messages first.
    ///
    /// The cut lands on the earliest user message that leaves at most
    /// `limit` messages.  When a single turn is longer than the limit, the
    /// cut falls on the earliest message that is not a tool result instead.
    pub fn trim(&mut self) {
        let len = self.messages.len();
        if len <= self.limit {
            return;
        }
        let earliest = len - self.limit;
        let cut = self
            .first_boundary(earliest, |message| message.role == MessageRole::User)
            .or_else(|| self.first_boundary(earliest, |message| message.role != MessageRole::Tool))
            .unwrap_or(len);
        self.messages.drain(..cut);
    }

    fn first_boundary(&self, from: usize, is_boundary: impl Fn(&Message) -> bool) -> Option<usize> {
        self.messages[from..]
            .iter()
            .position(is_boundary)
            .map(|offset| from + offset)
    }
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}
