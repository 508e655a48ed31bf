use std::collections::HashMap;

use parking_lot::Mutex;

use crate::session::mode::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Model,
}

impl TurnRole {
    pub fn as_gemini_role(self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Model,
            text: text.into(),
        }
    }
}

/// Per-user chat transcript. Turns are only dropped by `clear`.
#[derive(Default)]
pub struct ConversationHistory {
    turns: Mutex<HashMap<UserId, Vec<Turn>>>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a completed prompt/reply pair.
    pub fn record_exchange(&self, user: UserId, prompt: &str, reply: &str) {
        let mut turns = self.turns.lock();
        let entry = turns.entry(user).or_default();
        entry.push(Turn::user(prompt));
        entry.push(Turn::model(reply));
    }

    /// Returns up to `limit` most recent turns, oldest first. The window
    /// never starts on a model turn.
    pub fn recent(&self, user: UserId, limit: usize) -> Vec<Turn> {
        let turns = self.turns.lock();
        let Some(entry) = turns.get(&user) else {
            return Vec::new();
        };
        let mut start = entry.len().saturating_sub(limit);
        while start < entry.len() && entry[start].role == TurnRole::Model {
            start += 1;
        }
        entry[start..].to_vec()
    }

    #[cfg(test)]
    pub fn len(&self, user: UserId) -> usize {
        self.turns.lock().get(&user).map(Vec::len).unwrap_or(0)
    }

    /// Drops the user's transcript and returns how many turns were removed.
    pub fn clear(&self, user: UserId) -> usize {
        self.turns
            .lock()
            .remove(&user)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }
}
