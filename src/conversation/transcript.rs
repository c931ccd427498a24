use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Assistant text appended whenever a completion fails or comes back empty.
pub const FALLBACK_REPLY: &str = "Sorry, I encountered an error. Please try again.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Set on assistant messages standing in for a failed exchange.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), timestamp: Utc::now(), fallback: false }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), timestamp: Utc::now(), fallback: false }
    }

    pub fn fallback() -> Self {
        Self { role: Role::Assistant, content: FALLBACK_REPLY.to_string(), timestamp: Utc::now(), fallback: true }
    }
}

/// One successful question/answer exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub question: String,
    pub answer: String,
}

/// `{role, content}` item sent to the chat completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryPair {
    pub role: Role,
    pub content: String,
}

pub fn seed_prompt(title: &str, author: &str) -> String {
    format!("Write me a description in about 5-10 lines for the book name '{title}' & book author name '{author}'")
}

pub fn outbound_history(transcript: &[Message]) -> Vec<HistoryPair> {
    transcript
        .iter()
        .map(|m| HistoryPair { role: m.role, content: m.content.clone() })
        .collect()
}

/// Pairs every non-fallback assistant message with the user message right
/// before it. Sends are serialized, so that user message is its question.
pub fn derive_history(transcript: &[Message]) -> Vec<HistoryEntry> {
    let mut out = Vec::new();
    let mut last_question: Option<&str> = None;
    for m in transcript {
        match m.role {
            Role::User => last_question = Some(&m.content),
            Role::Assistant => {
                if let (false, Some(q)) = (m.fallback, last_question.take()) {
                    out.push(HistoryEntry { question: q.to_string(), answer: m.content.clone() });
                }
            }
        }
    }
    out
}
