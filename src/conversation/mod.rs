//! Per-book conversation sessions and the collaborators they depend on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::book::Book;
use crate::error::{CompletionError, LookupError};
use crate::settings::SessionSettings;

pub mod session;
pub mod transcript;

pub use session::{ConversationSession, RejectReason, SendOutcome, SessionSnapshot, SessionStatus};
pub use transcript::{HistoryEntry, HistoryPair, Message, Role};

/// Resolves a book identifier to the book a conversation is about.
#[async_trait]
pub trait EntityLookup: Send + Sync {
    async fn lookup(&self, id: &str) -> Result<Book, LookupError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub entity_id: String,
    pub message: String,
    #[serde(default)]
    pub conversation_history: Vec<HistoryPair>,
    /// Model choice of the conversation this message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<SessionSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CompletionResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompletionResponse {
    pub fn reply(text: impl Into<String>) -> Self {
        Self { success: true, response: Some(text.into()), error: None }
    }

    pub fn failure(err: &CompletionError) -> Self {
        Self { success: false, response: None, error: Some(err.to_string()) }
    }

    /// Collapses the wire shape into the reply text, treating an empty or
    /// missing reply the same as a reported failure.
    pub fn into_reply(self) -> Result<String, CompletionError> {
        if !self.success {
            return Err(CompletionError::Unsuccessful);
        }
        match self.response.map(|r| r.trim().to_string()) {
            Some(r) if !r.is_empty() => Ok(r),
            _ => Err(CompletionError::EmptyResponse),
        }
    }
}

/// Produces the assistant's reply for one message in a book conversation.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn complete(&self, req: CompletionRequest) -> Result<String, CompletionError>;
}
