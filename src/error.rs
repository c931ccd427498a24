use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

/// Failures that leave a conversation session unusable for its book.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("book {id} not found")]
    EntityNotFound { id: String },
    #[error("book {id} lookup failed: {reason}")]
    EntityLookupFailed { id: String, reason: String },
}

/// What an entity lookup collaborator can report back.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("not found")]
    NotFound,
    #[error("lookup failed: {0}")]
    Failed(String),
}

impl SessionError {
    pub fn from_lookup(id: &str, err: LookupError) -> Self {
        match err {
            LookupError::NotFound => SessionError::EntityNotFound { id: id.to_string() },
            LookupError::Failed(reason) => SessionError::EntityLookupFailed { id: id.to_string(), reason },
        }
    }
}

/// Chat completion failures. The session never propagates these; each one
/// becomes a fallback assistant message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompletionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("completion endpoint returned status {0}")]
    Status(u16),
    #[error("malformed completion response: {0}")]
    Malformed(String),
    #[error("completion endpoint reported failure")]
    Unsuccessful,
    #[error("completion carried no reply")]
    EmptyResponse,
    #[error("unknown book: {0}")]
    UnknownBook(String),
    #[error("no API key configured for the language model")]
    MissingApiKey,
    #[error("language model error: {0}")]
    Model(String),
}

impl CompletionError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CompletionError::Transport(_) => "transport",
            CompletionError::Status(_) => "status",
            CompletionError::Malformed(_) => "malformed",
            CompletionError::Unsuccessful => "unsuccessful",
            CompletionError::EmptyResponse => "empty",
            CompletionError::UnknownBook(_) => "unknown_book",
            CompletionError::MissingApiKey => "missing_api_key",
            CompletionError::Model(_) => "model",
        }
    }
}

impl From<reqwest::Error> for CompletionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            CompletionError::Malformed(e.to_string())
        } else if let Some(status) = e.status() {
            CompletionError::Status(status.as_u16())
        } else {
            CompletionError::Transport(e.to_string())
        }
    }
}

/// Field-keyed validation messages, serialized as `{"isbn": ["..."]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(pub BTreeMap<&'static str, Vec<String>>);

impl ValidationErrors {
    pub fn add(&mut self, field: &'static str, message: impl Into<String>) {
        self.0.entry(field).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}: {}", k, v.join(", "))).collect();
        write!(f, "{}", parts.join("; "))
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("invalid book: {0}")]
    Validation(ValidationErrors),
    #[error("a book with ISBN {0} already exists")]
    DuplicateIsbn(String),
    #[error("invalid page {0}")]
    InvalidPage(u32),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}
