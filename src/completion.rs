use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::book::Book;
use crate::conversation::{ChatCompletion, CompletionRequest, Role};
use crate::error::CompletionError;
use crate::models::{ChatMessage, ChatRole, LanguageModel, MissingApiKey, ModelRequest};
use crate::settings::{resolve_effective_settings, GlobalConfigDefaults, ModelParams, RequestOverrides, SessionSettings};
use crate::storage::BookRepository;

const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a helpful assistant that writes concise, engaging book summaries for a library catalog system.";

fn chat_system_prompt(book: &Book) -> String {
    let mut prompt = format!(
        "You are a knowledgeable assistant helping a reader with the book \"{}\" by {}. \
         Answer questions about this book clearly and accurately. \
         If you are unsure about a detail, say so instead of inventing it.",
        book.book_name, book.author_name
    );
    if !book.description.trim().is_empty() {
        prompt.push_str(&format!("\n\nCatalog description: {}", book.description.trim()));
    }
    prompt
}

fn summary_prompt(book: &Book) -> String {
    let isbn = if book.isbn.is_empty() { String::new() } else { format!("ISBN: {}", book.isbn) };
    format!(
        "Write a brief, engaging summary (2-3 sentences) for the book \"{name}\" by {author}.\n\n\
         The summary should:\n\
         - Be concise and informative\n\
         - Highlight the main theme or plot\n\
         - Be suitable for a book catalog\n\
         - Be written in a professional tone\n\n\
         Book Title: {name}\n\
         Author: {author}\n\
         {isbn}\n\n\
         Summary:",
        name = book.book_name,
        author = book.author_name,
    )
}

fn model_error(e: anyhow::Error) -> CompletionError {
    if e.downcast_ref::<MissingApiKey>().is_some() {
        CompletionError::MissingApiKey
    } else {
        CompletionError::Model(e.to_string())
    }
}

/// Answers book conversations with a language model, grounding each request
/// in the catalog entry for the book.
pub struct BookChatService {
    books: Arc<dyn BookRepository>,
    model: Arc<dyn LanguageModel>,
    defaults: GlobalConfigDefaults,
}

impl BookChatService {
    pub fn new(books: Arc<dyn BookRepository>, model: Arc<dyn LanguageModel>, defaults: GlobalConfigDefaults) -> Self {
        Self { books, model, defaults }
    }

    async fn load_book(&self, entity_id: &str) -> Result<Book, CompletionError> {
        let unknown = || CompletionError::UnknownBook(entity_id.to_string());
        let id: i64 = entity_id.trim().parse().map_err(|_| unknown())?;
        match self.books.get_book(id).await {
            Ok(Some(book)) => Ok(book),
            Ok(None) => Err(unknown()),
            Err(e) => Err(CompletionError::Transport(e.to_string())),
        }
    }

    pub fn build_messages(book: &Book, req: &CompletionRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(req.conversation_history.len() + 2);
        messages.push(ChatMessage::system(chat_system_prompt(book)));
        messages.extend(req.conversation_history.iter().map(|p| ChatMessage {
            role: match p.role {
                Role::User => ChatRole::User,
                Role::Assistant => ChatRole::Assistant,
            },
            content: p.content.clone(),
        }));
        messages.push(ChatMessage::user(req.message.clone()));
        messages
    }
}

#[async_trait]
impl ChatCompletion for BookChatService {
    async fn complete(&self, req: CompletionRequest) -> Result<String, CompletionError> {
        let book = self.load_book(&req.entity_id).await?;
        let session = req.settings.clone().unwrap_or_default();
        let settings = resolve_effective_settings(&self.defaults, &session, &RequestOverrides::default());
        let model_req = ModelRequest {
            model: settings.model,
            messages: Self::build_messages(&book, &req),
            params: settings.model_params,
        };
        let resp = self.model.generate(model_req).await.map_err(model_error)?;
        let reply = resp.content.trim();
        if reply.is_empty() {
            return Err(CompletionError::EmptyResponse);
        }
        info!(book_id = book.id, model = %resp.model, history = req.conversation_history.len(), "chat reply generated");
        Ok(reply.to_string())
    }
}

/// Short catalog summary for a book. Failures are logged and yield `None`.
pub async fn generate_book_summary(model: &dyn LanguageModel, defaults: &GlobalConfigDefaults, book: &Book) -> Option<String> {
    let overrides = RequestOverrides {
        model: None,
        model_params: Some(ModelParams { temperature: Some(0.7), max_tokens: Some(150), top_p: None }),
    };
    let settings = resolve_effective_settings(defaults, &SessionSettings::default(), &overrides);
    let req = ModelRequest {
        model: settings.model,
        messages: vec![ChatMessage::system(SUMMARY_SYSTEM_PROMPT), ChatMessage::user(summary_prompt(book))],
        params: settings.model_params,
    };
    match model.generate(req).await {
        Ok(resp) if !resp.content.trim().is_empty() => {
            info!(book = %book.book_name, "generated summary");
            Some(resp.content.trim().to_string())
        }
        Ok(_) => {
            error!(book = %book.book_name, "summary generation returned nothing");
            None
        }
        Err(e) => {
            error!(book = %book.book_name, error = %e, "error generating book summary");
            None
        }
    }
}
