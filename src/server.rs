use axum::{extract::{Path, Query, State}, routing::{get, patch, post}, Json, Router};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::book::{Book, NewBook};
use crate::completion::{generate_book_summary, BookChatService};
use crate::conversation::{ChatCompletion, CompletionRequest, CompletionResponse, ConversationSession, EntityLookup, RejectReason, SendOutcome, SessionSnapshot};
use crate::error::{CatalogError, SessionError};
use crate::models::LanguageModel;
use crate::settings::{GlobalConfigDefaults, SessionSettings, SessionSettingsPatch};
use crate::storage::{BookRepository, SqliteBookRepository};

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn catalog_error(e: CatalogError) -> ApiError {
    match e {
        CatalogError::Validation(errors) => (StatusCode::BAD_REQUEST, Json(json!(errors))),
        CatalogError::DuplicateIsbn(_) => api_error(StatusCode::CONFLICT, e.to_string()),
        CatalogError::InvalidPage(_) => (StatusCode::NOT_FOUND, Json(json!({ "detail": "Invalid page." }))),
        other => {
            warn!(error = %other, "catalog error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": other.to_string(), "detail": "Error fetching books. Please ensure database migrations are run." })),
            )
        }
    }
}

/// A server-hosted conversation: the session plus who opened it.
pub struct Conversation {
    pub id: Uuid,
    pub client_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub session: Arc<ConversationSession>,
}

#[derive(Clone)]
pub struct AppState {
    pub books: Arc<dyn BookRepository>,
    pub lookup: Arc<dyn EntityLookup>,
    pub completion: Arc<dyn ChatCompletion>,
    pub model: Arc<dyn LanguageModel>,
    pub defaults: GlobalConfigDefaults,
    pub conversations: Arc<RwLock<Vec<Conversation>>>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(repo: SqliteBookRepository, model: Arc<dyn LanguageModel>, defaults: GlobalConfigDefaults) -> Self {
        let repo = Arc::new(repo);
        let completion = Arc::new(BookChatService::new(repo.clone(), model.clone(), defaults.clone()));
        Self {
            books: repo.clone(),
            lookup: repo,
            completion,
            model,
            defaults,
            conversations: Arc::default(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    async fn session(&self, id: Uuid) -> Result<Arc<ConversationSession>, ApiError> {
        let conversations = self.conversations.read().await;
        conversations
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.session.clone())
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "conversation not found"))
    }

    async fn view(&self, id: Uuid) -> Result<ConversationView, ApiError> {
        let conversations = self.conversations.read().await;
        conversations
            .iter()
            .find(|c| c.id == id)
            .map(ConversationView::of)
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "conversation not found"))
    }
}

#[derive(Debug, Serialize)]
pub struct ConversationView {
    pub id: Uuid,
    pub client_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settings: SessionSettings,
    #[serde(flatten)]
    pub snapshot: SessionSnapshot,
}

impl ConversationView {
    fn of(c: &Conversation) -> Self {
        Self {
            id: c.id,
            client_id: c.client_id.clone(),
            created_at: c.created_at,
            settings: c.session.settings(),
            snapshot: c.session.snapshot(),
        }
    }
}

// The seed is claimed before returning so it is always the first exchange;
// only the model round-trip runs in the background.
fn spawn_auto_seed(session: &Arc<ConversationSession>) {
    match session.clone().start_auto_seed() {
        Ok(seed) => {
            let book_id = session.book_id().to_string();
            tokio::spawn(async move {
                let outcome = seed.await;
                info!(%book_id, ?outcome, "auto-seed finished");
            });
        }
        Err(reason) => debug!(book_id = %session.book_id(), ?reason, "auto-seed not started"),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
pub struct AddBookBody {
    #[serde(flatten)]
    pub book: NewBook,
    #[serde(default)]
    pub generate_summary: bool,
}

async fn add_book(
    State(state): State<AppState>,
    Json(body): Json<AddBookBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mut book = body.book.validate().map_err(|e| catalog_error(CatalogError::Validation(e)))?;
    if body.generate_summary && book.description.is_empty() {
        let draft = book.clone().into_book(0);
        if let Some(summary) = generate_book_summary(state.model.as_ref(), &state.defaults, &draft).await {
            book.description = summary;
        }
    }
    let book = state.books.add_book(book).await.map_err(catalog_error)?;
    info!(book_id = book.id, isbn = %book.isbn, "book added");
    Ok((StatusCode::CREATED, Json(json!({ "message": "Book added successfully", "book": book }))))
}

#[derive(Debug, Deserialize)]
pub struct GenerateSummaryBody {
    #[serde(default)]
    pub book_name: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub isbn: Option<String>,
}

/// Drafts a description for a book that is not saved yet, so it can be
/// reviewed before `POST /api/books`.
async fn generate_summary(
    State(state): State<AppState>,
    Json(body): Json<GenerateSummaryBody>,
) -> (StatusCode, Json<Value>) {
    let book_name = body.book_name.trim();
    let author_name = body.author_name.trim();
    if book_name.is_empty() || author_name.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "book_name and author_name are required" })),
        );
    }
    let draft = Book {
        id: 0,
        book_name: book_name.to_string(),
        author_name: author_name.to_string(),
        isbn: body.isbn.as_deref().map(str::trim).unwrap_or_default().to_string(),
        price: 0.0,
        quantity: 0,
        description: String::new(),
    };
    match generate_book_summary(state.model.as_ref(), &state.defaults, &draft).await {
        Some(summary) => (StatusCode::OK, Json(json!({ "success": true, "summary": summary }))),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "success": false,
                "error": "Failed to generate summary. Please check if GROQ_API_KEY is configured."
            })),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListBooksQuery {
    pub page: Option<u32>,
}

async fn list_books(
    State(state): State<AppState>,
    Query(q): Query<ListBooksQuery>,
) -> Result<Json<Value>, ApiError> {
    let page = state.books.list_books(q.page.unwrap_or(1)).await.map_err(catalog_error)?;
    Ok(Json(json!(page)))
}

async fn get_book(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    match state.books.get_book(id).await.map_err(catalog_error)? {
        Some(book) => Ok(Json(json!(book))),
        None => Err(api_error(StatusCode::NOT_FOUND, "book not found")),
    }
}

async fn chat(
    State(state): State<AppState>,
    Json(req): Json<CompletionRequest>,
) -> Json<CompletionResponse> {
    match state.completion.complete(req).await {
        Ok(reply) => Json(CompletionResponse::reply(reply)),
        Err(e) => {
            warn!(error = %e, "chat completion failed");
            Json(CompletionResponse::failure(&e))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationBody {
    pub book_id: String,
    pub client_id: Option<String>,
    pub settings: Option<SessionSettings>,
}

async fn create_conversation(
    State(state): State<AppState>,
    Json(body): Json<CreateConversationBody>,
) -> Result<(StatusCode, Json<ConversationView>), ApiError> {
    let book_id = body.book_id.trim().to_string();
    if book_id.is_empty() {
        return Err(api_error(StatusCode::UNPROCESSABLE_ENTITY, "book_id must not be empty"));
    }
    let session = ConversationSession::new(book_id, state.lookup.clone(), state.completion.clone())
        .with_settings(body.settings.unwrap_or_default());
    let session = Arc::new(session);
    match session.resolve().await {
        Ok(_) => {}
        Err(e @ SessionError::EntityNotFound { .. }) => return Err(api_error(StatusCode::NOT_FOUND, e.to_string())),
        Err(e) => return Err(api_error(StatusCode::BAD_GATEWAY, e.to_string())),
    }
    spawn_auto_seed(&session);

    let conversation = Conversation {
        id: Uuid::new_v4(),
        client_id: body.client_id,
        created_at: Utc::now(),
        session,
    };
    let view = ConversationView::of(&conversation);
    state.conversations.write().await.push(conversation);
    metrics::counter!("bookchat_sessions_created_total").increment(1);
    info!(conversation = %view.id, book_id = %view.snapshot.book_id, "conversation opened");
    Ok((StatusCode::CREATED, Json(view)))
}

#[derive(Debug, Serialize)]
pub struct ListConversationsResponse {
    pub conversations: Vec<Uuid>,
}

async fn list_conversations(State(state): State<AppState>) -> Json<ListConversationsResponse> {
    let conversations = state.conversations.read().await;
    Json(ListConversationsResponse { conversations: conversations.iter().map(|c| c.id).collect() })
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ConversationView>, ApiError> {
    state.view(id).await.map(Json)
}

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    pub text: String,
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<ConversationView>, ApiError> {
    let session = state.session(id).await?;
    match session.send(&body.text).await {
        SendOutcome::Rejected(RejectReason::EmptyMessage) => {
            Err(api_error(StatusCode::UNPROCESSABLE_ENTITY, "message must not be empty"))
        }
        SendOutcome::Rejected(reason) => Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": "message not sent", "reason": reason })),
        )),
        SendOutcome::Replied | SendOutcome::Failed(_) | SendOutcome::Discarded => state.view(id).await.map(Json),
    }
}

async fn reset_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ConversationView>, ApiError> {
    let session = state.session(id).await?;
    session.reset();
    spawn_auto_seed(&session);
    state.view(id).await.map(Json)
}

async fn patch_conversation_settings(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<SessionSettingsPatch>,
) -> Result<Json<SessionSettings>, ApiError> {
    let session = state.session(id).await?;
    Ok(Json(session.update_settings(patch)))
}

async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> StatusCode {
    let mut conversations = state.conversations.write().await;
    let before = conversations.len();
    conversations.retain(|c| c.id != id);
    if conversations.len() < before { StatusCode::NO_CONTENT } else { StatusCode::NOT_FOUND }
}

async fn render_metrics(State(state): State<AppState>) -> Result<String, StatusCode> {
    state.metrics.as_ref().map(|h| h.render()).ok_or(StatusCode::NOT_FOUND)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .route("/api/books", post(add_book).get(list_books))
        .route("/api/books/:id", get(get_book))
        .route("/api/generate-summary", post(generate_summary))
        .route("/api/chat", post(chat))
        .route("/v1/conversations", post(create_conversation).get(list_conversations))
        .route("/v1/conversations/:id", get(get_conversation).delete(delete_conversation))
        .route("/v1/conversations/:id/messages", post(send_message))
        .route("/v1/conversations/:id/reset", post(reset_conversation))
        .route("/v1/conversations/:id/settings", patch(patch_conversation_settings))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
    }
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}
