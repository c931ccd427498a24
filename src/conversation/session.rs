use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::transcript::{derive_history, outbound_history, seed_prompt, HistoryEntry, Message};
use super::{ChatCompletion, CompletionRequest, EntityLookup};
use crate::book::Book;
use crate::error::{CompletionError, SessionError};
use crate::settings::{SessionSettings, SessionSettingsPatch};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Uninitialized,
    Resolving,
    Idle,
    AwaitingReply,
    Unavailable,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    EmptyMessage,
    Pending,
    NotReady,
    /// Auto-seed already issued, or the conversation is not empty.
    NotEligible,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Replied,
    /// Recovered locally: the fallback message is in the transcript.
    Failed(CompletionError),
    /// The conversation was reset while the request was in flight.
    Discarded,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub book_id: String,
    pub book: Option<Book>,
    pub status: SessionStatus,
    pub pending: bool,
    pub transcript: Vec<Message>,
    pub history: Vec<HistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct SessionState {
    resolving: bool,
    transcript: Vec<Message>,
    pending: bool,
    seeded: bool,
    /// Bumped by every reset; replies tagged with an older value are dropped.
    generation: u64,
    settings: SessionSettings,
}

/// One conversation about one book.
///
/// The transcript is the only stored conversation state; the Q&A history is
/// derived from it on read. At most one completion request is outstanding at
/// a time: `pending` is checked and set under the same lock that appends the
/// user message, and released by a guard on every exit path.
pub struct ConversationSession {
    book_id: String,
    lookup: Arc<dyn EntityLookup>,
    completion: Arc<dyn ChatCompletion>,
    entity: OnceCell<Result<Book, SessionError>>,
    state: Mutex<SessionState>,
}

impl ConversationSession {
    pub fn new(book_id: impl Into<String>, lookup: Arc<dyn EntityLookup>, completion: Arc<dyn ChatCompletion>) -> Self {
        Self {
            book_id: book_id.into(),
            lookup,
            completion,
            entity: OnceCell::new(),
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn with_settings(self, settings: SessionSettings) -> Self {
        self.lock().settings = settings;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn book_id(&self) -> &str {
        &self.book_id
    }

    /// Looks the book up once. Later calls, including concurrent ones,
    /// observe the first outcome.
    pub async fn resolve(&self) -> Result<Book, SessionError> {
        let outcome = self
            .entity
            .get_or_init(|| async {
                self.lock().resolving = true;
                debug!(book_id = %self.book_id, "resolving book");
                let res = self
                    .lookup
                    .lookup(&self.book_id)
                    .await
                    .map_err(|e| SessionError::from_lookup(&self.book_id, e));
                self.lock().resolving = false;
                match &res {
                    Ok(book) => info!(book_id = %self.book_id, title = %book.book_name, "book resolved"),
                    Err(e) => warn!(book_id = %self.book_id, error = %e, "session unavailable"),
                }
                res
            })
            .await;
        outcome.clone()
    }

    /// Resolves the book, then issues the auto-seed exchange.
    pub async fn initialize(&self) -> Result<SendOutcome, SessionError> {
        self.resolve().await?;
        Ok(self.auto_seed().await)
    }

    /// Sends the synthesized first message if this conversation has not been
    /// seeded yet, the transcript is empty and the book is known.
    pub async fn auto_seed(&self) -> SendOutcome {
        match self.claim_seed(self) {
            Ok((guard, req)) => self.exchange(guard, req).await,
            Err(reason) => SendOutcome::Rejected(reason),
        }
    }

    /// Claims the seed exchange right away and returns the remaining request
    /// as a detached future. Once this returns, the seed message is in the
    /// transcript and `pending` is set, so no other send can go first.
    /// Dropping the future without running it releases `pending`.
    pub fn start_auto_seed(
        self: Arc<Self>,
    ) -> Result<impl Future<Output = SendOutcome> + Send + 'static, RejectReason> {
        let (guard, req) = self.claim_seed(Arc::clone(&self))?;
        Ok(async move { self.exchange(guard, req).await })
    }

    fn claim_seed<S>(&self, handle: S) -> Result<(PendingGuard<S>, CompletionRequest), RejectReason>
    where
        S: Deref<Target = ConversationSession>,
    {
        let book = self.book().ok_or(RejectReason::NotReady)?;
        let prompt = seed_prompt(&book.book_name, &book.author_name);
        let mut st = self.lock();
        if st.seeded || st.pending || !st.transcript.is_empty() {
            return Err(RejectReason::NotEligible);
        }
        st.seeded = true;
        let (guard, req) = self.begin(&mut st, prompt, handle);
        info!(book_id = %self.book_id, generation = guard.generation, "auto-seeding conversation");
        Ok((guard, req))
    }

    /// Sends a user message. Empty input, an outstanding request, or an
    /// unresolved book make this a no-op.
    pub async fn send(&self, text: &str) -> SendOutcome {
        let text = text.trim();
        if text.is_empty() {
            return SendOutcome::Rejected(RejectReason::EmptyMessage);
        }
        if self.book().is_none() {
            return SendOutcome::Rejected(RejectReason::NotReady);
        }
        let (guard, req) = {
            let mut st = self.lock();
            if st.pending {
                debug!(book_id = %self.book_id, "send rejected: request in flight");
                return SendOutcome::Rejected(RejectReason::Pending);
            }
            self.begin(&mut st, text.to_string(), self)
        };
        self.exchange(guard, req).await
    }

    /// Clears the conversation and re-arms the auto-seed. The book is kept.
    pub fn reset(&self) {
        let mut st = self.lock();
        st.transcript.clear();
        st.pending = false;
        st.seeded = false;
        st.generation += 1;
        info!(book_id = %self.book_id, generation = st.generation, "conversation reset");
    }

    // Caller holds the lock, so the user message, the pending flag and the
    // history snapshot change together.
    fn begin<S>(&self, st: &mut SessionState, text: String, handle: S) -> (PendingGuard<S>, CompletionRequest)
    where
        S: Deref<Target = ConversationSession>,
    {
        let conversation_history = outbound_history(&st.transcript);
        st.transcript.push(Message::user(text.clone()));
        st.pending = true;
        let guard = PendingGuard { session: handle, generation: st.generation, armed: true };
        let req = CompletionRequest {
            entity_id: self.book_id.clone(),
            message: text,
            conversation_history,
            settings: st.settings.model_layer(),
        };
        (guard, req)
    }

    async fn exchange<S>(&self, guard: PendingGuard<S>, req: CompletionRequest) -> SendOutcome
    where
        S: Deref<Target = ConversationSession>,
    {
        let result = self.completion.complete(req).await;

        let mut st = self.lock();
        if st.generation != guard.generation {
            debug!(book_id = %self.book_id, generation = guard.generation, "dropping reply from before reset");
            metrics::counter!("bookchat_completion_requests_total", "outcome" => "discarded").increment(1);
            guard.disarm(&mut st);
            return SendOutcome::Discarded;
        }
        let outcome = match result {
            Ok(reply) if !reply.trim().is_empty() => {
                st.transcript.push(Message::assistant(reply.trim()));
                SendOutcome::Replied
            }
            Ok(_) => {
                st.transcript.push(Message::fallback());
                SendOutcome::Failed(CompletionError::EmptyResponse)
            }
            Err(e) => {
                warn!(book_id = %self.book_id, error = %e, "completion failed");
                st.transcript.push(Message::fallback());
                SendOutcome::Failed(e)
            }
        };
        let label = match &outcome {
            SendOutcome::Failed(e) => e.kind(),
            _ => "replied",
        };
        metrics::counter!("bookchat_completion_requests_total", "outcome" => label).increment(1);
        guard.disarm(&mut st);
        outcome
    }

    pub fn book(&self) -> Option<&Book> {
        self.entity.get().and_then(|r| r.as_ref().ok())
    }

    pub fn error(&self) -> Option<&SessionError> {
        self.entity.get().and_then(|r| r.as_ref().err())
    }

    pub fn is_unavailable(&self) -> bool {
        self.error().is_some()
    }

    pub fn settings(&self) -> SessionSettings {
        self.lock().settings.clone()
    }

    /// Takes effect from the next request; one already in flight keeps the
    /// settings it was sent with.
    pub fn update_settings(&self, patch: SessionSettingsPatch) -> SessionSettings {
        let mut st = self.lock();
        st.settings.apply_patch(patch);
        st.settings.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.lock().pending
    }

    pub fn transcript(&self) -> Vec<Message> {
        self.lock().transcript.clone()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        derive_history(&self.lock().transcript)
    }

    pub fn status(&self) -> SessionStatus {
        let st = self.lock();
        self.status_of(&st)
    }

    fn status_of(&self, st: &SessionState) -> SessionStatus {
        match self.entity.get() {
            Some(Err(_)) => SessionStatus::Unavailable,
            Some(Ok(_)) if st.pending => SessionStatus::AwaitingReply,
            Some(Ok(_)) => SessionStatus::Idle,
            None if st.resolving => SessionStatus::Resolving,
            None => SessionStatus::Uninitialized,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let st = self.lock();
        SessionSnapshot {
            book_id: self.book_id.clone(),
            book: self.book().cloned(),
            status: self.status_of(&st),
            pending: st.pending,
            transcript: st.transcript.clone(),
            history: derive_history(&st.transcript),
            error: self.error().map(|e| e.to_string()),
        }
    }

    /// Number of assistant messages, successful or not.
    #[cfg(test)]
    pub fn assistant_count(&self) -> usize {
        use super::transcript::Role;

        self.lock().transcript.iter().filter(|m| m.role == Role::Assistant).count()
    }
}

/// Holds `pending` for one exchange. Dropping the send future mid-request
/// releases it too; a reset in between means the flag now belongs to a newer
/// conversation and is left alone.
struct PendingGuard<S: Deref<Target = ConversationSession>> {
    session: S,
    generation: u64,
    armed: bool,
}

impl<S: Deref<Target = ConversationSession>> PendingGuard<S> {
    fn disarm(mut self, st: &mut SessionState) {
        if st.generation == self.generation {
            st.pending = false;
        }
        self.armed = false;
    }
}

impl<S: Deref<Target = ConversationSession>> Drop for PendingGuard<S> {
    fn drop(&mut self) {
        if self.armed {
            let mut st = self.session.lock();
            if st.generation == self.generation {
                st.pending = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;
    use crate::error::LookupError;
    use crate::settings::ModelParams;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    const SEED: &str = "Write me a description in about 5-10 lines for the book name 'Dune' & book author name 'Frank Herbert'";

    fn dune() -> Book {
        Book {
            id: 42,
            book_name: "Dune".into(),
            author_name: "Frank Herbert".into(),
            isbn: "9780441172719".into(),
            price: 9.99,
            quantity: 1,
            description: String::new(),
        }
    }

    struct FakeLookup {
        result: Result<Book, LookupError>,
        calls: AtomicUsize,
    }

    impl FakeLookup {
        fn found() -> Arc<Self> {
            Arc::new(Self { result: Ok(dune()), calls: AtomicUsize::new(0) })
        }
        fn failing(err: LookupError) -> Arc<Self> {
            Arc::new(Self { result: Err(err), calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl EntityLookup for FakeLookup {
        async fn lookup(&self, _id: &str) -> Result<Book, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    #[derive(Default)]
    struct ScriptedCompletion {
        replies: Mutex<VecDeque<Result<String, CompletionError>>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedCompletion {
        fn new(replies: Vec<Result<String, CompletionError>>) -> Arc<Self> {
            Arc::new(Self { replies: Mutex::new(replies.into()), requests: Mutex::default() })
        }
        fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatCompletion for ScriptedCompletion {
        async fn complete(&self, req: CompletionRequest) -> Result<String, CompletionError> {
            self.requests.lock().unwrap().push(req);
            self.replies.lock().unwrap().pop_front().unwrap_or_else(|| Ok("more".into()))
        }
    }

    /// Blocks every request until the test releases it.
    #[derive(Default)]
    struct GatedCompletion {
        gate: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatCompletion for GatedCompletion {
        async fn complete(&self, req: CompletionRequest) -> Result<String, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(format!("re: {}", req.message))
        }
    }

    async fn wait_for_calls(c: &GatedCompletion, n: usize) {
        while c.calls.load(Ordering::SeqCst) < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn initialize_seeds_first_exchange() {
        let completion = ScriptedCompletion::new(vec![Ok("A desert planet saga...".into())]);
        let session = ConversationSession::new("42", FakeLookup::found(), completion.clone());

        let outcome = session.initialize().await.unwrap();
        assert_eq!(outcome, SendOutcome::Replied);

        let transcript = session.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].role, Role::User);
        assert_eq!(transcript[0].content, SEED);
        assert_eq!(transcript[1].role, Role::Assistant);
        assert_eq!(transcript[1].content, "A desert planet saga...");
        assert_eq!(
            session.history(),
            vec![HistoryEntry { question: SEED.into(), answer: "A desert planet saga...".into() }]
        );

        let reqs = completion.requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].entity_id, "42");
        assert!(reqs[0].conversation_history.is_empty());
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn failed_send_appends_fallback_but_no_history() {
        let completion = ScriptedCompletion::new(vec![
            Ok("A desert planet saga...".into()),
            Err(CompletionError::Transport("connection refused".into())),
        ]);
        let session = ConversationSession::new("42", FakeLookup::found(), completion);
        session.initialize().await.unwrap();

        let outcome = session.send("Tell me more").await;
        assert!(matches!(outcome, SendOutcome::Failed(CompletionError::Transport(_))));

        let transcript = session.transcript();
        assert_eq!(transcript.len(), 4);
        assert_eq!(transcript[2].content, "Tell me more");
        assert_eq!(transcript[3].content, "Sorry, I encountered an error. Please try again.");
        assert!(transcript[3].fallback);
        assert_eq!(session.history().len(), 1);
        assert!(!session.is_pending());

        // still usable afterwards
        assert_eq!(session.send("again").await, SendOutcome::Replied);
        assert_eq!(session.history().len(), 2);
    }

    #[tokio::test]
    async fn blank_reply_counts_as_failure() {
        let completion = ScriptedCompletion::new(vec![Ok("   ".into())]);
        let session = ConversationSession::new("42", FakeLookup::found(), completion);
        let outcome = session.initialize().await.unwrap();
        assert_eq!(outcome, SendOutcome::Failed(CompletionError::EmptyResponse));
        assert!(session.history().is_empty());
        assert_eq!(session.assistant_count(), 1);
    }

    #[tokio::test]
    async fn empty_send_is_a_noop() {
        let completion = ScriptedCompletion::new(vec![]);
        let session = ConversationSession::new("42", FakeLookup::found(), completion.clone());
        session.resolve().await.unwrap();

        assert_eq!(session.send("").await, SendOutcome::Rejected(RejectReason::EmptyMessage));
        assert_eq!(session.send("  \n").await, SendOutcome::Rejected(RejectReason::EmptyMessage));
        assert!(session.transcript().is_empty());
        assert!(completion.requests().is_empty());
        assert!(!session.is_pending());
    }

    #[tokio::test]
    async fn send_while_pending_is_rejected() {
        let completion = Arc::new(GatedCompletion::default());
        let session = Arc::new(ConversationSession::new("42", FakeLookup::found(), completion.clone()));
        session.resolve().await.unwrap();

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.send("first").await }
        });
        wait_for_calls(&completion, 1).await;
        assert!(session.is_pending());
        assert_eq!(session.status(), SessionStatus::AwaitingReply);

        assert_eq!(session.send("ok").await, SendOutcome::Rejected(RejectReason::Pending));
        assert_eq!(completion.calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.transcript().len(), 1);

        completion.gate.notify_one();
        assert_eq!(first.await.unwrap(), SendOutcome::Replied);
        assert!(!session.is_pending());
        assert_eq!(session.transcript()[1].content, "re: first");
    }

    #[tokio::test]
    async fn concurrent_sends_dispatch_one_request() {
        let completion = Arc::new(GatedCompletion::default());
        let session = ConversationSession::new("42", FakeLookup::found(), completion.clone());
        session.resolve().await.unwrap();

        let release = async {
            wait_for_calls(&completion, 1).await;
            completion.gate.notify_one();
        };
        let (a, b, ()) = tokio::join!(session.send("one"), session.send("two"), release);

        assert_eq!(a, SendOutcome::Replied);
        assert_eq!(b, SendOutcome::Rejected(RejectReason::Pending));
        assert_eq!(completion.calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.transcript().len(), 2);
    }

    #[tokio::test]
    async fn reset_clears_and_rearms_seed() {
        let completion = ScriptedCompletion::new(vec![Ok("saga".into()), Ok("more".into()), Ok("saga again".into())]);
        let session = ConversationSession::new("42", FakeLookup::found(), completion.clone());
        session.initialize().await.unwrap();
        session.send("Tell me more").await;
        assert_eq!(session.history().len(), 2);

        session.reset();
        assert!(session.transcript().is_empty());
        assert!(session.history().is_empty());
        assert!(!session.is_pending());

        assert_eq!(session.auto_seed().await, SendOutcome::Replied);
        let transcript = session.transcript();
        assert_eq!(transcript[0].content, SEED);
        assert_eq!(transcript[1].content, "saga again");
        assert_eq!(completion.requests().len(), 3);
        assert!(completion.requests()[2].conversation_history.is_empty());
    }

    #[tokio::test]
    async fn auto_seed_fires_once() {
        let completion = ScriptedCompletion::new(vec![Err(CompletionError::Status(500))]);
        let session = ConversationSession::new("42", FakeLookup::found(), completion.clone());
        session.initialize().await.unwrap();

        // transcript is not empty and the seed already went out
        assert_eq!(session.auto_seed().await, SendOutcome::Rejected(RejectReason::NotEligible));
        assert_eq!(completion.requests().len(), 1);
    }

    #[tokio::test]
    async fn auto_seed_while_seed_in_flight_is_not_eligible() {
        let completion = Arc::new(GatedCompletion::default());
        let session = Arc::new(ConversationSession::new("42", FakeLookup::found(), completion.clone()));
        session.resolve().await.unwrap();

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.auto_seed().await }
        });
        wait_for_calls(&completion, 1).await;
        assert_eq!(session.auto_seed().await, SendOutcome::Rejected(RejectReason::NotEligible));
        assert_eq!(completion.calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.transcript().len(), 1);

        completion.gate.notify_one();
        assert_eq!(first.await.unwrap(), SendOutcome::Replied);
        assert_eq!(session.auto_seed().await, SendOutcome::Rejected(RejectReason::NotEligible));
        assert_eq!(completion.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn started_seed_goes_before_any_user_message() {
        let completion = ScriptedCompletion::new(vec![Ok("saga".into())]);
        let session = Arc::new(ConversationSession::new("42", FakeLookup::found(), completion.clone()));
        session.resolve().await.unwrap();

        let seed = session.clone().start_auto_seed().unwrap();
        assert!(session.is_pending());
        assert_eq!(session.transcript()[0].content, SEED);
        assert_eq!(session.send("Hello").await, SendOutcome::Rejected(RejectReason::Pending));
        assert_eq!(session.clone().start_auto_seed().err(), Some(RejectReason::NotEligible));

        assert_eq!(tokio::spawn(seed).await.unwrap(), SendOutcome::Replied);
        assert_eq!(session.history()[0].question, SEED);
        assert_eq!(completion.requests().len(), 1);
    }

    #[tokio::test]
    async fn dropped_seed_future_releases_pending() {
        let completion = ScriptedCompletion::new(vec![]);
        let session = Arc::new(ConversationSession::new("42", FakeLookup::found(), completion.clone()));
        assert_eq!(session.clone().start_auto_seed().err(), Some(RejectReason::NotReady));
        session.resolve().await.unwrap();

        drop(session.clone().start_auto_seed().unwrap());
        assert!(!session.is_pending());
        assert!(completion.requests().is_empty());
        assert_eq!(session.send("Hello").await, SendOutcome::Replied);
    }

    #[tokio::test]
    async fn session_settings_travel_with_each_request() {
        let completion = ScriptedCompletion::new(vec![]);
        let settings = SessionSettings { display_name: Some("Ada".into()), ..Default::default() };
        let session = ConversationSession::new("42", FakeLookup::found(), completion.clone()).with_settings(settings);
        session.initialize().await.unwrap();

        session.update_settings(SessionSettingsPatch {
            default_model: Some("llama-3.3-70b-versatile".into()),
            model_params: Some(ModelParams { temperature: Some(0.2), ..Default::default() }),
            ..Default::default()
        });
        session.send("Tell me more").await;
        session.reset();
        assert_eq!(session.settings().display_name.as_deref(), Some("Ada"));

        let reqs = completion.requests();
        assert_eq!(reqs[0].settings, None);
        let sent = reqs[1].settings.clone().unwrap();
        assert_eq!(sent.default_model.as_deref(), Some("llama-3.3-70b-versatile"));
        assert_eq!(sent.display_name, None);
    }

    #[tokio::test]
    async fn outbound_history_is_prior_context_only() {
        let completion = ScriptedCompletion::new(vec![Ok("saga".into()), Ok("sure".into())]);
        let session = ConversationSession::new("42", FakeLookup::found(), completion.clone());
        session.initialize().await.unwrap();
        session.send("  Tell me more ").await;

        let req = &completion.requests()[1];
        assert_eq!(req.message, "Tell me more");
        let roles: Vec<Role> = req.conversation_history.iter().map(|p| p.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(req.conversation_history[0].content, SEED);
        assert_eq!(req.conversation_history[1].content, "saga");
    }

    #[tokio::test]
    async fn history_tracks_successes_only() {
        let completion = ScriptedCompletion::new(vec![
            Ok("a0".into()),
            Err(CompletionError::Unsuccessful),
            Ok("a2".into()),
            Err(CompletionError::Malformed("eof".into())),
            Ok("a4".into()),
        ]);
        let session = ConversationSession::new("42", FakeLookup::found(), completion);
        session.initialize().await.unwrap();
        for q in ["q1", "q2", "q3", "q4"] {
            session.send(q).await;
        }
        let history = session.history();
        assert_eq!(session.assistant_count(), 5);
        assert_eq!(history.len(), 3);
        assert_eq!(history[1], HistoryEntry { question: "q2".into(), answer: "a2".into() });
        assert_eq!(history[2], HistoryEntry { question: "q4".into(), answer: "a4".into() });
    }

    #[tokio::test]
    async fn lookup_failure_makes_session_unavailable() {
        let lookup = FakeLookup::failing(LookupError::NotFound);
        let completion = ScriptedCompletion::new(vec![]);
        let session = ConversationSession::new("7", lookup.clone(), completion.clone());

        let err = session.initialize().await.unwrap_err();
        assert_eq!(err, SessionError::EntityNotFound { id: "7".into() });
        assert!(session.is_unavailable());
        assert_eq!(session.status(), SessionStatus::Unavailable);

        assert!(session.resolve().await.is_err());
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.send("hello").await, SendOutcome::Rejected(RejectReason::NotReady));
        assert_eq!(session.auto_seed().await, SendOutcome::Rejected(RejectReason::NotReady));
        assert!(completion.requests().is_empty());
        assert!(session.snapshot().error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn reply_arriving_after_reset_is_discarded() {
        let completion = Arc::new(GatedCompletion::default());
        let session = Arc::new(ConversationSession::new("42", FakeLookup::found(), completion.clone()));
        session.resolve().await.unwrap();

        let in_flight = tokio::spawn({
            let session = session.clone();
            async move { session.send("before reset").await }
        });
        wait_for_calls(&completion, 1).await;
        session.reset();
        assert!(!session.is_pending());

        // the new conversation's seed is in flight when the old reply lands
        let seed = tokio::spawn({
            let session = session.clone();
            async move { session.auto_seed().await }
        });
        wait_for_calls(&completion, 2).await;
        completion.gate.notify_one();
        let first_done = in_flight.await.unwrap();
        assert_eq!(first_done, SendOutcome::Discarded);
        assert!(session.is_pending());
        assert_eq!(session.transcript().len(), 1);

        completion.gate.notify_one();
        assert_eq!(seed.await.unwrap(), SendOutcome::Replied);
        assert_eq!(session.history().len(), 1);
        assert_eq!(session.history()[0].question, SEED);
    }

    #[tokio::test]
    async fn abandoned_send_releases_pending() {
        let completion = Arc::new(GatedCompletion::default());
        let session = ConversationSession::new("42", FakeLookup::found(), completion);
        session.resolve().await.unwrap();

        let res = tokio::time::timeout(Duration::from_millis(20), session.send("hello")).await;
        assert!(res.is_err());
        assert!(!session.is_pending());
        assert_eq!(session.transcript().len(), 1);
    }
}
