use crate::openai_types::OpenAIMessage;

use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Shared state for all request handlers.
pub struct AppState {
    /// Environment fallback; stored business config takes precedence at request time.
    pub openai_api_key: Option<String>,
    pub http_client: reqwest::Client,
    pub db_pool: Pool<Postgres>,
    pub sessions: SessionStore,
}

/// In-memory conversation history, keyed by session id.
///
/// Owned by `AppState` and touched only through these synchronized operations.
/// History lives exactly as long as a call is active; `clear` (or a process
/// restart) discards it.
pub struct SessionStore {
    inner: Mutex<HashMap<Uuid, Vec<OpenAIMessage>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Append one turn to a session's history, creating the session if absent.
    pub fn append(&self, session_id: Uuid, message: OpenAIMessage) {
        let mut sessions = self.inner.lock().unwrap();
        sessions.entry(session_id).or_default().push(message);
    }

    /// Clone out the accumulated history for a session; empty if none exists.
    pub fn snapshot(&self, session_id: Uuid) -> Vec<OpenAIMessage> {
        let sessions = self.inner.lock().unwrap();
        sessions.get(&session_id).cloned().unwrap_or_default()
    }

    /// Discard a session's history. Returns false if there was nothing to discard.
    pub fn clear(&self, session_id: Uuid) -> bool {
        let mut sessions = self.inner.lock().unwrap();
        sessions.remove(&session_id).is_some()
    }

    /// Number of turns accumulated for a session; 0 if the session is not live.
    pub fn turn_count(&self, session_id: Uuid) -> usize {
        let sessions = self.inner.lock().unwrap();
        sessions.get(&session_id).map(Vec::len).unwrap_or(0)
    }
}

/// Outcome of one dialogue turn.  `Degraded` carries the fixed apology used when
/// the chat-completion vendor call fails; the caller-facing channel never sees a
/// raw error, but handlers can still tell the two outcomes apart.
#[derive(Debug, PartialEq)]
pub enum ChatReply {
    Answered(String),
    Degraded(String),
}

impl ChatReply {
    pub fn text(&self) -> &str {
        match self {
            ChatReply::Answered(text) | ChatReply::Degraded(text) => text,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, ChatReply::Degraded(_))
    }
}

/// What `dialogue::process_message` hands back to the API layer.
#[derive(Debug)]
pub struct DialogueOutcome {
    pub session_id: Uuid,
    pub reply: ChatReply,
    pub intent: Option<String>,
}

#[cfg(test)]
pub mod test_support {
    use super::{AppState, SessionStore};
    use sqlx::postgres::PgPoolOptions;

    /// State backed by a real database, or `None` when DATABASE_URL is unset
    /// so the calling test skips itself.
    pub async fn db_state() -> Option<AppState> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .ok()?;
        sqlx::migrate!().run(&pool).await.ok()?;
        Some(state_with(pool))
    }

    /// State whose pool never connects.  Any code path that touches it errors,
    /// so tests can prove a branch performs no database work.
    pub fn lazy_state() -> AppState {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/receptionist_unreachable")
            .unwrap();
        state_with(pool)
    }

    fn state_with(pool: sqlx::Pool<sqlx::Postgres>) -> AppState {
        AppState {
            openai_api_key: None,
            http_client: reqwest::Client::new(),
            db_pool: pool,
            sessions: SessionStore::new(),
        }
    }
}
