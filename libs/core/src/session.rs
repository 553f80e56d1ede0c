use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use url::Url;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::{
    gateway::ConversationHandle,
    stream::ActivityStream,
    watermark::{CursorTracker, Watermark},
};

/// What the transport needs to resume a session on a later request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHandle {
    pub conversation_id: String,
    pub token: String,
    #[serde(rename = "baseUri")]
    pub endpoint: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
}

/// Live relay state for one conversation. In-memory only.
pub struct Session {
    handle: ConversationHandle,
    pub(crate) cursor: CursorTracker,
    created_at: OffsetDateTime,
    pub(crate) delivered: HashSet<String>,
    pub(crate) stream: Option<ActivityStream>,
    pub(crate) user_id: Option<String>,
    pub(crate) last_turn_started: Option<OffsetDateTime>,
    last_seen: Instant,
}

impl Session {
    pub(crate) fn started(handle: ConversationHandle) -> Self {
        Self {
            handle,
            cursor: CursorTracker::default(),
            created_at: OffsetDateTime::now_utc(),
            delivered: HashSet::new(),
            stream: None,
            user_id: None,
            last_turn_started: None,
            last_seen: Instant::now(),
        }
    }

    /// Rebuilds a session from a handle issued earlier, continuing at `watermark`.
    pub fn resume(handle: SessionHandle, watermark: Option<Watermark>) -> Self {
        Self {
            handle: ConversationHandle {
                conversation_id: handle.conversation_id,
                token: handle.token,
                endpoint: handle.endpoint,
                stream_url: handle.stream_url,
                expires_in: None,
            },
            cursor: CursorTracker::new(watermark),
            created_at: OffsetDateTime::now_utc(),
            delivered: HashSet::new(),
            stream: None,
            user_id: None,
            last_turn_started: None,
            last_seen: Instant::now(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.handle.conversation_id
    }

    pub fn conversation(&self) -> &ConversationHandle {
        &self.handle
    }

    pub fn endpoint(&self) -> &Url {
        &self.handle.endpoint
    }

    pub fn stream_url(&self) -> Option<&str> {
        self.handle.stream_url.as_deref()
    }

    pub fn watermark(&self) -> Option<&Watermark> {
        self.cursor.current()
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    /// Start of the most recent turn, the gate for re-awaiting its reply.
    pub fn last_turn_started(&self) -> Option<OffsetDateTime> {
        self.last_turn_started
    }

    /// When a transport last asked for this session.
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn has_open_stream(&self) -> bool {
        self.stream.is_some()
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            conversation_id: self.handle.conversation_id.clone(),
            token: self.handle.token.clone(),
            endpoint: self.handle.endpoint.clone(),
            stream_url: self.handle.stream_url.clone(),
        }
    }

    /// Drops the push stream, if one is open. Returns whether there was one.
    pub fn release_stream(&mut self) -> bool {
        self.stream.take().is_some()
    }

    /// Refreshes the bearer token when a resumed request carries a newer one.
    pub fn rebind_token(&mut self, token: &str) {
        if self.handle.token != token {
            self.handle.token = token.to_string();
            self.stream = None;
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("conversation_id", &self.handle.conversation_id)
            .field("endpoint", &self.handle.endpoint.as_str())
            .field("watermark", &self.cursor.current())
            .field("created_at", &self.created_at)
            .field("delivered", &self.delivered.len())
            .field("streaming", &self.stream.is_some())
            .finish()
    }
}

pub type SharedSession = Arc<Mutex<Session>>;

/// Live sessions keyed by conversation id.
///
/// Each session sits behind its own mutex, so overlapping turns on one
/// conversation are serialised while separate conversations run freely.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<HashMap<String, SharedSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Session) -> SharedSession {
        let id = session.conversation_id().to_string();
        let shared = Arc::new(Mutex::new(session));
        self.inner.write().await.insert(id, Arc::clone(&shared));
        shared
    }

    pub async fn get(&self, conversation_id: &str) -> Option<SharedSession> {
        self.inner.read().await.get(conversation_id).cloned()
    }

    /// Returns the live session or rebuilds one from the caller's handle.
    ///
    /// The handle must point at the same region the live session is pinned
    /// to; a mismatch is treated as a new session for that conversation.
    pub async fn get_or_resume(
        &self,
        handle: SessionHandle,
        watermark: Option<Watermark>,
    ) -> SharedSession {
        if let Some(existing) = self.get(&handle.conversation_id).await {
            let mut session = existing.lock().await;
            if session.endpoint() == &handle.endpoint {
                session.rebind_token(&handle.token);
                session.touch();
                drop(session);
                return existing;
            }
        }
        self.insert(Session::resume(handle, watermark)).await
    }

    pub async fn remove(&self, conversation_id: &str) -> Option<SharedSession> {
        self.inner.write().await.remove(conversation_id)
    }

    /// Drops sessions nobody has asked for in `max_idle` and releases their
    /// streams. Sessions with a turn in flight are kept. Returns how many went.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let before = inner.len();
        inner.retain(|_, shared| match shared.try_lock() {
            Ok(mut session) if now.duration_since(session.last_seen) > max_idle => {
                session.release_stream();
                false
            }
            _ => true,
        });
        before - inner.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
