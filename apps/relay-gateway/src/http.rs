use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::{
    Json, Router,
    extract::State,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use relay_core::{
    Attachment, CardAction, ConversationRelay, OutboundMessage, RelayError, Reply, Session,
    SessionHandle, SessionRegistry, Watermark,
};
use url::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::MutexGuard;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::{error::GatewayError, ws};

#[derive(Clone)]
pub struct AppState {
    relay: Arc<ConversationRelay>,
    sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(relay: ConversationRelay) -> Self {
        Self {
            relay: Arc::new(relay),
            sessions: Arc::new(SessionRegistry::new()),
        }
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn relay(&self) -> &ConversationRelay {
        &self.relay
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Periodically drops sessions idle for longer than `max_idle`.
    pub fn spawn_idle_sweeper(&self, max_idle: Duration) -> JoinHandle<()> {
        let sessions = Arc::clone(&self.sessions);
        let period = max_idle.min(Duration::from_secs(60));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let evicted = sessions.evict_idle(max_idle).await;
                if evicted > 0 {
                    info!(evicted, "idle sessions evicted");
                }
            }
        })
    }

    /// Drops a session after a turn failed for good.
    async fn forget(&self, conversation_id: &str) {
        if let Some(shared) = self.sessions.remove(conversation_id).await {
            shared.lock().await.release_stream();
            debug!(conversation_id, "session dropped after a terminal error");
        }
    }

    /// Whether a live session pinned to `base_uri` has a turn to re-await.
    async fn has_turn_on_record(&self, conversation_id: &str, base_uri: &Url) -> bool {
        match self.sessions.get(conversation_id).await {
            Some(shared) => {
                let session = shared.lock().await;
                session.endpoint() == base_uri && session.last_turn_started().is_some()
            }
            None => false,
        }
    }

    fn ensure_known_region(&self, base_uri: &Url) -> Result<(), GatewayError> {
        let regions = self.relay.gateway().regions();
        if &regions.primary == base_uri || regions.fallback.as_ref() == Some(base_uri) {
            Ok(())
        } else {
            Err(GatewayError::BadRequest("baseUri is not a configured region"))
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/session/start", post(start_session))
        .route("/api/session/send", post(send_message))
        .route("/api/session/poll", post(poll_reply))
        .route("/api/session/end", post(end_session))
        .route("/api/session/stream", get(ws::stream_session))
        .with_state(state)
}

pub fn cors_layer(origin: &str) -> anyhow::Result<CorsLayer> {
    let origin = HeaderValue::from_str(origin)
        .with_context(|| format!("CORS_ALLOW_ORIGIN is not a valid header value: {origin}"))?;
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true))
}

async fn healthz() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn start_session(State(state): State<AppState>) -> Result<Json<SessionHandle>, GatewayError> {
    let session = state.relay.start_session().await?;
    let handle = session.handle();
    state.sessions.insert(session).await;
    Ok(Json(handle))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub conversation_id: String,
    pub token: String,
    pub base_uri: Url,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub watermark: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub channel_data: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRequest {
    pub conversation_id: String,
    pub token: String,
    pub base_uri: Url,
    #[serde(default)]
    pub watermark: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndRequest {
    pub conversation_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyBody {
    pub id: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub suggested_actions: Vec<CardAction>,
    pub watermark: Option<Watermark>,
    pub conversation_id: String,
}

impl From<Reply> for ReplyBody {
    fn from(reply: Reply) -> Self {
        Self {
            id: reply.activity.id,
            text: reply.activity.text,
            attachments: reply.activity.attachments,
            suggested_actions: reply.activity.suggested_actions,
            watermark: reply.watermark,
            conversation_id: reply.conversation_id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WaitingBody {
    status: &'static str,
    conversation_id: String,
    watermark: Option<Watermark>,
}

async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> Result<Response, GatewayError> {
    if request.text.trim().is_empty() && request.value.is_none() {
        return Err(GatewayError::BadRequest("text or value is required"));
    }
    state.ensure_known_region(&request.base_uri)?;

    let shared = state
        .sessions
        .get_or_resume(
            SessionHandle {
                conversation_id: request.conversation_id,
                token: request.token,
                endpoint: request.base_uri,
                stream_url: None,
            },
            request.watermark.map(Watermark::new),
        )
        .await;
    let mut session = shared.lock().await;

    let message = OutboundMessage {
        text: request.text,
        value: request.value,
        channel_data: request.channel_data,
        user_id: request.user_id,
    };
    let outcome = state.relay.send_and_await_reply(&mut session, message).await;
    finish_turn(outcome, session, &state).await
}

async fn poll_reply(
    State(state): State<AppState>,
    Json(request): Json<PollRequest>,
) -> Result<Response, GatewayError> {
    state.ensure_known_region(&request.base_uri)?;
    if request.watermark.is_none()
        && !state
            .has_turn_on_record(&request.conversation_id, &request.base_uri)
            .await
    {
        return Err(GatewayError::Conflict(
            "no turn on record for this conversation; send the last watermark",
        ));
    }

    let shared = state
        .sessions
        .get_or_resume(
            SessionHandle {
                conversation_id: request.conversation_id,
                token: request.token,
                endpoint: request.base_uri,
                stream_url: None,
            },
            request.watermark.map(Watermark::new),
        )
        .await;
    let mut session = shared.lock().await;

    // A resumed session has no turn on record; its watermark alone bounds what is new.
    let turn_started = session
        .last_turn_started()
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);
    let outcome = state.relay.await_reply(&mut session, turn_started).await;
    finish_turn(outcome, session, &state).await
}

async fn end_session(
    State(state): State<AppState>,
    Json(request): Json<EndRequest>,
) -> StatusCode {
    if let Some(shared) = state.sessions.remove(&request.conversation_id).await {
        match Arc::try_unwrap(shared) {
            Ok(session) => state.relay.end_session(session.into_inner()),
            Err(shared) => {
                shared.lock().await.release_stream();
                info!(
                    conversation_id = %request.conversation_id,
                    "conversation removed while a turn was still attached"
                );
            }
        }
    }
    StatusCode::NO_CONTENT
}

async fn finish_turn(
    outcome: Result<Reply, RelayError>,
    session: MutexGuard<'_, Session>,
    state: &AppState,
) -> Result<Response, GatewayError> {
    let terminal = outcome.as_ref().is_err_and(|err| !err.is_retryable());
    let conversation_id = session.conversation_id().to_string();
    let response = reply_response(outcome, &conversation_id, session.watermark(), state);
    drop(session);
    if terminal {
        state.forget(&conversation_id).await;
    }
    response
}

fn reply_response(
    outcome: Result<Reply, RelayError>,
    conversation_id: &str,
    watermark: Option<&Watermark>,
    state: &AppState,
) -> Result<Response, GatewayError> {
    match outcome {
        Ok(reply) => Ok(Json(ReplyBody::from(reply)).into_response()),
        Err(RelayError::ReplyTimeout { .. }) => {
            let retry_after = state.relay.settings().poll_interval.as_secs().max(1);
            let body = WaitingBody {
                status: "waiting",
                conversation_id: conversation_id.to_string(),
                watermark: watermark.cloned(),
            };
            let mut response = (StatusCode::ACCEPTED, Json(body)).into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
            Ok(response)
        }
        Err(err) => Err(err.into()),
    }
}
