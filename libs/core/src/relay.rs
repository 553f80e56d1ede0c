//! Conversation relay: session lifecycle and the send-then-await-reply turn.
//!
//! A turn posts one user activity and waits for the most recent bot message
//! stamped at or after the moment the turn began. Replies arrive either by
//! polling `GET /activities` with the session cursor or, when the upstream
//! offers one, over the conversation's push stream. Both paths share the
//! same selection rules so the caller cannot tell them apart.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use futures::StreamExt;
use metrics::counter;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tracing::{Instrument, debug, info, warn};

use crate::{
    activity::{Activity, normalize_activity},
    bridge::StreamingBridge,
    directline_client::{DirectLineError, OutboundActivity},
    error::{RelayError, SessionStartError},
    gateway::UpstreamGateway,
    session::Session,
    telemetry,
    token::TokenProvider,
    watermark::Watermark,
};

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(65);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_USER_ID: &str = "user1";
/// Upper bound on connecting the push stream. Capped by the turn deadline.
pub const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Stream when the conversation offers a stream url, poll otherwise.
    #[default]
    Auto,
    Poll,
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" | "stream" => Ok(DeliveryMode::Auto),
            "poll" => Ok(DeliveryMode::Poll),
            other => Err(format!("unknown delivery mode `{other}`")),
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeliveryMode::Auto => "auto",
            DeliveryMode::Poll => "poll",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelaySettings {
    pub reply_timeout: Duration,
    pub poll_interval: Duration,
    pub user_id: String,
    pub delivery: DeliveryMode,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            user_id: DEFAULT_USER_ID.to_string(),
            delivery: DeliveryMode::Auto,
        }
    }
}

/// One user turn. Not retained after the turn completes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutboundMessage {
    pub text: String,
    pub value: Option<Value>,
    pub channel_data: Option<Value>,
    pub user_id: Option<String>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    fn into_activity(self, default_user: &str) -> OutboundActivity {
        let user_id = self.user_id.unwrap_or_else(|| default_user.to_string());
        let mut activity = OutboundActivity::user_message(user_id, self.text);
        activity.value = self.value;
        activity.channel_data = self.channel_data;
        activity
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    pub activity: Activity,
    pub watermark: Option<Watermark>,
    pub conversation_id: String,
}

enum StreamOutcome {
    Reply(Activity),
    Closed,
    Deadline,
}

pub struct ConversationRelay {
    tokens: Arc<TokenProvider>,
    gateway: UpstreamGateway,
    settings: RelaySettings,
}

impl ConversationRelay {
    pub fn new(tokens: Arc<TokenProvider>, gateway: UpstreamGateway, settings: RelaySettings) -> Self {
        Self {
            tokens,
            gateway,
            settings,
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn gateway(&self) -> &UpstreamGateway {
        &self.gateway
    }

    pub async fn start_session(&self) -> Result<Session, RelayError> {
        let span = telemetry::span_for_session("start");
        async {
            let credential = self
                .tokens
                .token()
                .await
                .map_err(SessionStartError::from)?;
            let handle = self
                .gateway
                .create_conversation(credential.value())
                .await
                .map_err(SessionStartError::from)?;

            let region = self.gateway.regions().region_label(&handle.endpoint);
            tracing::Span::current().record("conversation_id", handle.conversation_id.as_str());
            counter!("relay_sessions_started_total", "region" => region).increment(1);
            info!(
                region,
                endpoint = telemetry::endpoint_host(&handle.endpoint),
                streaming = handle.stream_url.is_some(),
                "conversation started"
            );
            Ok::<_, RelayError>(Session::started(handle))
        }
        .instrument(span)
        .await
        .inspect_err(|err| {
            counter!("relay_errors_total", "kind" => err.kind()).increment(1);
            warn!(error = %err, "session start failed");
        })
    }

    /// Posts one user activity and waits for the bot's reply to it.
    ///
    /// A failed post is returned as is; sending is not idempotent so it is
    /// never retried here.
    pub async fn send_and_await_reply(
        &self,
        session: &mut Session,
        message: OutboundMessage,
    ) -> Result<Reply, RelayError> {
        let span = telemetry::span_for_turn("send", session.conversation_id());
        async move {
            let turn_started = OffsetDateTime::now_utc();
            let deadline = Instant::now() + self.settings.reply_timeout;
            session.last_turn_started = Some(turn_started);
            if let Some(user_id) = &message.user_id {
                session.user_id = Some(user_id.clone());
            }
            if self.wants_stream(session) {
                self.ensure_stream(session, deadline).await;
            }

            self.post_message(session, message).await.inspect_err(|_| {
                counter!("relay_turns_total", "outcome" => "send_failed").increment(1);
            })?;
            self.await_turn(session, turn_started, deadline).await
        }
        .instrument(span)
        .await
    }

    /// Posts a user activity without waiting for a reply. Returns the upstream activity id.
    pub async fn post_message(
        &self,
        session: &mut Session,
        message: OutboundMessage,
    ) -> Result<String, RelayError> {
        let activity = message.into_activity(&self.settings.user_id);
        let activity_id = self
            .gateway
            .post_activity(session.conversation(), &activity)
            .await
            .inspect_err(|err| warn!(error = %err, "posting user activity failed"))?;
        debug!(activity_id = %activity_id, "user activity posted");
        Ok(activity_id)
    }

    /// Waits for the reply to a turn that was already sent, e.g. after a
    /// [`RelayError::ReplyTimeout`]. The cursor and delivered ids carry over.
    pub async fn await_reply(
        &self,
        session: &mut Session,
        turn_started: OffsetDateTime,
    ) -> Result<Reply, RelayError> {
        let span = telemetry::span_for_turn("await", session.conversation_id());
        let deadline = Instant::now() + self.settings.reply_timeout;
        self.await_turn(session, turn_started, deadline)
            .instrument(span)
            .await
    }

    /// Releases the session's push stream. Conversations expire upstream on their own.
    pub fn end_session(&self, mut session: Session) {
        let had_stream = session.release_stream();
        info!(
            conversation_id = session.conversation_id(),
            had_stream, "conversation ended"
        );
    }

    /// Opens the conversation's push stream for live forwarding.
    pub async fn open_bridge(&self, session: &mut Session) -> Result<StreamingBridge, RelayError> {
        let stream_url = session
            .stream_url()
            .ok_or(RelayError::StreamUnavailable)?
            .to_string();
        let stream = timeout(STREAM_OPEN_TIMEOUT, self.gateway.open_stream(&stream_url))
            .await
            .map_err(|_| {
                DirectLineError::Stream(anyhow::anyhow!(
                    "stream did not connect within {}s",
                    STREAM_OPEN_TIMEOUT.as_secs()
                ))
            })??;
        Ok(StreamingBridge::new(
            session.handle(),
            stream,
            session.user_id.clone().unwrap_or_else(|| self.settings.user_id.clone()),
        ))
    }

    fn wants_stream(&self, session: &Session) -> bool {
        self.settings.delivery == DeliveryMode::Auto && session.stream_url().is_some()
    }

    /// Opens the push stream for a turn. Gives up at `STREAM_OPEN_TIMEOUT` or
    /// the turn deadline, whichever comes first, and leaves the turn to polling.
    async fn ensure_stream(&self, session: &mut Session, deadline: Instant) {
        if session.stream.is_some() {
            return;
        }
        let Some(stream_url) = session.stream_url().map(str::to_string) else {
            return;
        };
        let open_by = deadline.min(Instant::now() + STREAM_OPEN_TIMEOUT);
        match timeout_at(open_by, self.gateway.open_stream(&stream_url)).await {
            Ok(Ok(stream)) => session.stream = Some(stream),
            Ok(Err(err)) => {
                counter!("relay_errors_total", "kind" => "stream_open").increment(1);
                warn!(error = %err, "stream unavailable, polling instead");
            }
            Err(_) => {
                counter!("relay_errors_total", "kind" => "stream_open").increment(1);
                warn!("stream did not connect in time, polling instead");
            }
        }
    }

    async fn await_turn(
        &self,
        session: &mut Session,
        turn_started: OffsetDateTime,
        deadline: Instant,
    ) -> Result<Reply, RelayError> {
        let user_id = session
            .user_id
            .clone()
            .unwrap_or_else(|| self.settings.user_id.clone());

        let found = if session.stream.is_some() {
            match self
                .await_streamed(session, &user_id, turn_started, deadline)
                .await
            {
                StreamOutcome::Reply(activity) => Some(activity),
                StreamOutcome::Closed => {
                    self.await_polled(session, &user_id, turn_started, deadline)
                        .await
                }
                StreamOutcome::Deadline => None,
            }
        } else {
            self.await_polled(session, &user_id, turn_started, deadline)
                .await
        };

        match found {
            Some(activity) => {
                counter!("relay_turns_total", "outcome" => "reply").increment(1);
                debug!(activity_id = %activity.id, "bot reply selected");
                Ok(Reply {
                    activity,
                    watermark: session.watermark().cloned(),
                    conversation_id: session.conversation_id().to_string(),
                })
            }
            None => {
                counter!("relay_turns_total", "outcome" => "timeout").increment(1);
                info!(
                    budget_secs = self.settings.reply_timeout.as_secs(),
                    "no bot reply within budget"
                );
                Err(RelayError::ReplyTimeout {
                    budget: self.settings.reply_timeout,
                })
            }
        }
    }

    async fn await_polled(
        &self,
        session: &mut Session,
        user_id: &str,
        turn_started: OffsetDateTime,
        deadline: Instant,
    ) -> Option<Activity> {
        while Instant::now() < deadline {
            match self
                .gateway
                .fetch_activities(session.conversation(), session.cursor.as_query())
                .await
            {
                Ok(set) => {
                    session.cursor.advance(set.watermark.map(Watermark::new));
                    if let Some(reply) =
                        select_reply(session, &set.activities, user_id, turn_started)
                    {
                        return Some(reply);
                    }
                }
                Err(err) => {
                    counter!("relay_errors_total", "kind" => "fetch_skipped").increment(1);
                    warn!(error = %err, "activity fetch failed, skipping this poll");
                }
            }
            sleep(self.settings.poll_interval).await;
        }
        None
    }

    async fn await_streamed(
        &self,
        session: &mut Session,
        user_id: &str,
        turn_started: OffsetDateTime,
        deadline: Instant,
    ) -> StreamOutcome {
        loop {
            let Some(stream) = session.stream.as_mut() else {
                return StreamOutcome::Closed;
            };
            let next = match timeout_at(deadline, stream.next()).await {
                Ok(next) => next,
                Err(_) => return StreamOutcome::Deadline,
            };
            match next {
                Some(Ok(set)) => {
                    session.cursor.advance(set.watermark.map(Watermark::new));
                    if let Some(reply) =
                        select_reply(session, &set.activities, user_id, turn_started)
                    {
                        return StreamOutcome::Reply(reply);
                    }
                }
                Some(Err(err)) => {
                    counter!("relay_errors_total", "kind" => "stream").increment(1);
                    warn!(error = %err, "stream failed mid-turn, polling instead");
                    session.stream = None;
                    return StreamOutcome::Closed;
                }
                None => {
                    info!("stream closed mid-turn, polling instead");
                    session.stream = None;
                    return StreamOutcome::Closed;
                }
            }
        }
    }
}

/// Picks the last bot message in `batch` stamped at or after `turn_started`
/// that this session has not delivered yet, and marks it delivered.
fn select_reply(
    session: &mut Session,
    batch: &[Value],
    user_id: &str,
    turn_started: OffsetDateTime,
) -> Option<Activity> {
    let mut chosen = None;
    for raw in batch {
        match normalize_activity(raw, user_id) {
            Ok(Some(activity))
                if activity.is_bot()
                    && activity.timestamp >= turn_started
                    && !session.delivered.contains(&activity.id) =>
            {
                chosen = Some(activity);
            }
            Ok(_) => {}
            Err(err) => {
                counter!("relay_errors_total", "kind" => "malformed_activity").increment(1);
                warn!(error = %err, "skipping malformed activity");
            }
        }
    }
    if let Some(activity) = &chosen {
        session.delivered.insert(activity.id.clone());
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{gateway::ConversationHandle, session::SessionHandle};
    use reqwest::Url;
    use serde_json::json;
    use time::macros::datetime;

    fn session() -> Session {
        Session::resume(
            SessionHandle {
                conversation_id: "conv".into(),
                token: "t".into(),
                endpoint: Url::parse("https://dl.test/v3/directline").unwrap(),
                stream_url: None,
            },
            None,
        )
    }

    fn message(id: &str, from: &str, ts: &str) -> Value {
        json!({"type": "message", "id": id, "timestamp": ts, "from": {"id": from}, "text": id})
    }

    #[test]
    fn selection_keeps_last_fresh_bot_message() {
        let mut session = session();
        let started = datetime!(2024-04-02 12:00:00 UTC);
        let batch = vec![
            message("old", "bot", "2024-04-02T11:59:59Z"),
            message("echo", "user1", "2024-04-02T12:00:00Z"),
            message("first", "bot", "2024-04-02T12:00:01Z"),
            json!({"type": "message", "id": "broken", "from": {"id": "bot"}}),
            message("second", "bot", "2024-04-02T12:00:02Z"),
            json!({"type": "typing", "id": "typing", "from": {"id": "bot"}}),
        ];
        let reply = select_reply(&mut session, &batch, "user1", started).unwrap();
        assert_eq!(reply.id, "second");
        assert!(session.delivered.contains("second"));

        assert!(select_reply(&mut session, &batch[4..], "user1", started).is_none());
    }

    #[test]
    fn user_messages_are_never_selected() {
        let mut session = session();
        let started = datetime!(2024-04-02 12:00:00 UTC);
        let batch = vec![
            message("a", "user1", "2024-04-02T12:00:05Z"),
            json!({"type": "message", "id": "b", "timestamp": "2024-04-02T12:00:06Z",
                   "from": {"id": "anyone", "role": "user"}}),
        ];
        assert!(select_reply(&mut session, &batch, "user1", started).is_none());
    }

    #[test]
    fn outbound_message_carries_value_and_user() {
        let message = OutboundMessage {
            text: "pick".into(),
            value: Some(json!({"choice": 1})),
            channel_data: Some(json!({"locale": "en-US"})),
            user_id: Some("visitor-7".into()),
        };
        let activity = message.into_activity(DEFAULT_USER_ID);
        assert_eq!(activity.from.id, "visitor-7");
        assert_eq!(activity.value, Some(json!({"choice": 1})));
        assert!(activity.channel_data.is_some());
    }

    #[test]
    fn delivery_mode_parses() {
        assert_eq!("POLL".parse::<DeliveryMode>(), Ok(DeliveryMode::Poll));
        assert_eq!("auto".parse::<DeliveryMode>(), Ok(DeliveryMode::Auto));
        assert!("push".parse::<DeliveryMode>().is_err());
        assert_eq!(RelaySettings::default().reply_timeout, Duration::from_secs(65));
    }

    #[test]
    fn conversation_handle_is_pinned_in_session() {
        let session = session();
        let handle: &ConversationHandle = session.conversation();
        assert_eq!(handle.endpoint.as_str(), "https://dl.test/v3/directline");
    }
}
