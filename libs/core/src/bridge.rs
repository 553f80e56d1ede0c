use std::fmt;

use futures::StreamExt;
use metrics::counter;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, warn};

use crate::{
    activity::{Activity, Attachment, CardAction, normalize_activity},
    session::SessionHandle,
    stream::ActivityStream,
    telemetry,
};

/// Events forwarded to a live transport.
#[derive(Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    SessionStarted {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        token: String,
    },
    BotResponse {
        id: String,
        text: String,
        attachments: Vec<Attachment>,
        #[serde(rename = "suggestedActions")]
        suggested_actions: Vec<CardAction>,
    },
}

impl From<Activity> for RelayEvent {
    fn from(activity: Activity) -> Self {
        RelayEvent::BotResponse {
            id: activity.id,
            text: activity.text,
            attachments: activity.attachments,
            suggested_actions: activity.suggested_actions,
        }
    }
}

impl fmt::Debug for RelayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayEvent::SessionStarted {
                conversation_id, ..
            } => f
                .debug_struct("SessionStarted")
                .field("conversation_id", conversation_id)
                .field("token", &"[REDACTED]")
                .finish(),
            RelayEvent::BotResponse {
                id,
                text,
                attachments,
                suggested_actions,
            } => f
                .debug_struct("BotResponse")
                .field("id", id)
                .field("text", text)
                .field("attachments", &attachments.len())
                .field("suggested_actions", &suggested_actions.len())
                .finish(),
        }
    }
}

/// Why [`StreamingBridge::run`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeExit {
    SinkClosed,
    UpstreamClosed,
    UpstreamFailed,
}

/// Forwards bot messages from a conversation's push stream to a transport sink.
///
/// No reconnect: once the upstream stream ends the caller starts a new session.
pub struct StreamingBridge {
    handle: SessionHandle,
    stream: ActivityStream,
    user_id: String,
}

impl StreamingBridge {
    pub(crate) fn new(handle: SessionHandle, stream: ActivityStream, user_id: String) -> Self {
        Self {
            handle,
            stream,
            user_id,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.handle.conversation_id
    }

    pub async fn run(self, sink: mpsc::Sender<RelayEvent>) -> BridgeExit {
        let StreamingBridge {
            handle,
            mut stream,
            user_id,
        } = self;
        let span = telemetry::span_for_bridge(&handle.conversation_id);

        async move {
            let started = RelayEvent::SessionStarted {
                conversation_id: handle.conversation_id.clone(),
                token: handle.token.clone(),
            };
            if sink.send(started).await.is_err() {
                return BridgeExit::SinkClosed;
            }

            loop {
                let next = tokio::select! {
                    _ = sink.closed() => {
                        debug!("transport went away, closing bridge");
                        return BridgeExit::SinkClosed;
                    }
                    next = stream.next() => next,
                };

                let batch = match next {
                    Some(Ok(batch)) => batch,
                    Some(Err(err)) => {
                        counter!("relay_errors_total", "kind" => "stream").increment(1);
                        warn!(error = %err, "upstream stream failed");
                        return BridgeExit::UpstreamFailed;
                    }
                    None => {
                        info!("upstream stream closed");
                        return BridgeExit::UpstreamClosed;
                    }
                };

                for raw in &batch.activities {
                    match normalize_activity(raw, &user_id) {
                        Ok(Some(activity)) if activity.is_bot() => {
                            if sink.send(activity.into()).await.is_err() {
                                return BridgeExit::SinkClosed;
                            }
                        }
                        Ok(_) => {}
                        Err(err) => {
                            counter!("relay_errors_total", "kind" => "malformed_activity")
                                .increment(1);
                            warn!(error = %err, "skipping malformed activity");
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn events_serialise_with_type_tag() {
        let started = RelayEvent::SessionStarted {
            conversation_id: "c".into(),
            token: "tok".into(),
        };
        assert_eq!(
            serde_json::to_value(&started).unwrap(),
            json!({"type": "session_started", "conversationId": "c", "token": "tok"})
        );
        assert!(!format!("{started:?}").contains("\"tok\""));

        let reply = RelayEvent::from(Activity {
            id: "a1".into(),
            sender_role: crate::activity::SenderRole::Bot,
            text: "hi".into(),
            attachments: vec![],
            suggested_actions: vec![],
            timestamp: datetime!(2024-01-01 0:00 UTC),
        });
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"type": "bot_response", "id": "a1", "text": "hi",
                   "attachments": [], "suggestedActions": []})
        );
    }
}
