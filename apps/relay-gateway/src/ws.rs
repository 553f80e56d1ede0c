use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use relay_core::{OutboundMessage, RelayError, RelayEvent};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::http::AppState;

const EVENT_BUFFER: usize = 32;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientFrame {
    #[serde(default)]
    text: String,
    #[serde(default)]
    value: Option<Value>,
}

pub async fn stream_session(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = run_stream(socket, state).await {
            warn!(error = %err, "stream session closed with error");
        }
    })
}

async fn run_stream(mut socket: WebSocket, state: AppState) -> anyhow::Result<()> {
    let relay = state.relay();
    let mut session = match relay.start_session().await {
        Ok(session) => session,
        Err(err) => return send_error(&mut socket, &err).await,
    };
    let bridge = match relay.open_bridge(&mut session).await {
        Ok(bridge) => bridge,
        Err(err) => {
            relay.end_session(session);
            return send_error(&mut socket, &err).await;
        }
    };

    let (tx, mut rx) = mpsc::channel::<RelayEvent>(EVENT_BUFFER);
    let bridge_task = tokio::spawn(bridge.run(tx));

    let outcome = loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    let payload = serde_json::to_string(&event)?;
                    if socket.send(Message::Text(payload.into())).await.is_err() {
                        break Ok(());
                    }
                }
                None => break Ok(()),
            },
            frame = socket.recv() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Some(message) = parse_frame(text.as_str()) else {
                        debug!("ignoring client frame without text or value");
                        continue;
                    };
                    if let Err(err) = relay.post_message(&mut session, message).await {
                        warn!(error = %err, "forwarding client message failed");
                        break send_error(&mut socket, &err).await;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    debug!(error = %err, "client socket error");
                    break Ok(());
                }
            },
        }
    };

    drop(rx);
    match bridge_task.await {
        Ok(exit) => debug!(?exit, "bridge finished"),
        Err(err) => warn!(error = %err, "bridge task failed"),
    }
    relay.end_session(session);
    outcome
}

fn parse_frame(raw: &str) -> Option<OutboundMessage> {
    let frame: ClientFrame = serde_json::from_str(raw).ok()?;
    if frame.text.trim().is_empty() && frame.value.is_none() {
        return None;
    }
    Some(OutboundMessage {
        text: frame.text,
        value: frame.value,
        ..OutboundMessage::default()
    })
}

async fn send_error(socket: &mut WebSocket, err: &RelayError) -> anyhow::Result<()> {
    let payload = json!({"type": "error", "kind": err.kind(), "message": err.to_string()});
    socket
        .send(Message::Text(payload.to_string().into()))
        .await?;
    socket.send(Message::Close(None)).await.ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_need_text_or_value() {
        assert!(parse_frame(r#"{"text": "  "}"#).is_none());
        assert!(parse_frame("not json").is_none());
        let message = parse_frame(r#"{"text": "hi"}"#).unwrap();
        assert_eq!(message.text, "hi");
        let message = parse_frame(r#"{"value": {"choice": 1}}"#).unwrap();
        assert!(message.value.is_some());
    }
}
