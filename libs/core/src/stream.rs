use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, future, stream::BoxStream};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::directline_client::{ActivitySet, DirectLineError};

/// Lazy, non-restartable sequence of raw activity batches pushed by the upstream.
pub type ActivityStream = BoxStream<'static, Result<ActivitySet, DirectLineError>>;

#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn open(&self, stream_url: &str) -> Result<ActivityStream, DirectLineError>;
}

pub type SharedStreamConnector = Arc<dyn StreamConnector>;

/// Direct Line WebSocket stream client.
#[derive(Clone, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl StreamConnector for WebSocketConnector {
    async fn open(&self, stream_url: &str) -> Result<ActivityStream, DirectLineError> {
        let (socket, response) = connect_async(stream_url)
            .await
            .map_err(|err| DirectLineError::Stream(err.into()))?;
        debug!(status = %response.status(), "direct line stream connected");

        let batches = socket.filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => decode_batch(text.as_bytes()),
                Ok(Message::Binary(bytes)) => decode_batch(&bytes),
                Ok(_) => None,
                Err(err) => Some(Err(DirectLineError::Stream(err.into()))),
            })
        });
        Ok(batches.boxed())
    }
}

/// Decodes one stream frame. Empty frames are keep-alives and yield nothing.
pub fn decode_batch(payload: &[u8]) -> Option<Result<ActivitySet, DirectLineError>> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(
        serde_json::from_slice::<ActivitySet>(payload)
            .map_err(|err| DirectLineError::Decode(err.into())),
    )
}
