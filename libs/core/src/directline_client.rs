use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::StatusCode;
use metrics::{counter, histogram};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Raw conversation descriptor returned by `POST /conversations`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationResponse {
    pub token: String,
    pub conversation_id: String,
    pub stream_url: Option<String>,
    pub expires_in: Option<u64>,
}

/// One page of activities plus the cursor the upstream issued for it.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ActivitySet {
    #[serde(default)]
    pub activities: Vec<Value>,
    #[serde(default)]
    pub watermark: Option<String>,
}

/// Outbound user activity in Bot Framework shape.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct OutboundActivity {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub from: ChannelAccount,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(rename = "channelData", skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<Value>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ChannelAccount {
    pub id: String,
    pub role: &'static str,
}

impl OutboundActivity {
    pub fn user_message(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: "message",
            from: ChannelAccount {
                id: user_id.into(),
                role: "user",
            },
            text: text.into(),
            value: None,
            channel_data: None,
        }
    }
}

/// Raw request operations against one Direct Line region.
///
/// Implementations never retry; failover and pinning are handled by
/// [`crate::gateway::UpstreamGateway`].
#[async_trait]
pub trait DirectLineApi: Send + Sync {
    async fn create_conversation(
        &self,
        endpoint: &Url,
        credential: &str,
    ) -> Result<ConversationResponse, DirectLineError>;

    async fn post_activity(
        &self,
        endpoint: &Url,
        conversation_id: &str,
        token: &str,
        activity: &OutboundActivity,
    ) -> Result<String, DirectLineError>;

    async fn fetch_activities(
        &self,
        endpoint: &Url,
        conversation_id: &str,
        token: &str,
        watermark: Option<&str>,
    ) -> Result<ActivitySet, DirectLineError>;
}

pub type SharedDirectLineApi = Arc<dyn DirectLineApi>;

#[derive(Clone)]
pub struct ReqwestDirectLineApi {
    client: Client,
}

impl ReqwestDirectLineApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Appends `segments` to `base`, keeping any path prefix already present on the base.
///
/// Each segment is percent-encoded on its own, so ids cannot reshape the path or query.
pub fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, DirectLineError> {
    if let Some(bad) = segments
        .iter()
        .find(|segment| matches!(**segment, "" | "." | ".."))
    {
        return Err(DirectLineError::Config(anyhow::anyhow!(
            "invalid path segment `{bad}`"
        )));
    }
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| DirectLineError::Config(anyhow::anyhow!("{base} cannot carry a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[async_trait]
impl DirectLineApi for ReqwestDirectLineApi {
    async fn create_conversation(
        &self,
        endpoint_base: &Url,
        credential: &str,
    ) -> Result<ConversationResponse, DirectLineError> {
        let url = endpoint(endpoint_base, &["conversations"])?;
        let started = Instant::now();
        let response = self
            .client
            .post(url)
            .bearer_auth(credential)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|err| transport_error("conversations.start", err))?;
        record_roundtrip("conversations.start", response.status(), started);

        map_response("conversations.start", response)
            .await
            .map(|raw: RawConversationResponse| ConversationResponse {
                token: raw.token,
                conversation_id: raw.conversation_id,
                stream_url: raw.stream_url,
                expires_in: raw.expires_in,
            })
    }

    async fn post_activity(
        &self,
        endpoint_base: &Url,
        conversation_id: &str,
        token: &str,
        activity: &OutboundActivity,
    ) -> Result<String, DirectLineError> {
        let url = endpoint(
            endpoint_base,
            &["conversations", conversation_id, "activities"],
        )?;
        let started = Instant::now();
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(activity)
            .send()
            .await
            .map_err(|err| transport_error("activities.post", err))?;
        record_roundtrip("activities.post", response.status(), started);

        map_response("activities.post", response)
            .await
            .map(|raw: RawResourceResponse| raw.id.unwrap_or_default())
    }

    async fn fetch_activities(
        &self,
        endpoint_base: &Url,
        conversation_id: &str,
        token: &str,
        watermark: Option<&str>,
    ) -> Result<ActivitySet, DirectLineError> {
        let url = endpoint(
            endpoint_base,
            &["conversations", conversation_id, "activities"],
        )?;
        let started = Instant::now();
        let mut request = self.client.get(url).bearer_auth(token);
        if let Some(wm) = watermark {
            request = request.query(&[("watermark", wm)]);
        }
        let response = request
            .send()
            .await
            .map_err(|err| transport_error("activities.fetch", err))?;
        record_roundtrip("activities.fetch", response.status(), started);

        map_response("activities.fetch", response).await
    }
}

fn transport_error(endpoint: &'static str, err: reqwest::Error) -> DirectLineError {
    counter!(
        "relay_errors_total",
        "kind" => "directline_transport",
        "endpoint" => endpoint
    )
    .increment(1);
    DirectLineError::Transport(err)
}

fn record_roundtrip(endpoint: &'static str, status: StatusCode, started: Instant) {
    histogram!(
        "relay_dl_roundtrip_seconds",
        "endpoint" => endpoint,
        "status" => status.as_str().to_string()
    )
    .record(started.elapsed().as_secs_f64());
}

pub(crate) async fn map_response<T>(
    endpoint: &'static str,
    response: reqwest::Response,
) -> Result<T, DirectLineError>
where
    T: for<'de> Deserialize<'de>,
{
    let status = response.status();
    if !status.is_success() {
        let retry_after = retry_after(&response);
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable>".into());
        counter!(
            "relay_errors_total",
            "kind" => "directline_remote",
            "endpoint" => endpoint,
            "status" => status.as_str().to_string()
        )
        .increment(1);
        return Err(DirectLineError::Remote {
            status,
            retry_after,
            message: truncate_body(body),
        });
    }

    response.json::<T>().await.map_err(|err| {
        counter!(
            "relay_errors_total",
            "kind" => "directline_decode",
            "endpoint" => endpoint
        )
        .increment(1);
        DirectLineError::Decode(err.into())
    })
}

pub(crate) fn truncate_body(body: String) -> String {
    const MAX_BODY: usize = 512;
    if body.len() <= MAX_BODY {
        return body;
    }
    let mut cut = MAX_BODY;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    body[..cut].to_string()
}

pub(crate) fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(http::header::RETRY_AFTER)
        .and_then(|header| header.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[derive(Debug, Error)]
pub enum DirectLineError {
    #[error("direct line configuration error")]
    Config(#[source] anyhow::Error),
    #[error("direct line transport error")]
    Transport(#[source] reqwest::Error),
    #[error("direct line remote error (status {status}, retry_after = {retry_after:?})")]
    Remote {
        status: StatusCode,
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("direct line response decode error")]
    Decode(#[source] anyhow::Error),
    #[error("direct line unavailable in every configured region")]
    Unavailable {
        primary: StatusCode,
        #[source]
        fallback: Box<DirectLineError>,
    },
    #[error("direct line stream error")]
    Stream(#[source] anyhow::Error),
}

impl DirectLineError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            DirectLineError::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DirectLineError::Config(_) => "config",
            DirectLineError::Transport(_) => "transport",
            DirectLineError::Remote { .. } => "remote",
            DirectLineError::Decode(_) => "decode",
            DirectLineError::Unavailable { .. } => "unavailable",
            DirectLineError::Stream(_) => "stream",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConversationResponse {
    token: String,
    #[serde(rename = "conversationId")]
    conversation_id: String,
    #[serde(rename = "streamUrl", default)]
    stream_url: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawResourceResponse {
    #[serde(default)]
    id: Option<String>,
}
