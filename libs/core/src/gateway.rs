use http::StatusCode;
use metrics::counter;
use reqwest::Url;
use tracing::{info, warn};

use crate::{
    directline_client::{
        ActivitySet, ConversationResponse, DirectLineError, OutboundActivity, SharedDirectLineApi,
    },
    stream::{ActivityStream, SharedStreamConnector},
};

/// Primary and optional fallback Direct Line regions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Regions {
    pub primary: Url,
    pub fallback: Option<Url>,
}

impl Regions {
    pub fn new(primary: Url, fallback: Option<Url>) -> Self {
        Self { primary, fallback }
    }

    pub fn region_label(&self, endpoint: &Url) -> &'static str {
        if self.fallback.as_ref() == Some(endpoint) {
            "fallback"
        } else {
            "primary"
        }
    }
}

/// A conversation pinned to the region that created it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationHandle {
    pub conversation_id: String,
    pub token: String,
    pub endpoint: Url,
    pub stream_url: Option<String>,
    pub expires_in: Option<u64>,
}

impl ConversationHandle {
    fn pinned(response: ConversationResponse, endpoint: Url) -> Self {
        Self {
            conversation_id: response.conversation_id,
            token: response.token,
            endpoint,
            stream_url: response.stream_url,
            expires_in: response.expires_in,
        }
    }
}

/// Upstream gateway: regional failover on creation, pinned endpoints after.
#[derive(Clone)]
pub struct UpstreamGateway {
    api: SharedDirectLineApi,
    streams: SharedStreamConnector,
    regions: Regions,
}

impl UpstreamGateway {
    pub fn new(api: SharedDirectLineApi, streams: SharedStreamConnector, regions: Regions) -> Self {
        Self {
            api,
            streams,
            regions,
        }
    }

    pub fn regions(&self) -> &Regions {
        &self.regions
    }

    pub async fn create_conversation(
        &self,
        credential: &str,
    ) -> Result<ConversationHandle, DirectLineError> {
        let primary = self.regions.primary.clone();
        let err = match self.api.create_conversation(&primary, credential).await {
            Ok(response) => return Ok(ConversationHandle::pinned(response, primary)),
            Err(err) => err,
        };

        let refused = matches!(
            &err,
            DirectLineError::Remote { status, .. } if *status == StatusCode::FORBIDDEN
        );
        let fallback = match self.regions.fallback.clone() {
            Some(fallback) if refused => fallback,
            _ => return Err(err),
        };

        warn!(
            primary = %primary,
            fallback = %fallback,
            "primary region refused conversation, trying fallback region"
        );
        counter!("relay_region_failovers_total").increment(1);
        match self.api.create_conversation(&fallback, credential).await {
            Ok(response) => {
                info!(endpoint = %fallback, "conversation pinned to fallback region");
                Ok(ConversationHandle::pinned(response, fallback))
            }
            Err(fallback_err) => Err(DirectLineError::Unavailable {
                primary: StatusCode::FORBIDDEN,
                fallback: Box::new(fallback_err),
            }),
        }
    }

    pub async fn post_activity(
        &self,
        handle: &ConversationHandle,
        activity: &OutboundActivity,
    ) -> Result<String, DirectLineError> {
        self.api
            .post_activity(
                &handle.endpoint,
                &handle.conversation_id,
                &handle.token,
                activity,
            )
            .await
    }

    pub async fn fetch_activities(
        &self,
        handle: &ConversationHandle,
        watermark: Option<&str>,
    ) -> Result<ActivitySet, DirectLineError> {
        self.api
            .fetch_activities(
                &handle.endpoint,
                &handle.conversation_id,
                &handle.token,
                watermark,
            )
            .await
    }

    pub async fn open_stream(&self, stream_url: &str) -> Result<ActivityStream, DirectLineError> {
        self.streams.open(stream_url).await
    }
}
