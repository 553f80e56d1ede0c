#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use futures::{StreamExt, future, stream};
use http::StatusCode;
use relay_core::{
    ActivitySet, ActivityStream, ConversationRelay, ConversationResponse, CredentialError,
    CredentialSource, DirectLineApi, DirectLineError, OutboundActivity, Regions, RelaySettings,
    StreamConnector, Token, TokenProvider, UpstreamGateway,
};
use reqwest::Url;
use serde_json::{Value, json};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::sync::mpsc;

pub const PRIMARY: &str = "https://directline.test/v3/directline";
pub const FALLBACK: &str = "https://india.directline.test/v3/directline";
pub const CONVERSATION_TOKEN: &str = "CONV_TOKEN_abc123";

pub fn regions() -> Regions {
    Regions::new(
        Url::parse(PRIMARY).expect("primary url"),
        Some(Url::parse(FALLBACK).expect("fallback url")),
    )
}

pub fn rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).expect("format timestamp")
}

pub fn bot_message(id: &str, text: &str, ts: OffsetDateTime) -> Value {
    json!({
        "type": "message",
        "id": id,
        "timestamp": rfc3339(ts),
        "from": {"id": "copilot-bot", "role": "bot"},
        "text": text
    })
}

pub fn user_echo(id: &str, text: &str, ts: OffsetDateTime) -> Value {
    json!({
        "type": "message",
        "id": id,
        "timestamp": rfc3339(ts),
        "from": {"id": "user1"},
        "text": text
    })
}

pub fn remote(status: StatusCode) -> DirectLineError {
    DirectLineError::Remote {
        status,
        retry_after: None,
        message: format!("scripted {status}"),
    }
}

/// One scripted `GET /activities` answer, produced when the fetch happens.
pub type FetchStep = Box<dyn FnOnce() -> Result<ActivitySet, DirectLineError> + Send>;

pub fn batch(activities: Vec<Value>, watermark: &str) -> FetchStep {
    let watermark = watermark.to_string();
    Box::new(move || {
        Ok(ActivitySet {
            activities,
            watermark: Some(watermark),
        })
    })
}

pub fn lazy_batch(
    make: impl FnOnce(OffsetDateTime) -> Vec<Value> + Send + 'static,
    watermark: &str,
) -> FetchStep {
    let watermark = watermark.to_string();
    Box::new(move || {
        Ok(ActivitySet {
            activities: make(OffsetDateTime::now_utc()),
            watermark: Some(watermark),
        })
    })
}

pub fn failing(status: StatusCode) -> FetchStep {
    Box::new(move || Err(remote(status)))
}

#[derive(Clone, Debug, PartialEq)]
pub struct PostedActivity {
    pub endpoint: Url,
    pub conversation_id: String,
    pub token: String,
    pub body: Value,
}

#[derive(Clone, Debug, Default)]
pub struct Calls {
    pub creates: Vec<Url>,
    pub posts: Vec<PostedActivity>,
    pub fetches: Vec<(Url, Option<String>)>,
}

/// In-memory Direct Line that answers from a script and records every call.
///
/// Once the fetch script is exhausted it answers with an empty page that
/// echoes the requested watermark, as the real service does when idle.
#[derive(Default)]
pub struct ScriptedDirectLine {
    refusals: Mutex<HashMap<String, StatusCode>>,
    stream_url: Option<String>,
    post_failure: Mutex<Option<StatusCode>>,
    post_delay: Option<Duration>,
    fetches: Mutex<VecDeque<FetchStep>>,
    calls: Mutex<Calls>,
}

impl ScriptedDirectLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream_url(mut self, url: &str) -> Self {
        self.stream_url = Some(url.to_string());
        self
    }

    pub fn refuse(self, endpoint: &str, status: StatusCode) -> Self {
        self.refusals
            .lock()
            .expect("refusals lock")
            .insert(endpoint.to_string(), status);
        self
    }

    /// Every post takes `delay` before it is answered.
    pub fn slow_posts(mut self, delay: Duration) -> Self {
        self.post_delay = Some(delay);
        self
    }

    pub fn fail_posts(&self, status: StatusCode) {
        *self.post_failure.lock().expect("post lock") = Some(status);
    }

    pub fn script(self, steps: Vec<FetchStep>) -> Self {
        self.fetches.lock().expect("fetch lock").extend(steps);
        self
    }

    pub fn push_fetch(&self, step: FetchStep) {
        self.fetches.lock().expect("fetch lock").push_back(step);
    }

    pub fn calls(&self) -> Calls {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl DirectLineApi for ScriptedDirectLine {
    async fn create_conversation(
        &self,
        endpoint: &Url,
        _credential: &str,
    ) -> Result<ConversationResponse, DirectLineError> {
        self.calls
            .lock()
            .expect("calls lock")
            .creates
            .push(endpoint.clone());
        if let Some(status) = self
            .refusals
            .lock()
            .expect("refusals lock")
            .get(endpoint.as_str())
        {
            return Err(remote(*status));
        }
        Ok(ConversationResponse {
            token: CONVERSATION_TOKEN.to_string(),
            conversation_id: "conv-1".to_string(),
            stream_url: self.stream_url.clone(),
            expires_in: Some(3600),
        })
    }

    async fn post_activity(
        &self,
        endpoint: &Url,
        conversation_id: &str,
        token: &str,
        activity: &OutboundActivity,
    ) -> Result<String, DirectLineError> {
        if let Some(delay) = self.post_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = *self.post_failure.lock().expect("post lock") {
            return Err(remote(status));
        }
        let mut calls = self.calls.lock().expect("calls lock");
        calls.posts.push(PostedActivity {
            endpoint: endpoint.clone(),
            conversation_id: conversation_id.to_string(),
            token: token.to_string(),
            body: serde_json::to_value(activity).expect("serialize activity"),
        });
        Ok(format!("{conversation_id}|user-{}", calls.posts.len()))
    }

    async fn fetch_activities(
        &self,
        endpoint: &Url,
        _conversation_id: &str,
        _token: &str,
        watermark: Option<&str>,
    ) -> Result<ActivitySet, DirectLineError> {
        self.calls
            .lock()
            .expect("calls lock")
            .fetches
            .push((endpoint.clone(), watermark.map(str::to_string)));
        let step = self.fetches.lock().expect("fetch lock").pop_front();
        match step {
            Some(step) => step(),
            None => Ok(ActivitySet {
                activities: Vec::new(),
                watermark: watermark.map(str::to_string),
            }),
        }
    }
}

/// Hands out one stream per `open`, fed through the returned senders.
#[derive(Default)]
pub struct ChannelStreams {
    pending: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<ActivitySet, DirectLineError>>>>,
    opened: Mutex<Vec<String>>,
    stalled: AtomicBool,
}

pub type StreamFeed = mpsc::UnboundedSender<Result<ActivitySet, DirectLineError>>;

impl ChannelStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a stream for the next `open` and returns the sender feeding it.
    pub fn prepare(&self) -> StreamFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().expect("streams lock").push_back(rx);
        tx
    }

    /// Every later `open` hangs without ever connecting.
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().expect("opened lock").clone()
    }
}

#[async_trait]
impl StreamConnector for ChannelStreams {
    async fn open(&self, stream_url: &str) -> Result<ActivityStream, DirectLineError> {
        self.opened
            .lock()
            .expect("opened lock")
            .push(stream_url.to_string());
        if self.stalled.load(Ordering::SeqCst) {
            future::pending::<()>().await;
        }
        let rx = self
            .pending
            .lock()
            .expect("streams lock")
            .pop_front()
            .ok_or_else(|| DirectLineError::Stream(anyhow::anyhow!("no scripted stream")))?;
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

pub struct CountingCredentials {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingCredentials {
    pub fn ok() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn rejecting() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialSource for CountingCredentials {
    async fn issue(&self) -> Result<Token, CredentialError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail {
            return Err(CredentialError::Rejected {
                status: StatusCode::UNAUTHORIZED,
                body: "bad secret".into(),
            });
        }
        Ok(Token::new(
            format!("SECRET_BEARER_{n}"),
            OffsetDateTime::now_utc() + time::Duration::minutes(30),
        ))
    }
}

pub struct Harness {
    pub api: Arc<ScriptedDirectLine>,
    pub streams: Arc<ChannelStreams>,
    pub credentials: Arc<CountingCredentials>,
    pub relay: ConversationRelay,
}

pub fn harness(api: ScriptedDirectLine, settings: RelaySettings) -> Harness {
    harness_with(api, CountingCredentials::ok(), regions(), settings)
}

pub fn harness_with(
    api: ScriptedDirectLine,
    credentials: CountingCredentials,
    regions: Regions,
    settings: RelaySettings,
) -> Harness {
    let api = Arc::new(api);
    let streams = Arc::new(ChannelStreams::new());
    let credentials = Arc::new(credentials);
    let tokens = Arc::new(TokenProvider::new(credentials.clone()));
    let gateway = UpstreamGateway::new(api.clone(), streams.clone(), regions);
    Harness {
        api,
        streams,
        credentials,
        relay: ConversationRelay::new(tokens, gateway, settings),
    }
}

pub fn polling_settings() -> RelaySettings {
    RelaySettings {
        delivery: relay_core::DeliveryMode::Poll,
        ..RelaySettings::default()
    }
}
