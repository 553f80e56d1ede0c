use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use reqwest::{Client, Url};

use crate::{
    directline_client::ReqwestDirectLineApi,
    gateway::{Regions, UpstreamGateway},
    relay::{ConversationRelay, RelaySettings},
    stream::WebSocketConnector,
    token::{SecretExchange, SharedCredentialSource, StaticSecret, TokenProvider},
};

pub const DEFAULT_DIRECT_LINE_BASE: &str = "https://directline.botframework.com/v3/directline";
pub const DEFAULT_FALLBACK_BASE: &str = "https://india.directline.botframework.com/v3/directline";

#[derive(Clone, PartialEq, Eq)]
pub struct RelayConfig {
    secret: String,
    pub token_url: Option<Url>,
    pub regions: Regions,
    pub settings: RelaySettings,
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("secret", &"[REDACTED]")
            .field("token_url", &self.token_url.as_ref().map(Url::as_str))
            .field("regions", &self.regions)
            .field("settings", &self.settings)
            .finish()
    }
}

impl RelayConfig {
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        Ok(Self {
            secret: secret.into(),
            token_url: None,
            regions: Regions::new(
                parse_url("DIRECT_LINE_BASE", DEFAULT_DIRECT_LINE_BASE)?,
                Some(parse_url("DIRECT_LINE_FALLBACK_BASE", DEFAULT_FALLBACK_BASE)?),
            ),
            settings: RelaySettings::default(),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let secret = get("DIRECT_LINE_SECRET").context("DIRECT_LINE_SECRET is not set")?;
        let mut config = Self::new(secret)?;

        if let Some(raw) = get("DIRECT_LINE_TOKEN_URL") {
            config.token_url = Some(parse_url("DIRECT_LINE_TOKEN_URL", &raw)?);
        }
        if let Some(raw) = get("DIRECT_LINE_BASE") {
            config.regions.primary = parse_url("DIRECT_LINE_BASE", &raw)?;
        }
        if let Some(raw) = get("DIRECT_LINE_FALLBACK_BASE") {
            config.regions.fallback = if raw.trim().eq_ignore_ascii_case("none") {
                None
            } else {
                Some(parse_url("DIRECT_LINE_FALLBACK_BASE", &raw)?)
            };
        }
        if let Some(raw) = get("RELAY_REPLY_TIMEOUT_SECS") {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("RELAY_REPLY_TIMEOUT_SECS is not a number: {raw}"))?;
            config.settings.reply_timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = get("RELAY_POLL_INTERVAL_MS") {
            let millis: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("RELAY_POLL_INTERVAL_MS is not a number: {raw}"))?;
            config.settings.poll_interval = Duration::from_millis(millis);
        }
        if let Some(user_id) = get("RELAY_USER_ID") {
            config.settings.user_id = user_id.trim().to_string();
        }
        if let Some(raw) = get("RELAY_DELIVERY") {
            config.settings.delivery = raw
                .parse()
                .map_err(anyhow::Error::msg)
                .context("RELAY_DELIVERY")?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.settings.reply_timeout.is_zero() {
            bail!("RELAY_REPLY_TIMEOUT_SECS must be greater than zero");
        }
        if self.settings.poll_interval.is_zero() {
            bail!("RELAY_POLL_INTERVAL_MS must be greater than zero");
        }
        if self.settings.poll_interval > self.settings.reply_timeout {
            bail!(
                "poll interval {:?} exceeds reply timeout {:?}",
                self.settings.poll_interval,
                self.settings.reply_timeout
            );
        }
        Ok(())
    }

    /// HTTP client whose per-request timeout matches the turn budget.
    pub fn http_client(&self) -> Result<Client> {
        Client::builder()
            .timeout(self.settings.reply_timeout)
            .build()
            .context("building upstream http client")
    }

    pub fn credential_source(&self, client: Client) -> SharedCredentialSource {
        match &self.token_url {
            Some(token_url) => Arc::new(SecretExchange::new(
                client,
                token_url.clone(),
                self.secret.clone(),
            )),
            None => Arc::new(StaticSecret::new(self.secret.clone())),
        }
    }

    pub fn build_relay(&self) -> Result<ConversationRelay> {
        let client = self.http_client()?;
        let tokens = Arc::new(TokenProvider::new(self.credential_source(client.clone())));
        let gateway = UpstreamGateway::new(
            Arc::new(ReqwestDirectLineApi::new(client)),
            Arc::new(WebSocketConnector),
            self.regions.clone(),
        );
        Ok(ConversationRelay::new(tokens, gateway, self.settings.clone()))
    }
}

fn parse_url(key: &str, raw: &str) -> Result<Url> {
    Url::parse(raw.trim()).with_context(|| format!("{key} is not a valid url: {raw}"))
}
