use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use relay_core::RelayConfig;

pub const DEFAULT_BIND: &str = "0.0.0.0:8000";
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:5173";
pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(30 * 60);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub addr: SocketAddr,
    pub cors_allow_origin: String,
    pub log_format: LogFormat,
    /// Sessions untouched for this long are dropped from the registry.
    pub session_idle: Duration,
    pub relay: RelayConfig,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let bind = get("BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let addr = bind
            .trim()
            .parse()
            .with_context(|| format!("BIND is not a socket address: {bind}"))?;
        let cors_allow_origin = get("CORS_ALLOW_ORIGIN")
            .map(|origin| origin.trim().to_string())
            .unwrap_or_else(|| DEFAULT_CORS_ORIGIN.to_string());
        let log_format = log_format(get("LOG_FORMAT").as_deref())?;
        let session_idle = match get("SESSION_IDLE_SECS") {
            Some(raw) => {
                let secs: u64 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("SESSION_IDLE_SECS is not a number: {raw}"))?;
                if secs == 0 {
                    bail!("SESSION_IDLE_SECS must be greater than zero");
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_SESSION_IDLE,
        };

        Ok(Self {
            addr,
            cors_allow_origin,
            log_format,
            session_idle,
            relay: RelayConfig::from_lookup(&lookup)?,
        })
    }
}

/// Parses `LOG_FORMAT`; unset means plain text.
pub fn log_format(raw: Option<&str>) -> Result<LogFormat> {
    match raw.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
        None | Some("text") | Some("pretty") => Ok(LogFormat::Text),
        Some("json") => Ok(LogFormat::Json),
        Some(other) => bail!("LOG_FORMAT must be `text` or `json`, got `{other}`"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_browser_dev_setup() {
        let config = GatewayConfig::from_lookup(|key| {
            (key == "DIRECT_LINE_SECRET").then(|| "secret".to_string())
        })
        .unwrap();
        assert_eq!(config.addr.to_string(), DEFAULT_BIND);
        assert_eq!(config.cors_allow_origin, DEFAULT_CORS_ORIGIN);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.session_idle, DEFAULT_SESSION_IDLE);
    }

    #[test]
    fn log_format_is_validated() {
        assert_eq!(log_format(Some("JSON")).unwrap(), LogFormat::Json);
        assert!(log_format(Some("xml")).is_err());
    }

    #[test]
    fn session_idle_must_be_positive() {
        let config = GatewayConfig::from_lookup(|key| match key {
            "DIRECT_LINE_SECRET" => Some("secret".into()),
            "SESSION_IDLE_SECS" => Some("90".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.session_idle, Duration::from_secs(90));

        let err = GatewayConfig::from_lookup(|key| match key {
            "DIRECT_LINE_SECRET" => Some("secret".into()),
            "SESSION_IDLE_SECS" => Some("0".into()),
            _ => None,
        })
        .unwrap_err();
        assert!(err.to_string().contains("SESSION_IDLE_SECS"));
    }

    #[test]
    fn bad_bind_is_reported() {
        let err = GatewayConfig::from_lookup(|key| match key {
            "DIRECT_LINE_SECRET" => Some("secret".into()),
            "BIND" => Some("port 80".into()),
            _ => None,
        })
        .unwrap_err();
        assert!(err.to_string().contains("BIND"));
    }
}
