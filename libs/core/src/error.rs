use std::time::Duration;

use thiserror::Error;

use crate::{directline_client::DirectLineError, token::CredentialError};

#[derive(Debug, Error)]
pub enum SessionStartError {
    #[error("could not obtain an upstream credential")]
    Credential(#[from] CredentialError),
    #[error("upstream refused to open a conversation")]
    Upstream(#[from] DirectLineError),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("session start failed")]
    SessionStart(#[from] SessionStartError),
    #[error("upstream call failed")]
    Upstream(#[from] DirectLineError),
    #[error("no bot reply within {budget:?}")]
    ReplyTimeout { budget: Duration },
    #[error("conversation has no stream url")]
    StreamUnavailable,
}

impl RelayError {
    /// Whether the caller may re-await the same turn without starting over.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::ReplyTimeout { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::SessionStart(SessionStartError::Credential(_)) => "credential",
            RelayError::SessionStart(SessionStartError::Upstream(_)) => "session_start",
            RelayError::Upstream(err) => err.kind(),
            RelayError::ReplyTimeout { .. } => "reply_timeout",
            RelayError::StreamUnavailable => "stream_unavailable",
        }
    }
}
