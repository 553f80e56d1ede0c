use std::time::Duration;

use axum::http::{HeaderValue, StatusCode, header::RETRY_AFTER};
use axum::{
    Json,
    response::{IntoResponse, Response},
};
use relay_core::{CredentialError, DirectLineError, RelayError, SessionStartError};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    BadRequest(&'static str),
    #[error("{0}")]
    Conflict(&'static str),
    #[error("relay error")]
    Relay(#[from] RelayError),
    #[error("internal server error")]
    Internal(#[source] anyhow::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::Relay(RelayError::SessionStart(SessionStartError::Credential(
                CredentialError::MissingConfiguration(_),
            ))) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Relay(RelayError::SessionStart(_)) => StatusCode::BAD_GATEWAY,
            GatewayError::Relay(RelayError::Upstream(DirectLineError::Remote { status, .. })) => {
                match *status {
                    // The conversation token is expired or revoked; the client must start over.
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => *status,
                    StatusCode::TOO_MANY_REQUESTS => StatusCode::TOO_MANY_REQUESTS,
                    status if status.is_server_error() => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::BAD_REQUEST,
                }
            }
            GatewayError::Relay(RelayError::Upstream(_)) => StatusCode::BAD_GATEWAY,
            GatewayError::Relay(RelayError::ReplyTimeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Relay(RelayError::StreamUnavailable) => StatusCode::CONFLICT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::Relay(RelayError::Upstream(DirectLineError::Remote {
                retry_after,
                ..
            })) => *retry_after,
            _ => None,
        }
    }

    fn upstream_status(&self) -> Option<u16> {
        match self {
            GatewayError::Relay(RelayError::Upstream(err)) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    fn message(&self) -> String {
        match self {
            GatewayError::Relay(RelayError::Upstream(DirectLineError::Remote {
                message, ..
            })) => format!("Downstream Error: {message}"),
            GatewayError::Relay(RelayError::SessionStart(_)) => {
                "could not start a conversation".to_string()
            }
            GatewayError::Relay(err) => err.to_string(),
            GatewayError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            error: self.message(),
            upstream_status: self.upstream_status(),
        });
        let mut response = (status, body).into_response();
        if let Some(retry_after) = self.retry_after()
            && let Ok(header) = HeaderValue::from_str(&retry_after.as_secs().to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, header);
        }
        response
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    upstream_status: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_map_by_class_and_keep_retry_after() {
        let err = GatewayError::from(RelayError::Upstream(DirectLineError::Remote {
            status: StatusCode::SERVICE_UNAVAILABLE,
            retry_after: Some(Duration::from_secs(7)),
            message: "busy".into(),
        }));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        let response = err.into_response();
        assert_eq!(response.headers()[RETRY_AFTER], "7");

        let err = GatewayError::from(RelayError::Upstream(DirectLineError::Remote {
            status: StatusCode::NOT_FOUND,
            retry_after: None,
            message: "gone".into(),
        }));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn expired_conversation_tokens_pass_through() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            let err = GatewayError::from(RelayError::Upstream(DirectLineError::Remote {
                status,
                retry_after: None,
                message: "token expired".into(),
            }));
            assert_eq!(err.status(), status);
            assert_eq!(err.message(), "Downstream Error: token expired");
            assert_eq!(err.upstream_status(), Some(status.as_u16()));
        }
    }

    #[test]
    fn missing_secret_is_a_server_fault() {
        let err = GatewayError::from(RelayError::from(SessionStartError::from(
            CredentialError::MissingConfiguration("direct line secret"),
        )));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
