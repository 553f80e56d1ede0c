use tracing::info_span;

pub fn span_for_session(action: &'static str) -> tracing::Span {
    info_span!(
        "relay.session",
        action,
        conversation_id = tracing::field::Empty
    )
}

pub fn span_for_turn(action: &'static str, conversation_id: &str) -> tracing::Span {
    info_span!("relay.turn", action, conversation_id)
}

pub fn span_for_bridge(conversation_id: &str) -> tracing::Span {
    info_span!("relay.bridge", conversation_id)
}

/// Host of an endpoint, for log fields that must not carry paths or query strings.
pub fn endpoint_host(endpoint: &reqwest::Url) -> &str {
    endpoint.host_str().unwrap_or("-")
}
