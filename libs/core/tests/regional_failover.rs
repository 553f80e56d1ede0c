use http::StatusCode;
use relay_core::{
    DirectLineError, OutboundMessage, Regions, RelayError, SessionStartError,
};
use reqwest::Url;

#[path = "../test_support/mod.rs"]
mod support;

use support::{
    CountingCredentials, FALLBACK, PRIMARY, ScriptedDirectLine, bot_message, harness,
    harness_with, lazy_batch, polling_settings,
};

#[tokio::test(start_paused = true)]
async fn forbidden_primary_fails_over_once_and_pins_the_fallback() {
    let h = harness(
        ScriptedDirectLine::new()
            .refuse(PRIMARY, StatusCode::FORBIDDEN)
            .script(vec![lazy_batch(
                |now| vec![bot_message("a1", "namaste", now)],
                "1",
            )]),
        polling_settings(),
    );

    let mut session = h.relay.start_session().await.unwrap();
    assert_eq!(session.endpoint().as_str(), FALLBACK);
    assert_eq!(session.handle().endpoint.as_str(), FALLBACK);

    h.relay
        .send_and_await_reply(&mut session, OutboundMessage::text("hello"))
        .await
        .unwrap();

    let calls = h.api.calls();
    let creates: Vec<&str> = calls.creates.iter().map(Url::as_str).collect();
    assert_eq!(creates, vec![PRIMARY, FALLBACK]);
    assert!(calls.posts.iter().all(|p| p.endpoint.as_str() == FALLBACK));
    assert!(calls.fetches.iter().all(|(e, _)| e.as_str() == FALLBACK));
}

#[tokio::test]
async fn healthy_primary_never_touches_the_fallback() {
    let h = harness(ScriptedDirectLine::new(), polling_settings());
    let session = h.relay.start_session().await.unwrap();
    assert_eq!(session.endpoint().as_str(), PRIMARY);
    assert_eq!(h.api.calls().creates.len(), 1);
}

#[tokio::test]
async fn only_forbidden_triggers_failover() {
    let h = harness(
        ScriptedDirectLine::new().refuse(PRIMARY, StatusCode::SERVICE_UNAVAILABLE),
        polling_settings(),
    );
    let err = h.relay.start_session().await.unwrap_err();
    match err {
        RelayError::SessionStart(SessionStartError::Upstream(DirectLineError::Remote {
            status,
            ..
        })) => assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.api.calls().creates.len(), 1);
}

#[tokio::test]
async fn both_regions_refusing_is_unavailable() {
    let h = harness(
        ScriptedDirectLine::new()
            .refuse(PRIMARY, StatusCode::FORBIDDEN)
            .refuse(FALLBACK, StatusCode::FORBIDDEN),
        polling_settings(),
    );
    let err = h.relay.start_session().await.unwrap_err();
    match err {
        RelayError::SessionStart(SessionStartError::Upstream(DirectLineError::Unavailable {
            primary,
            fallback,
        })) => {
            assert_eq!(primary, StatusCode::FORBIDDEN);
            assert_eq!(fallback.status(), Some(StatusCode::FORBIDDEN));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.api.calls().creates.len(), 2);
}

#[tokio::test]
async fn without_a_fallback_the_refusal_is_returned() {
    let h = harness_with(
        ScriptedDirectLine::new().refuse(PRIMARY, StatusCode::FORBIDDEN),
        CountingCredentials::ok(),
        Regions::new(Url::parse(PRIMARY).unwrap(), None),
        polling_settings(),
    );
    let err = h.relay.start_session().await.unwrap_err();
    match err {
        RelayError::SessionStart(SessionStartError::Upstream(err)) => {
            assert_eq!(err.status(), Some(StatusCode::FORBIDDEN))
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.api.calls().creates.len(), 1);
}
