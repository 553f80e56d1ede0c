use anyhow::Result;
use axum::serve;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::GatewayConfig;
use crate::http::{AppState, cors_layer, router};

/// Builds the relay from configuration and serves until ctrl-c.
pub async fn run(config: GatewayConfig) -> Result<()> {
    let relay = config.relay.build_relay()?;
    let regions = relay.gateway().regions();
    info!(
        primary = %regions.primary,
        fallback = regions.fallback.as_ref().map(|url| url.as_str()).unwrap_or("none"),
        delivery = %relay.settings().delivery,
        "relay configured"
    );

    let state = AppState::new(relay);
    let sweeper = state.spawn_idle_sweeper(config.session_idle);
    let app = router(state).layer(cors_layer(&config.cors_allow_origin)?);
    let listener = TcpListener::bind(config.addr).await?;
    info!("relay-gateway listening on {}", config.addr);

    serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    sweeper.abort();
    Ok(())
}
