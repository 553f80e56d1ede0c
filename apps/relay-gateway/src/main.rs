use anyhow::Result;
use relay_gateway::{GatewayConfig, run, tracing_init::init_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = GatewayConfig::from_env()?;
    init_tracing(config.log_format)?;
    run(config).await
}
