use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;
use txn_monitor::server::{run_server, AppState};
use txn_monitor::HubConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = HubConfig::default();
    if let Some(addr) = std::env::args().nth(1) {
        config = config.with_bind_addr(addr.parse::<SocketAddr>()?);
    }

    let state = AppState::from_config(config);
    run_server(state).await?;
    Ok(())
}
