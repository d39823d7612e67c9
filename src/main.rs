use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use botlink_server::config::ServerConfig;
use botlink_server::server::driver::SimulationDriver;
use botlink_server::server::services::{DisabledInstanceControl, FsHistoryWriter};
use botlink_server::server::BotServer;
use botlink_server::sim::headless::HeadlessScene;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Botlink Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ServerConfig::load_or_default();
    config.validate().map_err(anyhow::Error::msg)?;
    info!(
        "Configuration loaded: {} steps/s, broadcast every {} steps, {} managed bots",
        config.step_rate,
        config.tick_rate,
        config.managed_bots.len()
    );

    // Collaborator services: the matchmaking control plane is external;
    // without one configured, run-start requests fail softly and only
    // directly-registered bots can join
    let control = Arc::new(DisabledInstanceControl::new());
    let history = Arc::new(FsHistoryWriter::new(config.replay_data_dir.clone()));

    let server = BotServer::new(config.clone(), control, history);
    let scene = HeadlessScene::new("headless");
    let driver = SimulationDriver::new(server.clone(), Box::new(scene));

    if !config.managed_bots.is_empty() {
        server.request_start_run();
    }

    // Shutdown signal handler
    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Shutdown signal received");
    };

    // The driver performs graceful session teardown before returning
    driver.run(shutdown).await;
    info!("Server stopped");

    Ok(())
}
