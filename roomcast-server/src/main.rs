use log::info;
use roomcast_sync::{RelayServer, RoomRegistry, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    info!("Starting roomcast relay on {}...", config.bind_addr);

    let server = RelayServer::new(config, RoomRegistry::new());
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    let stats = server.stats().await;
    info!(
        "Relay stopped after {} connections, {} frames",
        stats.total_connections, stats.total_frames
    );
    Ok(())
}
