#![cfg(not(tarpaulin_include))]

use sheetsync::config::ServerConfig;
use sheetsync::server;

/// Starts the document server.
///
/// Listens on `SHEETSYNC_BIND` (default `127.0.0.1:3000`) and keeps documents
/// under `SHEETSYNC_DATA_DIR` (default `database`, empty for memory only).
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    log::info!("starting document server on {}", config.bind);
    server::run(config).await
}
