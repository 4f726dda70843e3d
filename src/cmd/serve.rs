//! `cloudx serve` and `cloudx init-db`.

use anyhow::Result;
use tracing::info;

use cloudx::config::CloudxConfig;
use cloudx::platform::server::{ServerConfig, open_store, start_server};

pub async fn cmd_serve(config: CloudxConfig, in_memory: bool) -> Result<()> {
    start_server(ServerConfig { config, in_memory }).await
}

pub async fn cmd_init_db(config: &CloudxConfig) -> Result<()> {
    open_store(config, false).await?;
    info!(database = %config.database.name, "schema ready");
    println!(
        "Database schema initialized on {}:{}/{}",
        config.database.host, config.database.port, config.database.name
    );
    Ok(())
}
