#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

mod bridge;
mod cli;
mod config;
mod db;
mod discord;
mod media;
mod transport;
mod utils;
mod web;

use config::Config;
use web::WebServer;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let config = Arc::new(
        Config::load_from_file(&cli.config)
            .with_context(|| format!("failed to load config from {}", cli.config.display()))?,
    );
    utils::logging::init_tracing(&config.logging);

    if cli.check_config {
        info!(
            "configuration ok relays={} store={}",
            config.relays.len(),
            config.database.connection_string()
        );
        return Ok(());
    }

    info!("discord mirror bridge starting up");

    let db_manager = Arc::new(db::DatabaseManager::new(&config.database).await?);
    db_manager.migrate().await?;

    if cli.cleanup_only {
        let removed = db_manager
            .mapping_store()
            .cleanup_old_mappings(config.bridge.mapping_retention_days)
            .await?;
        info!("removed {} expired mappings", removed);
        return Ok(());
    }

    let discord_client = Arc::new(discord::DiscordClient::new(config.clone())?);
    let bridge = Arc::new(bridge::BridgeCore::new(
        config.clone(),
        discord_client.clone(),
        db_manager.clone(),
    ));
    discord_client.set_bridge(bridge.clone()).await;

    let web_server = WebServer::new(config.clone(), bridge.clone());
    let web_handle = tokio::spawn(async move {
        if let Err(e) = web_server.start().await {
            error!("web server error: {}", e);
        }
    });

    let gateway = discord_client.clone();
    let bridge_handle = tokio::spawn(async move {
        if let Err(e) = gateway.start().await {
            error!("discord client error: {}", e);
            return;
        }
        if let Err(e) = bridge.start().await {
            error!("bridge error: {}", e);
        }
    });

    tokio::select! {
        _ = web_handle => {},
        _ = bridge_handle => {},
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
    }

    discord_client.stop().await?;
    info!("discord mirror bridge shutting down");
    Ok(())
}
