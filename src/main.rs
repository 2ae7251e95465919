use serenity::all::GatewayIntents;
use serenity::Client;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod discord;
mod query;
mod store;
mod sweeper;
mod tracker;

use crate::config::Config;
use crate::discord::{Handler, TrackerKey};
use crate::store::Store;
use crate::tracker::VoiceTracker;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let tracker = Arc::new(VoiceTracker::new(Store::new(config.data_file.clone())));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MEMBERS;

    let mut client = Client::builder(&config.token, intents)
        .event_handler(Handler::new(config.sweep_interval, shutdown_rx))
        .type_map_insert::<TrackerKey>(tracker)
        .await
        .expect("failed to build Discord client");

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            shard_manager.shutdown_all().await;
        }
    });

    info!(
        data_file = %config.data_file.display(),
        sweep_interval_secs = config.sweep_interval.as_secs(),
        "starting voice time bot"
    );

    if let Err(why) = client.start().await {
        error!(error = ?why, "client error");
    }
}
