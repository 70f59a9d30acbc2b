//! Farcaster Publisher — Binary Entrypoint
//! Loads configuration, authenticates the gateway client and starts the
//! publish, interaction and ticker-plugin loops.

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use farcaster_publisher::api::FarcasterClient;
use farcaster_publisher::config::FarcasterConfig;
use farcaster_publisher::generator::{CastGenerator, ModelGenerator, TemplateContext};
use farcaster_publisher::interactions::InteractionClient;
use farcaster_publisher::post::PostClient;
use farcaster_publisher::signals::{AutoTradingPlugin, MentionRankingPlugin};
use farcaster_publisher::store::StateStore;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("farcaster_publisher=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Arc::new(FarcasterConfig::load()?);
    if !config.enabled {
        tracing::warn!("client disabled via FARCASTER_ENABLED=false");
        return Ok(());
    }

    let client = Arc::new(FarcasterClient::new(config.clone()));
    client.init().await?;

    let generator: Arc<dyn CastGenerator> = Arc::new(ModelGenerator::from_env());
    let post = PostClient::new(config.clone(), client.clone(), generator.clone());
    post.set_template_context(TemplateContext {
        agent_name: client.username(),
        username: client.username(),
    });

    tracing::info!(
        fid = config.fid,
        dry_run = config.dry_run,
        sink_mode = config.sink_mode,
        post_window_ms = %format!("{}-{}", config.post_interval_min_ms, config.post_interval_max_ms),
        "client started"
    );

    post.start();

    let interactions = InteractionClient::new(client.clone(), generator.clone(), config.clone());
    interactions.start();

    // Source plugins only run when this instance generates its own content.
    let mut ranking = None;
    let mut trading = None;
    if !config.sink_mode || config.enable_source_plugins {
        let store = StateStore::new(&config.state_dir);
        let plugin = MentionRankingPlugin::new(
            post.clone(),
            PathBuf::from("state/tickerRankingComparison.json"),
            store.clone(),
            config.post_interval_min_ms,
        );
        plugin.start();
        ranking = Some(plugin);

        let plugin = AutoTradingPlugin::new(
            post.clone(),
            vec![
                PathBuf::from("state/tweetedTickersState.json"),
                PathBuf::from("state/mentionedTickersState.json"),
            ],
            store,
            config.post_interval_min_ms,
        );
        plugin.start();
        trading = Some(plugin);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    post.stop();
    interactions.stop();
    if let Some(p) = ranking {
        p.stop();
    }
    if let Some(p) = trading {
        p.stop();
    }
    Ok(())
}
