// src/config.rs
// Configuration surface: defaults, optional TOML override file, env overrides,
// cross-field validation. Env always wins over the file.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

const ENV_CONFIG_PATH: &str = "FARCASTER_CONFIG_PATH";
const DEFAULT_CONFIG_PATH: &str = "config/farcaster.toml";

#[derive(Debug, Clone)]
pub struct FarcasterConfig {
    pub enabled: bool,
    pub dry_run: bool,
    /// Import-only operating mode: republish what other producers hand over,
    /// generate nothing of our own.
    pub sink_mode: bool,
    pub enable_source_plugins: bool,
    pub enable_autonomous_post_generation: bool,
    /// Extended account tier: raises the per-cast length ceiling to 1024.
    pub protocol_pro: bool,

    pub api_base_url: String,
    pub api_key: Option<String>,
    pub signer_uuid: Option<String>,
    pub fid: u64,

    pub post_interval_min_ms: u64,
    pub post_interval_max_ms: u64,
    pub interactions_interval_min_ms: u64,
    pub interactions_interval_max_ms: u64,
    pub max_cast_length: usize,
    pub cast_request_min_interval_ms: u64,

    pub max_posts_per_day: usize,
    pub max_posts_per_hour: usize,

    pub queue_max_size: usize,
    pub news_priority_weight: i64,
    pub trade_priority_weight: i64,

    pub ignore_bot_authors: bool,
    pub processed_message_ttl_ms: i64,
    pub max_actions_processing: usize,

    pub feed_rss_url: Option<String>,
    pub state_dir: PathBuf,
}

impl Default for FarcasterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dry_run: false,
            sink_mode: true,
            enable_source_plugins: false,
            enable_autonomous_post_generation: false,
            protocol_pro: false,

            api_base_url: "https://api.neynar.com".to_string(),
            api_key: None,
            signer_uuid: None,
            fid: 0,

            post_interval_min_ms: 30 * 60 * 1000,
            post_interval_max_ms: 60 * 60 * 1000,
            interactions_interval_min_ms: 60 * 1000,
            interactions_interval_max_ms: 2 * 60 * 1000,
            max_cast_length: 300,
            cast_request_min_interval_ms: 10_500,

            max_posts_per_day: 120,
            max_posts_per_hour: 20,

            queue_max_size: 300,
            news_priority_weight: 100,
            trade_priority_weight: 10,

            ignore_bot_authors: true,
            processed_message_ttl_ms: 24 * 60 * 60 * 1000,
            max_actions_processing: 1,

            feed_rss_url: None,
            state_dir: PathBuf::from("state"),
        }
    }
}

/// Partial config read from `config/farcaster.toml` (or `$FARCASTER_CONFIG_PATH`).
#[derive(Debug, Default, Deserialize)]
struct FileOverrides {
    enabled: Option<bool>,
    dry_run: Option<bool>,
    sink_mode: Option<bool>,
    enable_source_plugins: Option<bool>,
    enable_autonomous_post_generation: Option<bool>,
    protocol_pro: Option<bool>,
    api_base_url: Option<String>,
    post_interval_min_ms: Option<u64>,
    post_interval_max_ms: Option<u64>,
    interactions_interval_min_ms: Option<u64>,
    interactions_interval_max_ms: Option<u64>,
    max_cast_length: Option<usize>,
    cast_request_min_interval_ms: Option<u64>,
    max_posts_per_day: Option<usize>,
    max_posts_per_hour: Option<usize>,
    queue_max_size: Option<usize>,
    news_priority_weight: Option<i64>,
    trade_priority_weight: Option<i64>,
    ignore_bot_authors: Option<bool>,
    processed_message_ttl_ms: Option<i64>,
    max_actions_processing: Option<usize>,
    feed_rss_url: Option<String>,
    state_dir: Option<PathBuf>,
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_bool(target: &mut bool, key: &str) {
    if let Some(v) = env_str(key) {
        *target = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
    }
}

fn env_parse<T: std::str::FromStr>(target: &mut T, key: &str) {
    if let Some(v) = env_str(key) {
        if let Ok(parsed) = v.parse() {
            *target = parsed;
        } else {
            tracing::warn!(key, value = %v, "unparseable env value, keeping previous");
        }
    }
}

impl FarcasterConfig {
    /// Defaults, then the optional TOML file, then env vars, then validation.
    pub fn load() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_file()?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_file(&mut self) -> Result<()> {
        let path = env_str(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        if !path.exists() {
            if std::env::var(ENV_CONFIG_PATH).is_ok() {
                bail!("{ENV_CONFIG_PATH} points to non-existent path");
            }
            return Ok(());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let file: FileOverrides =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = file.$field { self.$field = v; })*
            };
        }
        take!(
            enabled,
            dry_run,
            sink_mode,
            enable_source_plugins,
            enable_autonomous_post_generation,
            protocol_pro,
            api_base_url,
            post_interval_min_ms,
            post_interval_max_ms,
            interactions_interval_min_ms,
            interactions_interval_max_ms,
            max_cast_length,
            cast_request_min_interval_ms,
            max_posts_per_day,
            max_posts_per_hour,
            queue_max_size,
            news_priority_weight,
            trade_priority_weight,
            ignore_bot_authors,
            processed_message_ttl_ms,
            max_actions_processing,
        );
        if file.feed_rss_url.is_some() {
            self.feed_rss_url = file.feed_rss_url;
        }
        if let Some(dir) = file.state_dir {
            self.state_dir = dir;
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        env_bool(&mut self.enabled, "FARCASTER_ENABLED");
        env_bool(&mut self.dry_run, "FARCASTER_DRY_RUN");
        env_bool(&mut self.sink_mode, "FARCASTER_SINK_MODE");
        env_bool(&mut self.enable_source_plugins, "FARCASTER_ENABLE_SOURCE_PLUGINS");
        env_bool(
            &mut self.enable_autonomous_post_generation,
            "FARCASTER_ENABLE_AUTONOMOUS_POST_GENERATION",
        );
        env_bool(&mut self.protocol_pro, "FARCASTER_PROTOCOL_PRO");

        env_parse(&mut self.api_base_url, "FARCASTER_API_BASE_URL");
        if let Some(v) = env_str("FARCASTER_API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = env_str("FARCASTER_SIGNER_UUID") {
            self.signer_uuid = Some(v);
        }
        env_parse(&mut self.fid, "FARCASTER_FID");

        env_parse(&mut self.post_interval_min_ms, "FARCASTER_POST_INTERVAL_MIN_MS");
        env_parse(&mut self.post_interval_max_ms, "FARCASTER_POST_INTERVAL_MAX_MS");
        env_parse(
            &mut self.interactions_interval_min_ms,
            "FARCASTER_INTERACTIONS_INTERVAL_MIN_MS",
        );
        env_parse(
            &mut self.interactions_interval_max_ms,
            "FARCASTER_INTERACTIONS_INTERVAL_MAX_MS",
        );
        env_parse(&mut self.max_cast_length, "FARCASTER_MAX_CAST_LENGTH");
        env_parse(
            &mut self.cast_request_min_interval_ms,
            "FARCASTER_CAST_REQUEST_MIN_INTERVAL_MS",
        );

        env_parse(&mut self.max_posts_per_day, "FARCASTER_MAX_POSTS_PER_DAY");
        env_parse(&mut self.max_posts_per_hour, "FARCASTER_MAX_POSTS_PER_HOUR");

        env_parse(&mut self.queue_max_size, "FARCASTER_QUEUE_MAX_SIZE");
        env_parse(&mut self.news_priority_weight, "FARCASTER_NEWS_PRIORITY_WEIGHT");
        env_parse(&mut self.trade_priority_weight, "FARCASTER_TRADE_PRIORITY_WEIGHT");

        env_bool(&mut self.ignore_bot_authors, "FARCASTER_IGNORE_BOT_AUTHORS");
        env_parse(&mut self.processed_message_ttl_ms, "FARCASTER_PROCESSED_MESSAGE_TTL_MS");
        env_parse(&mut self.max_actions_processing, "FARCASTER_MAX_ACTIONS_PROCESSING");

        if let Some(v) = env_str("FARCASTER_FEED_RSS_URL") {
            self.feed_rss_url = Some(v);
        }
        if let Some(v) = env_str("FARCASTER_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.dry_run {
            if self.api_key.is_none() {
                bail!("missing FARCASTER_API_KEY");
            }
            if self.signer_uuid.is_none() {
                bail!("missing FARCASTER_SIGNER_UUID");
            }
            if self.fid == 0 {
                bail!("missing or invalid FARCASTER_FID");
            }
        }
        if self.post_interval_min_ms > self.post_interval_max_ms {
            bail!("FARCASTER_POST_INTERVAL_MIN_MS cannot be greater than FARCASTER_POST_INTERVAL_MAX_MS");
        }
        if self.interactions_interval_min_ms > self.interactions_interval_max_ms {
            bail!(
                "FARCASTER_INTERACTIONS_INTERVAL_MIN_MS cannot be greater than FARCASTER_INTERACTIONS_INTERVAL_MAX_MS"
            );
        }
        if !(120..=1024).contains(&self.max_cast_length) {
            bail!("FARCASTER_MAX_CAST_LENGTH must be within 120..=1024");
        }
        Ok(())
    }

    /// Protocol ceiling for the account tier.
    pub fn platform_max_cast_length(&self) -> usize {
        if self.protocol_pro {
            1024
        } else {
            300
        }
    }

    /// Effective per-chunk limit: configured length clamped by the tier
    /// ceiling, floored at 120.
    pub fn effective_max_cast_length(&self) -> usize {
        self.max_cast_length.min(self.platform_max_cast_length()).max(120)
    }
}
