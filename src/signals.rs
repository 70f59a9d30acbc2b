// src/signals.rs
// Ticker producer plugins: file-fed trade-signal sources that generate a
// trade cast through the content generator and hand it to the publish queue.
// Each plugin dedups on a digest of its source snapshot so an unchanged file
// never produces a repeat post.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::limiter::DAY_MS;
use crate::post::PostClient;
use crate::store::StateStore;
use crate::textutil::now_ms;

const PLUGIN_INTERVAL_FLOOR_MS: u64 = 60_000;

fn digest_hex(payload: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

fn plugin_interval_ms(post_interval_min_ms: u64) -> u64 {
    post_interval_min_ms.max(PLUGIN_INTERVAL_FLOOR_MS)
}

// ---- most-mentioned ranking ------------------------------------------------

/// Tolerant ranking row: producers disagree on field names.
#[derive(Debug, Clone, Deserialize)]
pub struct RankingItem {
    pub symbol: Option<String>,
    pub ticker: Option<String>,
    pub position: Option<i64>,
    pub rank: Option<i64>,
    pub mentions: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MentionRankingState {
    #[serde(rename = "lastPostedTicker", default, skip_serializing_if = "Option::is_none")]
    pub last_posted_ticker: Option<String>,
    #[serde(rename = "lastPostedAt", default, skip_serializing_if = "Option::is_none")]
    pub last_posted_at: Option<i64>,
    #[serde(rename = "lastRankingDigest", default, skip_serializing_if = "Option::is_none")]
    pub last_ranking_digest: Option<String>,
}

pub struct RankingSignal {
    pub text: String,
    pub symbol: String,
    pub digest: String,
}

/// Build the seed message from a ranking file's contents, or `None` when the
/// file is absent, unparseable or empty.
pub fn pick_ranking_message(raw: &str) -> Option<RankingSignal> {
    let rows: Vec<RankingItem> = serde_json::from_str(raw).ok()?;
    let top = rows.first()?;
    let top10: Vec<Value> = serde_json::from_str::<Vec<Value>>(raw)
        .unwrap_or_default()
        .into_iter()
        .take(10)
        .collect();
    let digest = digest_hex(&serde_json::to_string(&top10).unwrap_or_default());
    let pos = top.position.or(top.rank).unwrap_or(0);
    let symbol = top
        .symbol
        .clone()
        .or_else(|| top.ticker.clone())
        .unwrap_or_else(|| "UNKNOWN".to_string())
        .to_uppercase();
    let text = format!(
        "Most-mentioned ticker sync: ${symbol} is currently leading at rank #{}. I am watching mention acceleration versus real liquidity before chasing entries.",
        pos + 1
    );
    Some(RankingSignal { text, symbol, digest })
}

pub struct MentionRankingPlugin {
    post: PostClient,
    ranking_path: PathBuf,
    store: StateStore,
    interval_ms: u64,
    running: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MentionRankingPlugin {
    pub fn new(
        post: PostClient,
        ranking_path: PathBuf,
        store: StateStore,
        post_interval_min_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            post,
            ranking_path,
            store,
            interval_ms: plugin_interval_ms(post_interval_min_ms),
            running: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
        })
    }

    pub async fn run_once(&self) {
        let Ok(raw) = std::fs::read_to_string(&self.ranking_path) else { return };
        let Some(signal) = pick_ranking_message(&raw) else { return };

        let mut state: MentionRankingState =
            self.store.load("postedMentionedState", MentionRankingState::default);
        if state.last_ranking_digest.as_deref() == Some(signal.digest.as_str()) {
            return;
        }

        self.post.queue_trade_cast(&signal.text).await;
        state = MentionRankingState {
            last_posted_ticker: Some(signal.symbol),
            last_posted_at: Some(now_ms()),
            last_ranking_digest: Some(signal.digest),
        };
        if let Err(e) = self.store.save("postedMentionedState", &state) {
            tracing::warn!(error = %e, "failed to persist ranking plugin state");
        }
        tracing::info!("mention-ranking plugin queued trade cast");
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                this.run_once().await;
                tokio::time::sleep(Duration::from_millis(this.interval_ms)).await;
            }
        });
        *self.loop_handle.lock().expect("handle lock poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.loop_handle.lock().expect("handle lock poisoned").take() {
            handle.abort();
        }
    }
}

// ---- cross-client trade sync -----------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTradingState {
    #[serde(rename = "lastReset", default)]
    pub last_reset: i64,
    #[serde(default)]
    pub posted: Vec<String>,
    #[serde(rename = "lastSourceDigest", default, skip_serializing_if = "Option::is_none")]
    pub last_source_digest: Option<String>,
}

impl Default for AutoTradingState {
    fn default() -> Self {
        Self {
            last_reset: 0,
            posted: Vec::new(),
            last_source_digest: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TickersFile {
    #[serde(default)]
    tweeted: Vec<String>,
}

fn read_tickers(path: &PathBuf) -> Vec<String> {
    let Ok(raw) = std::fs::read_to_string(path) else { return Vec::new() };
    serde_json::from_str::<TickersFile>(&raw)
        .map(|f| f.tweeted)
        .unwrap_or_default()
}

pub struct TradeSignal {
    pub text: String,
    pub digest: String,
}

/// Last ticker across the source files wins; the digest covers the whole
/// snapshot so any upstream change re-arms the plugin.
pub fn build_trade_signal(ticker_lists: &[Vec<String>]) -> Option<TradeSignal> {
    let candidates: Vec<String> = ticker_lists
        .iter()
        .flatten()
        .map(|x| x.to_uppercase())
        .collect();
    let chosen = candidates.last()?.clone();
    let snapshot = serde_json::to_string(ticker_lists).unwrap_or_default();
    let digest = digest_hex(&snapshot);
    let text = format!(
        "Cross-client trade sync: ${chosen} just triggered from the trading pipeline. I am tracking momentum, liquidity shift, and execution risk before confirming continuation."
    );
    Some(TradeSignal { text, digest })
}

pub struct AutoTradingPlugin {
    post: PostClient,
    ticker_paths: Vec<PathBuf>,
    store: StateStore,
    interval_ms: u64,
    running: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl AutoTradingPlugin {
    pub fn new(
        post: PostClient,
        ticker_paths: Vec<PathBuf>,
        store: StateStore,
        post_interval_min_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            post,
            ticker_paths,
            store,
            interval_ms: plugin_interval_ms(post_interval_min_ms),
            running: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
        })
    }

    pub async fn run_once(&self) {
        let mut state: AutoTradingState = self.store.load("postedTradeState", AutoTradingState::default);
        let now = now_ms();
        if state.last_reset == 0 || state.last_reset < now - DAY_MS {
            state.last_reset = now;
            state.posted.clear();
        }

        let lists: Vec<Vec<String>> = self.ticker_paths.iter().map(read_tickers).collect();
        let Some(signal) = build_trade_signal(&lists) else { return };

        if state.last_source_digest.as_deref() != Some(signal.digest.as_str())
            && !state.posted.contains(&signal.text)
        {
            self.post.queue_trade_cast(&signal.text).await;
            state.posted.push(signal.text);
            state.last_source_digest = Some(signal.digest);
            if let Err(e) = self.store.save("postedTradeState", &state) {
                tracing::warn!(error = %e, "failed to persist trade plugin state");
            }
            tracing::info!("auto-trading plugin queued trade cast");
        }
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                this.run_once().await;
                tokio::time::sleep(Duration::from_millis(this.interval_ms)).await;
            }
        });
        *self.loop_handle.lock().expect("handle lock poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.loop_handle.lock().expect("handle lock poisoned").take() {
            handle.abort();
        }
    }
}
