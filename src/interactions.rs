//! # Interaction poller
//! Separate consumer of the same rate-limited publish primitive: polls
//! mentions, dedups by hash with a TTL map, and replies through the content
//! generator. Cursor and processed set are persisted so a restart neither
//! re-reads nor re-answers old mentions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::api::{ApiErrorKind, Cast, CastSink, FarcasterClient};
use crate::config::FarcasterConfig;
use crate::generator::{CastGenerator, TemplateContext, REPLY_TEMPLATE};
use crate::store::StateStore;
use crate::textutil::{jitter_ms, now_ms};

const RECORD: &str = "interactionState";
const REPLY_TEXT_CAP: usize = 1_024;
/// Poller cooldown after a throttled mention fetch.
const FETCH_BACKOFF_MS: i64 = 70_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionState {
    pub version: u32,
    #[serde(rename = "lastMentionsCursor", default, skip_serializing_if = "Option::is_none")]
    pub last_mentions_cursor: Option<String>,
    /// hash -> processed-at (unix ms); entries expire after the configured TTL.
    #[serde(default)]
    pub processed: BTreeMap<String, i64>,
}

impl Default for InteractionState {
    fn default() -> Self {
        Self {
            version: 1,
            last_mentions_cursor: None,
            processed: BTreeMap::new(),
        }
    }
}

pub fn prune_processed(state: &mut InteractionState, now: i64, ttl_ms: i64) {
    let threshold = now - ttl_ms;
    state.processed.retain(|_, &mut ts| ts >= threshold);
}

pub fn should_ignore_author(cast: &Cast, own_fid: u64, ignore_bot_authors: bool) -> bool {
    if cast.author_fid == own_fid {
        return true;
    }
    if !ignore_bot_authors {
        return false;
    }
    let user = cast.author_username.as_deref().unwrap_or("").to_lowercase();
    user.contains("bot") || user.ends_with(".eth")
}

pub struct InteractionClient {
    client: Arc<FarcasterClient>,
    generator: Arc<dyn CastGenerator>,
    config: Arc<FarcasterConfig>,
    store: StateStore,
    fetch_backoff_until: Mutex<i64>,
    running: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl InteractionClient {
    pub fn new(
        client: Arc<FarcasterClient>,
        generator: Arc<dyn CastGenerator>,
        config: Arc<FarcasterConfig>,
    ) -> Arc<Self> {
        let store = StateStore::new(&config.state_dir);
        Arc::new(Self {
            client,
            generator,
            config,
            store,
            fetch_backoff_until: Mutex::new(0),
            running: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
        })
    }

    async fn reply_to_cast(&self, cast: &Cast) -> anyhow::Result<()> {
        let ctx = TemplateContext {
            agent_name: self.client.username(),
            username: self.client.username(),
        };
        let text = self.generator.generate(REPLY_TEMPLATE, &cast.text, &ctx).await?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let capped: String = text.chars().take(REPLY_TEXT_CAP).collect();
        let sent = self.client.reply_to_cast(&cast.hash, &capped).await?;
        tracing::info!(parent = %cast.hash, hash = %sent.hash, "replied to mention");
        Ok(())
    }

    pub async fn handle_interactions_once(&self) {
        let now = now_ms();
        if now < *self.fetch_backoff_until.lock().expect("backoff lock poisoned") {
            return;
        }

        let mut state: InteractionState = self.store.load(RECORD, InteractionState::default);
        prune_processed(&mut state, now, self.config.processed_message_ttl_ms);

        let page = match self.client.mentions(state.last_mentions_cursor.as_deref()).await {
            Ok(page) => page,
            Err(e) => {
                if e.kind == ApiErrorKind::Throttled {
                    *self.fetch_backoff_until.lock().expect("backoff lock poisoned") =
                        now_ms() + FETCH_BACKOFF_MS;
                }
                tracing::warn!(error = %e, "mentions fetch failed");
                self.save(&state);
                return;
            }
        };
        if page.next_cursor.is_some() {
            state.last_mentions_cursor = page.next_cursor.clone();
        }

        let mut processed_count = 0usize;
        for cast in &page.items {
            if should_ignore_author(cast, self.config.fid, self.config.ignore_bot_authors) {
                continue;
            }
            if state.processed.contains_key(&cast.hash) {
                continue;
            }
            if processed_count >= self.config.max_actions_processing {
                break;
            }
            if let Err(e) = self.reply_to_cast(cast).await {
                tracing::warn!(hash = %cast.hash, error = %e, "failed replying to cast");
            } else {
                processed_count += 1;
            }
            state.processed.insert(cast.hash.clone(), now_ms());
        }

        self.save(&state);
    }

    fn save(&self, state: &InteractionState) {
        if let Err(e) = self.store.save(RECORD, state) {
            tracing::warn!(error = %e, "failed to persist interaction state");
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
                this.handle_interactions_once().await;
                let delay = jitter_ms(
                    this.config.interactions_interval_min_ms,
                    this.config.interactions_interval_max_ms,
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
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

#[cfg(test)]
mod tests {
    use super::*;

    fn cast(hash: &str, fid: u64, username: Option<&str>) -> Cast {
        Cast {
            hash: hash.into(),
            text: "gm".into(),
            author_fid: fid,
            author_username: username.map(String::from),
            timestamp: String::new(),
            parent_hash: None,
        }
    }

    #[test]
    fn ttl_pruning_drops_only_expired_entries() {
        let mut state = InteractionState::default();
        let now = 1_700_000_000_000;
        state.processed.insert("old".into(), now - 100_000);
        state.processed.insert("fresh".into(), now - 1_000);
        prune_processed(&mut state, now, 60_000);
        assert!(!state.processed.contains_key("old"));
        assert!(state.processed.contains_key("fresh"));
    }

    #[test]
    fn own_and_bot_authors_are_ignored() {
        assert!(should_ignore_author(&cast("a", 7, Some("alice")), 7, true));
        assert!(should_ignore_author(&cast("b", 9, Some("newsbot")), 7, true));
        assert!(should_ignore_author(&cast("c", 9, Some("vitalik.eth")), 7, true));
        assert!(!should_ignore_author(&cast("d", 9, Some("alice")), 7, true));
        assert!(!should_ignore_author(&cast("e", 9, Some("newsbot")), 7, false));
    }
}
