//! # Publish pipeline
//! The scheduler that ties the queue, the rate limiter and the chunked
//! publisher together. One `PostClient` per agent identity: it owns its loop
//! task and single-flight drain flag, with an explicit `start()`/`stop()`
//! lifecycle.
//!
//! Per tick: import external work (shared inbox in sink mode, feed poll
//! otherwise), optionally synthesize an autonomous cast when idle, attempt
//! exactly one drain, then reschedule with a delay derived from backoff and
//! queue state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use metrics::{counter, describe_counter, gauge};
use once_cell::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::api::{ApiErrorKind, Cast, CastSink};
use crate::config::FarcasterConfig;
use crate::feed::FeedPoller;
use crate::generator::{cap_generated, CastGenerator, TemplateContext, NEWS_TEMPLATE, TRADE_TEMPLATE};
use crate::inbox::{infer_kind, SharedInbox};
use crate::limiter::{Admission, RateLimiter};
use crate::queue::{NewCast, PostQueue, QueueItem, QueueKind, QueuePolicy};
use crate::store::StateStore;
use crate::textutil::{jitter_ms, now_ms, split_cast_text};

const IMMEDIATE_DRAIN_DELAY_MS: u64 = 1_500;
/// Short tick while the queue still has work.
const NONEMPTY_QUEUE_DELAY_MS: u64 = 15_000;
/// Quota sleeps are capped so config changes are picked up within minutes.
const QUOTA_WAIT_CAP_MS: i64 = 15 * 60 * 1000;
const MIN_CAST_BACKOFF_MS: i64 = 15_000;
const DEFAULT_CAST_BACKOFF_MS: i64 = 45_000;
const QUOTA_WARN_INTERVAL_MS: i64 = 10 * 60 * 1000;
const SHARED_IMPORT_TEXT_CAP: usize = 1_500;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("casts_published_total", "Casts (chunks) published.");
        describe_counter!("publish_items_completed_total", "Queue items fully published.");
        describe_counter!("publish_throttled_total", "Publish attempts answered with 429.");
        describe_counter!("publish_quota_deferred_total", "Drains deferred by local quota.");
    });
}

/// Advisory scheduling hints; losing them on restart costs at most one extra
/// immediate attempt because admissibility is recomputed from the persisted
/// rate snapshot.
#[derive(Debug, Default)]
struct Backoff {
    cast_backoff_until: i64,
    quota_backoff_until: i64,
    last_cast_request_at: i64,
    last_quota_warn_at: i64,
}

/// Outcome of publishing a single chunk.
enum ChunkOutcome {
    Published(Cast),
    BackedOff,
}

struct Inner {
    config: Arc<FarcasterConfig>,
    sink: Arc<dyn CastSink>,
    generator: Arc<dyn CastGenerator>,
    queue: Mutex<PostQueue>,
    limiter: Mutex<RateLimiter>,
    backoff: Mutex<Backoff>,
    template_ctx: Mutex<TemplateContext>,
    inbox: SharedInbox,
    feed: Option<FeedPoller>,
    draining: AtomicBool,
    running: AtomicBool,
    immediate_drain_pending: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct PostClient {
    inner: Arc<Inner>,
}

impl PostClient {
    pub fn new(
        config: Arc<FarcasterConfig>,
        sink: Arc<dyn CastSink>,
        generator: Arc<dyn CastGenerator>,
    ) -> Self {
        ensure_metrics_described();
        let store = StateStore::new(&config.state_dir);
        let queue = PostQueue::new(
            store.clone(),
            QueuePolicy {
                max_size: config.queue_max_size,
                news_weight: config.news_priority_weight,
                trade_weight: config.trade_priority_weight,
            },
        );
        let limiter = RateLimiter::new(store.clone());
        let inbox = SharedInbox::new(store.clone());
        let feed = config
            .feed_rss_url
            .clone()
            .map(|url| FeedPoller::new(url, store.clone()));
        Self {
            inner: Arc::new(Inner {
                config,
                sink,
                generator,
                queue: Mutex::new(queue),
                limiter: Mutex::new(limiter),
                backoff: Mutex::new(Backoff::default()),
                template_ctx: Mutex::new(TemplateContext::default()),
                inbox,
                feed,
                draining: AtomicBool::new(false),
                running: AtomicBool::new(false),
                immediate_drain_pending: AtomicBool::new(false),
                loop_handle: Mutex::new(None),
            }),
        }
    }

    pub fn set_template_context(&self, ctx: TemplateContext) {
        *self.inner.template_ctx.lock().expect("ctx lock poisoned") = ctx;
    }

    fn template_ctx(&self) -> TemplateContext {
        self.inner.template_ctx.lock().expect("ctx lock poisoned").clone()
    }

    pub fn shared_inbox(&self) -> &SharedInbox {
        &self.inner.inbox
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().expect("queue lock poisoned").len()
    }

    pub fn queue_items(&self) -> Vec<QueueItem> {
        self.inner.queue.lock().expect("queue lock poisoned").items().to_vec()
    }

    /// Admit an item and trigger a short-delayed out-of-band drain so
    /// low-latency items are not stuck behind the periodic loop.
    pub fn enqueue(&self, input: NewCast) {
        let kind = input.kind;
        let admitted = self.inner.queue.lock().expect("queue lock poisoned").enqueue(input);
        if admitted.is_some() {
            tracing::info!(kind = kind.as_str(), "queued post");
            self.schedule_immediate_drain();
        }
    }

    fn schedule_immediate_drain(&self) {
        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }
        if self.inner.immediate_drain_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(IMMEDIATE_DRAIN_DELAY_MS)).await;
            this.inner.immediate_drain_pending.store(false, Ordering::SeqCst);
            if let Err(e) = this.drain_queue_once().await {
                tracing::warn!(error = %e, "immediate queue drain failed");
            }
        });
    }

    /// At most one drain in flight; a concurrent trigger is a no-op.
    pub async fn drain_queue_once(&self) -> Result<()> {
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let result = self.drain_inner().await;
        self.inner.draining.store(false, Ordering::SeqCst);
        result
    }

    async fn drain_inner(&self) -> Result<()> {
        if now_ms() < self.inner.backoff.lock().expect("backoff lock poisoned").quota_backoff_until {
            return Ok(());
        }
        let next = self.inner.queue.lock().expect("queue lock poisoned").next_item();
        match next {
            Some(item) => self.post_item(item).await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Publish one queue item as a chunk chain, persisting progress after
    /// every chunk so a restart or a 429 resumes at the next unsent chunk.
    /// Returns `false` when the attempt was deferred (quota or throttling);
    /// other publish errors propagate and leave the item queued.
    async fn post_item(&self, item: QueueItem) -> Result<bool> {
        let cfg = &self.inner.config;
        let now = now_ms();
        if now < self.inner.backoff.lock().expect("backoff lock poisoned").quota_backoff_until {
            return Ok(false);
        }

        let admission = self
            .inner
            .limiter
            .lock()
            .expect("limiter lock poisoned")
            .can_post(now, cfg.max_posts_per_hour, cfg.max_posts_per_day);
        if let Admission::Deny { reason } = admission {
            let next_at = self
                .inner
                .limiter
                .lock()
                .expect("limiter lock poisoned")
                .next_allowed_at(now, cfg.max_posts_per_hour, cfg.max_posts_per_day);
            let mut b = self.inner.backoff.lock().expect("backoff lock poisoned");
            b.quota_backoff_until = b.quota_backoff_until.max(next_at);
            counter!("publish_quota_deferred_total").increment(1);
            // Avoid log spam while the queue is blocked by quota.
            if now - b.last_quota_warn_at >= QUOTA_WARN_INTERVAL_MS {
                let wait_sec = ((b.quota_backoff_until - now).max(1_000) + 999) / 1_000;
                tracing::warn!(
                    kind = item.kind.as_str(),
                    reason = %reason,
                    retry_in_secs = wait_sec,
                    "queued due to rate limit"
                );
                b.last_quota_warn_at = now;
            }
            return Ok(false);
        }

        let max_len = cfg.effective_max_cast_length();
        let chunks = split_cast_text(&item.text, max_len);
        let mut parent = item.parent_hash.clone();
        let embeds: Option<Vec<String>> = item.embed_url().map(|u| vec![u.to_string()]);
        if embeds.is_some() {
            tracing::info!("attaching embed from item metadata");
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let cast = match self.publish_chunk(chunk, &parent, i == 0, embeds.as_deref()).await? {
                ChunkOutcome::Published(cast) => cast,
                ChunkOutcome::BackedOff => return Ok(false),
            };

            self.inner
                .limiter
                .lock()
                .expect("limiter lock poisoned")
                .track_post(now_ms());
            counter!("casts_published_total").increment(1);
            tracing::info!(hash = %cast.hash, kind = item.kind.as_str(), "cast published");

            parent = Some(cast.hash.clone());
            let remaining = if i < chunks.len() - 1 {
                Some(chunks[i + 1..].join("\n\n"))
            } else {
                None
            };
            self.inner
                .queue
                .lock()
                .expect("queue lock poisoned")
                .record_progress(&item.id, &cast.hash, remaining);
        }

        self.inner.queue.lock().expect("queue lock poisoned").remove(&item.id);
        counter!("publish_items_completed_total").increment(1);
        tracing::info!(kind = item.kind.as_str(), "posted");
        Ok(true)
    }

    /// One chunk: wait out inter-request spacing and any provider backoff,
    /// publish, and classify throttling into `BackedOff`.
    async fn publish_chunk(
        &self,
        chunk: &str,
        parent: &Option<String>,
        first: bool,
        embeds: Option<&[String]>,
    ) -> Result<ChunkOutcome> {
        let min_spacing = self.inner.config.cast_request_min_interval_ms as i64;
        let wait_ms = {
            let b = self.inner.backoff.lock().expect("backoff lock poisoned");
            let now = now_ms();
            let spacing = (b.last_cast_request_at + min_spacing - now).max(0);
            let cooling = (b.cast_backoff_until - now).max(0);
            spacing.max(cooling)
        };
        if wait_ms > 0 {
            tokio::time::sleep(Duration::from_millis(wait_ms as u64)).await;
        }

        let result = match parent {
            Some(p) => self.inner.sink.reply_to_cast(p, chunk).await,
            None => {
                self.inner
                    .sink
                    .create_cast(chunk, if first { embeds } else { None })
                    .await
            }
        };

        match result {
            Ok(cast) => {
                self.inner
                    .backoff
                    .lock()
                    .expect("backoff lock poisoned")
                    .last_cast_request_at = now_ms();
                Ok(ChunkOutcome::Published(cast))
            }
            Err(e) if e.kind == ApiErrorKind::Throttled => {
                let backoff_ms = e
                    .retry_after_ms
                    .map(|v| v as i64)
                    .unwrap_or(DEFAULT_CAST_BACKOFF_MS)
                    .max(MIN_CAST_BACKOFF_MS);
                self.inner
                    .backoff
                    .lock()
                    .expect("backoff lock poisoned")
                    .cast_backoff_until = now_ms() + backoff_ms;
                counter!("publish_throttled_total").increment(1);
                tracing::warn!(
                    backoff_secs = (backoff_ms + 999) / 1_000,
                    "cast publish rate-limited, backing off"
                );
                Ok(ChunkOutcome::BackedOff)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drain-and-clear the shared inbox into the queue, classifying items
    /// that arrive without an explicit kind.
    fn import_shared_inbox(&self) {
        let items = self.inner.inbox.drain();
        if items.is_empty() {
            return;
        }
        let mut imported = 0usize;
        for shared in items {
            let content = shared.content.trim();
            if content.is_empty() || shared.id.is_empty() {
                continue;
            }
            if self
                .inner
                .queue
                .lock()
                .expect("queue lock poisoned")
                .contains_source_id(&shared.id)
            {
                continue;
            }
            let kind = infer_kind(&shared);
            let text: String = content.chars().take(SHARED_IMPORT_TEXT_CAP).collect();
            let mut cast = NewCast::new(kind, text)
                .with_parent(shared.parent_hash.clone())
                .with_meta("source", "shared")
                .with_meta("sourceId", shared.id.clone())
                .with_meta("priority", shared.priority);
            if let Some(url) = &shared.embed_url {
                cast = cast.with_meta("embedUrl", url.clone());
            }
            self.enqueue(cast);
            imported += 1;
        }
        if imported > 0 {
            tracing::info!(imported, "imported shared post(s) from sink inbox");
        }
    }

    async fn poll_feed(&self) {
        let Some(feed) = &self.inner.feed else { return };
        match feed.poll_once().await {
            Ok(Some(cast)) => self.enqueue(cast),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "feed pipeline failed"),
        }
    }

    /// Generate-and-enqueue a trade cast from an upstream signal seed.
    /// Empty or failed generation falls back to the seed text.
    pub async fn queue_trade_cast(&self, seed: &str) {
        let ctx = self.template_ctx();
        let text = match self.inner.generator.generate(TRADE_TEMPLATE, seed, &ctx).await {
            Ok(t) if !t.trim().is_empty() => t,
            Ok(_) => cap_generated(seed),
            Err(e) => {
                tracing::warn!(error = %e, "trade cast generation failed, using seed");
                cap_generated(seed)
            }
        };
        self.enqueue(NewCast::new(QueueKind::Trade, text));
    }

    /// Autonomous fallback post when the queue is idle. Empty generation is
    /// a no-op, not an error.
    async fn generate_autonomous_cast(&self) {
        let ctx = self.template_ctx();
        match self.inner.generator.generate(NEWS_TEMPLATE, "", &ctx).await {
            Ok(t) if !t.trim().is_empty() => {
                self.enqueue(NewCast::new(QueueKind::News, cap_generated(&t)));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "autonomous generation failed"),
        }
    }

    async fn tick(&self) -> Result<()> {
        let cfg = &self.inner.config;
        if cfg.sink_mode {
            self.import_shared_inbox();
        } else {
            self.poll_feed().await;
        }

        if self.queue_len() == 0 && !cfg.sink_mode && cfg.enable_autonomous_post_generation {
            self.generate_autonomous_cast().await;
        }

        self.drain_queue_once().await
    }

    /// Delay until the next tick, by priority: active quota backoff (capped),
    /// then fast drain while non-empty, then the jittered idle interval.
    fn next_delay_ms(&self) -> u64 {
        let cfg = &self.inner.config;
        let now = now_ms();
        let quota_wait = {
            let b = self.inner.backoff.lock().expect("backoff lock poisoned");
            (b.quota_backoff_until - now).max(0)
        };
        if quota_wait > 0 {
            quota_wait.min(QUOTA_WAIT_CAP_MS) as u64
        } else if self.queue_len() > 0 {
            NONEMPTY_QUEUE_DELAY_MS
        } else {
            jitter_ms(cfg.post_interval_min_ms, cfg.post_interval_max_ms)
        }
    }

    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                if !this.inner.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = this.tick().await {
                    tracing::error!(error = %e, "post loop error");
                }
                gauge!("publish_queue_depth").set(this.queue_len() as f64);
                let delay = this.next_delay_ms();
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        });
        *self.inner.loop_handle.lock().expect("handle lock poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.inner.loop_handle.lock().expect("handle lock poisoned").take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Single tick entrypoint for tests and manual drains.
    pub async fn run_tick(&self) -> Result<()> {
        self.tick().await
    }
}
