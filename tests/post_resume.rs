// tests/post_resume.rs
// Chunked publish resumability: a throttled or restarted pipeline continues
// at the next unsent chunk, never re-sending and never losing data.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use farcaster_publisher::api::{ApiError, ApiErrorKind, Cast, CastSink};
use farcaster_publisher::config::FarcasterConfig;
use farcaster_publisher::generator::SeedGenerator;
use farcaster_publisher::post::PostClient;
use farcaster_publisher::queue::{NewCast, QueueKind};

#[derive(Debug, Clone)]
struct RecordedCall {
    text: String,
    parent: Option<String>,
}

/// Scripted publish primitive: succeeds with predictable hashes, throttling
/// on the configured call indices.
struct ScriptedSink {
    calls: Mutex<Vec<RecordedCall>>,
    throttle_on: Vec<usize>,
}

impl ScriptedSink {
    fn new(throttle_on: Vec<usize>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            throttle_on,
        })
    }

    fn record(&self, text: &str, parent: Option<&str>) -> Result<Cast, ApiError> {
        let mut calls = self.calls.lock().unwrap();
        let n = calls.len();
        calls.push(RecordedCall {
            text: text.to_string(),
            parent: parent.map(String::from),
        });
        if self.throttle_on.contains(&n) {
            return Err(ApiError {
                kind: ApiErrorKind::Throttled,
                status: Some(429),
                retry_after_ms: None,
                message: "slow down".into(),
            });
        }
        Ok(Cast {
            hash: format!("0xhash{n}"),
            text: text.to_string(),
            author_fid: 1,
            author_username: Some("agent".into()),
            timestamp: String::new(),
            parent_hash: parent.map(String::from),
        })
    }

    fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CastSink for ScriptedSink {
    async fn create_cast(&self, text: &str, _embeds: Option<&[String]>) -> Result<Cast, ApiError> {
        self.record(text, None)
    }

    async fn reply_to_cast(&self, parent_hash: &str, text: &str) -> Result<Cast, ApiError> {
        self.record(text, Some(parent_hash))
    }
}

fn test_config(dir: &std::path::Path) -> Arc<FarcasterConfig> {
    Arc::new(FarcasterConfig {
        dry_run: true,
        sink_mode: true,
        max_cast_length: 160,
        cast_request_min_interval_ms: 0,
        state_dir: dir.to_path_buf(),
        ..Default::default()
    })
}

fn three_paragraph_text() -> (String, String, String, String) {
    let p1 = "a".repeat(150);
    let p2 = "b".repeat(150);
    let p3 = "c".repeat(150);
    let text = format!("{p1}\n\n{p2}\n\n{p3}");
    (text, p1, p2, p3)
}

#[tokio::test(start_paused = true)]
async fn throttle_mid_chain_persists_progress_and_resumes() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let sink = ScriptedSink::new(vec![1]); // second chunk throttled once
    let post = PostClient::new(config, sink.clone(), Arc::new(SeedGenerator));

    let (text, _p1, p2, p3) = three_paragraph_text();
    post.enqueue(NewCast::new(QueueKind::News, text));
    post.drain_queue_once().await.unwrap();

    // Chunk 1 published, chunk 2 throttled: the persisted item now carries
    // chunk 1's hash and only the unsent tail.
    let items = post.queue_items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].parent_hash.as_deref(), Some("0xhash0"));
    assert_eq!(items[0].text, format!("{p2}\n\n{p3}"));

    // Backoff expires (virtual time) and a later drain finishes the chain.
    post.drain_queue_once().await.unwrap();
    assert_eq!(post.queue_len(), 0);

    let calls = sink.calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[0].parent, None);
    assert_eq!(calls[2].parent.as_deref(), Some("0xhash0"));
    assert_eq!(calls[2].text, p2);
    assert_eq!(calls[3].parent.as_deref(), Some("0xhash2"));
    assert_eq!(calls[3].text, p3);
}

#[tokio::test(start_paused = true)]
async fn restart_resumes_from_persisted_chunk_state() {
    let tmp = tempfile::tempdir().unwrap();
    let (text, _p1, p2, p3) = three_paragraph_text();

    {
        let sink = ScriptedSink::new(vec![1]);
        let post = PostClient::new(test_config(tmp.path()), sink, Arc::new(SeedGenerator));
        post.enqueue(NewCast::new(QueueKind::News, text));
        post.drain_queue_once().await.unwrap();
        assert_eq!(post.queue_len(), 1);
    }

    // Fresh process: queue state reloaded from disk, backoff state gone.
    let sink = ScriptedSink::new(vec![]);
    let post = PostClient::new(test_config(tmp.path()), sink.clone(), Arc::new(SeedGenerator));
    assert_eq!(post.queue_len(), 1);
    post.drain_queue_once().await.unwrap();

    assert_eq!(post.queue_len(), 0);
    let calls = sink.calls();
    assert_eq!(calls.len(), 2);
    // Both remaining chunks continue the reply chain from the persisted hash.
    assert_eq!(calls[0].parent.as_deref(), Some("0xhash0"));
    assert_eq!(calls[0].text, p2);
    assert_eq!(calls[1].parent.as_deref(), Some("0xhash0"));
    assert_eq!(calls[1].text, p3);
}

#[tokio::test(start_paused = true)]
async fn quota_exhaustion_defers_without_touching_the_item() {
    let tmp = tempfile::tempdir().unwrap();
    let config = FarcasterConfig {
        dry_run: true,
        max_posts_per_hour: 1,
        cast_request_min_interval_ms: 0,
        state_dir: tmp.path().to_path_buf(),
        ..Default::default()
    };

    // One post already tracked in the persisted window.
    {
        use farcaster_publisher::limiter::RateLimiter;
        use farcaster_publisher::store::StateStore;
        let mut limiter = RateLimiter::new(StateStore::new(tmp.path()));
        limiter.track_post(farcaster_publisher::textutil::now_ms() - 1_000);
    }

    let sink = ScriptedSink::new(vec![]);
    let post = PostClient::new(Arc::new(config), sink.clone(), Arc::new(SeedGenerator));
    post.enqueue(NewCast::new(QueueKind::News, "held back".to_string()));
    post.drain_queue_once().await.unwrap();

    assert!(sink.calls().is_empty());
    let items = post.queue_items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].text, "held back");
    assert!(items[0].parent_hash.is_none());
}
