// tests/pipeline_restart.rs
// Persisted pipeline state survives a process restart byte-for-byte at the
// semantic level: queue contents and rate-limit window reload deep-equal.

use std::sync::Arc;

use async_trait::async_trait;
use farcaster_publisher::api::{ApiError, Cast, CastSink};
use farcaster_publisher::config::FarcasterConfig;
use farcaster_publisher::generator::SeedGenerator;
use farcaster_publisher::limiter::RateLimiter;
use farcaster_publisher::post::PostClient;
use farcaster_publisher::queue::{NewCast, QueueKind};
use farcaster_publisher::store::StateStore;
use farcaster_publisher::textutil::now_ms;

struct NullSink;

#[async_trait]
impl CastSink for NullSink {
    async fn create_cast(&self, text: &str, _embeds: Option<&[String]>) -> Result<Cast, ApiError> {
        Ok(Cast {
            hash: "0x0".into(),
            text: text.into(),
            author_fid: 1,
            author_username: None,
            timestamp: String::new(),
            parent_hash: None,
        })
    }

    async fn reply_to_cast(&self, parent: &str, text: &str) -> Result<Cast, ApiError> {
        Ok(Cast {
            hash: "0x0".into(),
            text: text.into(),
            author_fid: 1,
            author_username: None,
            timestamp: String::new(),
            parent_hash: Some(parent.into()),
        })
    }
}

fn client(dir: &std::path::Path) -> PostClient {
    let config = Arc::new(FarcasterConfig {
        dry_run: true,
        state_dir: dir.to_path_buf(),
        ..Default::default()
    });
    PostClient::new(config, Arc::new(NullSink), Arc::new(SeedGenerator))
}

#[tokio::test]
async fn queue_contents_reload_identically() {
    let tmp = tempfile::tempdir().unwrap();

    let before = {
        let post = client(tmp.path());
        post.enqueue(
            NewCast::new(QueueKind::News, "headline\n\nhttps://example.com/a")
                .with_meta("link", "https://example.com/a"),
        );
        post.enqueue(NewCast::new(QueueKind::Trade, "trade note"));
        post.queue_items()
    };
    assert_eq!(before.len(), 2);

    let reloaded = client(tmp.path()).queue_items();
    assert_eq!(reloaded, before);
}

#[test]
fn rate_window_reloads_identically() {
    let tmp = tempfile::tempdir().unwrap();
    let now = now_ms();

    let before = {
        let mut limiter = RateLimiter::new(StateStore::new(tmp.path()));
        limiter.track_post(now - 5_000);
        limiter.track_post(now - 10_000);
        limiter.snapshot().clone()
    };

    let reloaded = RateLimiter::new(StateStore::new(tmp.path()));
    assert_eq!(reloaded.snapshot(), &before);
}
