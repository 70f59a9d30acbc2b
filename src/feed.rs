//! # News feed poller
//! Fetches an RSS feed, normalizes entries and enqueues at most one unseen
//! article per tick. Seen links live in a persisted set that resets every
//! 24 h so a slow feed can resurface.

use anyhow::{Context, Result};
use metrics::counter;
use once_cell::sync::OnceCell;
use quick_xml::de::from_str;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc2822, OffsetDateTime, UtcOffset};

use crate::limiter::DAY_MS;
use crate::queue::{NewCast, QueueKind};
use crate::store::StateStore;
use crate::textutil::now_ms;

const RECORD: &str = "postedNewsState";
const FEED_TEXT_CAP: usize = 1_500;

#[derive(Debug, Clone, PartialEq)]
pub struct NewsEntry {
    pub title: String,
    pub link: String,
    pub published_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostedNewsState {
    pub version: u32,
    #[serde(rename = "lastReset")]
    pub last_reset: i64,
    pub posted: Vec<String>,
}

impl Default for PostedNewsState {
    fn default() -> Self {
        Self {
            version: 1,
            last_reset: 0,
            posted: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
}

fn parse_rfc2822_to_unix_ms(ts: &str) -> Option<i64> {
    OffsetDateTime::parse(ts, &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC).unix_timestamp() * 1_000)
}

/// Decode entities, strip tags, collapse whitespace.
fn normalize_title(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").to_string();
    out.trim().to_string()
}

pub fn parse_feed(xml: &str) -> Result<Vec<NewsEntry>> {
    let rss: Rss = from_str(xml).context("parsing feed xml")?;
    let mut out = Vec::with_capacity(rss.channel.item.len());
    for it in rss.channel.item {
        let title = normalize_title(it.title.as_deref().unwrap_or_default());
        let link = it.link.as_deref().unwrap_or_default().trim().to_string();
        if title.is_empty() || link.is_empty() {
            continue;
        }
        out.push(NewsEntry {
            title,
            link,
            published_at: it.pub_date.as_deref().and_then(parse_rfc2822_to_unix_ms),
        });
    }
    Ok(out)
}

/// First entry whose link is not in the posted set.
pub fn next_unseen<'a>(entries: &'a [NewsEntry], posted: &[String]) -> Option<&'a NewsEntry> {
    entries.iter().find(|e| !posted.iter().any(|p| p == &e.link))
}

pub struct FeedPoller {
    url: String,
    http: reqwest::Client,
    store: StateStore,
}

impl FeedPoller {
    pub fn new(url: String, store: StateStore) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
            store,
        }
    }

    /// One tick: fetch, pick one unseen entry, mark it posted and hand back
    /// the cast to enqueue. `None` when everything was seen already.
    pub async fn poll_once(&self) -> Result<Option<NewCast>> {
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .context("fetching feed")?
            .error_for_status()
            .context("feed fetch status")?;
        let xml = resp.text().await.context("reading feed body")?;
        let entries = parse_feed(&xml)?;
        if entries.is_empty() {
            return Ok(None);
        }

        let now = now_ms();
        let mut state = self.store.load(RECORD, PostedNewsState::default);
        if state.last_reset == 0 || state.last_reset < now - DAY_MS {
            state.last_reset = now;
            state.posted.clear();
        }

        let Some(next) = next_unseen(&entries, &state.posted) else {
            return Ok(None);
        };

        let text: String = format!("{}\n\n{}", next.title, next.link)
            .chars()
            .take(FEED_TEXT_CAP)
            .collect();
        let cast = NewCast::new(QueueKind::News, text).with_meta("link", next.link.clone());

        state.posted.push(next.link.clone());
        self.store.save(RECORD, &state)?;
        counter!("feed_articles_enqueued_total").increment(1);
        Ok(Some(cast))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>wire</title>
  <item><title>First &amp; foremost</title><link>https://example.com/a</link>
    <pubDate>Tue, 05 Aug 2025 10:00:00 +0000</pubDate></item>
  <item><title>  Second   story </title><link>https://example.com/b</link></item>
  <item><title></title><link>https://example.com/empty</link></item>
</channel></rss>"#;

    #[test]
    fn parses_and_normalizes_entries() {
        let entries = parse_feed(FIXTURE).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title, "First & foremost");
        assert_eq!(entries[0].link, "https://example.com/a");
        assert!(entries[0].published_at.is_some());
        assert_eq!(entries[1].title, "Second story");
    }

    #[test]
    fn next_unseen_skips_posted_links() {
        let entries = parse_feed(FIXTURE).unwrap();
        let posted = vec!["https://example.com/a".to_string()];
        assert_eq!(next_unseen(&entries, &posted).unwrap().link, "https://example.com/b");
        let all: Vec<String> = entries.iter().map(|e| e.link.clone()).collect();
        assert!(next_unseen(&entries, &all).is_none());
    }
}
