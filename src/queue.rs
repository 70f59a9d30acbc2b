//! # Publish queue
//! Durable, bounded, two-class weighted-priority queue of pending casts.
//! The queue exclusively owns its items from admission until full publication
//! or eviction; every mutation is persisted before returning.

use std::collections::BTreeMap;

use metrics::{counter, gauge};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::StateStore;
use crate::textutil::now_ms;

const RECORD: &str = "postQueueState";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    News,
    Trade,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::News => "news",
            QueueKind::Trade => "trade",
        }
    }
}

pub type Metadata = BTreeMap<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    pub id: String,
    pub kind: QueueKind,
    pub text: String,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "parentHash", default, skip_serializing_if = "Option::is_none")]
    pub parent_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl QueueItem {
    fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    /// Deduplication key carried by imported items.
    pub fn source_id(&self) -> Option<&str> {
        self.meta_str("sourceId")
    }

    pub fn embed_url(&self) -> Option<&str> {
        self.meta_str("embedUrl")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueState {
    pub version: u32,
    pub items: Vec<QueueItem>,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            version: 1,
            items: Vec::new(),
        }
    }
}

/// Enqueue input; `id` and `created_at` are assigned at admission time.
#[derive(Debug, Clone)]
pub struct NewCast {
    pub kind: QueueKind,
    pub text: String,
    pub parent_hash: Option<String>,
    pub metadata: Metadata,
}

impl NewCast {
    pub fn new(kind: QueueKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            parent_hash: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_parent(mut self, parent_hash: Option<String>) -> Self {
        self.parent_hash = parent_hash;
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueuePolicy {
    pub max_size: usize,
    pub news_weight: i64,
    pub trade_weight: i64,
}

/// The admission/priority policy over the persisted queue state.
#[derive(Debug)]
pub struct PostQueue {
    state: QueueState,
    store: StateStore,
    policy: QueuePolicy,
}

impl PostQueue {
    pub fn new(store: StateStore, policy: QueuePolicy) -> Self {
        let state = store.load(RECORD, QueueState::default);
        Self { state, store, policy }
    }

    pub fn len(&self) -> usize {
        self.state.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.items.is_empty()
    }

    pub fn items(&self) -> &[QueueItem] {
        &self.state.items
    }

    fn weight(&self, kind: QueueKind) -> i64 {
        match kind {
            QueueKind::News => self.policy.news_weight,
            QueueKind::Trade => self.policy.trade_weight,
        }
    }

    pub fn contains_source_id(&self, source_id: &str) -> bool {
        self.state.items.iter().any(|x| x.source_id() == Some(source_id))
    }

    fn save(&self) {
        if let Err(e) = self.store.save(RECORD, &self.state) {
            tracing::warn!(error = %e, "failed to persist publish queue");
        }
        gauge!("publish_queue_depth").set(self.state.items.len() as f64);
    }

    /// Admit a new item. A duplicate `sourceId` is silently dropped; under
    /// capacity pressure the first `trade` item by queue position is evicted,
    /// falling back to the front of the queue. Returns the assigned id when
    /// the item was admitted.
    pub fn enqueue(&mut self, input: NewCast) -> Option<String> {
        if let Some(sid) = input.metadata.get("sourceId").and_then(Value::as_str) {
            if !sid.is_empty() && self.contains_source_id(sid) {
                counter!("publish_queue_duplicates_total").increment(1);
                return None;
            }
        }

        if self.state.items.len() >= self.policy.max_size {
            tracing::warn!("queue full, dropping oldest trade to preserve queue health");
            let idx = self
                .state
                .items
                .iter()
                .position(|x| x.kind == QueueKind::Trade)
                .unwrap_or(0);
            self.state.items.remove(idx);
            counter!("publish_queue_evicted_total").increment(1);
        }

        let now = now_ms();
        let suffix: u32 = rand::rng().random_range(0..0x0100_0000);
        let id = format!("{}:{}:{:06x}", input.kind.as_str(), now, suffix);
        self.state.items.push(QueueItem {
            id: id.clone(),
            kind: input.kind,
            text: input.text,
            created_at: now,
            parent_hash: input.parent_hash,
            metadata: input.metadata,
        });
        self.save();
        counter!("publish_queue_enqueued_total").increment(1);
        Some(id)
    }

    /// Best candidate by `(priority weight desc, created_at asc)`. The stored
    /// order is left untouched; insertion order is what eviction relies on.
    pub fn next_item(&self) -> Option<QueueItem> {
        self.state
            .items
            .iter()
            .min_by_key(|x| (std::cmp::Reverse(self.weight(x.kind)), x.created_at))
            .cloned()
    }

    /// Persist chunk progress: the parent hash of the last published chunk
    /// and, when given, the remaining unsent text.
    pub fn record_progress(&mut self, id: &str, parent_hash: &str, remaining: Option<String>) {
        if let Some(item) = self.state.items.iter_mut().find(|x| x.id == id) {
            item.parent_hash = Some(parent_hash.to_string());
            if let Some(rest) = remaining {
                item.text = rest;
            }
        }
        self.save();
    }

    pub fn remove(&mut self, id: &str) {
        self.state.items.retain(|x| x.id != id);
        self.save();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(max: usize) -> (tempfile::TempDir, PostQueue) {
        let tmp = tempfile::tempdir().unwrap();
        let q = PostQueue::new(
            StateStore::new(tmp.path()),
            QueuePolicy {
                max_size: max,
                news_weight: 100,
                trade_weight: 10,
            },
        );
        (tmp, q)
    }

    #[test]
    fn news_outranks_trade_regardless_of_age() {
        let (_t, mut q) = queue(10);
        q.enqueue(NewCast::new(QueueKind::Trade, "older trade"));
        q.enqueue(NewCast::new(QueueKind::News, "newer news"));
        assert_eq!(q.next_item().unwrap().text, "newer news");
    }

    #[test]
    fn fifo_within_a_priority_class() {
        let (_t, mut q) = queue(10);
        let first = q.enqueue(NewCast::new(QueueKind::News, "first")).unwrap();
        q.enqueue(NewCast::new(QueueKind::News, "second"));
        assert_eq!(q.next_item().unwrap().id, first);
    }

    #[test]
    fn duplicate_source_id_is_dropped() {
        let (_t, mut q) = queue(10);
        q.enqueue(NewCast::new(QueueKind::News, "a").with_meta("sourceId", "s-1"));
        let second = q.enqueue(NewCast::new(QueueKind::News, "b").with_meta("sourceId", "s-1"));
        assert!(second.is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn eviction_prefers_trade_and_never_grows_past_bound() {
        let (_t, mut q) = queue(3);
        q.enqueue(NewCast::new(QueueKind::News, "n1"));
        q.enqueue(NewCast::new(QueueKind::Trade, "t1"));
        q.enqueue(NewCast::new(QueueKind::News, "n2"));
        q.enqueue(NewCast::new(QueueKind::News, "n3"));
        assert_eq!(q.len(), 3);
        assert!(q.items().iter().all(|x| x.kind == QueueKind::News));
    }

    #[test]
    fn eviction_falls_back_to_front_when_no_trade_queued() {
        let (_t, mut q) = queue(2);
        q.enqueue(NewCast::new(QueueKind::News, "n1"));
        q.enqueue(NewCast::new(QueueKind::News, "n2"));
        q.enqueue(NewCast::new(QueueKind::News, "n3"));
        let texts: Vec<&str> = q.items().iter().map(|x| x.text.as_str()).collect();
        assert_eq!(texts, vec!["n2", "n3"]);
    }

    #[test]
    fn mutations_are_persisted() {
        let tmp = tempfile::tempdir().unwrap();
        let policy = QueuePolicy {
            max_size: 10,
            news_weight: 100,
            trade_weight: 10,
        };
        let id = {
            let mut q = PostQueue::new(StateStore::new(tmp.path()), policy);
            let id = q.enqueue(NewCast::new(QueueKind::News, "persisted")).unwrap();
            q.record_progress(&id, "0xabc", Some("rest of it".into()));
            id
        };
        let reloaded = PostQueue::new(StateStore::new(tmp.path()), policy);
        let item = reloaded.next_item().unwrap();
        assert_eq!(item.id, id);
        assert_eq!(item.parent_hash.as_deref(), Some("0xabc"));
        assert_eq!(item.text, "rest of it");
    }
}
