// src/inbox.rs
// Shared cross-client inbox: other producers push finished cast candidates
// here; the publish loop drains and clears the whole list in one step. The
// record layout is a cross-client contract, as is the keyword heuristic that
// classifies items arriving without an explicit kind.

use serde::{Deserialize, Serialize};

use crate::queue::QueueKind;
use crate::store::StateStore;

const RECORD: &str = "sharedInbox";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SharedItem {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub priority: bool,
    #[serde(rename = "parentHash", default, skip_serializing_if = "Option::is_none")]
    pub parent_hash: Option<String>,
    #[serde(rename = "embedUrl", default, skip_serializing_if = "Option::is_none")]
    pub embed_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SharedInbox {
    store: StateStore,
}

impl SharedInbox {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn push(&self, item: SharedItem) {
        let mut items: Vec<SharedItem> = self.store.load(RECORD, Vec::new);
        items.push(item);
        if let Err(e) = self.store.save(RECORD, &items) {
            tracing::warn!(error = %e, "failed to persist shared inbox");
        }
    }

    /// Take everything and clear the record.
    pub fn drain(&self) -> Vec<SharedItem> {
        let items: Vec<SharedItem> = self.store.load(RECORD, Vec::new);
        if !items.is_empty() {
            if let Err(e) = self.store.save(RECORD, &Vec::<SharedItem>::new()) {
                tracing::warn!(error = %e, "failed to clear shared inbox");
            }
        }
        items
    }
}

/// Classify an imported item when the producer did not say `trade` outright.
///
/// Substring matching over a fixed phrase list; kept as-is for compatibility
/// with the producers on the other side of the inbox.
pub fn infer_kind(item: &SharedItem) -> QueueKind {
    if item.kind.as_deref() == Some("trade") {
        return QueueKind::Trade;
    }
    let content = item.content.to_lowercase();
    const TRADE_PHRASES: [&str; 6] = [
        "trade setup",
        "most mentioned ticker",
        "increasing mentions",
        "entry",
        "stop loss",
        "take profit",
    ];
    if TRADE_PHRASES.iter().any(|p| content.contains(p)) {
        return QueueKind::Trade;
    }
    QueueKind::News
}
