//! Cross-Tab Mirror
//!
//! Client instances ("tabs") sharing one [`MirrorStore`] converge without
//! each holding a transport. Every accepted merge is written as one record
//! per changed entity under `live_match_<matchId>`; siblings receive a
//! storage event for each write they did not make and merge the record.
//! Records merged from the mirror are never written back.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use parking_lot::Mutex;
use serde::{Serialize, Deserialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::merge::delta::{MatchDelta, Origin};
use crate::model::state::{MatchId, Timestamp};
use crate::model::update::{Topic, Update};

/// Storage events buffered per listener.
const EVENT_CAPACITY: usize = 1024;

/// Identity of one client instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabId(Uuid);

impl TabId {
    /// Fresh random identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TabId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mirror key of a match.
pub fn mirror_key(match_id: MatchId) -> String {
    format!("live_match_{}", match_id)
}

/// A write observed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// Key written.
    pub key: String,
    /// New value; `None` on removal.
    pub new_value: Option<String>,
    /// Writer.
    pub origin: TabId,
}

/// Key-value store shared between tabs, with change notification.
pub trait MirrorStore: Send + Sync + 'static {
    /// Write a value and notify listeners.
    fn set_item(&self, origin: TabId, key: &str, value: String);

    /// Current value.
    fn get_item(&self, key: &str) -> Option<String>;

    /// Remove a value and notify listeners.
    fn remove_item(&self, origin: TabId, key: &str);

    /// Listen for writes.
    fn watch(&self) -> broadcast::Receiver<StorageEvent>;
}

/// In-process [`MirrorStore`].
pub struct SharedStorage {
    items: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
}

impl Default for SharedStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SharedStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedStorage")
            .field("keys", &self.items.lock().len())
            .field("listeners", &self.events.receiver_count())
            .finish()
    }
}

impl SharedStorage {
    /// Empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { items: Mutex::new(HashMap::new()), events }
    }
}

impl MirrorStore for SharedStorage {
    fn set_item(&self, origin: TabId, key: &str, value: String) {
        self.items.lock().insert(key.to_string(), value.clone());
        // No listeners is fine.
        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            new_value: Some(value),
            origin,
        });
    }

    fn get_item(&self, key: &str) -> Option<String> {
        self.items.lock().get(key).cloned()
    }

    fn remove_item(&self, origin: TabId, key: &str) {
        if self.items.lock().remove(key).is_some() {
            let _ = self.events.send(StorageEvent { key: key.to_string(), new_value: None, origin });
        }
    }

    fn watch(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

/// One mirrored change: the minimal update that reproduces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorRecord {
    /// Topic of the update.
    #[serde(rename = "type")]
    pub topic: Topic,
    /// Match concerned.
    #[serde(rename = "matchId")]
    pub match_id: MatchId,
    /// Server timestamp of the original merge.
    pub timestamp: Timestamp,
    /// Changed fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl MirrorRecord {
    /// Record for one update.
    pub fn new(match_id: MatchId, timestamp: Timestamp, update: &Update) -> Self {
        let fields = match update.to_payload() {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        Self { topic: update.topic(), match_id, timestamp, fields }
    }

    /// Decode the fields back into a typed update.
    pub fn to_update(&self) -> Result<Update, serde_json::Error> {
        Update::decode(self.topic, &Value::Object(self.fields.clone()))
    }
}

/// A tab's view of the shared store.
#[derive(Clone)]
pub struct CrossTabMirror {
    store: Arc<dyn MirrorStore>,
    tab: TabId,
}

impl fmt::Debug for CrossTabMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossTabMirror").field("tab", &self.tab).finish()
    }
}

impl CrossTabMirror {
    /// Attach a new tab to `store`.
    pub fn new(store: Arc<dyn MirrorStore>) -> Self {
        Self { store, tab: TabId::new() }
    }

    /// This tab's identity.
    pub fn tab(&self) -> TabId {
        self.tab
    }

    /// Write one record per reproducible change. Returns records written.
    pub fn publish(&self, delta: &MatchDelta) -> usize {
        if delta.origin == Origin::Mirror {
            return 0;
        }
        let key = mirror_key(delta.match_id);
        let mut written = 0;
        for update in delta.changes.iter().filter_map(|c| c.to_update()) {
            let record = MirrorRecord::new(delta.match_id, delta.server_timestamp, &update);
            match serde_json::to_string(&record) {
                Ok(value) => {
                    self.store.set_item(self.tab, &key, value);
                    written += 1;
                }
                Err(e) => warn!(match_id = delta.match_id, "unencodable mirror record: {}", e),
            }
        }
        debug!(match_id = delta.match_id, written, "mirrored delta");
        written
    }

    /// Last record written for a match by any tab.
    pub fn latest(&self, match_id: MatchId) -> Option<MirrorRecord> {
        let value = self.store.get_item(&mirror_key(match_id))?;
        serde_json::from_str(&value).ok()
    }

    /// Listen for sibling writes about one match.
    pub fn listen(&self, match_id: MatchId) -> MirrorListener {
        MirrorListener {
            events: self.store.watch(),
            tab: self.tab,
            key: mirror_key(match_id),
        }
    }
}

/// Sibling writes for one match key.
#[derive(Debug)]
pub struct MirrorListener {
    events: broadcast::Receiver<StorageEvent>,
    tab: TabId,
    key: String,
}

impl MirrorListener {
    /// Next record written by another tab. `None` once the store is gone.
    pub async fn next(&mut self) -> Option<MirrorRecord> {
        loop {
            let event = match self.events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(key = %self.key, skipped, "mirror listener lagged");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            };
            if event.origin == self.tab || event.key != self.key {
                continue;
            }
            let Some(value) = event.new_value else {
                continue;
            };
            match serde_json::from_str::<MirrorRecord>(&value) {
                Ok(record) => return Some(record),
                Err(e) => warn!(key = %self.key, "undecodable mirror record: {}", e),
            }
        }
    }
}
