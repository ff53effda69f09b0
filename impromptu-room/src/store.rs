//! Replicated key-value store.
//!
//! The hub owns the authoritative map. Every follower keeps a cache that the
//! hub's `storage` broadcasts overwrite wholesale. [`StoreHandle`] is the
//! accessor the room hands out: reads come from the local cache, writes go
//! to the hub as `storageSet` requests and only show up locally once the
//! hub echoes the new snapshot.

use std::sync::{Arc, OnceLock};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::protocol::Frame;
use crate::room::RoomError;
use crate::transport::ConnectionSender;

/// Full contents of a room store.
pub type StoreSnapshot = serde_json::Map<String, Value>;

/// Store cache shared between the room, its follower session and (on the
/// hub) the hub relay.
pub(crate) type SharedStore = Arc<RwLock<StoreSnapshot>>;

pub(crate) fn shared_store() -> SharedStore {
    Arc::new(RwLock::new(StoreSnapshot::new()))
}

/// Replace the cache with a snapshot received from the hub.
pub(crate) async fn replace(cache: &SharedStore, snapshot: StoreSnapshot) {
    *cache.write().await = snapshot;
}

/// Accessor for a room's replicated store.
#[derive(Clone)]
pub struct StoreHandle {
    cache: SharedStore,
    link: Arc<OnceLock<ConnectionSender>>,
    debug: bool,
}

impl StoreHandle {
    pub(crate) fn new(cache: SharedStore, link: Arc<OnceLock<ConnectionSender>>, debug: bool) -> Self {
        Self { cache, link, debug }
    }

    /// Latest locally cached value for `key`.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.cache.read().await.get(key).cloned()
    }

    /// Ask the hub to set `key`. Fire-and-forget: the local cache is left
    /// alone until the hub broadcasts the updated store.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), RoomError> {
        let link = self.link.get().ok_or(RoomError::NotConnected)?;
        let frame = Frame::storage_set(key, value);
        debug_log!(self.debug, "Requesting store write: {frame:?}");
        link.send(frame.to_value()?)
            .map_err(|_| RoomError::ConnectionClosed)
    }

    /// Copy of the whole cached store.
    pub async fn snapshot(&self) -> StoreSnapshot {
        self.cache.read().await.clone()
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        self.cache.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}
