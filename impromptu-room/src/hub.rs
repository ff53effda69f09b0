//! Hub relay: connection registry, fan-out and the authoritative store.
//!
//! Runs as a single actor task so the registry and the store are only ever
//! mutated from one place:
//! ```text
//! accepted conn ──► HubEvent::Accepted ─┐
//! conn reader A ──► HubEvent::Frame ────┼──► HubRelay ──► fan-out to every
//! conn reader B ──► HubEvent::Closed ───┘   (registry,    registered
//!                                            store)       connection
//! ```
//!
//! Broadcasts include the sender: a peer gets its own messages back with
//! its own id as `sender`. Store writes are last-write-wins and every write
//! is followed by a full snapshot to all connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::Frame;
use crate::store::SharedStore;
use crate::transport::{Connection, ConnectionSender};

/// Statistics for monitoring hub health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub messages_relayed: u64,
    pub store_writes: u64,
    pub frames_ignored: u64,
}

/// Hub stats readable from outside the actor without a round trip.
#[derive(Default)]
struct AtomicHubStats {
    active_connections: AtomicUsize,
    total_connections: AtomicU64,
    messages_relayed: AtomicU64,
    store_writes: AtomicU64,
    frames_ignored: AtomicU64,
}

impl AtomicHubStats {
    fn snapshot(&self) -> HubStats {
        HubStats {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
            store_writes: self.store_writes.load(Ordering::Relaxed),
            frames_ignored: self.frames_ignored.load(Ordering::Relaxed),
        }
    }
}

/// Registry key; connections are tracked individually even if two of them
/// report the same peer id.
type ConnectionKey = u64;

enum HubEvent {
    Accepted(Connection),
    Frame { key: ConnectionKey, data: Value },
    Closed(ConnectionKey),
}

/// Handle to a running hub relay.
#[derive(Clone)]
pub struct HubHandle {
    events: mpsc::UnboundedSender<HubEvent>,
    stats: Arc<AtomicHubStats>,
}

impl HubHandle {
    /// Hand an incoming connection to the hub.
    pub fn accept(&self, conn: Connection) -> bool {
        self.events.send(HubEvent::Accepted(conn)).is_ok()
    }

    pub fn stats(&self) -> HubStats {
        self.stats.snapshot()
    }
}

/// The hub actor.
pub struct HubRelay {
    /// Open connections to this hub, the hub's own loopback follower included
    registry: HashMap<ConnectionKey, ConnectionSender>,
    next_key: ConnectionKey,
    /// Authoritative store (shared with this process's follower cache)
    store: SharedStore,
    /// Feeds connection readers back into the actor
    events: mpsc::UnboundedSender<HubEvent>,
    stats: Arc<AtomicHubStats>,
    debug: bool,
}

impl HubRelay {
    /// Start the hub actor over `store`.
    pub(crate) fn spawn(store: SharedStore, debug: bool) -> HubHandle {
        let (events, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(AtomicHubStats::default());
        let relay = Self {
            registry: HashMap::new(),
            next_key: 0,
            store,
            events: events.clone(),
            stats: stats.clone(),
            debug,
        };
        tokio::spawn(relay.run(rx));
        HubHandle { events, stats }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<HubEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                HubEvent::Accepted(conn) => self.register(conn),
                HubEvent::Frame { key, data } => self.on_frame(key, data).await,
                HubEvent::Closed(key) => self.unregister(key),
            }
        }
    }

    fn register(&mut self, conn: Connection) {
        let key = self.next_key;
        self.next_key += 1;

        let (sender, mut inbound) = conn.into_parts();
        log::info!("Hub accepted connection from {}", sender.remote_id());
        self.registry.insert(key, sender);
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats
            .active_connections
            .store(self.registry.len(), Ordering::Relaxed);

        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(data) = inbound.recv().await {
                if events.send(HubEvent::Frame { key, data }).is_err() {
                    return;
                }
            }
            let _ = events.send(HubEvent::Closed(key));
        });
    }

    fn unregister(&mut self, key: ConnectionKey) {
        if let Some(sender) = self.registry.remove(&key) {
            log::info!("Hub connection from {} closed", sender.remote_id());
        }
        self.stats
            .active_connections
            .store(self.registry.len(), Ordering::Relaxed);
    }

    async fn on_frame(&mut self, key: ConnectionKey, data: Value) {
        let Some(sender_id) = self.registry.get(&key).map(|c| c.remote_id().clone()) else {
            return;
        };

        match Frame::from_value(data) {
            Ok(Frame::Message { message, .. }) => {
                debug_log!(self.debug, "Hub relaying message from {sender_id}: {message}");
                self.stats.messages_relayed.fetch_add(1, Ordering::Relaxed);
                self.fan_out(&Frame::relayed(sender_id, message));
            }
            Ok(Frame::StorageSet { prop, value }) => {
                debug_log!(self.debug, "Hub store write from {sender_id}: {prop} = {value}");
                let snapshot = {
                    let mut store = self.store.write().await;
                    store.insert(prop, value);
                    store.clone()
                };
                self.stats.store_writes.fetch_add(1, Ordering::Relaxed);
                self.fan_out(&Frame::storage(snapshot));
            }
            Ok(other) => {
                debug_log!(self.debug, "Hub ignoring {} frame from {sender_id}", other.kind());
                self.stats.frames_ignored.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                debug_log!(self.debug, "Hub ignoring frame from {sender_id}: {e}");
                self.stats.frames_ignored.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Send `frame` to every registered connection. Returns how many took it.
    fn fan_out(&self, frame: &Frame) -> usize {
        let data = match frame.to_value() {
            Ok(data) => data,
            Err(e) => {
                log::warn!("Hub could not encode {} frame: {e}", frame.kind());
                return 0;
            }
        };
        self.registry
            .values()
            .filter(|conn| conn.send(data.clone()).is_ok())
            .count()
    }
}
