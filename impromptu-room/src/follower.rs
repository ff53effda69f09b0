//! Follower session: every peer's single connection to the room hub.
//!
//! The hub connects to itself too, so sending and receiving look the same
//! on every peer. Inbound frames are demultiplexed on `type`:
//! - `storage` replaces the local store cache, unless this process runs the
//!   hub relay: the cache is then the relay's authoritative store, already
//!   updated, and it stays that way after a demotion since the relay keeps
//!   serving
//! - `message` goes to the room's receive callbacks and subscribers
//! - anything else is dropped

use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::hub::HubHandle;
use crate::protocol::Frame;
use crate::room::RoomMessage;
use crate::store::{self, SharedStore};
use crate::transport::{ConnectionSender, Transport, TransportError};

type ReceiveCallback = Box<dyn FnMut(Value) + Send>;

/// Where received broadcasts go: registered callbacks and stream subscribers.
pub(crate) struct Receivers {
    callbacks: Mutex<Vec<ReceiveCallback>>,
    subscribers: broadcast::Sender<RoomMessage>,
}

impl Receivers {
    pub(crate) fn new(capacity: usize) -> Self {
        let (subscribers, _) = broadcast::channel(capacity.max(1));
        Self {
            callbacks: Mutex::new(Vec::new()),
            subscribers,
        }
    }

    pub(crate) fn add_callback(&self, callback: ReceiveCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<RoomMessage> {
        self.subscribers.subscribe()
    }

    /// Callbacks run without the lock held, so they may register more
    /// callbacks; those first fire on the next message.
    fn dispatch(&self, received: RoomMessage) {
        let mut running = std::mem::take(
            &mut *self.callbacks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for callback in running.iter_mut() {
            callback(received.message.clone());
        }
        {
            let mut callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
            let added = std::mem::replace(&mut *callbacks, running);
            callbacks.extend(added);
        }
        // No subscribers is fine
        let _ = self.subscribers.send(received);
    }
}

/// Reader side of a follower connection.
pub(crate) struct FollowerSession {
    endpoint: String,
    /// Set if this process won the claim and runs the hub relay
    hub: Arc<OnceLock<HubHandle>>,
    store: SharedStore,
    receivers: Arc<Receivers>,
    debug: bool,
}

impl FollowerSession {
    pub(crate) fn new(
        endpoint: String,
        hub: Arc<OnceLock<HubHandle>>,
        store: SharedStore,
        receivers: Arc<Receivers>,
        debug: bool,
    ) -> Self {
        Self {
            endpoint,
            hub,
            store,
            receivers,
            debug,
        }
    }

    /// Connect to the hub endpoint and start demultiplexing its frames.
    ///
    /// Resolves once the connection is open, with its send half.
    pub(crate) async fn connect_client(
        self,
        transport: &dyn Transport,
    ) -> Result<ConnectionSender, TransportError> {
        debug_log!(self.debug, "Connecting follower session to {}", self.endpoint);
        let conn = transport.connect(&self.endpoint).await?;
        let (link, inbound) = conn.into_parts();
        log::info!("Follower {} connected to {}", link.local_id(), self.endpoint);

        tokio::spawn(self.run(inbound));
        Ok(link)
    }

    async fn run(self, mut inbound: mpsc::UnboundedReceiver<Value>) {
        while let Some(data) = inbound.recv().await {
            debug_log!(self.debug, "Follower received: {data}");
            self.handle(data).await;
        }
        log::info!("Follower connection to {} closed", self.endpoint);
    }

    async fn handle(&self, data: Value) {
        match Frame::from_value(data) {
            Ok(Frame::Storage { storage }) => {
                if self.hub.get().is_some() {
                    debug_log!(self.debug, "Hub ignoring its own store echo");
                    return;
                }
                store::replace(&self.store, storage).await;
            }
            Ok(Frame::Message { sender, message }) => {
                self.receivers.dispatch(RoomMessage { sender, message });
            }
            Ok(other) => {
                debug_log!(self.debug, "Follower ignoring {} frame", other.kind());
            }
            Err(e) => {
                debug_log!(self.debug, "Follower ignoring frame: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubRelay;
    use crate::store::shared_store;
    use crate::transport::PeerId;
    use serde_json::json;

    /// A session over a fresh store, with a hub relay on that store if
    /// `runs_hub`.
    fn session(runs_hub: bool) -> (FollowerSession, SharedStore, Arc<Receivers>) {
        let store = shared_store();
        let receivers = Arc::new(Receivers::new(16));
        let hub = Arc::new(OnceLock::new());
        if runs_hub {
            let _ = hub.set(HubRelay::spawn(store.clone(), false));
        }
        let session = FollowerSession::new(
            "impromptu-demo".to_string(),
            hub,
            store.clone(),
            receivers.clone(),
            false,
        );
        (session, store, receivers)
    }

    #[tokio::test]
    async fn test_follower_applies_snapshot() {
        let (session, store, _) = session(false);
        store.write().await.insert("stale".into(), json!(true));

        session
            .handle(json!({"type": "storage", "storage": {"color": "red"}}))
            .await;

        let cache = store.read().await;
        assert_eq!(cache.get("color"), Some(&json!("red")));
        assert!(cache.get("stale").is_none());
    }

    #[tokio::test]
    async fn test_hub_ignores_snapshot_echo() {
        let (session, store, _) = session(true);
        store.write().await.insert("color".into(), json!("blue"));

        session
            .handle(json!({"type": "storage", "storage": {"color": "red"}}))
            .await;

        assert_eq!(store.read().await.get("color"), Some(&json!("blue")));
    }

    #[tokio::test]
    async fn test_stale_snapshot_cannot_roll_back_relay_store() {
        let (session, store, _) = session(true);
        store.write().await.insert("k0".into(), json!(0));
        store.write().await.insert("k1".into(), json!(1));

        // An echo of an older store arriving after k1 was applied
        session
            .handle(json!({"type": "storage", "storage": {"k0": 0}}))
            .await;

        assert_eq!(store.read().await.get("k1"), Some(&json!(1)));
        assert_eq!(store.read().await.len(), 2);
    }

    #[tokio::test]
    async fn test_callback_may_register_callbacks() {
        let (session, _, receivers) = session(false);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner_receivers = receivers.clone();
        let inner_seen = seen.clone();
        receivers.add_callback(Box::new(move |message: Value| {
            let seen = inner_seen.clone();
            inner_receivers.add_callback(Box::new(move |later: Value| {
                seen.lock().unwrap().push(format!("inner {later}"));
            }));
            inner_seen.lock().unwrap().push(format!("outer {message}"));
        }));

        session.handle(json!({"type": "message", "message": 1})).await;
        session.handle(json!({"type": "message", "message": 2})).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "outer 1".to_string(),
                "outer 2".to_string(),
                "inner 2".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_snapshot_applied_twice_is_same_as_once() {
        let (session, store, _) = session(false);
        let frame = json!({"type": "storage", "storage": {"a": 1, "b": [2]}});

        session.handle(frame.clone()).await;
        let once = store.read().await.clone();
        session.handle(frame).await;
        assert_eq!(*store.read().await, once);
    }

    #[tokio::test]
    async fn test_messages_reach_every_callback_and_subscriber() {
        let (session, _, receivers) = session(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let seen = seen.clone();
            receivers.add_callback(Box::new(move |message| seen.lock().unwrap().push(message)));
        }
        let mut rx = receivers.subscribe();

        session
            .handle(json!({"type": "message", "sender": "f1", "message": {"x": 1}}))
            .await;

        assert_eq!(*seen.lock().unwrap(), vec![json!({"x": 1}), json!({"x": 1})]);
        let received = rx.recv().await.unwrap();
        assert!(received.sent_by(&PeerId::new("f1")));
        assert_eq!(received.message, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_malformed_frames_change_nothing() {
        let (session, store, receivers) = session(false);
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        receivers.add_callback(Box::new(move |_| *counter.lock().unwrap() += 1));

        session.handle(Value::Null).await;
        session.handle(json!("storage")).await;
        session.handle(json!({"type": "unknown"})).await;
        session.handle(json!({"type": "storage", "storage": 3})).await;
        session.handle(json!({"type": "storageSet", "prop": "k", "value": 1})).await;

        assert!(store.read().await.is_empty());
        assert_eq!(*calls.lock().unwrap(), 0);
    }
}
