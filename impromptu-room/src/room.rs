//! The public room facade.
//!
//! ```text
//! Room::connect()
//!   ├── EndpointClaimer::try_become_hub()   claim "<namespace>-<room>"
//!   │      └── on success: HubRelay behind the endpoint
//!   └── FollowerSession::connect_client()   always, hub included
//!
//! Room::send(msg)        ──► follower connection ──► hub fan-out
//! Room::on_receive(cb)   ◄── follower connection ◄── hub fan-out
//! Room::storage().set()  ──► follower connection ──► hub store ──► snapshot
//! Room::storage().get()  ◄── local cache
//! ```
//!
//! A room lives for as long as its owner keeps it; there is no teardown,
//! reconnect or hub failover.

use std::sync::{Arc, OnceLock};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::election::{endpoint_name, EndpointClaimer, Role};
use crate::follower::{FollowerSession, Receivers};
use crate::hub::{HubHandle, HubStats};
use crate::protocol::{Frame, ProtocolError};
use crate::store::{shared_store, SharedStore, StoreHandle};
use crate::transport::{ConnectionSender, PeerId, Transport, TransportError};

/// Room configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Prefix of the endpoint name derived from the room name
    pub namespace: String,
    /// Log protocol chatter at debug level
    pub debug: bool,
    /// Messages buffered per [`Room::subscribe`] receiver
    pub event_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            namespace: "impromptu".to_string(),
            debug: false,
            event_capacity: 256,
        }
    }
}

/// A broadcast received from the room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomMessage {
    /// Connection id of the peer that sent it, as stamped by the hub
    pub sender: Option<PeerId>,
    pub message: Value,
}

impl RoomMessage {
    pub fn sent_by(&self, peer: &PeerId) -> bool {
        self.sender.as_ref() == Some(peer)
    }
}

/// Room errors.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("room is not connected")]
    NotConnected,
    #[error("room is already connected")]
    AlreadyConnected,
    #[error("connection to the hub is closed")]
    ConnectionClosed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A joined (or joining) room.
pub struct Room {
    room_name: String,
    endpoint: String,
    config: RoomConfig,
    transport: Arc<dyn Transport>,
    role: Arc<RwLock<Role>>,
    store: SharedStore,
    /// Send half of the follower connection, set once `connect()` succeeds
    link: Arc<OnceLock<ConnectionSender>>,
    /// Set when this peer won the claim
    hub: Arc<OnceLock<HubHandle>>,
    receivers: Arc<Receivers>,
    /// Held for the whole of `connect()`; true once the claim has settled
    claimed: Mutex<bool>,
}

impl Room {
    /// Create a room with default configuration.
    pub fn new(transport: Arc<dyn Transport>, room_name: impl Into<String>, debug: bool) -> Self {
        let config = RoomConfig {
            debug,
            ..RoomConfig::default()
        };
        Self::with_config(transport, room_name, config)
    }

    pub fn with_config(
        transport: Arc<dyn Transport>,
        room_name: impl Into<String>,
        config: RoomConfig,
    ) -> Self {
        let room_name = room_name.into();
        let endpoint = endpoint_name(&config.namespace, &room_name);
        let receivers = Arc::new(Receivers::new(config.event_capacity));
        debug_log!(config.debug, "Created room with name {room_name}");

        Self {
            room_name,
            endpoint,
            config,
            transport,
            role: Arc::new(RwLock::new(Role::Unresolved)),
            store: shared_store(),
            link: Arc::new(OnceLock::new()),
            hub: Arc::new(OnceLock::new()),
            receivers,
            claimed: Mutex::new(false),
        }
    }

    /// Join the room: race for the hub endpoint, then open the follower
    /// connection. Only the follower connection can fail; losing the race
    /// is normal. There is no timeout.
    ///
    /// The claim is attempted once per room. If opening the follower
    /// connection fails, calling `connect()` again retries just that step.
    /// Once connected, further calls return [`RoomError::AlreadyConnected`].
    pub async fn connect(&self) -> Result<(), RoomError> {
        let mut claimed = self.claimed.lock().await;
        if self.link.get().is_some() {
            return Err(RoomError::AlreadyConnected);
        }

        if !*claimed {
            let claimer = EndpointClaimer::new(
                self.transport.clone(),
                self.endpoint.clone(),
                self.role.clone(),
                self.store.clone(),
                self.hub.clone(),
                self.config.debug,
            );
            let role = claimer.try_become_hub().await;
            *claimed = true;
            log::info!("Room {} resolved as {role:?}", self.room_name);
        }

        let session = FollowerSession::new(
            self.endpoint.clone(),
            self.hub.clone(),
            self.store.clone(),
            self.receivers.clone(),
            self.config.debug,
        );
        let link = session.connect_client(self.transport.as_ref()).await?;
        let _ = self.link.set(link);

        debug_log!(self.config.debug, "Room {} ready", self.room_name);
        Ok(())
    }

    /// Broadcast `message` to everyone in the room, this peer included.
    pub fn send(&self, message: impl Into<Value>) -> Result<(), RoomError> {
        let link = self.link.get().ok_or(RoomError::NotConnected)?;
        let frame = Frame::message(message);
        debug_log!(self.config.debug, "Sending: {frame:?}");
        link.send(frame.to_value()?)
            .map_err(|_| RoomError::ConnectionClosed)
    }

    /// Call `callback` with every broadcast message received. Each call adds
    /// another callback; nothing is deduplicated.
    pub fn on_receive<F>(&self, callback: F)
    where
        F: FnMut(Value) + Send + 'static,
    {
        self.receivers.add_callback(Box::new(callback));
    }

    /// Stream of received broadcasts with their sender ids.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomMessage> {
        self.receivers.subscribe()
    }

    /// Accessor for the replicated store.
    pub fn storage(&self) -> StoreHandle {
        StoreHandle::new(self.store.clone(), self.link.clone(), self.config.debug)
    }

    pub async fn role(&self) -> Role {
        *self.role.read().await
    }

    pub async fn is_hub(&self) -> bool {
        self.role().await == Role::Hub
    }

    /// This peer's connection id in the room (the `sender` others see).
    pub fn local_id(&self) -> Option<PeerId> {
        self.link.get().map(|link| link.local_id().clone())
    }

    pub fn is_connected(&self) -> bool {
        self.link.get().is_some_and(|link| !link.is_closed())
    }

    /// Relay statistics, if this peer won the hub claim.
    pub fn hub_stats(&self) -> Option<HubStats> {
        self.hub.get().map(HubHandle::stats)
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    pub fn endpoint_name(&self) -> &str {
        &self.endpoint
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }
}

/// Create a room and join it in the background, calling `on_ready` once
/// `connect()` finishes. This is the hook for hosts that hold their main
/// loop until rooms are set up. Must be called inside a tokio runtime.
pub fn create_room<F>(
    transport: Arc<dyn Transport>,
    room_name: impl Into<String>,
    debug: bool,
    on_ready: F,
) -> Arc<Room>
where
    F: FnOnce(Result<(), RoomError>) + Send + 'static,
{
    let room = Arc::new(Room::new(transport, room_name, debug));
    let joining = room.clone();
    tokio::spawn(async move {
        let result = joining.connect().await;
        if let Err(e) = &result {
            log::warn!("Joining room {} failed: {e}", joining.room_name());
        }
        on_ready(result);
    });
    room
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryNetwork;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    #[test]
    fn test_room_config_default() {
        let config = RoomConfig::default();
        assert_eq!(config.namespace, "impromptu");
        assert!(!config.debug);
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn test_room_creation() {
        let room = Room::new(Arc::new(MemoryNetwork::new()), "demo", true);
        assert_eq!(room.room_name(), "demo");
        assert_eq!(room.endpoint_name(), "impromptu-demo");
        assert!(room.config().debug);
        assert!(room.local_id().is_none());
        assert!(!room.is_connected());
        assert!(room.hub_stats().is_none());
    }

    #[test]
    fn test_custom_namespace() {
        let config = RoomConfig {
            namespace: "sketch".to_string(),
            ..RoomConfig::default()
        };
        let room = Room::with_config(Arc::new(MemoryNetwork::new()), "demo", config);
        assert_eq!(room.endpoint_name(), "sketch-demo");
    }

    #[tokio::test]
    async fn test_initial_role_unresolved() {
        let room = Room::new(Arc::new(MemoryNetwork::new()), "demo", false);
        assert_eq!(room.role().await, Role::Unresolved);
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let room = Room::new(Arc::new(MemoryNetwork::new()), "demo", false);
        assert!(matches!(room.send(json!(1)), Err(RoomError::NotConnected)));
        assert!(matches!(
            room.storage().set("k", 1),
            Err(RoomError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_lone_peer_becomes_hub_and_hears_itself() {
        let room = Room::new(Arc::new(MemoryNetwork::new()), "solo", false);
        room.connect().await.unwrap();

        assert!(room.is_hub().await);
        assert!(room.is_connected());
        let me = room.local_id().unwrap();

        let mut rx = room.subscribe();
        room.send("hello").unwrap();
        let received = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(received.sent_by(&me));
        assert_eq!(received.message, json!("hello"));
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let room = Room::new(Arc::new(MemoryNetwork::new()), "demo", false);
        room.connect().await.unwrap();
        assert!(matches!(room.connect().await, Err(RoomError::AlreadyConnected)));
    }

    /// Memory network whose first `connect` fails.
    struct FlakyConnect {
        net: MemoryNetwork,
        failed: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl Transport for FlakyConnect {
        async fn claim(&self, name: &str) -> crate::transport::EndpointEvents {
            self.net.claim(name).await
        }

        async fn connect(&self, name: &str) -> Result<crate::transport::Connection, TransportError> {
            if !self.failed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(TransportError::Connect {
                    name: name.to_string(),
                    reason: "refused".to_string(),
                });
            }
            self.net.connect(name).await
        }
    }

    #[tokio::test]
    async fn test_connect_retry_after_failed_follower_connection() {
        let transport = FlakyConnect {
            net: MemoryNetwork::new(),
            failed: std::sync::atomic::AtomicBool::new(false),
        };
        let room = Room::new(Arc::new(transport), "retry", false);

        assert!(matches!(room.connect().await, Err(RoomError::Transport(_))));
        assert!(room.is_hub().await);
        assert!(!room.is_connected());

        // The claim is kept; only the follower connection is retried
        room.connect().await.unwrap();
        assert!(room.is_hub().await);
        assert!(room.is_connected());
        assert!(matches!(room.connect().await, Err(RoomError::AlreadyConnected)));

        let me = room.local_id().unwrap();
        let mut rx = room.subscribe();
        room.send("after retry").unwrap();
        let received = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(received.sent_by(&me));
    }

    #[tokio::test]
    async fn test_create_room_calls_ready() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let room = create_room(Arc::new(MemoryNetwork::new()), "preload", false, move |result| {
            let _ = tx.send(result.is_ok());
        });

        let ok = timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
        assert!(ok);
        assert!(room.is_connected());
        assert!(room.is_hub().await);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(RoomError::NotConnected.to_string(), "room is not connected");
        let err = RoomError::from(TransportError::NoSuchEndpoint("x".into()));
        assert_eq!(err.to_string(), "no endpoint named x");
    }
}
