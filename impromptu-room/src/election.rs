//! Hub election by endpoint claim.
//!
//! Every peer tries, exactly once, to claim the room's endpoint name. The
//! transport only lets one claimant hold a name, so the first successful
//! claim becomes the hub and everyone else a follower. There is no
//! coordination beyond that, and no re-election: a peer that resolved as a
//! follower never tries again.
//!
//! After resolving, the claimer keeps watching its endpoint. On the hub it
//! hands incoming connections to the [`HubRelay`]; if the endpoint later
//! disconnects or closes, the role drops to `Follower` for good.

use std::sync::{Arc, OnceLock};
use tokio::sync::{oneshot, RwLock};

use crate::hub::{HubHandle, HubRelay};
use crate::store::SharedStore;
use crate::transport::{EndpointEvent, EndpointEvents, Transport};

/// A peer's role in its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Claim not settled yet
    Unresolved,
    /// Holds the room endpoint and relays for everyone
    Hub,
    /// Talks to someone else's hub
    Follower,
}

/// The endpoint name every peer of `room_name` races to claim.
pub fn endpoint_name(namespace: &str, room_name: &str) -> String {
    format!("{namespace}-{room_name}")
}

/// One-shot claim outcome. Only the first `settle` takes effect.
struct ClaimSignal {
    tx: Option<oneshot::Sender<Role>>,
}

impl ClaimSignal {
    fn settle(&mut self, role: Role) -> bool {
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(role);
                true
            }
            None => false,
        }
    }

    fn is_settled(&self) -> bool {
        self.tx.is_none()
    }
}

/// Claims a room endpoint and, on success, runs the hub relay behind it.
pub struct EndpointClaimer {
    transport: Arc<dyn Transport>,
    endpoint: String,
    role: Arc<RwLock<Role>>,
    store: SharedStore,
    hub: Arc<OnceLock<HubHandle>>,
    debug: bool,
}

impl EndpointClaimer {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        endpoint: String,
        role: Arc<RwLock<Role>>,
        store: SharedStore,
        hub: Arc<OnceLock<HubHandle>>,
        debug: bool,
    ) -> Self {
        Self {
            transport,
            endpoint,
            role,
            store,
            hub,
            debug,
        }
    }

    /// Attempt the claim. Resolves once with the settled role and never
    /// fails: losing the race is just the `Follower` outcome.
    pub async fn try_become_hub(self) -> Role {
        debug_log!(self.debug, "Attempting to become hub for {}...", self.endpoint);
        let events = self.transport.claim(&self.endpoint).await;

        let (tx, rx) = oneshot::channel();
        let signal = ClaimSignal { tx: Some(tx) };
        tokio::spawn(self.watch(events, signal));

        // The watcher settles before it can exit; a dropped signal still
        // means nobody handed us the endpoint
        rx.await.unwrap_or(Role::Follower)
    }

    /// Drive the endpoint's events for as long as the transport reports them.
    async fn watch(self, mut events: EndpointEvents, mut signal: ClaimSignal) {
        while let Some(event) = events.recv().await {
            match event {
                EndpointEvent::Open(id) => {
                    if signal.is_settled() {
                        debug_log!(self.debug, "Ignoring late open of {id}, role already settled");
                        continue;
                    }
                    *self.role.write().await = Role::Hub;
                    let hub = HubRelay::spawn(self.store.clone(), self.debug);
                    let _ = self.hub.set(hub);
                    log::info!("Became hub for {} (id {id})", self.endpoint);
                    signal.settle(Role::Hub);
                }
                EndpointEvent::Connection(conn) => match self.hub.get() {
                    Some(hub) => {
                        debug_log!(self.debug, "New connection to hub from {}", conn.remote_id());
                        hub.accept(conn);
                    }
                    None => {
                        debug_log!(self.debug, "Dropping connection from {}, not hub", conn.remote_id());
                    }
                },
                EndpointEvent::Error(e) => {
                    debug_log!(self.debug, "Claim of {} failed: {e}", self.endpoint);
                    self.fall_back(&mut signal).await;
                }
                EndpointEvent::Disconnected | EndpointEvent::Close => {
                    self.fall_back(&mut signal).await;
                }
            }
        }
        signal.settle(Role::Follower);
    }

    /// Become (or stay) a follower. A hub that loses its endpoint ends up
    /// here too, but a follower never goes back to hub.
    async fn fall_back(&self, signal: &mut ClaimSignal) {
        let mut role = self.role.write().await;
        if *role == Role::Hub {
            log::warn!("Lost hub endpoint {}, continuing as follower", self.endpoint);
        }
        *role = Role::Follower;
        drop(role);
        if signal.settle(Role::Follower) {
            debug_log!(self.debug, "Not hub for {}", self.endpoint);
        }
    }
}
