//! # impromptu-room: serverless rooms over peer connections
//!
//! Peers join a named room and share a broadcast channel plus a small
//! replicated key-value store. There is no backend: whichever peer claims the
//! room's endpoint name first becomes the hub, and everyone (the hub too)
//! talks to the room through a follower connection to that endpoint.
//!
//! ## Architecture
//!
//! ```text
//!  Peer A (hub)                                Peer B
//! ┌──────────────────────────────┐           ┌──────────────────┐
//! │ EndpointClaimer ── claimed ─┐│           │ EndpointClaimer  │
//! │                             ▼│           │  (claim lost)    │
//! │                     ┌──────────┐         │                  │
//! │  FollowerSession ──►│ HubRelay │◄────────┤ FollowerSession  │
//! │   (loopback)     ◄──│ registry │────────►│                  │
//! │                     │ + store  │         │                  │
//! │                     └──────────┘         │                  │
//! └──────────────────────────────┘           └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire frames (`message`, `storageSet`, `storage`)
//! - [`transport`]: the endpoint/connection capability plus in-memory and
//!   WebSocket implementations
//! - [`election`]: one-shot endpoint claim deciding hub or follower
//! - [`hub`]: connection registry, fan-out and the authoritative store
//! - [`follower`]: the follower connection and its frame demux
//! - [`store`]: the replicated store cache and its accessor handle
//! - [`room`]: the public `Room` facade

/// Protocol chatter, emitted only when the room was created with debug on.
macro_rules! debug_log {
    ($enabled:expr, $($arg:tt)+) => {
        if $enabled {
            log::debug!($($arg)+);
        }
    };
}

pub mod protocol;
pub mod transport;
pub mod election;
pub mod hub;
pub mod follower;
pub mod store;
pub mod room;

// Re-exports for convenience
pub use protocol::{Frame, ProtocolError};
pub use transport::{
    Connection, ConnectionSender, EndpointEvent, PeerId, Transport, TransportError,
};
pub use transport::memory::MemoryNetwork;
pub use transport::ws::{WsTransport, WsTransportConfig};
pub use election::{endpoint_name, EndpointClaimer, Role};
pub use hub::{HubHandle, HubRelay, HubStats};
pub use store::{StoreHandle, StoreSnapshot};
pub use room::{create_room, Room, RoomConfig, RoomError, RoomMessage};
