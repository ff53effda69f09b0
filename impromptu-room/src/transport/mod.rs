//! Peer transport capability.
//!
//! The room core needs very little from a transport:
//! - claim a named endpoint and hear about the outcome and about incoming
//!   connections ([`Transport::claim`])
//! - open a connection to a named endpoint ([`Transport::connect`])
//! - move JSON data objects over a connection ([`Connection`])
//!
//! Two implementations ship with the crate: [`memory::MemoryNetwork`] for
//! rooms inside one process, and [`ws::WsTransport`] over WebSockets.

pub mod memory;
pub mod ws;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identity of an endpoint or of one side of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identity for a connecting peer.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Events reported for a claimed endpoint.
#[derive(Debug)]
pub enum EndpointEvent {
    /// The claim succeeded; carries the endpoint's own id.
    Open(PeerId),
    /// The endpoint lost its registration (after or instead of opening).
    Disconnected,
    /// The endpoint was shut down.
    Close,
    /// The claim failed, typically because another peer holds the name.
    Error(TransportError),
    /// A peer opened a connection to this endpoint.
    Connection(Connection),
}

/// Stream of events for one claim attempt.
pub type EndpointEvents = mpsc::UnboundedReceiver<EndpointEvent>;

/// The transport capability the room core is built on.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Try to claim `name`. The outcome arrives on the returned stream as
    /// `Open` or `Error`; accepted connections follow as `Connection`.
    async fn claim(&self, name: &str) -> EndpointEvents;

    /// Open a connection to the endpoint `name`, resolving once it is open.
    async fn connect(&self, name: &str) -> Result<Connection, TransportError>;
}

/// An open connection: a send half and the stream of inbound data objects.
///
/// The inbound stream ends when the remote side goes away.
#[derive(Debug)]
pub struct Connection {
    sender: ConnectionSender,
    inbound: mpsc::UnboundedReceiver<Value>,
}

impl Connection {
    pub fn new(
        local: PeerId,
        remote: PeerId,
        outbound: mpsc::UnboundedSender<Value>,
        inbound: mpsc::UnboundedReceiver<Value>,
    ) -> Self {
        Self {
            sender: ConnectionSender {
                local,
                remote,
                outbound,
            },
            inbound,
        }
    }

    /// Two connected in-process ends: whatever one sends the other receives.
    pub fn pair(a: PeerId, b: PeerId) -> (Connection, Connection) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Connection::new(a.clone(), b.clone(), a_tx, a_rx),
            Connection::new(b, a, b_tx, b_rx),
        )
    }

    pub fn local_id(&self) -> &PeerId {
        &self.sender.local
    }

    pub fn remote_id(&self) -> &PeerId {
        &self.sender.remote
    }

    pub fn send(&self, data: Value) -> Result<(), TransportError> {
        self.sender.send(data)
    }

    /// Next inbound data object, `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<Value> {
        self.inbound.recv().await
    }

    /// Split into a cloneable send half and the inbound stream.
    pub fn into_parts(self) -> (ConnectionSender, mpsc::UnboundedReceiver<Value>) {
        (self.sender, self.inbound)
    }
}

/// Send half of a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionSender {
    local: PeerId,
    remote: PeerId,
    outbound: mpsc::UnboundedSender<Value>,
}

impl ConnectionSender {
    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    pub fn remote_id(&self) -> &PeerId {
        &self.remote
    }

    /// Queue one data object. No delivery confirmation; fails only when the
    /// connection is already gone.
    pub fn send(&self, data: Value) -> Result<(), TransportError> {
        self.outbound.send(data).map_err(|_| TransportError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("endpoint {0} is already claimed")]
    EndpointTaken(String),

    #[error("no endpoint named {0}")]
    NoSuchEndpoint(String),

    #[error("failed to bind endpoint {name} on {addr}: {source}")]
    Bind {
        name: String,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("listener for {name} failed: {source}")]
    Listener {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {name} failed: {reason}")]
    Connect { name: String, reason: String },

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("connection closed")]
    Closed,
}
