//! In-process transport.
//!
//! `MemoryNetwork` plays the role of a signaling broker for peers living in
//! the same process: it hands out endpoint names first come, first served and
//! wires connections up with in-memory channels. Cloning the network shares
//! the same broker.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::{Connection, EndpointEvent, EndpointEvents, PeerId, Transport, TransportError};

/// An in-process broker of named endpoints.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    /// Claimed endpoint name → event stream of its claimant
    endpoints: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<EndpointEvent>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `name` away from its claimant, which sees `Disconnected`.
    ///
    /// The name becomes free to claim again. Connections already made stay up.
    pub async fn release(&self, name: &str) -> bool {
        let mut endpoints = self.endpoints.lock().await;
        match endpoints.remove(name) {
            Some(events) => {
                let _ = events.send(EndpointEvent::Disconnected);
                log::debug!("Released endpoint {name}");
                true
            }
            None => false,
        }
    }

    /// Whether `name` currently has a live claimant.
    pub async fn is_claimed(&self, name: &str) -> bool {
        let endpoints = self.endpoints.lock().await;
        endpoints.get(name).is_some_and(|events| !events.is_closed())
    }
}

#[async_trait::async_trait]
impl Transport for MemoryNetwork {
    async fn claim(&self, name: &str) -> EndpointEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut endpoints = self.endpoints.lock().await;

        // A claimant that dropped its event stream no longer holds the name
        let taken = endpoints.get(name).is_some_and(|events| !events.is_closed());
        if taken {
            let _ = tx.send(EndpointEvent::Error(TransportError::EndpointTaken(
                name.to_string(),
            )));
        } else {
            let _ = tx.send(EndpointEvent::Open(PeerId::new(name)));
            endpoints.insert(name.to_string(), tx);
        }
        rx
    }

    async fn connect(&self, name: &str) -> Result<Connection, TransportError> {
        let mut endpoints = self.endpoints.lock().await;
        let events = endpoints
            .get(name)
            .ok_or_else(|| TransportError::NoSuchEndpoint(name.to_string()))?;

        let (follower_side, endpoint_side) = Connection::pair(PeerId::random(), PeerId::new(name));
        if events.send(EndpointEvent::Connection(endpoint_side)).is_err() {
            endpoints.remove(name);
            return Err(TransportError::NoSuchEndpoint(name.to_string()));
        }
        Ok(follower_side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_first_claim_wins() {
        let net = MemoryNetwork::new();

        let mut first = net.claim("impromptu-demo").await;
        let mut second = net.claim("impromptu-demo").await;

        assert!(matches!(first.recv().await, Some(EndpointEvent::Open(id)) if id.as_str() == "impromptu-demo"));
        assert!(matches!(
            second.recv().await,
            Some(EndpointEvent::Error(TransportError::EndpointTaken(_)))
        ));
        assert!(net.is_claimed("impromptu-demo").await);
    }

    #[tokio::test]
    async fn test_connect_reaches_claimant() {
        let net = MemoryNetwork::new();
        let mut events = net.claim("hub").await;
        let _open = events.recv().await;

        let mut follower = net.connect("hub").await.unwrap();
        let mut accepted = match events.recv().await {
            Some(EndpointEvent::Connection(conn)) => conn,
            other => panic!("expected connection, got {other:?}"),
        };

        assert_eq!(accepted.remote_id(), follower.local_id());
        assert_eq!(follower.remote_id(), &PeerId::new("hub"));

        follower.send(json!({"type": "message", "message": 1})).unwrap();
        assert_eq!(
            accepted.recv().await,
            Some(json!({"type": "message", "message": 1}))
        );
        accepted.send(json!("pong")).unwrap();
        assert_eq!(follower.recv().await, Some(json!("pong")));
    }

    #[tokio::test]
    async fn test_connect_to_unknown_endpoint_fails() {
        let net = MemoryNetwork::new();
        assert!(matches!(
            net.connect("nobody").await,
            Err(TransportError::NoSuchEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_release_disconnects_and_frees_name() {
        let net = MemoryNetwork::new();
        let mut events = net.claim("hub").await;
        let _open = events.recv().await;

        assert!(net.release("hub").await);
        assert!(matches!(events.recv().await, Some(EndpointEvent::Disconnected)));
        assert!(!net.is_claimed("hub").await);
        assert!(!net.release("hub").await);

        let mut again = net.claim("hub").await;
        assert!(matches!(again.recv().await, Some(EndpointEvent::Open(_))));
    }

    #[tokio::test]
    async fn test_dropped_claimant_frees_name() {
        let net = MemoryNetwork::new();
        drop(net.claim("hub").await);

        let mut again = net.claim("hub").await;
        assert!(matches!(again.recv().await, Some(EndpointEvent::Open(_))));
    }
}
