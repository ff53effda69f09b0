//! WebSocket transport.
//!
//! An endpoint name maps to a fixed TCP port:
//! ```text
//! port(name) = base_port + fnv1a(name) % port_span
//! ```
//! Claiming an endpoint means binding that port, so the operating system's
//! one-listener-per-port rule decides the claim race. Followers connect to
//! `ws://host:port(name)/<name>?peer=<id>`; the listener refuses handshakes
//! for any other path, which keeps two names that hash to the same port
//! from sharing a hub.
//!
//! Data objects travel as JSON text frames.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::{Connection, EndpointEvent, EndpointEvents, PeerId, Transport, TransportError};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    /// Host every endpoint listens on and followers dial
    pub host: String,
    /// First port of the endpoint range
    pub base_port: u16,
    /// Number of ports endpoint names are hashed across
    pub port_span: u16,
}

impl Default for WsTransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            base_port: 43000,
            port_span: 1000,
        }
    }
}

/// Endpoint claims and connections over WebSockets.
#[derive(Debug, Clone)]
pub struct WsTransport {
    config: WsTransportConfig,
}

impl WsTransport {
    pub fn new(config: WsTransportConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(WsTransportConfig::default())
    }

    /// The port an endpoint name listens on.
    pub fn port_for(&self, name: &str) -> u16 {
        let span = u64::from(self.config.port_span.max(1));
        let offset = (fnv1a(name) % span) as u16;
        self.config.base_port.saturating_add(offset)
    }

    /// `host:port` an endpoint name listens on.
    pub fn endpoint_addr(&self, name: &str) -> String {
        format!("{}:{}", self.config.host, self.port_for(name))
    }

    pub fn config(&self) -> &WsTransportConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn claim(&self, name: &str) -> EndpointEvents {
        let (events, rx) = mpsc::unbounded_channel();
        let addr = self.endpoint_addr(name);

        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                log::debug!("Endpoint {name} listening on {addr}");
                let _ = events.send(EndpointEvent::Open(PeerId::new(name)));
                tokio::spawn(accept_loop(listener, name.to_string(), events));
            }
            Err(source) => {
                let _ = events.send(EndpointEvent::Error(TransportError::Bind {
                    name: name.to_string(),
                    addr,
                    source,
                }));
            }
        }
        rx
    }

    async fn connect(&self, name: &str) -> Result<Connection, TransportError> {
        let local = PeerId::random();
        let url = format!(
            "ws://{}/{}?peer={}",
            self.endpoint_addr(name),
            encode_path(name),
            local
        );

        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        log::debug!("Connected to endpoint {name} as {local}");
        Ok(spawn_pump(ws_stream, local, PeerId::new(name)))
    }
}

/// Accept TCP connections for a claimed endpoint until the listener fails or
/// nobody is watching the endpoint any more.
async fn accept_loop(
    listener: TcpListener,
    name: String,
    events: mpsc::UnboundedSender<EndpointEvent>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(source) => {
                log::warn!("Endpoint {name} stopped accepting: {source}");
                let _ = events.send(EndpointEvent::Error(TransportError::Listener {
                    name: name.clone(),
                    source,
                }));
                let _ = events.send(EndpointEvent::Close);
                return;
            }
        };
        if events.is_closed() {
            log::debug!("Endpoint {name} has no watcher, closing listener");
            return;
        }

        let name = name.clone();
        let events = events.clone();
        tokio::spawn(async move {
            match accept_peer(stream, &name).await {
                Ok(conn) => {
                    log::debug!("Endpoint {name} accepted {} from {addr}", conn.remote_id());
                    let _ = events.send(EndpointEvent::Connection(conn));
                }
                Err(e) => log::debug!("Endpoint {name} rejected {addr}: {e}"),
            }
        });
    }
}

/// Run the server handshake, checking the path and picking up the peer id.
async fn accept_peer(stream: TcpStream, endpoint: &str) -> Result<Connection, TransportError> {
    let expected_path = format!("/{}", encode_path(endpoint));
    let mut peer: Option<PeerId> = None;

    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let path = request.uri().path();
            if path != expected_path {
                let mut rejection = ErrorResponse::new(Some(format!("no endpoint at {path}")));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                return Err(rejection);
            }
            peer = request.uri().query().and_then(peer_from_query);
            Ok(response)
        },
    )
    .await
    .map_err(|e| TransportError::Handshake(e.to_string()))?;

    let remote = peer.unwrap_or_else(PeerId::random);
    Ok(spawn_pump(ws_stream, PeerId::new(endpoint), remote))
}

/// Bridge a WebSocket to a [`Connection`]'s channels.
///
/// The task ends when the socket closes or every send half is dropped.
fn spawn_pump<S>(ws_stream: WebSocketStream<S>, local: PeerId, remote: PeerId) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Value>();
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let peer = remote.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                outgoing = out_rx.recv() => {
                    match outgoing {
                        Some(data) => {
                            let text = match serde_json::to_string(&data) {
                                Ok(text) => text,
                                Err(e) => {
                                    log::warn!("Dropping unserializable frame for {peer}: {e}");
                                    continue;
                                }
                            };
                            if let Err(e) = ws_sender.send(Message::text(text)).await {
                                log::debug!("Send to {peer} failed: {e}");
                                break;
                            }
                        }
                        None => {
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }

                incoming = ws_receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            deliver(&in_tx, serde_json::from_str(text.as_str()), &peer);
                        }
                        Some(Ok(Message::Binary(data))) => {
                            deliver(&in_tx, serde_json::from_slice(&data), &peer);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection with {peer} closed");
                            break;
                        }
                        Some(Err(e)) => {
                            log::debug!("Connection with {peer} failed: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    });

    Connection::new(local, remote, out_tx, in_rx)
}

fn deliver(
    inbound: &mpsc::UnboundedSender<Value>,
    parsed: Result<Value, serde_json::Error>,
    peer: &PeerId,
) {
    match parsed {
        Ok(data) => {
            let _ = inbound.send(data);
        }
        Err(e) => log::debug!("Dropping non-JSON frame from {peer}: {e}"),
    }
}

fn peer_from_query(query: &str) -> Option<PeerId> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("peer="))
        .filter(|id| !id.is_empty())
        .map(PeerId::new)
}

/// Percent-encode everything outside the URL-safe unreserved set.
fn encode_path(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

fn fnv1a(name: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}
