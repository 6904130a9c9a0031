//! Peer-to-peer transport
//!
//! Peers talk over WebSocket using JSON text frames. Every frame is an [`Envelope`]:
//! `{type, data, sender_id, public_key, signature}`, where the signature covers
//! SHA-256 of the bincode encoding of the decoded [`Message`]. The first frame in
//! each direction must be a handshake; it binds the connection to the sender's id
//! and is refused when the chain id or genesis differ.

use crate::blockchain::{Block, Ledger, Sha256Hash};
use crate::config::NetworkConfig;
use crate::crypto::{address_from_hex, address_to_hex, verify_signed_by, KeyPair};
use crate::error::{ChainError, NetworkError};
use crate::transaction::Transaction;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, client_async, WebSocketStream};
use tracing::{debug, info, warn};

/// Hex-encoded address of a peer's device key, fixed at handshake.
pub type PeerId = String;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_QUEUE: usize = 1_024;
const PEER_QUEUE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub chain_id: String,
    pub genesis_hash: Sha256Hash,
    pub height: u64,
    pub tip_hash: Sha256Hash,
    /// Port the sender accepts connections on, if any.
    pub listen_port: Option<u16>,
}

impl Handshake {
    pub fn from_ledger(ledger: &Ledger, listen_port: Option<u16>) -> Self {
        Handshake {
            chain_id: ledger.params().chain_id.clone(),
            genesis_hash: ledger.genesis_hash(),
            height: ledger.height(),
            tip_hash: ledger.tip_hash(),
            listen_port,
        }
    }

    /// Whether `other` is on the same network as us.
    pub fn compatible_with(&self, other: &Handshake) -> bool {
        self.chain_id == other.chain_id && self.genesis_hash == other.genesis_hash
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    Handshake(Handshake),
    NewBlock(Block),
    NewTransaction(Transaction),
    SyncRequest { from_height: u64 },
    SyncResponse { blocks: Vec<Block> },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::NewBlock(_) => "new_block",
            Message::NewTransaction(_) => "new_transaction",
            Message::SyncRequest { .. } => "sync_request",
            Message::SyncResponse { .. } => "sync_response",
        }
    }

    fn signing_bytes(&self) -> Result<Vec<u8>, NetworkError> {
        bincode::serialize(self).map_err(|e| NetworkError::MalformedMessage(e.to_string()))
    }
}

/// Signed wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
    pub sender_id: PeerId,
    pub public_key: String,
    pub signature: String,
}

impl Envelope {
    pub fn seal(message: &Message, keypair: &KeyPair) -> Result<Self, ChainError> {
        let signature = keypair.sign(&message.signing_bytes()?)?;
        let (kind, data) = match serde_json::to_value(message)? {
            serde_json::Value::Object(mut fields) => (
                fields.remove("type").and_then(|t| t.as_str().map(str::to_string)),
                fields.remove("data"),
            ),
            _ => (None, None),
        };
        let kind = kind.ok_or_else(|| NetworkError::MalformedMessage("message has no type".to_string()))?;
        Ok(Envelope {
            kind,
            data: data.unwrap_or(serde_json::Value::Null),
            sender_id: address_to_hex(&keypair.address()),
            public_key: hex::encode(keypair.public_key_bytes()),
            signature: hex::encode(signature),
        })
    }

    /// Decode the payload and check that `sender_id` signed it.
    pub fn open(&self) -> Result<Message, NetworkError> {
        let message: Message = serde_json::from_value(serde_json::json!({
            "type": self.kind,
            "data": self.data,
        }))
        .map_err(|e| NetworkError::MalformedMessage(format!("{} payload: {}", self.kind, e)))?;

        let sender = address_from_hex(&self.sender_id)
            .map_err(|_| NetworkError::BadEnvelope("sender_id is not a hex address".to_string()))?;
        let public_key = hex::decode(&self.public_key)
            .map_err(|_| NetworkError::BadEnvelope("public_key is not hex".to_string()))?;
        let signature = hex::decode(&self.signature)
            .map_err(|_| NetworkError::BadEnvelope("signature is not hex".to_string()))?;

        if !verify_signed_by(&sender, &public_key, &message.signing_bytes()?, &signature) {
            return Err(NetworkError::BadEnvelope(format!(
                "{} from {} is not signed by its sender",
                self.kind, self.sender_id
            )));
        }
        Ok(message)
    }

    pub fn to_json(&self) -> Result<String, NetworkError> {
        serde_json::to_string(self).map_err(|e| NetworkError::MalformedMessage(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, NetworkError> {
        serde_json::from_str(text).map_err(|e| NetworkError::MalformedMessage(e.to_string()))
    }
}

/// What the transport reports to the node.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    Connected { peer: PeerId, handshake: Handshake },
    Message { peer: PeerId, message: Message },
    Disconnected { peer: PeerId },
}

struct PeerHandle {
    address: String,
    outbound: mpsc::Sender<String>,
    /// Id of the node that dialed this connection.
    initiator: PeerId,
    connection: u64,
    close: oneshot::Sender<()>,
}

impl PeerHandle {
    /// Between two connections to the same peer, both ends keep the one dialed by
    /// the lower id. A redial from the same side does not displace a live one.
    fn yields_to(&self, initiator: &str) -> bool {
        initiator < self.initiator.as_str()
    }
}

/// WebSocket server and client for one node.
pub struct NetworkNode {
    config: NetworkConfig,
    keypair: Arc<KeyPair>,
    ledger: Arc<RwLock<Ledger>>,
    peers: Arc<RwLock<HashMap<PeerId, PeerHandle>>>,
    events: mpsc::Sender<NetworkEvent>,
    next_connection: AtomicU64,
}

impl NetworkNode {
    pub fn new(
        config: NetworkConfig,
        keypair: Arc<KeyPair>,
        ledger: Arc<RwLock<Ledger>>,
    ) -> (Self, mpsc::Receiver<NetworkEvent>) {
        let (events, receiver) = mpsc::channel(EVENT_QUEUE);
        let node = NetworkNode {
            config,
            keypair,
            ledger,
            peers: Arc::new(RwLock::new(HashMap::new())),
            events,
            next_connection: AtomicU64::new(0),
        };
        (node, receiver)
    }

    pub fn local_id(&self) -> PeerId {
        address_to_hex(&self.keypair.address())
    }

    pub async fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.read().await.keys().cloned().collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peer_address(&self, peer: &str) -> Option<String> {
        self.peers.read().await.get(peer).map(|p| p.address.clone())
    }

    /// Accept connections until the listener fails.
    pub async fn start_server(self: Arc<Self>, listener: TcpListener) -> Result<(), ChainError> {
        let local = listener.local_addr()?;
        info!("P2P server listening on ws://{}", local);
        loop {
            let (stream, remote) = listener.accept().await?;
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                let handshake_timeout = node.handshake_timeout();
                let ws = match timeout(handshake_timeout, accept_async(stream)).await {
                    Ok(Ok(ws)) => ws,
                    Ok(Err(e)) => {
                        debug!("WebSocket accept from {} failed: {}", remote, e);
                        return;
                    }
                    Err(_) => {
                        debug!("WebSocket accept from {} timed out", remote);
                        return;
                    }
                };
                if let Err(e) = node.run_connection(ws, remote.to_string(), false).await {
                    debug!("Inbound peer {} closed: {}", remote, e);
                }
            });
        }
    }

    /// Open one outbound connection and serve it until it closes.
    pub async fn connect_peer(&self, address: &str) -> Result<(), NetworkError> {
        let url = format!("ws://{}", address);
        let stream = timeout(self.handshake_timeout(), TcpStream::connect(address))
            .await
            .map_err(|_| NetworkError::Timeout)?
            .map_err(|e| NetworkError::Transport(format!("connect to {} failed: {}", address, e)))?;
        let (ws, _) = timeout(self.handshake_timeout(), client_async(url.as_str(), stream))
            .await
            .map_err(|_| NetworkError::Timeout)?
            .map_err(|e| NetworkError::Transport(format!("WebSocket upgrade to {} failed: {}", address, e)))?;
        self.run_connection(ws, address.to_string(), true).await
    }

    /// Keep a connection to `address` alive, retrying with exponential backoff
    /// between 1 and 60 seconds.
    pub async fn maintain_peer(self: Arc<Self>, address: String) {
        let mut backoff = MIN_BACKOFF;
        loop {
            match self.connect_peer(&address).await {
                Ok(()) => {
                    debug!("Connection to {} ended", address);
                    backoff = MIN_BACKOFF;
                }
                Err(e) => {
                    debug!("Peer {} unavailable: {}; retrying in {:?}", address, e, backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
            tokio::time::sleep(backoff).await;
        }
    }

    /// Send `message` to every connected peer except `except`.
    pub async fn broadcast(&self, message: &Message, except: Option<&str>) -> Result<usize, ChainError> {
        let frame = Envelope::seal(message, &self.keypair)?.to_json()?;
        let peers = self.peers.read().await;
        let mut sent = 0;
        for (id, peer) in peers.iter() {
            if Some(id.as_str()) == except {
                continue;
            }
            if peer.outbound.try_send(frame.clone()).is_ok() {
                sent += 1;
            } else {
                debug!("Outbound queue to {} is full, dropping {}", id, message.kind());
            }
        }
        Ok(sent)
    }

    pub async fn send_to(&self, peer: &str, message: &Message) -> Result<(), ChainError> {
        let frame = Envelope::seal(message, &self.keypair)?.to_json()?;
        let peers = self.peers.read().await;
        let handle = peers
            .get(peer)
            .ok_or_else(|| NetworkError::UnknownPeer(peer.to_string()))?;
        handle
            .outbound
            .send(frame)
            .await
            .map_err(|_| NetworkError::Disconnected)?;
        Ok(())
    }

    /// Close the connection to `peer`. The reader stops at once; dropping the queue
    /// stops the writer, which closes the socket.
    pub async fn disconnect(&self, peer: &str) -> bool {
        match self.peers.write().await.remove(peer) {
            Some(handle) => {
                let _ = handle.close.send(());
                true
            }
            None => false,
        }
    }

    fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.config.handshake_timeout_secs)
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.config.idle_timeout_secs)
    }

    async fn local_handshake(&self) -> Handshake {
        let ledger = self.ledger.read().await;
        Handshake::from_ledger(&ledger, Some(self.config.p2p_port))
    }

    /// Handshake, register and serve one connection. `dialed` is true when we opened it.
    async fn run_connection(
        &self,
        ws: WebSocketStream<TcpStream>,
        address: String,
        dialed: bool,
    ) -> Result<(), NetworkError> {
        let (mut sink, mut stream) = ws.split();
        let ours = self.local_handshake().await;

        let hello = Envelope::seal(&Message::Handshake(ours.clone()), &self.keypair)
            .map_err(|e| NetworkError::MalformedMessage(e.to_string()))?
            .to_json()?;
        timeout(WRITE_TIMEOUT, sink.send(WsMessage::Text(hello)))
            .await
            .map_err(|_| NetworkError::Timeout)?
            .map_err(|e| NetworkError::Transport(e.to_string()))?;

        let envelope = timeout(self.handshake_timeout(), next_envelope(&mut stream))
            .await
            .map_err(|_| NetworkError::Timeout)??;
        let theirs = match envelope.open()? {
            Message::Handshake(handshake) => handshake,
            other => {
                return Err(NetworkError::MalformedMessage(format!(
                    "expected handshake, got {}",
                    other.kind()
                )))
            }
        };
        let peer_id = envelope.sender_id;
        if !ours.compatible_with(&theirs) {
            warn!(
                "Dropping {} at {}: chain {} does not match ours ({})",
                peer_id, address, theirs.chain_id, ours.chain_id
            );
            return Err(NetworkError::BadEnvelope("chain id or genesis mismatch".to_string()));
        }
        if peer_id == self.local_id() {
            return Err(NetworkError::BadEnvelope("connected to ourselves".to_string()));
        }

        let initiator = if dialed { self.local_id() } else { peer_id.clone() };
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (outbound, mut queue) = mpsc::channel::<String>(PEER_QUEUE);
        let (close, mut closed) = oneshot::channel();
        {
            let mut peers = self.peers.write().await;
            match peers.get(&peer_id) {
                Some(existing) if !existing.yields_to(&initiator) => {
                    return Err(NetworkError::Transport(format!("already connected to {}", peer_id)));
                }
                Some(_) => debug!("Replacing connection to {} with the one {} dialed", peer_id, initiator),
                None if peers.len() >= self.config.max_peers => {
                    return Err(NetworkError::Transport("peer limit reached".to_string()));
                }
                None => {}
            }
            let handle = PeerHandle {
                address: address.clone(),
                outbound,
                initiator,
                connection,
                close,
            };
            if let Some(replaced) = peers.insert(peer_id.clone(), handle) {
                let _ = replaced.close.send(());
            }
        }
        info!("Connected to peer {} at {} (height {})", peer_id, address, theirs.height);
        let _ = self
            .events
            .send(NetworkEvent::Connected {
                peer: peer_id.clone(),
                handshake: theirs,
            })
            .await;

        let writer = tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                match timeout(WRITE_TIMEOUT, sink.send(WsMessage::Text(frame))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            let _ = sink.close().await;
        });

        let result = self.read_loop(&mut stream, &peer_id, &mut closed).await;

        writer.abort();
        let replaced = {
            let mut peers = self.peers.write().await;
            match peers.get(&peer_id) {
                Some(handle) if handle.connection != connection => true,
                Some(_) => {
                    peers.remove(&peer_id);
                    false
                }
                None => false,
            }
        };
        if replaced {
            debug!("Connection {} to {} superseded", connection, peer_id);
            return Ok(());
        }
        let _ = self
            .events
            .send(NetworkEvent::Disconnected { peer: peer_id.clone() })
            .await;
        match &result {
            Err(e) => info!("Peer {} dropped: {}", peer_id, e),
            Ok(()) => info!("Peer {} disconnected", peer_id),
        }
        result
    }

    /// Forward frames from `peer_id` until the socket closes or `closed` fires.
    async fn read_loop(
        &self,
        stream: &mut SplitStream<WebSocketStream<TcpStream>>,
        peer_id: &str,
        closed: &mut oneshot::Receiver<()>,
    ) -> Result<(), NetworkError> {
        loop {
            let next = tokio::select! {
                _ = &mut *closed => return Ok(()),
                next = timeout(self.idle_timeout(), next_envelope(stream)) => next,
            };
            let envelope = match next {
                Err(_) => return Err(NetworkError::Timeout),
                Ok(Err(NetworkError::Disconnected)) => return Ok(()),
                Ok(Err(NetworkError::MalformedMessage(reason))) => {
                    debug!("Ignoring malformed frame from {}: {}", peer_id, reason);
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Ok(Ok(envelope)) => envelope,
            };
            if envelope.sender_id != peer_id {
                return Err(NetworkError::BadEnvelope(format!(
                    "sender id changed from {} to {}",
                    peer_id, envelope.sender_id
                )));
            }
            let message = envelope.open()?;
            if self
                .events
                .send(NetworkEvent::Message {
                    peer: peer_id.to_string(),
                    message,
                })
                .await
                .is_err()
            {
                return Ok(());
            }
        }
    }
}

/// Next text frame as an envelope. Control frames are skipped.
async fn next_envelope(stream: &mut SplitStream<WebSocketStream<TcpStream>>) -> Result<Envelope, NetworkError> {
    loop {
        let frame = stream
            .next()
            .await
            .ok_or(NetworkError::Disconnected)?
            .map_err(|e| NetworkError::Transport(e.to_string()))?;
        match frame {
            WsMessage::Text(text) => return Envelope::from_json(&text),
            WsMessage::Binary(bytes) => {
                let text = String::from_utf8(bytes)
                    .map_err(|_| NetworkError::MalformedMessage("binary frame is not UTF-8".to_string()))?;
                return Envelope::from_json(&text);
            }
            WsMessage::Close(_) => return Err(NetworkError::Disconnected),
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
        }
    }
}
