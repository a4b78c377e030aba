//! Clients and the process-wide client registry.
//!
//! A client is created by the HTTP identity flow and outlives any single
//! WebSocket connection. Its private id never leaves the server (knowing
//! it would allow impersonation); peers only ever see the public id, a
//! keyed hash of the private one.
//!
//! While no transport is attached an inactivity timer runs; if it fires
//! the registry evicts the client, which cascades into its session
//! (receiver removal, or sender-gone termination).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::bus::{EventBus, Subscriber};
use crate::config::RelayConfig;
use crate::error::IdentityError;
use crate::protocol::{DirectReply, PeerEvent, SenderEvent, SessionEvent, CLIENT_NAME_MAX_LENGTH};
use crate::timer::Countdown;

/// Length of a freshly generated private id, in raw bytes.
const PRIVATE_ID_BYTES: usize = 18;

/// A frame queued for a client's WebSocket writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
    /// Close the connection with a protocol-violation reason.
    Close { reason: String },
}

/// A connected client's sender channel.
pub type ClientSender = mpsc::UnboundedSender<Outbound>;

/// Lifecycle notifications a client emits toward its session.
#[derive(Debug, Clone)]
pub enum ClientLifecycleEvent {
    /// The registry dropped this client.
    Destroyed { public_id: String },
}

/// One identified client.
pub struct Client {
    private_id: String,
    public_id: String,
    name: RwLock<String>,
    joined_session: RwLock<Option<String>>,
    bytes_received: AtomicU64,
    transport: RwLock<Option<ClientSender>>,
    timeout: Duration,
    timeout_timer: Countdown,
    destroyed: AtomicBool,
    /// Presence and name changes, seen by cross-linked peers.
    peer_bus: EventBus<PeerEvent>,
    /// Internal lifecycle topic the owning session subscribes to.
    lifecycle_bus: EventBus<ClientLifecycleEvent>,
    registry: Weak<ClientRegistry>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("private_id", &self.private_id)
            .field("public_id", &self.public_id)
            .finish()
    }
}

impl Client {
    pub fn private_id(&self) -> &str {
        &self.private_id
    }

    pub fn public_id(&self) -> &str {
        &self.public_id
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Set the display name, truncated to [`CLIENT_NAME_MAX_LENGTH`]
    /// characters. Empty names are ignored. Peers are notified.
    pub fn set_name(&self, name: &str) {
        if name.is_empty() {
            return;
        }

        let truncated: String = name.chars().take(CLIENT_NAME_MAX_LENGTH).collect();
        *self.name.write() = truncated.clone();

        self.peer_bus.publish(&PeerEvent::NameChanged {
            id: self.public_id.clone(),
            name: truncated,
        });
    }

    pub fn joined_session(&self) -> Option<String> {
        self.joined_session.read().clone()
    }

    /// Bind this client to a session. Settable once.
    pub fn join_session(&self, id: &str) -> bool {
        if id.is_empty() {
            return false;
        }

        let mut joined = self.joined_session.write();
        if joined.is_some() {
            return false;
        }
        *joined = Some(id.to_string());
        true
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Bump the personal received-bytes counter and tell the client.
    pub fn increment_received(&self, bytes: u64) {
        let total = self.bytes_received.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.send_reply(&DirectReply::PersonalReceived { bytes: total });
    }

    /// A client is online while a transport is attached (the inactivity
    /// timer only runs while disconnected).
    pub fn online(&self) -> bool {
        !self.timeout_timer.is_running()
    }

    /// Attach a live transport: the inactivity timer stops and peers see
    /// the client come online.
    pub fn attach_transport(&self, sender: ClientSender) {
        *self.transport.write() = Some(sender);
        self.timeout_timer.stop();

        self.peer_bus.publish(&PeerEvent::Connected {
            id: self.public_id.clone(),
        });
    }

    /// Drop the transport: the inactivity timer starts and peers see the
    /// client go offline.
    pub fn detach_transport(self: &Arc<Self>) {
        *self.transport.write() = None;
        self.arm_timeout();

        self.peer_bus.publish(&PeerEvent::Disconnected {
            id: self.public_id.clone(),
        });
    }

    /// Restart the inactivity timer if it is currently counting down.
    pub fn touch_timeout_if_armed(self: &Arc<Self>) {
        if self.timeout_timer.is_running() {
            self.timeout_timer.stop();
            self.arm_timeout();
        }
    }

    pub fn send_reply(&self, reply: &DirectReply) {
        self.send_serialized(reply);
    }

    pub fn send_binary(&self, data: Bytes) {
        if let Some(sender) = self.transport.read().as_ref() {
            let _ = sender.send(Outbound::Binary(data));
        }
    }

    /// Ask the writer task to close the connection.
    pub fn close_transport(&self, reason: &str) {
        if let Some(sender) = self.transport.read().as_ref() {
            let _ = sender.send(Outbound::Close {
                reason: reason.to_string(),
            });
        }
    }

    pub(crate) fn peer_bus(&self) -> &EventBus<PeerEvent> {
        &self.peer_bus
    }

    pub(crate) fn lifecycle_bus(&self) -> &EventBus<ClientLifecycleEvent> {
        &self.lifecycle_bus
    }

    /// Called by the registry after the map entry is gone. Publishes the
    /// destruction exactly once and shuts the transport down.
    fn mark_destroyed(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.timeout_timer.stop();
        self.lifecycle_bus.publish(&ClientLifecycleEvent::Destroyed {
            public_id: self.public_id.clone(),
        });

        self.close_transport("Client removed");
        *self.transport.write() = None;
    }

    fn arm_timeout(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.timeout_timer.start(self.timeout, move || {
            if let Some(client) = weak.upgrade() {
                if let Some(registry) = client.registry.upgrade() {
                    tracing::info!(
                        public_id = client.public_id.as_str(),
                        "Client inactivity timeout, evicting"
                    );
                    registry.remove(client.private_id());
                }
            }
        });
    }

    /// Serialize an event and hand it to the writer task, dropping it
    /// silently when no transport is attached.
    fn send_serialized<T: Serialize>(&self, event: &T) {
        let sender = self.transport.read().as_ref().cloned();
        let Some(sender) = sender else { return };

        match serde_json::to_string(event) {
            Ok(json) => {
                let _ = sender.send(Outbound::Text(json));
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize outbound event");
            }
        }
    }
}

impl Subscriber<SessionEvent> for Client {
    fn on_event(&self, event: &SessionEvent) {
        self.send_serialized(event);
    }
}

impl Subscriber<SenderEvent> for Client {
    fn on_event(&self, event: &SenderEvent) {
        self.send_serialized(event);
    }
}

impl Subscriber<PeerEvent> for Client {
    fn on_event(&self, event: &PeerEvent) {
        self.send_serialized(event);
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Process-wide map of private id → client.
pub struct ClientRegistry {
    clients: DashMap<String, Arc<Client>>,
    max_clients: usize,
    client_timeout: Duration,
    signature_key: String,
}

impl ClientRegistry {
    pub fn new(config: &RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            clients: DashMap::new(),
            max_clients: config.max_clients,
            client_timeout: Duration::from_secs(config.client_timeout_secs),
            signature_key: config.signature_key.clone(),
        })
    }

    /// A fresh private id: random bytes, url-safe base64.
    pub fn generate_private_id() -> String {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;

        let mut raw = [0u8; PRIVATE_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut raw);
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Derive the peer-safe public id from a private id.
    pub fn sign(&self, private_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.signature_key.as_bytes());
        hasher.update([0x1f]);
        hasher.update(private_id.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Register a new client. Its inactivity timer starts immediately —
    /// it stops only once a transport attaches.
    pub fn create(self: &Arc<Self>, private_id: &str) -> Result<Arc<Client>, IdentityError> {
        if self.clients.len() >= self.max_clients {
            return Err(IdentityError::ClientLimit);
        }

        let client = Arc::new(Client {
            private_id: private_id.to_string(),
            public_id: self.sign(private_id),
            name: RwLock::new(String::new()),
            joined_session: RwLock::new(None),
            bytes_received: AtomicU64::new(0),
            transport: RwLock::new(None),
            timeout: self.client_timeout,
            timeout_timer: Countdown::new(),
            destroyed: AtomicBool::new(false),
            peer_bus: EventBus::new(),
            lifecycle_bus: EventBus::new(),
            registry: Arc::downgrade(self),
        });

        use dashmap::mapref::entry::Entry;
        match self.clients.entry(private_id.to_string()) {
            Entry::Occupied(_) => return Err(IdentityError::DuplicateId),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&client));
            }
        }

        tracing::info!(public_id = client.public_id.as_str(), "Client created");
        client.arm_timeout();

        Ok(client)
    }

    pub fn get(&self, private_id: &str) -> Option<Arc<Client>> {
        self.clients.get(private_id).map(|entry| Arc::clone(&entry))
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Drop a client. Idempotent. The map entry is removed first; the
    /// destruction notification runs after the shard lock is released so
    /// a subscriber re-entering `remove` cannot deadlock.
    pub fn remove(&self, private_id: &str) -> bool {
        let Some((_, client)) = self.clients.remove(private_id) else {
            return false;
        };

        tracing::info!(public_id = client.public_id.as_str(), "Client removed");
        client.mark_destroyed();
        true
    }
}
