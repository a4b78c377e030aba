//! Transfer sessions.
//!
//! A session aggregates the chunk buffer, the membership model and the
//! timers, owns the lifecycle state machine and publishes every event
//! its members see. Members are held weakly — the client registry owns
//! the clients — and all publishing happens after the session's own
//! locks are released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::buffer::Buffer;
use crate::bus::{EventBus, Subscriber};
use crate::client::{Client, ClientLifecycleEvent, ClientRegistry};
use crate::config::RelayConfig;
use crate::error::SessionError;
use crate::protocol::{
    CompleteReason, FileInfo, MemberInfo, SenderEvent, SessionEvent, SessionSnapshot,
    SnapshotLimits, sanitize_file_name, ChunkInfo, FILE_NAME_MAX_LENGTH,
};
use crate::sessions::SessionRegistry;
use crate::timer::Countdown;

/// One file transfer: a sender, a bounded receiver set and the buffer
/// between them.
pub struct TransferSession {
    id: String,
    sender: Weak<Client>,
    receivers: RwLock<Vec<Weak<Client>>>,
    file_info: RwLock<Option<FileInfo>>,
    buffer: Buffer,
    /// Events every member sees.
    bus: EventBus<SessionEvent>,
    /// Back-pressure topic, sender only.
    sender_bus: EventBus<SenderEvent>,
    reason: Mutex<CompleteReason>,
    finished: AtomicBool,
    freeze_timer: Countdown,
    registry: Weak<SessionRegistry>,
    clients: Arc<ClientRegistry>,
    config: RelayConfig,
}

impl std::fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSession").field("id", &self.id).finish()
    }
}

impl TransferSession {
    /// Build a session for `sender`, wire the sender into both event
    /// topics and arm the initial-freeze timer.
    pub(crate) fn create(
        sender: &Arc<Client>,
        id: String,
        config: &RelayConfig,
        registry: Weak<SessionRegistry>,
        clients: Arc<ClientRegistry>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            id,
            sender: Arc::downgrade(sender),
            receivers: RwLock::new(Vec::new()),
            file_info: RwLock::new(None),
            buffer: Buffer::new(config),
            bus: EventBus::new(),
            sender_bus: EventBus::new(),
            reason: Mutex::new(CompleteReason::Ok),
            finished: AtomicBool::new(false),
            freeze_timer: Countdown::new(),
            registry,
            clients,
            config: config.clone(),
        });

        session.bus.subscribe(sender);
        session.sender_bus.subscribe(sender);
        sender.lifecycle_bus().subscribe(&session);

        let weak = Arc::downgrade(&session);
        session.freeze_timer.start(
            Duration::from_secs(config.max_initial_freeze_secs),
            move || {
                if let Some(session) = weak.upgrade() {
                    session.drop_initial_freeze();
                }
            },
        );

        tracing::info!(session_id = session.id.as_str(), "Session created");
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sender(&self) -> Option<Arc<Client>> {
        self.sender.upgrade()
    }

    /// Live receivers, in join order.
    pub fn receivers(&self) -> Vec<Arc<Client>> {
        self.receivers
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn file_info(&self) -> Option<FileInfo> {
        self.file_info.read().clone()
    }

    pub fn is_sender(&self, client: &Client) -> bool {
        self.sender
            .upgrade()
            .map(|sender| sender.private_id() == client.private_id())
            .unwrap_or(false)
    }

    // ── Membership ────────────────────────────────────────────────────────

    /// Admit `client` as a receiver: register it as an expected consumer,
    /// cross-link it with the existing receivers for peer events, tell
    /// the prior members, then subscribe it to the session topic.
    pub fn add_receiver(self: &Arc<Self>, client: &Arc<Client>) -> Result<(), SessionError> {
        {
            let mut receivers = self.receivers.write();

            let already_member = receivers
                .iter()
                .filter_map(Weak::upgrade)
                .any(|existing| existing.public_id() == client.public_id());
            if already_member {
                return Err(SessionError::ReceiverRejected);
            }

            if !self.buffer.add_expected_consumer(client.public_id()) {
                return Err(SessionError::ReceiverRejected);
            }

            for existing in receivers.iter().filter_map(Weak::upgrade) {
                client.peer_bus().subscribe(&existing);
                existing.peer_bus().subscribe(client);
            }

            receivers.push(Arc::downgrade(client));
        }

        client.lifecycle_bus().subscribe(self);

        // Prior members first; the new receiver is subscribed afterwards
        // and learns the full state from its start_init snapshot.
        self.bus.publish(&SessionEvent::NewReceiver {
            id: client.public_id().to_string(),
            name: client.name(),
        });
        self.bus.subscribe(client);

        tracing::info!(
            session_id = self.id.as_str(),
            receiver = client.public_id(),
            "Receiver joined"
        );
        Ok(())
    }

    /// Remove a receiver by public id: drop it from the membership and
    /// the expected-consumer set, sweep, and either notify the remaining
    /// members or — when the last receiver is gone and data has already
    /// been dropped — terminate with `NoReceivers`.
    pub fn remove_receiver(&self, public_id: &str) {
        let (was_member, removed_client, now_empty) = {
            let mut receivers = self.receivers.write();

            let mut removed_client = None;
            receivers.retain(|weak| match weak.upgrade() {
                Some(existing) if existing.public_id() == public_id => {
                    removed_client = Some(existing);
                    false
                }
                Some(_) => true,
                // Dead weak handles are purged along the way.
                None => false,
            });

            (removed_client.is_some(), removed_client, receivers.is_empty())
        };

        let (was_expected, removed_chunks) = self.buffer.remove_expected_consumer(public_id);

        // Re-entered from the client-destroyed cascade: nothing left to do.
        if !was_member && !was_expected {
            return;
        }

        if let Some(client) = &removed_client {
            self.bus.unsubscribe(client);
            self.clients.remove(client.private_id());
        }

        if now_empty && self.buffer.some_chunk_removed() {
            // The initial part of the file is already lost, so no new
            // receiver can ever join; the session has nobody to serve.
            self.set_reason(CompleteReason::NoReceivers);
            self.request_removal();
            return;
        }

        if !removed_chunks.is_empty() {
            self.bus.publish(&SessionEvent::ChunksRemoved {
                indices: removed_chunks,
            });
        }
        self.bus.publish(&SessionEvent::ReceiverRemoved {
            id: public_id.to_string(),
        });

        tracing::info!(
            session_id = self.id.as_str(),
            receiver = public_id,
            "Receiver removed"
        );
    }

    // ── Transfer operations ───────────────────────────────────────────────

    /// Validate, sanitize and store the announced file.
    pub fn set_file_info(&self, name: &str, size: u64) -> bool {
        if name.is_empty() || name.len() > FILE_NAME_MAX_LENGTH || size == 0 {
            return false;
        }

        let Some(sanitized) = sanitize_file_name(name) else {
            return false;
        };

        let info = FileInfo {
            name: sanitized,
            size,
        };
        *self.file_info.write() = Some(info.clone());

        self.bus.publish(&SessionEvent::FileInfoUpdated {
            name: info.name,
            size: info.size,
        });
        true
    }

    /// Accept a payload frame from the sender. False when the buffer
    /// refused it.
    pub fn add_chunk(&self, payload: Bytes) -> bool {
        let size = payload.len() as u64;
        let old_allowed = self.buffer.new_chunk_allowed();

        let Some(index) = self.buffer.add_chunk(payload) else {
            return false;
        };

        self.bus
            .publish(&SessionEvent::NewChunkAvailable { index, size });

        let new_allowed = self.buffer.new_chunk_allowed();
        if old_allowed != new_allowed {
            self.sender_bus
                .publish(&SenderEvent::NewChunkAllowed { status: new_allowed });
        }
        self.bus.publish(&SessionEvent::BytesInUpdated {
            value: self.buffer.bytes_in(),
        });

        true
    }

    /// Hand out a chunk payload to a receiver.
    pub fn get_chunk(&self, index: u64, client: &Client) -> Option<Bytes> {
        let data = self.buffer.get(index)?;

        self.bus.publish(&SessionEvent::ChunkDownloadStarted {
            id: client.public_id().to_string(),
            index,
        });

        Some(data)
    }

    /// Record a receiver's acknowledgement of a chunk; evict what became
    /// fully acknowledged and terminate with `Ok` once the buffer drains
    /// after EOF.
    pub fn ack_chunk(&self, index: u64, client: &Client) {
        let old_allowed = self.buffer.new_chunk_allowed();

        let Some(outcome) = self.buffer.ack(index) else {
            return;
        };

        client.increment_received(outcome.chunk_size as u64);

        if outcome.freeze_lifted {
            self.bus.publish(&SessionEvent::ChunksUnfrozen);
        }

        self.bus.publish(&SessionEvent::ChunkDownloadFinished {
            id: client.public_id().to_string(),
            index,
        });

        if !outcome.removed.is_empty() {
            self.bus.publish(&SessionEvent::ChunksRemoved {
                indices: outcome.removed,
            });
        }

        let new_allowed = self.buffer.new_chunk_allowed();
        if old_allowed != new_allowed {
            self.sender_bus
                .publish(&SenderEvent::NewChunkAllowed { status: new_allowed });
        }
        self.bus.publish(&SessionEvent::BytesOutUpdated {
            value: self.buffer.bytes_out(),
        });

        if self.buffer.chunk_count() == 0 && self.buffer.eof() {
            // Reason stays Ok.
            self.request_removal();
        }
    }

    /// Mark the upload complete. The session only terminates once the
    /// buffer drains.
    pub fn set_eof(&self) {
        if self.buffer.eof() {
            return;
        }
        self.buffer.set_eof();

        self.bus.publish(&SessionEvent::UploadFinished);

        if self.buffer.chunk_count() == 0 {
            // Everything already acknowledged and evicted.
            self.request_removal();
        }
    }

    /// Sender-requested teardown.
    pub fn manual_terminate(&self) {
        self.set_reason(CompleteReason::SenderGone);
        self.request_removal();
    }

    /// Lift the initial freeze (normally invoked by the freeze timer).
    ///
    /// Expiry doubles as a grace deadline: with no receivers the session
    /// has nobody to serve, and with no announced file the sender never
    /// really showed up.
    pub fn drop_initial_freeze(&self) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }

        let Some(removed) = self.buffer.drop_initial_freeze() else {
            return;
        };

        if self.receivers.read().iter().all(|weak| weak.upgrade().is_none()) {
            self.set_reason(CompleteReason::NoReceivers);
            self.request_removal();
            return;
        }

        if self.file_info.read().is_none() {
            self.set_reason(CompleteReason::SenderGone);
            self.request_removal();
            return;
        }

        self.bus.publish(&SessionEvent::ChunksUnfrozen);
        if !removed.is_empty() {
            self.bus
                .publish(&SessionEvent::ChunksRemoved { indices: removed });
        }
    }

    // ── Buffer queries ────────────────────────────────────────────────────

    pub fn bytes_in(&self) -> u64 {
        self.buffer.bytes_in()
    }

    pub fn bytes_out(&self) -> u64 {
        self.buffer.bytes_out()
    }

    pub fn some_chunk_removed(&self) -> bool {
        self.buffer.some_chunk_removed()
    }

    pub fn chunk_count(&self) -> usize {
        self.buffer.chunk_count()
    }

    pub fn current_max_chunk_index(&self) -> u64 {
        self.buffer.current_max_index()
    }

    pub fn new_chunk_allowed(&self) -> bool {
        self.buffer.new_chunk_allowed()
    }

    pub fn eof(&self) -> bool {
        self.buffer.eof()
    }

    pub fn initial_freeze(&self) -> bool {
        self.buffer.initial_freeze()
    }

    pub fn chunks_info(&self) -> Vec<ChunkInfo> {
        self.buffer.chunks_info()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    pub(crate) fn set_timed_out(&self) {
        self.set_reason(CompleteReason::Timeout);
    }

    /// Teardown: publish `Complete` exactly once, then drop every member
    /// from the client registry. Invoked by the registry after the map
    /// entry is gone.
    pub(crate) fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }

        self.freeze_timer.stop();

        let reason = *self.reason.lock();
        tracing::info!(
            session_id = self.id.as_str(),
            reason = ?reason,
            "Session complete"
        );
        self.bus.publish(&SessionEvent::Complete { status: reason });

        let members: Vec<Arc<Client>> = {
            let receivers = self.receivers.read();
            receivers
                .iter()
                .filter_map(Weak::upgrade)
                .chain(self.sender.upgrade())
                .collect()
        };
        for member in members {
            self.clients.remove(member.private_id());
        }
    }

    /// The state document a freshly-attached member starts from.
    pub fn snapshot(&self, for_client: &Client, expiration_in: u64) -> SessionSnapshot {
        let receivers = self
            .receivers()
            .iter()
            .map(|receiver| MemberInfo {
                id: receiver.public_id().to_string(),
                name: receiver.name(),
                is_online: receiver.online(),
            })
            .collect();

        // A dead sender weak is not an error here: the upload may already
        // be complete.
        let sender = self.sender.upgrade().map(|sender| MemberInfo {
            id: sender.public_id().to_string(),
            name: sender.name(),
            is_online: sender.online(),
        });

        SessionSnapshot {
            session_id: self.id.clone(),
            limits: SnapshotLimits {
                max_receiver_count: self.config.max_consumers,
                max_chunk_size: self.config.max_chunk_size,
                max_chunk_queue: self.config.queue_max,
                max_initial_freeze: self.config.max_initial_freeze_secs,
            },
            sender,
            receivers,
            current_chunk: self.buffer.current_max_index(),
            upload_finished: self.buffer.eof(),
            some_chunk_was_removed: self.buffer.some_chunk_removed(),
            initial_freeze: self.buffer.initial_freeze(),
            chunks: self.buffer.chunks_info(),
            expiration_in,
            file: self.file_info(),
            bytes_from_sender: self.buffer.bytes_in(),
            bytes_to_receivers: self.buffer.bytes_out(),
            received_by_you: for_client.bytes_received(),
        }
    }

    fn set_reason(&self, reason: CompleteReason) {
        *self.reason.lock() = reason;
    }

    fn request_removal(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
    }

    fn on_client_destroyed(&self, public_id: &str) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }

        let sender = self.sender.upgrade();
        let sender_gone = match sender {
            None => true,
            Some(ref sender) => sender.public_id() == public_id,
        };

        if sender_gone {
            if self.buffer.eof() {
                // File fully submitted; the sender leaving is benign.
                return;
            }
            self.set_reason(CompleteReason::SenderGone);
            self.request_removal();
            return;
        }

        self.remove_receiver(public_id);
    }
}

impl Subscriber<ClientLifecycleEvent> for TransferSession {
    fn on_event(&self, event: &ClientLifecycleEvent) {
        match event {
            ClientLifecycleEvent::Destroyed { public_id } => {
                self.on_client_destroyed(public_id);
            }
        }
    }
}
