//! The process-wide session registry.
//!
//! Maps session id → session, enforces the global session cap and runs
//! one lifetime timer per session. The session id equals the sender's
//! public id, which makes "this client already has a session" a plain
//! key collision.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::client::{Client, ClientRegistry};
use crate::config::RelayConfig;
use crate::error::SessionError;
use crate::session::TransferSession;
use crate::timer::Countdown;

struct SessionEntry {
    session: Arc<TransferSession>,
    lifetime_timer: Arc<Countdown>,
}

/// Process-wide map of session id → session.
pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
    clients: Arc<ClientRegistry>,
    config: RelayConfig,
}

impl SessionRegistry {
    pub fn new(config: RelayConfig, clients: Arc<ClientRegistry>) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            clients,
            config,
        })
    }

    /// Create a session owned by `sender` and arm its lifetime timer.
    /// Returns the session and the seconds until expiry.
    pub fn create(
        self: &Arc<Self>,
        sender: &Arc<Client>,
    ) -> Result<(Arc<TransferSession>, u64), SessionError> {
        if self.sessions.len() >= self.config.session_limit {
            return Err(SessionError::SessionLimit);
        }

        let id = sender.public_id().to_string();
        let lifetime = Duration::from_secs(self.config.max_lifetime_secs);

        use dashmap::mapref::entry::Entry;
        let session = match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => return Err(SessionError::DuplicateSession),
            Entry::Vacant(slot) => {
                let session = TransferSession::create(
                    sender,
                    id.clone(),
                    &self.config,
                    Arc::downgrade(self),
                    Arc::clone(&self.clients),
                );

                let lifetime_timer = Arc::new(Countdown::new());
                let registry = Arc::clone(self);
                let timer_id = id.clone();
                lifetime_timer.start(lifetime, move || {
                    registry.remove_due_timeout(&timer_id);
                });

                slot.insert(SessionEntry {
                    session: Arc::clone(&session),
                    lifetime_timer,
                });
                session
            }
        };

        Ok((session, lifetime.as_secs()))
    }

    /// Look a session up, together with its remaining lifetime in
    /// seconds.
    pub fn get(&self, id: &str) -> Option<(Arc<TransferSession>, u64)> {
        self.sessions.get(id).map(|entry| {
            (
                Arc::clone(&entry.session),
                entry.lifetime_timer.remaining().as_secs(),
            )
        })
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn can_create(&self) -> bool {
        self.sessions.len() < self.config.session_limit
    }

    /// Drop a session. Idempotent, and safe against re-entry: the map
    /// entry is swapped out under the shard lock, then teardown (which
    /// may call back into `remove`) runs with the lock released.
    pub fn remove(&self, id: &str) {
        let Some((_, entry)) = self.sessions.remove(id) else {
            return;
        };

        entry.lifetime_timer.stop();
        entry.session.finish();
    }

    fn remove_due_timeout(&self, id: &str) {
        let Some((_, entry)) = self.sessions.remove(id) else {
            return;
        };

        tracing::info!(session_id = id, "Session lifetime expired");
        entry.session.set_timed_out();
        entry.session.finish();
    }
}
