//! Shared server state.
//!
//! The two process-wide registries plus the configuration, composed once
//! at startup and handed to every route handler. Tests build their own
//! isolated instance instead of reaching for globals.

use std::sync::Arc;

use crate::client::ClientRegistry;
use crate::config::RelayConfig;
use crate::sessions::SessionRegistry;

/// Shared relay state.
#[derive(Clone)]
pub struct AppState {
    pub config: RelayConfig,
    pub clients: Arc<ClientRegistry>,
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        let clients = ClientRegistry::new(&config);
        let sessions = SessionRegistry::new(config.clone(), Arc::clone(&clients));

        Self {
            config,
            clients,
            sessions,
        }
    }
}
