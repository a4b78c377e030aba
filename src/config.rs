//! Server configuration.
//!
//! All limits the core enforces are collected here and injected by
//! constructor — the registries and sessions never reach for a global.

/// Default maximum size of a single chunk payload in bytes (1 MiB).
const DEFAULT_MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Default maximum number of chunks held in a session buffer at once.
const DEFAULT_QUEUE_MAX: usize = 16;

/// Default maximum number of receivers per session.
const DEFAULT_MAX_CONSUMERS: usize = 10;

/// Default maximum number of concurrent sessions.
const DEFAULT_SESSION_LIMIT: usize = 100;

/// Default maximum number of identified clients.
const DEFAULT_MAX_CLIENTS: usize = 1000;

/// Default session lifetime in seconds (1 hour).
const DEFAULT_MAX_LIFETIME_SECS: u64 = 3600;

/// Default initial-freeze window in seconds.
const DEFAULT_MAX_INITIAL_FREEZE_SECS: u64 = 60;

/// Default client inactivity timeout in seconds.
const DEFAULT_CLIENT_TIMEOUT_SECS: u64 = 120;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// Upper bound on a single chunk payload, in bytes.
    pub max_chunk_size: usize,
    /// Maximum number of chunks buffered per session.
    pub queue_max: usize,
    /// Maximum number of receivers per session.
    pub max_consumers: usize,
    /// Maximum number of concurrent sessions.
    pub session_limit: usize,
    /// Maximum number of identified clients.
    pub max_clients: usize,
    /// Session lifetime in seconds; expiry terminates with `Timeout`.
    pub max_lifetime_secs: u64,
    /// Initial-freeze window in seconds.
    pub max_initial_freeze_secs: u64,
    /// How long a client may stay disconnected before it is evicted.
    pub client_timeout_secs: u64,
    /// Key for the keyed hash that derives public ids from private ids.
    pub signature_key: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            queue_max: DEFAULT_QUEUE_MAX,
            max_consumers: DEFAULT_MAX_CONSUMERS,
            session_limit: DEFAULT_SESSION_LIMIT,
            max_clients: DEFAULT_MAX_CLIENTS,
            max_lifetime_secs: DEFAULT_MAX_LIFETIME_SECS,
            max_initial_freeze_secs: DEFAULT_MAX_INITIAL_FREEZE_SECS,
            client_timeout_secs: DEFAULT_CLIENT_TIMEOUT_SECS,
            signature_key: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_chunk_size, 1024 * 1024);
        assert_eq!(config.queue_max, 16);
        assert_eq!(config.max_consumers, 10);
        assert_eq!(config.session_limit, 100);
        assert_eq!(config.max_lifetime_secs, 3600);
    }
}
