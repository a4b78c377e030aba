//! Filepipe Relay Server
//!
//! A WebSocket file-relay server: one sender streams a file in chunks to
//! a bounded set of receivers, through transient in-memory buffers.
//!
//! 1. **Chunk relay**: the sender uploads binary frames; each chunk is
//!    held only until every expected receiver has acknowledged it, then
//!    dropped. Nothing ever touches disk.
//!
//! 2. **Late-join window**: early chunks are frozen against eviction for
//!    a configurable window, so receivers joining moments after the
//!    upload starts still see the stream from the beginning.
//!
//! 3. **Fair lifecycle**: per-session lifetime limits, per-client
//!    inactivity eviction, global client and session caps.
//!
//! **Privacy**: clients are identified by an opaque cookie token that
//! never leaves the server; peers only ever see a keyed hash of it.

mod api;
mod buffer;
mod bus;
mod chunk;
mod client;
mod config;
mod error;
mod handler;
mod protocol;
mod session;
mod sessions;
mod state;
mod timer;

use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use rand::RngCore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::RelayConfig;
use state::AppState;

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "filepipe-relay", version, about = "File-relay server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "FILEPIPE_PORT")]
    port: u16,

    /// Maximum chunk payload size in bytes
    #[arg(long, default_value_t = 1024 * 1024, env = "FILEPIPE_MAX_CHUNK_SIZE")]
    max_chunk_size: usize,

    /// Maximum number of chunks buffered per session
    #[arg(long, default_value_t = 16, env = "FILEPIPE_QUEUE_MAX")]
    queue_max: usize,

    /// Maximum number of receivers per session
    #[arg(long, default_value_t = 10, env = "FILEPIPE_MAX_CONSUMERS")]
    max_consumers: usize,

    /// Maximum number of concurrent sessions
    #[arg(long, default_value_t = 100, env = "FILEPIPE_SESSION_LIMIT")]
    session_limit: usize,

    /// Maximum number of identified clients
    #[arg(long, default_value_t = 1000, env = "FILEPIPE_MAX_CLIENTS")]
    max_clients: usize,

    /// Session lifetime in seconds
    #[arg(long, default_value_t = 3600, env = "FILEPIPE_MAX_LIFETIME_SECS")]
    max_lifetime_secs: u64,

    /// Initial-freeze window in seconds
    #[arg(long, default_value_t = 60, env = "FILEPIPE_MAX_INITIAL_FREEZE_SECS")]
    max_initial_freeze_secs: u64,

    /// Client inactivity timeout in seconds
    #[arg(long, default_value_t = 120, env = "FILEPIPE_CLIENT_TIMEOUT_SECS")]
    client_timeout_secs: u64,

    /// Key for deriving public ids from private ids.
    /// A random key is generated when not set (public ids then change
    /// across restarts, which is fine — sessions don't survive restarts
    /// either).
    #[arg(long, env = "FILEPIPE_SIGNATURE_KEY")]
    signature_key: Option<String>,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "filepipe_relay=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let signature_key = args.signature_key.unwrap_or_else(|| {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        hex::encode(raw)
    });

    let config = RelayConfig {
        port: args.port,
        max_chunk_size: args.max_chunk_size,
        queue_max: args.queue_max,
        max_consumers: args.max_consumers,
        session_limit: args.session_limit,
        max_clients: args.max_clients,
        max_lifetime_secs: args.max_lifetime_secs,
        max_initial_freeze_secs: args.max_initial_freeze_secs,
        client_timeout_secs: args.client_timeout_secs,
        signature_key,
    };

    tracing::info!(
        session_limit = config.session_limit,
        max_clients = config.max_clients,
        max_chunk_size = config.max_chunk_size,
        queue_max = config.queue_max,
        "Limits configured"
    );

    let state = AppState::new(config);

    // Build main router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/ws", get(api::ws_handler))
        .route("/api/identity/request", get(api::identity_request))
        .route("/api/me/info", get(api::me_info))
        .route("/api/me/leave", post(api::me_leave))
        .route("/api/session/create", post(api::session_create))
        .route("/api/session/join", get(api::session_join))
        .route("/api/statistics/current", get(api::statistics))
        .route("/health", get(api::health))
        .with_state(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", state.config.port);
    tracing::info!("Filepipe relay server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .await
        .expect("Server error");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_creation() {
        let state = AppState::new(RelayConfig::default());
        assert_eq!(state.clients.count(), 0);
        assert_eq!(state.sessions.count(), 0);
    }
}
