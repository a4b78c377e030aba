//! HTTP onboarding and service routes.
//!
//! Identity here is deliberately plain: a client is a random private
//! token in an HttpOnly cookie. The token itself never appears in any
//! response body — responses carry only the derived public id.

use std::sync::Arc;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::client::{Client, ClientRegistry};
use crate::error::{IdentityError, SessionError};
use crate::handler;
use crate::state::AppState;

/// Name of the identity cookie.
const CLIENT_TOKEN_COOKIE: &str = "filepipe_token";

/// Slack added to the WebSocket message-size cap on top of the largest
/// chunk payload, for frame and JSON overhead.
const WS_MESSAGE_OVERHEAD: usize = 1024;

// ── Identity ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct IdentityQuery {
    name: String,
}

/// `GET /api/identity/request?name=` — create a client and hand back the
/// identity cookie.
pub async fn identity_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<IdentityQuery>,
) -> Response {
    if identified_client(&state, &headers).is_some() {
        return (StatusCode::BAD_REQUEST, "You are already identified").into_response();
    }

    if query.name.is_empty() {
        return (StatusCode::FORBIDDEN, "You must pass a name").into_response();
    }

    let private_id = ClientRegistry::generate_private_id();
    let client = match state.clients.create(&private_id) {
        Ok(client) => client,
        Err(IdentityError::ClientLimit) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                "The maximum number of clients has been reached, please try again later",
            )
                .into_response();
        }
        Err(IdentityError::DuplicateId) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "Identity collision").into_response();
        }
    };
    client.set_name(&query.name);

    // The longest a client can matter: its own idle timeout plus a full
    // session lifetime.
    let max_age = state.config.max_lifetime_secs + state.config.client_timeout_secs;
    let cookie = format!(
        "{}={}; HttpOnly; Path=/; Max-Age={}",
        CLIENT_TOKEN_COOKIE, private_id, max_age
    );

    (
        StatusCode::CREATED,
        [(header::SET_COOKIE, cookie)],
        Json(json!({
            "id": client.public_id(),
            "name": client.name(),
        })),
    )
        .into_response()
}

/// `GET /api/me/info` — who the cookie says you are.
pub async fn me_info(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(client) = identified_client(&state, &headers) else {
        return not_identified();
    };

    Json(json!({
        "id": client.public_id(),
        "name": client.name(),
        "session": client.joined_session(),
    }))
    .into_response()
}

/// `POST /api/me/leave` — forget this identity.
pub async fn me_leave(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(client) = identified_client(&state, &headers) else {
        return not_identified();
    };

    state.clients.remove(client.private_id());
    (StatusCode::OK, "Your id has been deleted").into_response()
}

// ── Sessions ──────────────────────────────────────────────────────────────────

/// `POST /api/session/create` — open a transfer session as the sender.
pub async fn session_create(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(client) = identified_client(&state, &headers) else {
        return not_identified();
    };

    if client.joined_session().is_some() {
        return (
            StatusCode::FORBIDDEN,
            "You are already a participant in a session",
        )
            .into_response();
    }

    let session = match state.sessions.create(&client) {
        Ok((session, _remaining)) => session,
        Err(SessionError::SessionLimit) => {
            client.touch_timeout_if_armed();
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                "The maximum number of sessions has been reached, please try again later",
            )
                .into_response();
        }
        Err(_) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "Session creation failed")
                .into_response();
        }
    };

    if !client.join_session(session.id()) {
        state.sessions.remove(session.id());
        return (StatusCode::INTERNAL_SERVER_ERROR, "Session creation failed").into_response();
    }

    (
        StatusCode::CREATED,
        Json(json!({ "id": session.id() })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct JoinQuery {
    id: String,
}

/// `GET /api/session/join?id=` — join a session as a receiver.
pub async fn session_join(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<JoinQuery>,
) -> Response {
    let Some(client) = identified_client(&state, &headers) else {
        return not_identified();
    };

    let Some((session, _remaining)) = state.sessions.get(&query.id) else {
        return (StatusCode::NOT_FOUND, SessionError::NotFound.to_string()).into_response();
    };

    if let Some(joined) = client.joined_session() {
        if joined == query.id {
            // Idempotent re-join of the same session.
            return (StatusCode::ACCEPTED, Json(json!({ "id": session.id() }))).into_response();
        }
        return (
            StatusCode::BAD_REQUEST,
            SessionError::AlreadyJoined.to_string(),
        )
            .into_response();
    }

    if session.some_chunk_removed() {
        // Part of the stream is already gone; a newcomer would see a hole.
        return (
            StatusCode::FORBIDDEN,
            SessionError::JoinWindowClosed.to_string(),
        )
            .into_response();
    }

    if let Err(e) = session.add_receiver(&client) {
        return (StatusCode::FORBIDDEN, e.to_string()).into_response();
    }

    if !client.join_session(session.id()) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Couldn't join the session").into_response();
    }

    (StatusCode::ACCEPTED, Json(json!({ "id": session.id() }))).into_response()
}

// ── Service Endpoints ─────────────────────────────────────────────────────────

/// `GET /api/statistics/current` — counts against the configured caps.
pub async fn statistics(State(state): State<AppState>) -> Response {
    Json(json!({
        "current_client_count": state.clients.count(),
        "current_session_count": state.sessions.count(),
        "max_client_count": state.config.max_clients,
        "max_session_count": state.config.session_limit,
    }))
    .into_response()
}

/// `GET /health` — liveness document.
pub async fn health() -> Response {
    Json(json!({
        "status": "ok",
        "service": "filepipe-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
    .into_response()
}

// ── WebSocket Upgrade ─────────────────────────────────────────────────────────

/// `GET /api/ws` — upgrade to the session transport. Only identified
/// clients that have already joined a live session are accepted.
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(client) = identified_client(&state, &headers) else {
        return not_identified();
    };

    let Some(session_id) = client.joined_session() else {
        return (
            StatusCode::FORBIDDEN,
            "Join a session before connecting the transport",
        )
            .into_response();
    };

    let Some((session, remaining)) = state.sessions.get(&session_id) else {
        return (StatusCode::NOT_FOUND, "Session not found").into_response();
    };

    ws.max_message_size(state.config.max_chunk_size + WS_MESSAGE_OVERHEAD)
        .on_upgrade(move |socket| handler::handle_websocket(socket, client, session, remaining))
        .into_response()
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn not_identified() -> Response {
    (StatusCode::UNAUTHORIZED, "You have not been identified").into_response()
}

fn identified_client(state: &AppState, headers: &HeaderMap) -> Option<Arc<Client>> {
    let token = cookie_value(headers, CLIENT_TOKEN_COOKIE)?;
    state.clients.get(&token)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;

    raw.split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;

    fn test_state() -> AppState {
        AppState::new(RelayConfig {
            max_clients: 4,
            session_limit: 2,
            signature_key: "test-key".to_string(),
            ..RelayConfig::default()
        })
    }

    fn headers_with_cookie(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            format!("{}={}", CLIENT_TOKEN_COOKIE, token).parse().unwrap(),
        );
        headers
    }

    #[test]
    fn test_cookie_value_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "other=1; filepipe_token=abc123; more=2".parse().unwrap(),
        );
        assert_eq!(
            cookie_value(&headers, CLIENT_TOKEN_COOKIE).as_deref(),
            Some("abc123")
        );
        assert!(cookie_value(&headers, "missing").is_none());
        assert!(cookie_value(&HeaderMap::new(), CLIENT_TOKEN_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_identity_request_creates_client() {
        let state = test_state();
        let response = identity_request(
            State(state.clone()),
            HeaderMap::new(),
            Query(IdentityQuery {
                name: "Alice".to_string(),
            }),
        )
        .await;

        assert_eq!(response.status(), StatusCode::CREATED);
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(cookie.starts_with(CLIENT_TOKEN_COOKIE));
        assert!(cookie.contains("HttpOnly"));
        assert_eq!(state.clients.count(), 1);
    }

    #[tokio::test]
    async fn test_identity_request_requires_name() {
        let state = test_state();
        let response = identity_request(
            State(state),
            HeaderMap::new(),
            Query(IdentityQuery {
                name: String::new(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_identity_request_enforces_client_cap() {
        let state = test_state();
        for _ in 0..4 {
            let response = identity_request(
                State(state.clone()),
                HeaderMap::new(),
                Query(IdentityQuery {
                    name: "X".to_string(),
                }),
            )
            .await;
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let response = identity_request(
            State(state),
            HeaderMap::new(),
            Query(IdentityQuery {
                name: "X".to_string(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_me_info_requires_identity() {
        let state = test_state();
        let response = me_info(State(state.clone()), HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        state.clients.create("token-1").unwrap();
        let response = me_info(State(state), headers_with_cookie("token-1")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_me_leave_removes_client() {
        let state = test_state();
        state.clients.create("token-1").unwrap();

        let response = me_leave(State(state.clone()), headers_with_cookie("token-1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.clients.count(), 0);
    }

    #[tokio::test]
    async fn test_session_create_flow() {
        let state = test_state();
        state.clients.create("token-1").unwrap();

        let response =
            session_create(State(state.clone()), headers_with_cookie("token-1")).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(state.sessions.count(), 1);

        // Creating again from the same identity is refused.
        let response =
            session_create(State(state.clone()), headers_with_cookie("token-1")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_session_join_flow() {
        let state = test_state();
        let sender = state.clients.create("token-s").unwrap();
        let (session, _) = state.sessions.create(&sender).unwrap();
        sender.join_session(session.id());
        let sid = session.id().to_string();

        state.clients.create("token-r").unwrap();
        let response = session_join(
            State(state.clone()),
            headers_with_cookie("token-r"),
            Query(JoinQuery { id: sid.clone() }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(session.receivers().len(), 1);

        // Re-joining the same session is idempotent.
        let response = session_join(
            State(state.clone()),
            headers_with_cookie("token-r"),
            Query(JoinQuery { id: sid }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(session.receivers().len(), 1);
    }

    #[tokio::test]
    async fn test_session_join_unknown_session() {
        let state = test_state();
        state.clients.create("token-r").unwrap();

        let response = session_join(
            State(state),
            headers_with_cookie("token-r"),
            Query(JoinQuery {
                id: "missing".to_string(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_session_join_closed_window() {
        let state = test_state();
        let sender = state.clients.create("token-s").unwrap();
        let (session, _) = state.sessions.create(&sender).unwrap();
        sender.join_session(session.id());

        let r1 = state.clients.create("token-r1").unwrap();
        session.add_receiver(&r1).unwrap();
        r1.join_session(session.id());

        // R1 consumes chunk 1; the eviction closes the join window.
        session.add_chunk(bytes::Bytes::from(vec![0u8; 16]));
        session.ack_chunk(1, &r1);
        assert!(session.some_chunk_removed());

        state.clients.create("token-r2").unwrap();
        let response = session_join(
            State(state),
            headers_with_cookie("token-r2"),
            Query(JoinQuery {
                id: session.id().to_string(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_statistics_document() {
        let state = test_state();
        state.clients.create("token-1").unwrap();

        let response = statistics(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
