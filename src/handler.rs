//! WebSocket connection handler.
//!
//! Runs one task per member connection: attaches the transport to the
//! client, sends the `start_init` snapshot, then relays frames between
//! the socket and the session until the connection closes or the member
//! commits a protocol violation.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::client::{Client, Outbound};
use crate::protocol::{ClientAction, DirectReply};
use crate::session::TransferSession;

/// Action names the relay understands; anything else gets a benign
/// `unknown_action` reply instead of a close.
const KNOWN_ACTIONS: [&str; 7] = [
    "set_file_info",
    "upload_finished",
    "kick_receiver",
    "terminate_session",
    "new_name",
    "get_chunk",
    "confirm_chunk",
];

/// How long the writer task gets to flush queued frames (including a
/// close frame) after the read loop ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle a single member WebSocket for its whole lifetime.
///
/// The caller (the upgrade route) has already verified that `client` is
/// identified and a member of `session`.
pub async fn handle_websocket(
    socket: WebSocket,
    client: Arc<Client>,
    session: Arc<TransferSession>,
    remaining_lifetime: u64,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // ── Step 1: Attach Transport ──────────────────────────────────────────

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    client.attach_transport(tx);
    tracing::info!(
        public_id = client.public_id(),
        session_id = session.id(),
        "WebSocket attached"
    );

    client.send_reply(&DirectReply::StartInit(
        session.snapshot(&client, remaining_lifetime),
    ));

    // ── Step 2: Spawn Writer Task ─────────────────────────────────────────

    let mut writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let result = match frame {
                Outbound::Text(json) => ws_sender.send(Message::Text(json)).await,
                Outbound::Binary(data) => ws_sender.send(Message::Binary(data.to_vec())).await,
                Outbound::Close { reason } => {
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::PROTOCOL,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if result.is_err() {
                break; // Connection closed
            }
        }
    });

    // ── Step 3: Read Loop ─────────────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Binary(data)) => {
                if let Err(reason) = handle_binary(&client, &session, data) {
                    client.close_transport(&reason);
                    break;
                }
            }
            Ok(Message::Text(text)) => {
                if let Err(reason) = handle_text(&client, &session, &text) {
                    client.close_transport(&reason);
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                tracing::info!(public_id = client.public_id(), "Client sent close frame");
                break;
            }
            Ok(_) => {} // Ping/Pong — handled at the protocol level
            Err(e) => {
                tracing::warn!(
                    public_id = client.public_id(),
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        }
    }

    // ── Step 4: Detach ────────────────────────────────────────────────────

    // Dropping the transport closes the writer's channel once queued
    // frames (a close frame included) are drained.
    client.detach_transport();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
        .await
        .is_err()
    {
        writer_task.abort();
    }

    tracing::info!(public_id = client.public_id(), "WebSocket detached");
}

/// A binary frame is a chunk payload and may only come from the sender.
fn handle_binary(
    client: &Arc<Client>,
    session: &Arc<TransferSession>,
    data: Vec<u8>,
) -> Result<(), String> {
    let Some(sender) = session.sender() else {
        return Err("It is impossible to verify the session sender".to_string());
    };
    if sender.private_id() != client.private_id() {
        return Err("Only the session sender can upload binary data".to_string());
    }

    if !session.add_chunk(Bytes::from(data)) {
        client.send_reply(&DirectReply::AddChunkFailure);
    }
    Ok(())
}

/// Parse and dispatch a text frame. An `Err` closes the connection.
fn handle_text(
    client: &Arc<Client>,
    session: &Arc<TransferSession>,
    text: &str,
) -> Result<(), String> {
    match serde_json::from_str::<ClientAction>(text) {
        Ok(action) => dispatch_action(client, session, action),
        Err(_) => {
            // Unknown actions are benign; everything else on a text
            // frame is a protocol violation.
            let value: serde_json::Value = serde_json::from_str(text)
                .map_err(|_| "Text frames must be JSON".to_string())?;
            let action = value
                .get("action")
                .and_then(|a| a.as_str())
                .ok_or_else(|| "A string 'action' field is required".to_string())?;

            if KNOWN_ACTIONS.contains(&action) {
                Err(format!("Invalid data for action '{}'", action))
            } else {
                client.send_reply(&DirectReply::UnknownAction {
                    name: action.to_string(),
                });
                Ok(())
            }
        }
    }
}

fn dispatch_action(
    client: &Arc<Client>,
    session: &Arc<TransferSession>,
    action: ClientAction,
) -> Result<(), String> {
    match action {
        ClientAction::SetFileInfo { name, size } => {
            require_sender(client, session, "set the file information")?;
            if !session.set_file_info(&name, size) {
                client.send_reply(&DirectReply::SetFileInfoFailure);
            }
            Ok(())
        }

        ClientAction::UploadFinished => {
            require_sender(client, session, "finish the upload")?;
            session.set_eof();
            Ok(())
        }

        ClientAction::KickReceiver { id } => {
            require_sender(client, session, "remove participants")?;
            if id == client.public_id() {
                return Err("You can't remove yourself".to_string());
            }
            session.remove_receiver(&id);
            Ok(())
        }

        ClientAction::TerminateSession => {
            require_sender(client, session, "terminate the session")?;
            session.manual_terminate();
            Ok(())
        }

        ClientAction::NewName { name } => {
            client.set_name(&name);
            Ok(())
        }

        ClientAction::GetChunk { id } => {
            match session.get_chunk(id, client) {
                Some(data) => client.send_binary(data),
                None => client.send_reply(&DirectReply::RequestedChunkNotFound {
                    available: session.chunks_info(),
                }),
            }
            Ok(())
        }

        ClientAction::ConfirmChunk { id } => {
            session.ack_chunk(id, client);
            Ok(())
        }
    }
}

fn require_sender(
    client: &Arc<Client>,
    session: &Arc<TransferSession>,
    verb: &str,
) -> Result<(), String> {
    if session.is_sender(client) {
        Ok(())
    } else {
        Err(format!("Only the session sender can {}", verb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientRegistry;
    use crate::config::RelayConfig;
    use crate::sessions::SessionRegistry;

    fn test_config() -> RelayConfig {
        RelayConfig {
            max_chunk_size: 1024,
            queue_max: 4,
            max_consumers: 2,
            signature_key: "test-key".to_string(),
            ..RelayConfig::default()
        }
    }

    fn world() -> (
        Arc<SessionRegistry>,
        Arc<TransferSession>,
        Arc<Client>,
        Arc<Client>,
        mpsc::UnboundedReceiver<Outbound>,
    ) {
        let config = test_config();
        let clients = ClientRegistry::new(&config);
        let sessions = SessionRegistry::new(config, Arc::clone(&clients));

        let sender = clients.create("s").unwrap();
        let (sender_tx, _sender_rx) = mpsc::unbounded_channel();
        sender.attach_transport(sender_tx);
        let (session, _) = sessions.create(&sender).unwrap();

        let receiver = clients.create("r").unwrap();
        let (receiver_tx, receiver_rx) = mpsc::unbounded_channel();
        receiver.attach_transport(receiver_tx);
        session.add_receiver(&receiver).unwrap();

        (sessions, session, sender, receiver, receiver_rx)
    }

    fn drain_text(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Outbound::Text(json) = frame {
                frames.push(json);
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_binary_from_receiver_is_a_violation() {
        let (_sessions, session, _sender, receiver, _rx) = world();
        let result = handle_binary(&receiver, &session, vec![1, 2, 3]);
        assert!(result.unwrap_err().contains("session sender"));
    }

    #[tokio::test]
    async fn test_binary_from_sender_is_accepted() {
        let (_sessions, session, sender, _receiver, _rx) = world();
        handle_binary(&sender, &session, vec![1, 2, 3]).unwrap();
        assert_eq!(session.chunk_count(), 1);
    }

    #[tokio::test]
    async fn test_oversize_binary_gets_failure_reply() {
        let (_sessions, session, sender, _receiver, _rx) = world();
        let (tx, mut sender_rx) = mpsc::unbounded_channel();
        sender.attach_transport(tx);

        handle_binary(&sender, &session, vec![0u8; 2048]).unwrap();

        assert_eq!(session.chunk_count(), 0);
        let frames = drain_text(&mut sender_rx);
        assert!(frames.iter().any(|f| f.contains("add_chunk_failure")));
    }

    #[tokio::test]
    async fn test_non_sender_cannot_set_file_info() {
        let (_sessions, session, _sender, receiver, _rx) = world();
        let result = handle_text(
            &receiver,
            &session,
            r#"{"action":"set_file_info","data":{"name":"f.bin","size":10}}"#,
        );
        assert!(result.unwrap_err().contains("session sender"));
    }

    #[tokio::test]
    async fn test_unknown_action_is_benign() {
        let (_sessions, session, _sender, receiver, mut rx) = world();
        handle_text(&receiver, &session, r#"{"action":"dance","data":{}}"#).unwrap();

        let frames = drain_text(&mut rx);
        assert!(frames
            .iter()
            .any(|f| f.contains("unknown_action") && f.contains("dance")));
    }

    #[tokio::test]
    async fn test_malformed_json_is_a_violation() {
        let (_sessions, session, _sender, receiver, _rx) = world();
        assert!(handle_text(&receiver, &session, "not json").is_err());
        assert!(handle_text(&receiver, &session, r#"{"data":{}}"#).is_err());
    }

    #[tokio::test]
    async fn test_known_action_with_bad_data_is_a_violation() {
        let (_sessions, session, sender, _receiver, _rx) = world();
        let result = handle_text(
            &sender,
            &session,
            r#"{"action":"get_chunk","data":{"id":"not-a-number"}}"#,
        );
        assert!(result.unwrap_err().contains("get_chunk"));
    }

    #[tokio::test]
    async fn test_kick_self_is_a_violation() {
        let (_sessions, session, sender, _receiver, _rx) = world();
        let frame = format!(
            r#"{{"action":"kick_receiver","data":{{"id":"{}"}}}}"#,
            sender.public_id()
        );
        let result = handle_text(&sender, &session, &frame);
        assert!(result.unwrap_err().contains("yourself"));
    }

    #[tokio::test]
    async fn test_get_chunk_roundtrip_and_miss() {
        let (_sessions, session, sender, receiver, mut rx) = world();
        handle_binary(&sender, &session, vec![7u8; 64]).unwrap();

        handle_text(&receiver, &session, r#"{"action":"get_chunk","data":{"id":1}}"#).unwrap();
        let mut got_binary = false;
        while let Ok(frame) = rx.try_recv() {
            if let Outbound::Binary(data) = frame {
                assert_eq!(data.len(), 64);
                got_binary = true;
            }
        }
        assert!(got_binary);

        handle_text(&receiver, &session, r#"{"action":"get_chunk","data":{"id":9}}"#).unwrap();
        let frames = drain_text(&mut rx);
        assert!(frames
            .iter()
            .any(|f| f.contains("requested_chunk_not_found") && f.contains("\"index\":1")));
    }

    #[tokio::test]
    async fn test_confirm_chunk_flows_to_buffer() {
        let (_sessions, session, sender, receiver, _rx) = world();
        handle_binary(&sender, &session, vec![7u8; 64]).unwrap();

        handle_text(&receiver, &session, r#"{"action":"confirm_chunk","data":{"id":1}}"#).unwrap();

        assert_eq!(session.chunk_count(), 0);
        assert_eq!(receiver.bytes_received(), 64);
    }

    #[tokio::test]
    async fn test_new_name_action() {
        let (_sessions, session, _sender, receiver, _rx) = world();
        handle_text(&receiver, &session, r#"{"action":"new_name","data":{"name":"Rex"}}"#).unwrap();
        assert_eq!(receiver.name(), "Rex");
    }

    #[tokio::test]
    async fn test_terminate_session_action() {
        let (sessions, session, sender, _receiver, _rx) = world();
        let sid = session.id().to_string();
        handle_text(&sender, &session, r#"{"action":"terminate_session"}"#).unwrap();
        assert!(sessions.get(&sid).is_none());
    }
}
