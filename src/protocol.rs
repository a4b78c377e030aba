//! Relay protocol message definitions.
//!
//! The relay speaks JSON-over-WebSocket for control traffic; chunk
//! payloads travel as binary frames. Events are grouped by topic: the
//! session topic every member subscribes to, the sender-only topic used
//! for back-pressure, the peer topic receivers use to see each other, and
//! direct replies that answer a single inbound frame.

use serde::{Deserialize, Serialize};

/// Longest accepted file name, in bytes.
pub const FILE_NAME_MAX_LENGTH: usize = 255;

/// Longest accepted client display name, in characters.
pub const CLIENT_NAME_MAX_LENGTH: usize = 20;

// ── Client → Relay ────────────────────────────────────────────────────────────

/// Text actions a connected member may send.
///
/// Binary frames are not represented here — a binary frame is always a
/// chunk payload and only the sender may produce one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum ClientAction {
    /// Announce the file being transferred. Sender only.
    SetFileInfo { name: String, size: u64 },

    /// Mark the upload as complete. Sender only.
    UploadFinished,

    /// Remove a receiver from the session. Sender only.
    KickReceiver { id: String },

    /// Tear the session down immediately. Sender only.
    TerminateSession,

    /// Change this client's display name.
    NewName { name: String },

    /// Request the payload of a buffered chunk by index.
    GetChunk { id: u64 },

    /// Acknowledge that a chunk has been fully received.
    ConfirmChunk { id: u64 },
}

// ── Relay → Client: session topic ─────────────────────────────────────────────

/// Events published to every member of a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A new receiver joined.
    NewReceiver { id: String, name: String },

    /// A receiver left or was kicked.
    ReceiverRemoved { id: String },

    /// The sender announced (or re-announced) the file.
    FileInfoUpdated { name: String, size: u64 },

    /// A receiver started downloading a chunk.
    ChunkDownloadStarted { id: String, index: u64 },

    /// A receiver acknowledged a chunk.
    ChunkDownloadFinished { id: String, index: u64 },

    /// The sender pushed a new chunk into the buffer.
    NewChunkAvailable { index: u64, size: u64 },

    /// Fully-acknowledged chunks were evicted from the buffer.
    ChunksRemoved { indices: Vec<u64> },

    /// Total bytes accepted from the sender changed.
    BytesInUpdated { value: u64 },

    /// Total bytes handed to receivers changed.
    BytesOutUpdated { value: u64 },

    /// The initial freeze has been lifted; eviction is live from now on.
    ChunksUnfrozen,

    /// The sender marked the upload as complete.
    UploadFinished,

    /// The session reached a terminal state. Published exactly once.
    Complete { status: CompleteReason },
}

/// Events published on the sender-only topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SenderEvent {
    /// Back-pressure signal: `true` while the buffer has room for
    /// another chunk.
    NewChunkAllowed { status: bool },
}

/// Peer-to-peer events exchanged among receivers, not owned by the
/// session: transport presence and name changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum PeerEvent {
    Connected { id: String },
    Disconnected { id: String },
    NameChanged { id: String, name: String },
}

// ── Relay → Client: direct replies ────────────────────────────────────────────

/// Messages addressed to a single client in response to its own frame
/// (or to report its personal progress).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum DirectReply {
    /// The session state document sent right after the WebSocket attaches.
    StartInit(SessionSnapshot),

    /// A binary frame was rejected by the buffer.
    AddChunkFailure,

    /// `set_file_info` carried an invalid name or size.
    SetFileInfoFailure,

    /// `get_chunk` referenced an index that is not (or no longer) in the
    /// buffer; carries what is currently available.
    RequestedChunkNotFound { available: Vec<ChunkInfo> },

    /// This client's personal received-bytes counter changed.
    PersonalReceived { bytes: u64 },

    /// The action name was not recognized.
    UnknownAction { name: String },
}

// ── Supporting Types ──────────────────────────────────────────────────────────

/// Why a session ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompleteReason {
    /// The file was fully uploaded and every chunk acknowledged.
    Ok,
    /// The session outlived its maximum lifetime.
    Timeout,
    /// The sender disappeared before finishing the upload.
    SenderGone,
    /// Every receiver left after data had already been dropped.
    NoReceivers,
}

/// Name and size of the file being transferred.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

/// Index and payload size of a buffered chunk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkInfo {
    pub index: u64,
    pub size: u64,
}

/// A session member as presented in the `start_init` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberInfo {
    pub id: String,
    pub name: String,
    pub is_online: bool,
}

/// The configured limits a client needs to drive the transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotLimits {
    pub max_receiver_count: usize,
    pub max_chunk_size: usize,
    pub max_chunk_queue: usize,
    pub max_initial_freeze: u64,
}

/// Everything a freshly-attached member needs to render the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub limits: SnapshotLimits,
    pub sender: Option<MemberInfo>,
    pub receivers: Vec<MemberInfo>,
    pub current_chunk: u64,
    pub upload_finished: bool,
    pub some_chunk_was_removed: bool,
    pub initial_freeze: bool,
    pub chunks: Vec<ChunkInfo>,
    /// Seconds until the session's lifetime timer fires.
    pub expiration_in: u64,
    pub file: Option<FileInfo>,
    pub bytes_from_sender: u64,
    pub bytes_to_receivers: u64,
    pub received_by_you: u64,
}

/// Strip path separators and control characters from a candidate file
/// name. Returns `None` when nothing displayable is left.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\') && !c.is_control())
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        return None;
    }

    Some(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_action_set_file_info_serialization() {
        let msg = ClientAction::SetFileInfo {
            name: "report.pdf".to_string(),
            size: 1024,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"action\":\"set_file_info\""));
        assert!(json.contains("report.pdf"));

        let parsed: ClientAction = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientAction::SetFileInfo { name, size } => {
                assert_eq!(name, "report.pdf");
                assert_eq!(size, 1024);
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_client_action_get_chunk_serialization() {
        let json = r#"{"action":"get_chunk","data":{"id":7}}"#;
        let parsed: ClientAction = serde_json::from_str(json).unwrap();
        match parsed {
            ClientAction::GetChunk { id } => assert_eq!(id, 7),
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_client_action_unit_variants_round_trip() {
        for msg in [ClientAction::UploadFinished, ClientAction::TerminateSession] {
            let json = serde_json::to_string(&msg).unwrap();
            let parsed: ClientAction = serde_json::from_str(&json).unwrap();
            let json2 = serde_json::to_string(&parsed).unwrap();
            assert_eq!(json, json2);
        }
    }

    #[test]
    fn test_session_event_new_chunk_serialization() {
        let msg = SessionEvent::NewChunkAvailable { index: 3, size: 100 };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"event\":\"new_chunk_available\""));
        assert!(json.contains("\"index\":3"));
    }

    #[test]
    fn test_session_event_complete_serialization() {
        let msg = SessionEvent::Complete {
            status: CompleteReason::SenderGone,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"event\":\"complete\""));
        assert!(json.contains("\"status\":\"sender_gone\""));
    }

    #[test]
    fn test_session_event_chunks_removed_serialization() {
        let msg = SessionEvent::ChunksRemoved {
            indices: vec![1, 2, 5],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"event\":\"chunks_removed\""));
        assert!(json.contains("[1,2,5]"));
    }

    #[test]
    fn test_sender_event_serialization() {
        let msg = SenderEvent::NewChunkAllowed { status: false };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"event\":\"new_chunk_allowed\""));
        assert!(json.contains("\"status\":false"));
    }

    #[test]
    fn test_peer_event_serialization() {
        let msg = PeerEvent::NameChanged {
            id: "pk-1".to_string(),
            name: "Alice".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"event\":\"name_changed\""));

        let parsed: PeerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_direct_reply_chunk_not_found_serialization() {
        let msg = DirectReply::RequestedChunkNotFound {
            available: vec![ChunkInfo { index: 2, size: 64 }],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"event\":\"requested_chunk_not_found\""));
        assert!(json.contains("\"index\":2"));
    }

    #[test]
    fn test_all_session_event_variants_round_trip() {
        let events = vec![
            SessionEvent::NewReceiver { id: "pk-1".to_string(), name: "Bob".to_string() },
            SessionEvent::ReceiverRemoved { id: "pk-1".to_string() },
            SessionEvent::FileInfoUpdated { name: "f.bin".to_string(), size: 300 },
            SessionEvent::ChunkDownloadStarted { id: "pk-1".to_string(), index: 1 },
            SessionEvent::ChunkDownloadFinished { id: "pk-1".to_string(), index: 1 },
            SessionEvent::NewChunkAvailable { index: 1, size: 100 },
            SessionEvent::ChunksRemoved { indices: vec![1] },
            SessionEvent::BytesInUpdated { value: 100 },
            SessionEvent::BytesOutUpdated { value: 200 },
            SessionEvent::ChunksUnfrozen,
            SessionEvent::UploadFinished,
            SessionEvent::Complete { status: CompleteReason::Ok },
        ];

        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let parsed: SessionEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, event, "Round-trip failed for: {}", json);
        }
    }

    #[test]
    fn test_start_init_serialization() {
        let snapshot = SessionSnapshot {
            session_id: "sid".to_string(),
            limits: SnapshotLimits {
                max_receiver_count: 2,
                max_chunk_size: 1024,
                max_chunk_queue: 4,
                max_initial_freeze: 60,
            },
            sender: Some(MemberInfo {
                id: "pk-s".to_string(),
                name: "S".to_string(),
                is_online: true,
            }),
            receivers: vec![],
            current_chunk: 0,
            upload_finished: false,
            some_chunk_was_removed: false,
            initial_freeze: true,
            chunks: vec![],
            expiration_in: 3600,
            file: None,
            bytes_from_sender: 0,
            bytes_to_receivers: 0,
            received_by_you: 0,
        };
        let json = serde_json::to_string(&DirectReply::StartInit(snapshot)).unwrap();
        assert!(json.contains("\"event\":\"start_init\""));
        assert!(json.contains("\"session_id\":\"sid\""));
        assert!(json.contains("\"max_receiver_count\":2"));
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(
            sanitize_file_name("../../etc/passwd").as_deref(),
            Some("....etcpasswd")
        );
        assert_eq!(
            sanitize_file_name("C:\\temp\\f.bin").as_deref(),
            Some("C:tempf.bin")
        );
        assert_eq!(sanitize_file_name("plain.txt").as_deref(), Some("plain.txt"));
        assert_eq!(sanitize_file_name("///"), None);
        assert_eq!(sanitize_file_name(".."), None);
        assert_eq!(sanitize_file_name("a\nb").as_deref(), Some("ab"));
    }
}
