//! Error types for registry and session admission.
//!
//! Per-message failures inside a live session (oversize chunk, unknown
//! index, …) are not errors — they are reported back to the caller as
//! reply events and the session continues. The types here cover the
//! fallible seams where an operation is refused outright.

use thiserror::Error;

/// Why a client could not be created.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("The maximum number of clients has been reached")]
    ClientLimit,

    #[error("A client with this id already exists")]
    DuplicateId,
}

/// Why a session could not be created or joined.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("The maximum number of sessions has been reached")]
    SessionLimit,

    #[error("A session created by this client already exists")]
    DuplicateSession,

    #[error("Session not found")]
    NotFound,

    #[error("The client is already a participant in another session")]
    AlreadyJoined,

    #[error("Part of the data has already been dropped; joining is no longer possible")]
    JoinWindowClosed,

    #[error("The receiver limit has been reached or the client is already a receiver")]
    ReceiverRejected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            IdentityError::ClientLimit.to_string(),
            "The maximum number of clients has been reached"
        );
        assert_eq!(SessionError::NotFound.to_string(), "Session not found");
    }
}
