//! Error types for signaling, transport and session setup.

use thiserror::Error;

/// Failures reported by a signaling store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or rejected the operation.
    #[error("signaling store unavailable: {0}")]
    Unavailable(String),

    /// The addressed record does not exist.
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Failures reported by the peer-to-peer transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Error bubbled up from the WebRTC stack.
    #[error("webrtc error: {0}")]
    Rtc(#[from] webrtc::Error),

    /// Description or candidate could not be produced or applied.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The data channel is gone.
    #[error("data channel closed")]
    ChannelClosed,
}

/// Errors surfaced to the caller of a [`crate::Session`] operation.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The join target has no signaling record.
    #[error("room {0} not found")]
    RoomNotFound(String),

    /// The signaling record exists but carries no offer yet.
    #[error("room {0} has no offer")]
    IncompleteRoom(String),

    /// Any signaling-store failure during setup.
    #[error("signaling store error: {0}")]
    StoreIo(#[from] StoreError),

    /// Description or candidate application failed.
    #[error("transport negotiation failed: {0}")]
    TransportNegotiation(#[from] TransportError),

    /// The data channel closed; the session was torn down.
    #[error("data channel closed unexpectedly")]
    ChannelClosedUnexpectedly,

    /// A local or remote description was already applied for this attempt.
    #[error("{0} description already set")]
    DescriptionAlreadySet(&'static str),

    /// Every negotiated channel id of this session has been used.
    #[error("no channel ids left")]
    ChannelIdsExhausted,

    /// An attempt is already in progress.
    #[error("session already started")]
    AlreadyStarted,

    /// The attempt was torn down while the operation was in flight.
    #[error("session closed")]
    Closed,

    /// An outbound message could not be encoded.
    #[error("message encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    /// Configuration rejected by validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
