//! Peer-to-peer data channel bootstrapped through a shared signaling store.
//!
//! A creator publishes an offer into a room record, a joiner answers it, both
//! trickle candidates through the record's subcollections and then talk over a
//! single negotiated data channel: plain-text chat plus `remote_move` samples
//! that drive a dead-reckoning cursor.

pub mod codec;
pub mod config;
pub mod error;
pub mod logger;
pub mod motion;
pub mod peer;
pub mod session;
pub mod signaling;
mod utils;

pub use codec::{DataMessage, Inbound};
pub use config::SessionConfig;
pub use error::{Result, SessionError, StoreError, TransportError};
pub use motion::{PositionFilter, Vector3};
pub use peer::{ConnectionState, Role, RtcTransport};
pub use session::{Session, SessionEvent};
pub use signaling::{MemoryStore, RoomRecord, SignalingStore};
