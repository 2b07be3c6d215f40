//! Transport abstraction for peer-to-peer negotiation.
//!
//! Production uses the `webrtc` crate ([`super::RtcTransport`]); tests plug in an
//! in-memory loopback. Every callback the underlying stack fires is turned into
//! a message on an mpsc channel so the session owns a single receiver per
//! event source and can drop it on teardown.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{CandidateEvent, ChannelEvent, IceCandidate, SessionDescription};
use crate::config::SessionConfig;
use crate::error::TransportError;

/// Locally gathered candidates, terminated by [`CandidateEvent::Complete`].
pub type CandidateEvents = mpsc::UnboundedReceiver<CandidateEvent>;

/// Open/message/close events of one data channel.
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Factory for peer connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: PeerConnection;

    /// Create a connection and the receiver its local candidates arrive on.
    async fn create_connection(
        &self,
        config: &SessionConfig,
    ) -> Result<(Self::Connection, CandidateEvents), TransportError>;
}

/// One side of a peer-to-peer negotiation.
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    type Channel: DataChannel;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Whether `add_ice_candidate` may be called before the remote description
    /// is set. When false the caller must queue candidates and flush them later.
    fn buffers_early_candidates(&self) -> bool {
        false
    }

    /// Create a data channel whose id is agreed out of band, so both peers open
    /// it without an in-band announcement.
    async fn create_negotiated_channel(
        &self,
        label: &str,
        id: u16,
    ) -> Result<(Arc<Self::Channel>, ChannelEvents), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Byte channel produced by [`PeerConnection::create_negotiated_channel`].
#[async_trait]
pub trait DataChannel: Send + Sync + 'static {
    fn id(&self) -> u16;

    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
