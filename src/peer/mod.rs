pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::{RtcPeer, RtcTransport};
pub use data_channel::{greeting, ChannelIds, ChannelManager, ChannelOutcome, RtcChannel};
pub use ice::{publish_local, CandidateExchange};
pub use state::{ChannelState, ConnectionState, Role};
pub use transport::{CandidateEvents, ChannelEvents, DataChannel, PeerConnection, Transport};
pub use types::{
    CandidateEvent, ChannelEvent, IceCandidate, SdpType, ServerConfig, SessionDescription,
};
