use serde::{Deserialize, Serialize};

/// Which side of the room this participant plays
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Creator,
    Joiner,
}

/// Coordinator state machine.
///
/// Creator: `Idle → TransportCreated → OfferSet → AwaitingAnswer → Connected → Closed`.
/// Joiner: `Idle → TransportCreated → AwaitingOffer → AnswerSet → Connected → Closed`.
/// `Connected` may be reached from any setup state once the channel opens.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    #[default]
    Idle,
    TransportCreated,
    OfferSet,
    AwaitingAnswer,
    AwaitingOffer,
    AnswerSet,
    Connected,
    Closed,
}

impl ConnectionState {
    /// Position along either role's path; states only ever move forward.
    pub fn rank(self) -> u8 {
        match self {
            ConnectionState::Idle => 0,
            ConnectionState::TransportCreated => 1,
            ConnectionState::OfferSet | ConnectionState::AwaitingOffer => 2,
            ConnectionState::AwaitingAnswer | ConnectionState::AnswerSet => 3,
            ConnectionState::Connected => 4,
            ConnectionState::Closed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Closed
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::TransportCreated => "transport-created",
            ConnectionState::OfferSet => "offer-set",
            ConnectionState::AwaitingAnswer => "awaiting-answer",
            ConnectionState::AwaitingOffer => "awaiting-offer",
            ConnectionState::AnswerSet => "answer-set",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Lifecycle of the negotiated data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}
