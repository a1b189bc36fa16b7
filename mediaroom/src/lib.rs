//! Client-side engine for mediaroom real-time sessions.
//!
//! The engine joins a room through a [`signal_client::SignalClient`], drives
//! a publisher and a subscriber transport obtained from an
//! [`rtc::PcFactory`], multiplexes application traffic over the reliable and
//! lossy data channels, and recovers from transient failures by resuming or
//! restarting the session.

pub mod rtc;
pub mod rtc_engine;
pub mod signal_client;

/// `use mediaroom::prelude::*;` to import the common types.
pub mod prelude;

pub use mediaroom_protocol as proto;

/// Which data channel a packet travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPacketKind {
    Lossy,
    Reliable,
}

/// An application payload received from another participant.
#[derive(Debug, Clone)]
pub struct UserDataPacket {
    pub payload: Vec<u8>,
    pub topic: String,
}

/// A typed inbound data packet, dispatched with the sender's identity.
#[derive(Debug, Clone)]
pub enum DataPacket {
    User(UserDataPacket),
    SipDtmf(proto::SipDtmf),
}

/// Why the engine ended up disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectionReason {
    /// Reconnection attempts were exhausted.
    Failed,
    ClientInitiated,
    DuplicateIdentity,
    ServerShutdown,
    ParticipantRemoved,
    RoomDeleted,
    StateMismatch,
    JoinFailure,
    Migration,
    SignalClose,
    Unknown,
}

impl From<proto::DisconnectReason> for DisconnectionReason {
    fn from(reason: proto::DisconnectReason) -> Self {
        match reason {
            proto::DisconnectReason::UnknownReason => Self::Unknown,
            proto::DisconnectReason::ClientInitiated => Self::ClientInitiated,
            proto::DisconnectReason::DuplicateIdentity => Self::DuplicateIdentity,
            proto::DisconnectReason::ServerShutdown => Self::ServerShutdown,
            proto::DisconnectReason::ParticipantRemoved => Self::ParticipantRemoved,
            proto::DisconnectReason::RoomDeleted => Self::RoomDeleted,
            proto::DisconnectReason::StateMismatch => Self::StateMismatch,
            proto::DisconnectReason::JoinFailure => Self::JoinFailure,
            proto::DisconnectReason::Migration => Self::Migration,
            proto::DisconnectReason::SignalClose => Self::SignalClose,
        }
    }
}
