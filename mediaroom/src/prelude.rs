pub use crate::rtc::{
    DataChannel, DataChannelInit, DataChannelState, IceCandidateInit, IceConnectionState,
    IceServer, IceTransportsType, MediaTrack, OfferOptions, PcFactory, PcTransport,
    RtcConfiguration, RtcError, SdpType, SessionDescription,
};
pub use crate::rtc_engine::{
    EngineError, EngineResult, RtcEngine, DEFAULT_JOIN_TIMEOUT, LOSSY_DC_LABEL,
    RELIABLE_DC_LABEL,
};
pub use crate::signal_client::{
    ConnectParams, SignalClient, SignalError, SignalEvent, SignalResult,
};
pub use crate::{DataPacket, DataPacketKind, DisconnectionReason, UserDataPacket};
