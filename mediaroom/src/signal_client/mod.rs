use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use mediaroom_protocol as proto;

use crate::rtc::{
    IceCandidateInit, IceTransportsType, Interceptor, Pacer, SessionDescription,
};

pub type SignalEmitter = mpsc::UnboundedSender<SignalEvent>;
pub type SignalEvents = mpsc::UnboundedReceiver<SignalEvent>;
pub type SignalResult<T> = Result<T, SignalError>;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("{0}")]
    Timeout(String),
    #[error("failed to send message to server")]
    SendError,
}

/// Server-push events the engine consumes. Delivered through the emitter
/// installed with [`SignalClient::set_event_emitter`].
#[derive(Debug)]
pub enum SignalEvent {
    Answer(SessionDescription),
    Offer(SessionDescription),
    Trickle {
        candidate: IceCandidateInit,
        target: proto::SignalTarget,
    },
    ParticipantUpdate(Vec<proto::ParticipantInfo>),
    SpeakersChanged(Vec<proto::SpeakerInfo>),
    LocalTrackPublished(proto::TrackPublishedResponse),
    LocalTrackUnpublished(proto::TrackUnpublishedResponse),
    TrackRemoteMuted(proto::MuteTrackRequest),
    ConnectionQuality(Vec<proto::ConnectionQualityInfo>),
    RoomUpdate(proto::Room),
    RoomMoved(proto::RoomMovedResponse),
    Leave(proto::LeaveRequest),
    TokenRefresh(String),
    LocalTrackSubscribed(proto::TrackSubscribed),
    SubscribedQualityUpdate(proto::SubscribedQualityUpdate),
    /// The signaling stream closed unexpectedly.
    Close,
}

/// Connection parameters assembled by the caller and forwarded to both the
/// signaling client and the transports.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub auto_subscribe: bool,
    pub adaptive_stream: bool,
    /// 0 lets the transport implementation pick its default.
    pub retransmit_buffer_size: u16,
    pub ice_transport_policy: IceTransportsType,
    pub pacer: Option<Pacer>,
    pub interceptors: Vec<Interceptor>,
}

impl Default for ConnectParams {
    fn default() -> Self {
        Self {
            auto_subscribe: true,
            adaptive_stream: false,
            retransmit_buffer_size: 0,
            ice_transport_policy: IceTransportsType::All,
            pacer: None,
            interceptors: Vec::new(),
        }
    }
}

/// The signaling side of a room session: a bidirectional framed channel to
/// the server. The engine owns the lifecycle (join, start, reconnect, close)
/// and consumes server pushes as [`SignalEvent`]s.
#[async_trait]
pub trait SignalClient: Send + Sync {
    /// Performs the signaling join round-trip. Cancelling the future aborts
    /// the join.
    async fn join(
        &self,
        url: &str,
        token: &str,
        params: &ConnectParams,
    ) -> SignalResult<proto::JoinResponse>;

    /// Re-establishes the signaling stream for a resume. Returns a refreshed
    /// ICE configuration when the server provides one.
    async fn reconnect(
        &self,
        url: &str,
        token: &str,
        params: &ConnectParams,
        participant_sid: &str,
    ) -> SignalResult<Option<proto::ReconnectResponse>>;

    /// Starts (or restarts) the read loop delivering [`SignalEvent`]s.
    fn start(&self);
    fn is_started(&self) -> bool;
    async fn close(&self);

    async fn send_offer(&self, offer: SessionDescription) -> SignalResult<()>;
    async fn send_answer(&self, answer: SessionDescription) -> SignalResult<()>;
    async fn send_ice_candidate(
        &self,
        candidate: IceCandidateInit,
        target: proto::SignalTarget,
    ) -> SignalResult<()>;
    async fn send_leave_with_reason(&self, reason: proto::DisconnectReason) -> SignalResult<()>;

    fn set_event_emitter(&self, emitter: SignalEmitter);
}
