// Copyright 2025 Mediaroom, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::HashMap,
    fmt::Debug,
    mem,
    pin::pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Notify};

use mediaroom_protocol as proto;

use crate::rtc::{
    DataChannel, DataChannelInit, IceConnectionState, IceServer, IceTransportsType, OfferOptions,
    OnRttUpdate, PcFactory, PcTransport, RtcConfiguration, RtcError, TransportOptions,
};
use crate::signal_client::{
    ConnectParams, SignalClient, SignalError, SignalEvent, SignalEvents,
};
use crate::{DataPacket, DataPacketKind, DisconnectionReason, UserDataPacket};

mod data_channels;
mod rtc_events;

use data_channels::{decode_data_packet, DataChannels};
use rtc_events::{forward_dc_events, forward_pc_events, RtcEmitter, RtcEvent, RtcEvents};

pub use data_channels::{LOSSY_DC_LABEL, RELIABLE_DC_LABEL};

pub type EngineResult<T> = Result<T, EngineError>;

pub const MAX_RECONNECT_COUNT: u32 = 10;
pub const INITIAL_RECONNECT_INTERVAL: Duration = Duration::from_millis(300);
pub const MAX_RECONNECT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(15);

const CONNECTED_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("signal failure: {0}")]
    Signal(#[from] SignalError),
    #[error("rtc failure: {0}")]
    Rtc(#[from] RtcError),
    #[error("no peer connection")]
    NoPeerConnection,
    #[error("connection timed out")]
    ConnectionTimeout,
    #[error("data channel not found")]
    DataChannelNotFound,
    #[error("reconnect attempts exhausted")]
    ReconnectExhausted,
    #[error("decode error")]
    Decode(#[from] prost::DecodeError),
    #[error("serde error")]
    Serde(#[from] serde_json::Error),
}

pub type OnParticipantUpdate = Box<dyn FnMut(Vec<proto::ParticipantInfo>) + Send>;
pub type OnSpeakersChanged = Box<dyn FnMut(Vec<proto::SpeakerInfo>) + Send>;
pub type OnMediaTrack = Box<dyn FnMut(Arc<dyn crate::rtc::MediaTrack>) + Send>;
pub type OnDataReceived = Box<dyn FnMut(proto::UserPacket) + Send>;
pub type OnDataPacket = Box<dyn FnMut(String, DataPacket) + Send>;
pub type OnConnectionQuality = Box<dyn FnMut(Vec<proto::ConnectionQualityInfo>) + Send>;
pub type OnRoomUpdate = Box<dyn FnMut(proto::Room) + Send>;
pub type OnRoomMoved = Box<dyn FnMut(proto::RoomMovedResponse) + Send>;
pub type OnRestarting = Box<dyn FnMut() + Send>;
pub type OnRestarted = Box<dyn FnMut(proto::JoinResponse) + Send>;
pub type OnResuming = Box<dyn FnMut() + Send>;
pub type OnResumed = Box<dyn FnMut() + Send>;
pub type OnTranscription = Box<dyn FnMut(proto::Transcription) + Send>;
pub type OnSignalConnected = Box<dyn FnMut(proto::JoinResponse) + Send>;
pub type OnRpcRequest =
    Box<dyn FnMut(String, String, String, String, Duration, u32) + Send>;
pub type OnRpcAck = Box<dyn FnMut(String) + Send>;
pub type OnRpcResponse = Box<dyn FnMut(String, Option<String>, Option<proto::RpcError>) + Send>;
pub type OnStreamHeader = Box<dyn FnMut(proto::data_stream::Header, String) + Send>;
pub type OnStreamChunk = Box<dyn FnMut(proto::data_stream::Chunk) + Send>;
pub type OnStreamTrailer = Box<dyn FnMut(proto::data_stream::Trailer) + Send>;
pub type OnLocalTrackUnpublished = Box<dyn FnMut(proto::TrackUnpublishedResponse) + Send>;
pub type OnLocalTrackSubscribed = Box<dyn FnMut(proto::TrackSubscribed) + Send>;
pub type OnTrackRemoteMuted = Box<dyn FnMut(proto::MuteTrackRequest) + Send>;
pub type OnSubscribedQualityUpdate = Box<dyn FnMut(proto::SubscribedQualityUpdate) + Send>;
pub type OnDisconnected = Box<dyn FnMut(DisconnectionReason) + Send>;

macro_rules! engine_callbacks {
    ($($name:ident: $alias:ty,)+) => {
        /// Optional user callbacks. Each slot has its own lock, so a callback
        /// is never invoked concurrently with its own assignment.
        #[derive(Default)]
        struct EngineCallbacks {
            $($name: Mutex<Option<$alias>>,)+
        }

        impl RtcEngine {
            $(
                pub fn $name(&self, handler: Option<$alias>) {
                    *self.inner.callbacks.$name.lock() = handler;
                }
            )+
        }
    };
}

engine_callbacks! {
    on_participant_update: OnParticipantUpdate,
    on_speakers_changed: OnSpeakersChanged,
    on_media_track: OnMediaTrack,
    on_data_received: OnDataReceived,
    on_data_packet: OnDataPacket,
    on_connection_quality: OnConnectionQuality,
    on_room_update: OnRoomUpdate,
    on_room_moved: OnRoomMoved,
    on_restarting: OnRestarting,
    on_restarted: OnRestarted,
    on_resuming: OnResuming,
    on_resumed: OnResumed,
    on_transcription: OnTranscription,
    on_signal_connected: OnSignalConnected,
    on_rpc_request: OnRpcRequest,
    on_rpc_ack: OnRpcAck,
    on_rpc_response: OnRpcResponse,
    on_stream_header: OnStreamHeader,
    on_stream_chunk: OnStreamChunk,
    on_stream_trailer: OnStreamTrailer,
    on_local_track_unpublished: OnLocalTrackUnpublished,
    on_local_track_subscribed: OnLocalTrackSubscribed,
    on_track_remote_muted: OnTrackRemoteMuted,
    on_subscribed_quality_update: OnSubscribedQualityUpdate,
    on_disconnected: OnDisconnected,
}

macro_rules! emit {
    ($self:expr, $name:ident $(, $arg:expr)* $(,)?) => {
        if let Some(cb) = $self.callbacks.$name.lock().as_mut() {
            cb($($arg),*);
        }
    };
}

#[derive(Default)]
struct PcState {
    publisher: Option<Arc<dyn PcTransport>>,
    subscriber: Option<Arc<dyn PcTransport>>,
    subscriber_primary: bool,
}

impl PcState {
    fn primary_target(&self) -> proto::SignalTarget {
        if self.subscriber_primary {
            proto::SignalTarget::Subscriber
        } else {
            proto::SignalTarget::Publisher
        }
    }

    fn primary(&self) -> Option<Arc<dyn PcTransport>> {
        if self.subscriber_primary {
            self.subscriber.clone()
        } else {
            self.publisher.clone()
        }
    }
}

struct EngineInner {
    client: Arc<dyn SignalClient>,
    pc_factory: Arc<dyn PcFactory>,

    pc: Mutex<PcState>,
    dc: DataChannels,

    pending_tracks: Mutex<HashMap<String, oneshot::Sender<proto::TrackPublishedResponse>>>,

    callbacks: EngineCallbacks,
    on_close: Mutex<Vec<Box<dyn FnOnce() + Send>>>,

    url: Mutex<String>,
    // Refreshed asynchronously by the server, last writer wins.
    token: Mutex<String>,
    params: Mutex<ConnectParams>,
    join_response: Mutex<proto::JoinResponse>,
    join_timeout: Mutex<Duration>,

    has_connected: AtomicBool,
    has_publish: AtomicBool,
    closed: AtomicBool,
    reconnecting: AtomicBool,
    requires_full_reconnect: AtomicBool,

    // Signalled whenever a reconnect attempt series finishes.
    reconnect_notifier: Notify,

    rtc_emitter: RtcEmitter,
    rtc_events: Mutex<Option<RtcEvents>>,
    signal_events: Mutex<Option<SignalEvents>>,
    close_tx: watch::Sender<bool>,
    close_rx: watch::Receiver<bool>,
}

impl Debug for EngineInner {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EngineInner")
            .field("closed", &self.closed)
            .field("reconnecting", &self.reconnecting)
            .field("requires_full_reconnect", &self.requires_full_reconnect)
            .finish()
    }
}

/// The connection engine of a room session.
///
/// Maintains the publisher and subscriber transports, drives offer/answer
/// with the signaling server, multiplexes application traffic over the two
/// data channels and recovers from transient failures by resuming or
/// restarting the session.
#[derive(Debug)]
pub struct RtcEngine {
    inner: Arc<EngineInner>,
}

impl RtcEngine {
    pub fn new(client: Arc<dyn SignalClient>, pc_factory: Arc<dyn PcFactory>) -> Self {
        let (signal_emitter, signal_events) = mpsc::unbounded_channel();
        client.set_event_emitter(signal_emitter);

        let (rtc_emitter, rtc_events) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);

        let inner = Arc::new(EngineInner {
            client,
            pc_factory,
            pc: Mutex::new(PcState::default()),
            dc: DataChannels::new(),
            pending_tracks: Default::default(),
            callbacks: Default::default(),
            on_close: Default::default(),
            url: Default::default(),
            token: Default::default(),
            params: Default::default(),
            join_response: Default::default(),
            join_timeout: Mutex::new(DEFAULT_JOIN_TIMEOUT),
            has_connected: Default::default(),
            has_publish: Default::default(),
            closed: Default::default(),
            reconnecting: Default::default(),
            requires_full_reconnect: Default::default(),
            reconnect_notifier: Notify::new(),
            rtc_emitter,
            rtc_events: Mutex::new(Some(rtc_events)),
            signal_events: Mutex::new(Some(signal_events)),
            close_tx,
            close_rx,
        });

        Self { inner }
    }

    /// Joins the room and waits until the primary transport is connected.
    ///
    /// Dropping the returned future cancels the signaling join.
    pub async fn join(
        &self,
        url: &str,
        token: &str,
        params: ConnectParams,
    ) -> EngineResult<proto::JoinResponse> {
        self.inner.join(url, token, params).await
    }

    /// Closes the engine. Idempotent; the teardown itself runs on a spawned
    /// task once any in-flight reconnect attempt has finished.
    pub fn close(&self) {
        self.inner.close();
    }

    /// True iff both transports exist and the primary one is ICE-connected.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Registers a handler to run during close, in registration order.
    /// Handlers registered after the drain has started are not run.
    pub fn on_close(&self, handler: impl FnOnce() + Send + 'static) {
        self.inner.on_close.lock().push(Box::new(handler));
    }

    pub async fn wait_until_connected(&self) -> EngineResult<()> {
        self.inner.wait_until_connected().await
    }

    pub fn set_join_timeout(&self, timeout: Duration) {
        *self.inner.join_timeout.lock() = timeout;
    }

    /// The response of the most recent join (initial or restarted).
    pub fn join_response(&self) -> proto::JoinResponse {
        self.inner.join_response.lock().clone()
    }

    pub fn publisher(&self) -> Option<Arc<dyn PcTransport>> {
        self.inner.pc.lock().publisher.clone()
    }

    pub fn subscriber(&self) -> Option<Arc<dyn PcTransport>> {
        self.inner.pc.lock().subscriber.clone()
    }

    pub fn data_channel(
        &self,
        target: proto::SignalTarget,
        kind: DataPacketKind,
    ) -> Option<Arc<dyn DataChannel>> {
        self.inner.dc.get(target, kind)
    }

    /// Registers interest in the server's response to an `AddTrack` request.
    /// The entry is consumed on fulfillment; callers that give up must call
    /// [`RtcEngine::unregister_track_published`].
    pub fn register_track_published(
        &self,
        cid: &str,
    ) -> oneshot::Receiver<proto::TrackPublishedResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending_tracks.lock().insert(cid.to_owned(), tx);
        rx
    }

    pub fn unregister_track_published(&self, cid: &str) {
        self.inner.pending_tracks.lock().remove(cid);
    }

    /// Sends a data packet on the matching publisher channel, negotiating the
    /// publisher first if it has never connected. Reliable packets are
    /// stamped with a strictly increasing sequence number; wire order matches
    /// sequence order.
    pub async fn publish_data_packet(
        &self,
        packet: proto::DataPacket,
        kind: DataPacketKind,
    ) -> EngineResult<()> {
        self.inner.publish_data_packet(packet, kind).await
    }

    pub async fn publish_rpc_request(
        &self,
        destination_identity: &str,
        request_id: &str,
        method: &str,
        payload: &str,
        response_timeout: Duration,
    ) -> EngineResult<()> {
        let packet = proto::DataPacket {
            destination_identities: vec![destination_identity.to_owned()],
            value: Some(proto::data_packet::Value::RpcRequest(proto::RpcRequest {
                id: request_id.to_owned(),
                method: method.to_owned(),
                payload: payload.to_owned(),
                response_timeout_ms: response_timeout.as_millis() as u32,
                version: 1,
            })),
            ..Default::default()
        };
        self.inner
            .publish_data_packet(packet, DataPacketKind::Reliable)
            .await
    }

    pub async fn publish_rpc_ack(
        &self,
        destination_identity: &str,
        request_id: &str,
    ) -> EngineResult<()> {
        let packet = proto::DataPacket {
            destination_identities: vec![destination_identity.to_owned()],
            value: Some(proto::data_packet::Value::RpcAck(proto::RpcAck {
                request_id: request_id.to_owned(),
            })),
            ..Default::default()
        };
        self.inner
            .publish_data_packet(packet, DataPacketKind::Reliable)
            .await
    }

    /// Exactly one of payload or error goes on the wire; a missing payload is
    /// sent as the empty string for compatibility with older receivers.
    pub async fn publish_rpc_response(
        &self,
        destination_identity: &str,
        request_id: &str,
        payload: Option<String>,
        error: Option<proto::RpcError>,
    ) -> EngineResult<()> {
        let value = match error {
            Some(error) => proto::rpc_response::Value::Error(error),
            None => proto::rpc_response::Value::Payload(payload.unwrap_or_default()),
        };
        let packet = proto::DataPacket {
            destination_identities: vec![destination_identity.to_owned()],
            value: Some(proto::data_packet::Value::RpcResponse(proto::RpcResponse {
                request_id: request_id.to_owned(),
                value: Some(value),
            })),
            ..Default::default()
        };
        self.inner
            .publish_data_packet(packet, DataPacketKind::Reliable)
            .await
    }

    pub async fn publish_stream_header(
        &self,
        header: proto::data_stream::Header,
        destination_identities: Vec<String>,
    ) -> EngineResult<()> {
        let packet = proto::DataPacket {
            destination_identities,
            value: Some(proto::data_packet::Value::StreamHeader(header)),
            ..Default::default()
        };
        self.inner
            .publish_data_packet(packet, DataPacketKind::Reliable)
            .await
    }

    pub async fn publish_stream_chunk(
        &self,
        chunk: proto::data_stream::Chunk,
        destination_identities: Vec<String>,
    ) -> EngineResult<()> {
        let packet = proto::DataPacket {
            destination_identities,
            value: Some(proto::data_packet::Value::StreamChunk(chunk)),
            ..Default::default()
        };
        self.inner
            .publish_data_packet(packet, DataPacketKind::Reliable)
            .await
    }

    pub async fn publish_stream_trailer(
        &self,
        stream_id: &str,
        destination_identities: Vec<String>,
    ) -> EngineResult<()> {
        let packet = proto::DataPacket {
            destination_identities,
            value: Some(proto::data_packet::Value::StreamTrailer(
                proto::data_stream::Trailer {
                    stream_id: stream_id.to_owned(),
                    ..Default::default()
                },
            )),
            ..Default::default()
        };
        self.inner
            .publish_data_packet(packet, DataPacketKind::Reliable)
            .await
    }

    /// True when the channel's buffered byte count is at or below its
    /// low-threshold. Callers use this to bound in-flight bytes.
    pub fn is_buffer_status_low(&self, kind: DataPacketKind) -> bool {
        self.inner.dc.is_buffer_status_low(kind)
    }

    pub async fn wait_for_buffer_status_low(&self, kind: DataPacketKind) {
        while !self.inner.dc.is_buffer_status_low(kind) {
            tokio::time::sleep(CONNECTED_POLL_INTERVAL).await;
        }
    }
}

impl EngineInner {
    async fn join(
        self: &Arc<Self>,
        url: &str,
        token: &str,
        params: ConnectParams,
    ) -> EngineResult<proto::JoinResponse> {
        let res = self.client.join(url, token, &params).await?;

        *self.url.lock() = url.to_owned();
        *self.token.lock() = token.to_owned();
        *self.params.lock() = params;
        *self.join_response.lock() = res.clone();

        self.configure(
            &res.ice_servers,
            res.client_configuration.as_ref(),
            Some(res.subscriber_primary),
        )?;

        emit!(self, on_signal_connected, res.clone());

        self.client.start();
        self.start_tasks();

        // The publisher only negotiates up front when it is the primary
        // transport or the server asked for fast publishing.
        if !res.subscriber_primary || res.fast_publish {
            let publisher = self.pc.lock().publisher.clone();
            publisher.ok_or(EngineError::NoPeerConnection)?.negotiate();
        }

        self.wait_until_connected().await?;
        self.has_connected.store(true, Ordering::Release);
        Ok(res)
    }

    fn start_tasks(self: &Arc<Self>) {
        if let Some(events) = self.signal_events.lock().take() {
            tokio::spawn(self.clone().signal_task(events, self.close_rx.clone()));
        }
        if let Some(events) = self.rtc_events.lock().take() {
            tokio::spawn(self.clone().rtc_task(events, self.close_rx.clone()));
        }
    }

    async fn signal_task(
        self: Arc<Self>,
        mut events: SignalEvents,
        mut close_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    if let Err(err) = self.on_signal_event(event).await {
                        log::error!("failed to handle signal event: {:?}", err);
                    }
                }
                _ = close_rx.changed() => break,
            }
        }
        log::debug!("signal task closed");
    }

    async fn rtc_task(
        self: Arc<Self>,
        mut events: RtcEvents,
        mut close_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    if let Err(err) = self.on_rtc_event(event).await {
                        log::error!("failed to handle rtc event: {:?}", err);
                    }
                }
                _ = close_rx.changed() => break,
            }
        }
        log::debug!("rtc task closed");
    }

    /// Tears down transports, builds a fresh pair from the server-provided
    /// ICE configuration and wires all events. Also starts a new connection
    /// epoch for reliable sequencing.
    fn configure(
        self: &Arc<Self>,
        ice_servers: &[proto::IceServer],
        client_config: Option<&proto::ClientConfiguration>,
        subscriber_primary: Option<bool>,
    ) -> EngineResult<()> {
        self.dc.reset_sequence();

        let params = self.params.lock().clone();
        let config = make_rtc_configuration(&params, ice_servers, client_config);
        log::debug!("using ICE servers: {:?}", config.ice_servers);

        let mut pc = self.pc.lock();
        if let Some(publisher) = pc.publisher.take() {
            publisher.close();
        }
        if let Some(subscriber) = pc.subscriber.take() {
            subscriber.close();
        }
        if let Some(subscriber_primary) = subscriber_primary {
            pc.subscriber_primary = subscriber_primary;
        }

        let on_rtt_update: OnRttUpdate = {
            let inner = Arc::downgrade(self);
            Box::new(move |rtt| forward_rtt(&inner, rtt))
        };

        let publisher = self.pc_factory.create_transport(
            proto::SignalTarget::Publisher,
            config.clone(),
            TransportOptions {
                is_sender: true,
                retransmit_buffer_size: params.retransmit_buffer_size,
                pacer: params.pacer,
                interceptors: params.interceptors.clone(),
                on_rtt_update: Some(on_rtt_update),
            },
        )?;
        let subscriber = match self.pc_factory.create_transport(
            proto::SignalTarget::Subscriber,
            config,
            TransportOptions {
                retransmit_buffer_size: params.retransmit_buffer_size,
                ..Default::default()
            },
        ) {
            Ok(subscriber) => subscriber,
            Err(err) => {
                // always created as a pair or not at all
                publisher.close();
                return Err(err.into());
            }
        };

        forward_pc_events(&publisher, self.rtc_emitter.clone());
        forward_pc_events(&subscriber, self.rtc_emitter.clone());

        // lossy first, then reliable
        let lossy = match publisher.create_data_channel(
            LOSSY_DC_LABEL,
            DataChannelInit {
                ordered: false,
                max_retransmits: Some(1),
            },
        ) {
            Ok(lossy) => lossy,
            Err(err) => {
                publisher.close();
                subscriber.close();
                return Err(err.into());
            }
        };
        let reliable =
            match publisher.create_data_channel(RELIABLE_DC_LABEL, DataChannelInit::default()) {
                Ok(reliable) => reliable,
                Err(err) => {
                    publisher.close();
                    subscriber.close();
                    return Err(err.into());
                }
            };
        forward_dc_events(&lossy, self.rtc_emitter.clone());
        forward_dc_events(&reliable, self.rtc_emitter.clone());
        self.dc.set_publisher_channels(lossy, reliable);

        pc.publisher = Some(publisher);
        pc.subscriber = Some(subscriber);
        Ok(())
    }

    async fn on_signal_event(self: &Arc<Self>, event: SignalEvent) -> EngineResult<()> {
        match event {
            SignalEvent::Answer(answer) => {
                if self.closed.load(Ordering::Acquire) {
                    log::debug!("ignoring sdp answer after close");
                    return Ok(());
                }
                let publisher = self.pc.lock().publisher.clone();
                if let Some(publisher) = publisher {
                    publisher.set_remote_description(answer).await?;
                    log::debug!("applied publisher answer");
                }
            }
            SignalEvent::Offer(offer) => {
                if self.closed.load(Ordering::Acquire) {
                    log::debug!("ignoring sdp offer after close");
                    return Ok(());
                }
                log::debug!("received offer for subscriber");
                let subscriber = self.pc.lock().subscriber.clone();
                if let Some(subscriber) = subscriber {
                    // the answer goes out once the description settles
                    subscriber.set_remote_description(offer).await?;
                }
            }
            SignalEvent::Trickle { candidate, target } => {
                if self.closed.load(Ordering::Acquire) {
                    log::debug!("ignoring trickle after close");
                    return Ok(());
                }
                log::debug!("remote ice candidate {:?} {:?}", candidate, target);
                let transport = {
                    let pc = self.pc.lock();
                    if target == proto::SignalTarget::Publisher {
                        pc.publisher.clone()
                    } else {
                        pc.subscriber.clone()
                    }
                };
                if let Some(transport) = transport {
                    if let Err(err) = transport.add_ice_candidate(candidate).await {
                        log::error!("could not add ice candidate: {:?}", err);
                    }
                }
            }
            SignalEvent::ParticipantUpdate(updates) => {
                emit!(self, on_participant_update, updates)
            }
            SignalEvent::SpeakersChanged(speakers) => emit!(self, on_speakers_changed, speakers),
            SignalEvent::LocalTrackPublished(res) => {
                let listener = self.pending_tracks.lock().remove(&res.cid);
                if let Some(listener) = listener {
                    let _ = listener.send(res);
                }
            }
            SignalEvent::LocalTrackUnpublished(res) => {
                emit!(self, on_local_track_unpublished, res)
            }
            SignalEvent::TrackRemoteMuted(req) => emit!(self, on_track_remote_muted, req),
            SignalEvent::ConnectionQuality(updates) => {
                emit!(self, on_connection_quality, updates)
            }
            SignalEvent::RoomUpdate(room) => emit!(self, on_room_update, room),
            SignalEvent::RoomMoved(moved) => emit!(self, on_room_moved, moved),
            SignalEvent::Leave(leave) => self.handle_leave(leave),
            SignalEvent::TokenRefresh(token) => *self.token.lock() = token,
            SignalEvent::LocalTrackSubscribed(subscribed) => {
                emit!(self, on_local_track_subscribed, subscribed)
            }
            SignalEvent::SubscribedQualityUpdate(update) => {
                emit!(self, on_subscribed_quality_update, update)
            }
            SignalEvent::Close => self.handle_disconnect(false),
        }
        Ok(())
    }

    async fn on_rtc_event(self: &Arc<Self>, event: RtcEvent) -> EngineResult<()> {
        match event {
            RtcEvent::IceCandidate { candidate, target } => {
                // None is the end-of-candidates sentinel
                let Some(candidate) = candidate else {
                    return Ok(());
                };
                log::debug!("local ice candidate {:?} {:?}", candidate, target);
                if let Err(err) = self.client.send_ice_candidate(candidate, target).await {
                    log::error!("could not send ice candidate for {:?}: {:?}", target, err);
                }
            }
            RtcEvent::ConnectionChange { state, target } => {
                let (primary_target, primary) = {
                    let pc = self.pc.lock();
                    (pc.primary_target(), pc.primary())
                };
                if target != primary_target {
                    return Ok(());
                }
                match state {
                    IceConnectionState::Connected | IceConnectionState::Completed => {
                        let pair = primary.and_then(|transport| transport.selected_candidate_pair());
                        log::debug!("ICE connected, selected pair: {:?}", pair);
                    }
                    IceConnectionState::Disconnected => log::debug!("ICE disconnected"),
                    IceConnectionState::Failed => {
                        log::debug!("ICE failed");
                        self.handle_disconnect(false);
                    }
                    _ => {}
                }
            }
            RtcEvent::DataChannel { channel, target } => {
                if target == proto::SignalTarget::Subscriber
                    && self.dc.route_subscriber_channel(channel.clone())
                {
                    forward_dc_events(&channel, self.rtc_emitter.clone());
                }
            }
            RtcEvent::Offer { offer, target: _ } => {
                self.has_publish.store(true, Ordering::Release);
                log::debug!("sending publisher offer");
                if let Err(err) = self.client.send_offer(offer).await {
                    log::error!("could not send offer: {:?}", err);
                }
            }
            RtcEvent::RemoteDescriptionSettled { target } => {
                if target == proto::SignalTarget::Subscriber {
                    if let Err(err) = self.create_answer_and_send().await {
                        log::error!("could not answer subscriber offer: {:?}", err);
                    }
                }
            }
            RtcEvent::MediaTrack { track } => emit!(self, on_media_track, track),
            RtcEvent::Data { data, binary } => self.handle_data_packet(&data, binary),
        }
        Ok(())
    }

    async fn create_answer_and_send(&self) -> EngineResult<()> {
        let subscriber = self
            .pc
            .lock()
            .subscriber
            .clone()
            .ok_or(EngineError::NoPeerConnection)?;
        let answer = subscriber.create_answer().await?;
        subscriber.set_local_description(answer.clone()).await?;
        self.client.send_answer(answer).await?;
        Ok(())
    }

    /// Decodes an inbound frame and dispatches the typed packet. The engine
    /// never aborts on a malformed peer packet.
    fn handle_data_packet(&self, data: &[u8], binary: bool) {
        let Ok(packet) = decode_data_packet(data, binary) else {
            return;
        };

        let identity = packet.participant_identity;
        match packet.value {
            Some(proto::data_packet::Value::User(mut user)) => {
                // compatibility with senders that only fill the inner fields
                if user.participant_identity.is_empty() {
                    user.participant_identity = identity.clone();
                }
                if user.destination_identities.is_empty() {
                    user.destination_identities = packet.destination_identities;
                }
                emit!(self, on_data_received, user.clone());

                let identity = if identity.is_empty() {
                    user.participant_identity.clone()
                } else {
                    identity
                };
                emit!(
                    self,
                    on_data_packet,
                    identity,
                    DataPacket::User(UserDataPacket {
                        payload: user.payload,
                        topic: user.topic.unwrap_or_default(),
                    })
                );
            }
            Some(proto::data_packet::Value::SipDtmf(dtmf)) => {
                emit!(self, on_data_packet, identity, DataPacket::SipDtmf(dtmf))
            }
            Some(proto::data_packet::Value::Transcription(transcription)) => {
                emit!(self, on_transcription, transcription)
            }
            Some(proto::data_packet::Value::RpcRequest(request)) => {
                emit!(
                    self,
                    on_rpc_request,
                    identity,
                    request.id,
                    request.method,
                    request.payload,
                    Duration::from_millis(u64::from(request.response_timeout_ms)),
                    request.version,
                );
            }
            Some(proto::data_packet::Value::RpcAck(ack)) => {
                emit!(self, on_rpc_ack, ack.request_id)
            }
            Some(proto::data_packet::Value::RpcResponse(response)) => {
                let (payload, error) = match response.value {
                    Some(proto::rpc_response::Value::Payload(payload)) => (Some(payload), None),
                    Some(proto::rpc_response::Value::Error(error)) => (None, Some(error)),
                    None => return,
                };
                emit!(self, on_rpc_response, response.request_id, payload, error);
            }
            Some(proto::data_packet::Value::StreamHeader(header)) => {
                emit!(self, on_stream_header, header, identity)
            }
            Some(proto::data_packet::Value::StreamChunk(chunk)) => {
                emit!(self, on_stream_chunk, chunk)
            }
            Some(proto::data_packet::Value::StreamTrailer(trailer)) => {
                emit!(self, on_stream_trailer, trailer)
            }
            None => {}
        }
    }

    fn handle_leave(self: &Arc<Self>, leave: proto::LeaveRequest) {
        log::debug!("received leave request: {:?}", leave);
        match proto::leave_request::Action::try_from(leave.action) {
            Ok(proto::leave_request::Action::Disconnect) => {
                let reason = leave.reason();
                self.close();
                log::info!("server initiated leave, reason: {:?}", reason);
                emit!(self, on_disconnected, reason.into());
            }
            Ok(proto::leave_request::Action::Reconnect) => self.handle_disconnect(true),
            Ok(proto::leave_request::Action::Resume) => self.handle_disconnect(false),
            Err(_) => {}
        }
    }

    fn close(self: &Arc<Self>) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let inner = self.clone();
        tokio::spawn(async move {
            // Wait for any in-flight reconnect attempt; the drain must not
            // race the reconnect loop's replacement of the transports.
            let mut notified = pin!(inner.reconnect_notifier.notified());
            loop {
                notified.as_mut().enable();
                if !inner.reconnecting.load(Ordering::Acquire) {
                    break;
                }
                notified.as_mut().await;
                notified.set(inner.reconnect_notifier.notified());
            }

            let handlers = mem::take(&mut *inner.on_close.lock());
            for handler in handlers {
                handler();
            }

            let (publisher, subscriber) = {
                let pc = inner.pc.lock();
                (pc.publisher.clone(), pc.subscriber.clone())
            };
            if let Some(publisher) = publisher {
                publisher.close();
            }
            if let Some(subscriber) = subscriber {
                subscriber.close();
            }

            inner.client.close().await;
            let _ = inner.close_tx.send(true);
        });
    }

    fn is_connected(&self) -> bool {
        let pc = self.pc.lock();
        if pc.publisher.is_none() || pc.subscriber.is_none() {
            return false;
        }
        pc.primary()
            .is_some_and(|transport| transport.is_connected())
    }

    async fn wait_until_connected(&self) -> EngineResult<()> {
        let timeout = *self.join_timeout.lock();
        let connected = async {
            loop {
                if self.is_connected() {
                    self.requires_full_reconnect.store(false, Ordering::Release);
                    return;
                }
                tokio::time::sleep(CONNECTED_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, connected)
            .await
            .map_err(|_| EngineError::ConnectionTimeout)
    }

    /// Waits for the publisher to become usable for sending. When the
    /// subscriber is primary the publisher may never have negotiated, so a
    /// single negotiation is triggered from here.
    async fn ensure_publisher_connected(&self, ensure_data_ready: bool) -> EngineResult<()> {
        let subscriber_primary = self.pc.lock().subscriber_primary;
        if !subscriber_primary {
            return self.wait_until_connected().await;
        }

        let timeout = *self.join_timeout.lock();
        let connected = async {
            let mut negotiated = false;
            loop {
                let publisher = self.pc.lock().publisher.clone();
                if let Some(publisher) = publisher {
                    if publisher.is_connected()
                        && (!ensure_data_ready || self.dc.publisher_channels_ready())
                    {
                        return;
                    }
                    if !negotiated {
                        publisher.negotiate();
                        negotiated = true;
                    }
                }
                tokio::time::sleep(CONNECTED_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, connected)
            .await
            .map_err(|_| EngineError::ConnectionTimeout)
    }

    async fn publish_data_packet(
        &self,
        packet: proto::DataPacket,
        kind: DataPacketKind,
    ) -> EngineResult<()> {
        self.ensure_publisher_connected(true).await?;
        self.dc.publish(packet, kind)
    }

    /// Entry point of the reconnect state machine. Never reconnects before
    /// the first successful join; at most one reconnect task runs at a time.
    fn handle_disconnect(self: &Arc<Self>, full_reconnect: bool) {
        if self.closed.load(Ordering::Acquire) || !self.has_connected.load(Ordering::Acquire) {
            return;
        }

        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // escalate the in-flight attempt instead
            if full_reconnect {
                self.requires_full_reconnect.store(true, Ordering::Release);
            }
            return;
        }

        let inner = self.clone();
        tokio::spawn(async move {
            inner.reconnect_task(full_reconnect).await;
        });
    }

    async fn reconnect_task(self: &Arc<Self>, mut full_reconnect: bool) {
        for i in 0..MAX_RECONNECT_COUNT {
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            if self.requires_full_reconnect.load(Ordering::Acquire) {
                full_reconnect = true;
            }

            let result = if full_reconnect {
                if i == 0 {
                    emit!(self, on_restarting);
                }
                log::info!("restarting connection... attempt: {}", i);
                self.restart_connection().await
            } else {
                if i == 0 {
                    emit!(self, on_resuming);
                }
                log::info!("resuming connection... attempt: {}", i);
                self.resume_connection().await
            };

            match result {
                Ok(()) => {
                    self.reconnecting.store(false, Ordering::Release);
                    self.reconnect_notifier.notify_waiters();
                    return;
                }
                Err(err) if full_reconnect => {
                    log::error!("restart connection failed: {:?}", err)
                }
                Err(err) => log::error!("resume connection failed: {:?}", err),
            }

            let delay = INITIAL_RECONNECT_INTERVAL * (i * i);
            if delay > MAX_RECONNECT_INTERVAL {
                break;
            }
            if i < MAX_RECONNECT_COUNT - 1 {
                tokio::time::sleep(delay).await;
            }
        }

        emit!(self, on_disconnected, DisconnectionReason::Failed);
        self.reconnecting.store(false, Ordering::Release);
        self.reconnect_notifier.notify_waiters();
    }

    /// Soft recovery: resume the signaling session and restart ICE on the
    /// existing transports, preserving subscriber state.
    async fn resume_connection(&self) -> EngineResult<()> {
        let url = self.url.lock().clone();
        let token = self.token.lock().clone();
        let params = self.params.lock().clone();
        let participant_sid = self
            .join_response
            .lock()
            .participant
            .as_ref()
            .map(|participant| participant.sid.clone())
            .unwrap_or_default();

        let reconnect = self
            .client
            .reconnect(&url, &token, &params, &participant_sid)
            .await?;

        if let Some(reconnect) = reconnect {
            let config = make_rtc_configuration(
                &params,
                &reconnect.ice_servers,
                reconnect.client_configuration.as_ref(),
            );
            // both transports reconfigure under the same lock hold
            let pc = self.pc.lock();
            let (Some(publisher), Some(subscriber)) =
                (pc.publisher.as_ref(), pc.subscriber.as_ref())
            else {
                return Err(EngineError::NoPeerConnection);
            };
            publisher.set_configuration(config.clone())?;
            subscriber.set_configuration(config)?;
        }

        self.client.start();

        let (send_offer, publisher) = {
            let pc = self.pc.lock();
            (
                !pc.subscriber_primary || self.has_publish.load(Ordering::Acquire),
                pc.publisher.clone(),
            )
        };
        if send_offer {
            let publisher = publisher.ok_or(EngineError::NoPeerConnection)?;
            publisher
                .create_and_send_offer(OfferOptions { ice_restart: true })
                .await?;
        }

        self.wait_until_connected().await?;
        emit!(self, on_resumed);
        Ok(())
    }

    /// Hard recovery: leave, close signaling and run the full join again,
    /// replacing both transports.
    async fn restart_connection(self: &Arc<Self>) -> EngineResult<()> {
        if self.client.is_started() {
            let _ = self
                .client
                .send_leave_with_reason(proto::DisconnectReason::UnknownReason)
                .await;
        }
        self.client.close().await;

        let url = self.url.lock().clone();
        let token = self.token.lock().clone();
        let params = self.params.lock().clone();
        let res = self.join(&url, &token, params).await?;
        emit!(self, on_restarted, res);
        Ok(())
    }
}

fn forward_rtt(inner: &Weak<EngineInner>, rtt: u32) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let subscriber = inner.pc.lock().subscriber.clone();
    if let Some(subscriber) = subscriber {
        subscriber.set_rtt(rtt);
    }
}

fn make_rtc_configuration(
    params: &ConnectParams,
    ice_servers: &[proto::IceServer],
    client_config: Option<&proto::ClientConfiguration>,
) -> RtcConfiguration {
    let mut config = RtcConfiguration {
        ice_servers: ice_servers
            .iter()
            .map(|server| IceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                password: server.credential.clone(),
            })
            .collect(),
        ice_transport_type: params.ice_transport_policy,
    };

    if let Some(client_config) = client_config {
        if client_config.force_relay() == proto::ClientConfigSetting::Enabled {
            config.ice_transport_type = IceTransportsType::Relay;
        }
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtc_configuration_maps_servers_and_policy() {
        let params = ConnectParams {
            ice_transport_policy: IceTransportsType::NoHost,
            ..Default::default()
        };
        let servers = vec![proto::IceServer {
            urls: vec!["turn:example.com".to_owned()],
            username: "user".to_owned(),
            credential: "pass".to_owned(),
        }];

        let config = make_rtc_configuration(&params, &servers, None);
        assert_eq!(config.ice_transport_type, IceTransportsType::NoHost);
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, servers[0].urls);
        assert_eq!(config.ice_servers[0].password, "pass");
    }

    #[test]
    fn forced_relay_overrides_policy() {
        let client_config = proto::ClientConfiguration {
            force_relay: proto::ClientConfigSetting::Enabled as i32,
        };
        let config = make_rtc_configuration(&ConnectParams::default(), &[], Some(&client_config));
        assert_eq!(config.ice_transport_type, IceTransportsType::Relay);

        let client_config = proto::ClientConfiguration {
            force_relay: proto::ClientConfigSetting::Disabled as i32,
        };
        let config = make_rtc_configuration(&ConnectParams::default(), &[], Some(&client_config));
        assert_eq!(config.ice_transport_type, IceTransportsType::All);
    }
}
