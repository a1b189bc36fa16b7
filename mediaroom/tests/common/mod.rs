#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use mediaroom::proto;
use mediaroom::rtc::*;
use mediaroom::rtc_engine::RtcEngine;
use mediaroom::signal_client::*;

pub const TEST_URL: &str = "wss://rtc.example.com";
pub const TEST_TOKEN: &str = "token";

#[derive(Debug, Clone)]
pub enum SentSignal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate {
        candidate: IceCandidateInit,
        target: proto::SignalTarget,
    },
    Leave(proto::DisconnectReason),
}

/// Scriptable in-memory signaling client.
#[derive(Default)]
pub struct FakeSignalClient {
    emitter: Mutex<Option<SignalEmitter>>,
    started: AtomicBool,
    pub join_calls: AtomicUsize,
    pub reconnect_calls: AtomicUsize,
    join_results: Mutex<VecDeque<SignalResult<proto::JoinResponse>>>,
    reconnect_results: Mutex<VecDeque<SignalResult<Option<proto::ReconnectResponse>>>>,
    // When set, the next reconnect call blocks until the sender side is
    // released or dropped.
    reconnect_gate: Mutex<Option<oneshot::Receiver<()>>>,
    fail_reconnect: AtomicBool,
    pub sent: Mutex<Vec<SentSignal>>,
    pub last_join_token: Mutex<String>,
    pub last_reconnect_token: Mutex<String>,
    pub last_reconnect_sid: Mutex<String>,
}

impl FakeSignalClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_join_result(&self, result: SignalResult<proto::JoinResponse>) {
        self.join_results.lock().push_back(result);
    }

    pub fn push_reconnect_result(&self, result: SignalResult<Option<proto::ReconnectResponse>>) {
        self.reconnect_results.lock().push_back(result);
    }

    pub fn gate_next_reconnect(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.reconnect_gate.lock() = Some(rx);
        tx
    }

    pub fn set_fail_reconnect(&self, fail: bool) {
        self.fail_reconnect.store(fail, Ordering::SeqCst);
    }

    /// Pushes a server event into the engine.
    pub fn emit(&self, event: SignalEvent) {
        if let Some(emitter) = self.emitter.lock().as_ref() {
            let _ = emitter.send(event);
        }
    }

    pub fn sent_offers(&self) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|signal| matches!(signal, SentSignal::Offer(_)))
            .count()
    }

    pub fn sent_answers(&self) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|signal| matches!(signal, SentSignal::Answer(_)))
            .count()
    }
}

#[async_trait]
impl SignalClient for FakeSignalClient {
    async fn join(
        &self,
        _url: &str,
        token: &str,
        _params: &ConnectParams,
    ) -> SignalResult<proto::JoinResponse> {
        self.join_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_join_token.lock() = token.to_owned();
        let scripted = self.join_results.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(join_response(false, false)))
    }

    async fn reconnect(
        &self,
        _url: &str,
        token: &str,
        _params: &ConnectParams,
        participant_sid: &str,
    ) -> SignalResult<Option<proto::ReconnectResponse>> {
        self.reconnect_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_reconnect_token.lock() = token.to_owned();
        *self.last_reconnect_sid.lock() = participant_sid.to_owned();

        let gate = self.reconnect_gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        if let Some(scripted) = self.reconnect_results.lock().pop_front() {
            return scripted;
        }
        if self.fail_reconnect.load(Ordering::SeqCst) {
            return Err(SignalError::Transport("reconnect refused".to_owned()));
        }
        Ok(None)
    }

    fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    async fn send_offer(&self, offer: SessionDescription) -> SignalResult<()> {
        self.sent.lock().push(SentSignal::Offer(offer));
        Ok(())
    }

    async fn send_answer(&self, answer: SessionDescription) -> SignalResult<()> {
        self.sent.lock().push(SentSignal::Answer(answer));
        Ok(())
    }

    async fn send_ice_candidate(
        &self,
        candidate: IceCandidateInit,
        target: proto::SignalTarget,
    ) -> SignalResult<()> {
        self.sent.lock().push(SentSignal::Candidate { candidate, target });
        Ok(())
    }

    async fn send_leave_with_reason(&self, reason: proto::DisconnectReason) -> SignalResult<()> {
        self.sent.lock().push(SentSignal::Leave(reason));
        Ok(())
    }

    fn set_event_emitter(&self, emitter: SignalEmitter) {
        *self.emitter.lock() = Some(emitter);
    }
}

#[derive(Default)]
struct TransportHandlers {
    on_offer: Mutex<Option<OnOffer>>,
    on_ice_candidate: Mutex<Option<OnIceCandidate>>,
    on_state_change: Mutex<Option<OnIceConnectionStateChange>>,
    on_track: Mutex<Option<OnTrack>>,
    on_data_channel: Mutex<Option<OnDataChannel>>,
    on_settled: Mutex<Option<OnRemoteDescriptionSettled>>,
}

pub struct FakeTransport {
    pub target: proto::SignalTarget,
    pub is_sender: bool,
    auto_connect: bool,
    state: Mutex<IceConnectionState>,
    pub config: Mutex<RtcConfiguration>,
    pub set_configuration_calls: AtomicUsize,
    pub negotiate_calls: AtomicUsize,
    pub offers: Mutex<Vec<OfferOptions>>,
    pub remote_descriptions: Mutex<Vec<SessionDescription>>,
    pub local_descriptions: Mutex<Vec<SessionDescription>>,
    pub candidates: Mutex<Vec<IceCandidateInit>>,
    pub rtt: AtomicU32,
    pub channels: Mutex<Vec<Arc<FakeDataChannel>>>,
    closed: AtomicBool,
    handlers: TransportHandlers,
    rtt_handler: Mutex<Option<OnRttUpdate>>,
}

impl FakeTransport {
    fn new(
        target: proto::SignalTarget,
        config: RtcConfiguration,
        options: TransportOptions,
        auto_connect: bool,
    ) -> Arc<Self> {
        let state = if auto_connect {
            IceConnectionState::Connected
        } else {
            IceConnectionState::New
        };
        Arc::new(Self {
            target,
            is_sender: options.is_sender,
            auto_connect,
            state: Mutex::new(state),
            config: Mutex::new(config),
            set_configuration_calls: AtomicUsize::new(0),
            negotiate_calls: AtomicUsize::new(0),
            offers: Mutex::new(Vec::new()),
            remote_descriptions: Mutex::new(Vec::new()),
            local_descriptions: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            rtt: AtomicU32::new(0),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            handlers: TransportHandlers::default(),
            rtt_handler: Mutex::new(options.on_rtt_update),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drives the ICE state and notifies the engine, as the stack would.
    pub fn set_ice_state(&self, state: IceConnectionState) {
        *self.state.lock() = state;
        if let Some(handler) = self.handlers.on_state_change.lock().as_mut() {
            handler(state);
        }
    }

    pub fn emit_candidate(&self, candidate: Option<IceCandidateInit>) {
        if let Some(handler) = self.handlers.on_ice_candidate.lock().as_mut() {
            handler(candidate);
        }
    }

    pub fn emit_data_channel(&self, channel: Arc<FakeDataChannel>) {
        if let Some(handler) = self.handlers.on_data_channel.lock().as_mut() {
            handler(channel);
        }
    }

    pub fn emit_track(&self, track: Arc<dyn MediaTrack>) {
        if let Some(handler) = self.handlers.on_track.lock().as_mut() {
            handler(track);
        }
    }

    /// Calls the RTT callback the factory installed, if any.
    pub fn report_rtt(&self, rtt: u32) {
        if let Some(handler) = self.rtt_handler.lock().as_ref() {
            handler(rtt);
        }
    }

    pub fn data_channel(&self, label: &str) -> Arc<FakeDataChannel> {
        self.channels
            .lock()
            .iter()
            .find(|channel| channel.label() == label)
            .cloned()
            .expect("data channel not created")
    }

    fn fire_offer(&self, options: OfferOptions) {
        self.offers.lock().push(options);
        if self.auto_connect {
            *self.state.lock() = IceConnectionState::Connected;
        }
        if let Some(handler) = self.handlers.on_offer.lock().as_mut() {
            handler(SessionDescription {
                sdp_type: SdpType::Offer,
                sdp: "fake-offer".to_owned(),
            });
        }
    }
}

#[async_trait]
impl PcTransport for FakeTransport {
    fn signal_target(&self) -> proto::SignalTarget {
        self.target
    }

    fn is_connected(&self) -> bool {
        matches!(
            *self.state.lock(),
            IceConnectionState::Connected | IceConnectionState::Completed
        )
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        *self.state.lock()
    }

    fn selected_candidate_pair(&self) -> Option<CandidatePair> {
        self.is_connected().then(|| CandidatePair {
            local: "local-host".to_owned(),
            remote: "remote-host".to_owned(),
        })
    }

    fn negotiate(&self) {
        self.negotiate_calls.fetch_add(1, Ordering::SeqCst);
        self.fire_offer(OfferOptions::default());
    }

    async fn create_and_send_offer(&self, options: OfferOptions) -> Result<(), RtcError> {
        self.fire_offer(options);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        self.remote_descriptions.lock().push(description);
        // pending candidates applied, the description is settled
        if let Some(handler) = self.handlers.on_settled.lock().as_mut() {
            handler();
        }
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        Ok(SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: "fake-answer".to_owned(),
        })
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        self.local_descriptions.lock().push(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), RtcError> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    fn set_configuration(&self, config: RtcConfiguration) -> Result<(), RtcError> {
        self.set_configuration_calls.fetch_add(1, Ordering::SeqCst);
        *self.config.lock() = config;
        Ok(())
    }

    fn create_data_channel(
        &self,
        label: &str,
        init: DataChannelInit,
    ) -> Result<Arc<dyn DataChannel>, RtcError> {
        let channel = FakeDataChannel::new(label, init);
        self.channels.lock().push(channel.clone());
        let channel: Arc<dyn DataChannel> = channel;
        Ok(channel)
    }

    fn set_rtt(&self, rtt: u32) {
        self.rtt.store(rtt, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn on_offer(&self, handler: Option<OnOffer>) {
        *self.handlers.on_offer.lock() = handler;
    }
    fn on_ice_candidate(&self, handler: Option<OnIceCandidate>) {
        *self.handlers.on_ice_candidate.lock() = handler;
    }
    fn on_ice_connection_state_change(&self, handler: Option<OnIceConnectionStateChange>) {
        *self.handlers.on_state_change.lock() = handler;
    }
    fn on_track(&self, handler: Option<OnTrack>) {
        *self.handlers.on_track.lock() = handler;
    }
    fn on_data_channel(&self, handler: Option<OnDataChannel>) {
        *self.handlers.on_data_channel.lock() = handler;
    }
    fn on_remote_description_settled(&self, handler: Option<OnRemoteDescriptionSettled>) {
        *self.handlers.on_settled.lock() = handler;
    }
}

pub struct FakeDataChannel {
    label: String,
    pub init: DataChannelInit,
    pub state: Mutex<DataChannelState>,
    pub sent: Mutex<Vec<(Vec<u8>, bool)>>,
    buffered_amount: Mutex<u64>,
    threshold: Mutex<u64>,
    on_message: Mutex<Option<OnMessage>>,
}

impl FakeDataChannel {
    pub fn new(label: &str, init: DataChannelInit) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_owned(),
            init,
            state: Mutex::new(DataChannelState::Open),
            sent: Mutex::new(Vec::new()),
            buffered_amount: Mutex::new(0),
            threshold: Mutex::new(65536),
            on_message: Mutex::new(None),
        })
    }

    /// Delivers an inbound frame to the attached handler.
    pub fn receive(&self, data: Vec<u8>, binary: bool) {
        if let Some(handler) = self.on_message.lock().as_mut() {
            handler(DataChannelMessage { data, binary });
        }
    }

    pub fn has_message_handler(&self) -> bool {
        self.on_message.lock().is_some()
    }

    pub fn set_buffered_amount(&self, amount: u64) {
        *self.buffered_amount.lock() = amount;
    }

    pub fn set_threshold(&self, threshold: u64) {
        *self.threshold.lock() = threshold;
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().iter().map(|(data, _)| data.clone()).collect()
    }
}

impl DataChannel for FakeDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn ready_state(&self) -> DataChannelState {
        *self.state.lock()
    }

    fn send(&self, data: &[u8], binary: bool) -> Result<(), RtcError> {
        self.sent.lock().push((data.to_vec(), binary));
        Ok(())
    }

    fn buffered_amount(&self) -> u64 {
        *self.buffered_amount.lock()
    }

    fn buffered_amount_low_threshold(&self) -> u64 {
        *self.threshold.lock()
    }

    fn on_message(&self, handler: Option<OnMessage>) {
        *self.on_message.lock() = handler;
    }

    fn close(&self) {
        *self.state.lock() = DataChannelState::Closed;
    }
}

/// Factory producing [`FakeTransport`]s. With `auto_connect`, transports
/// start out ICE-connected and reconnect as soon as an offer fires.
pub struct FakeRtc {
    auto_connect: bool,
    pub transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeRtc {
    pub fn new(auto_connect: bool) -> Arc<Self> {
        Arc::new(Self {
            auto_connect,
            transports: Mutex::new(Vec::new()),
        })
    }

    /// The most recently created transport for the given role.
    fn latest(&self, target: proto::SignalTarget) -> Arc<FakeTransport> {
        self.transports
            .lock()
            .iter()
            .rev()
            .find(|transport| transport.target == target)
            .cloned()
            .expect("transport not created")
    }

    pub fn publisher(&self) -> Arc<FakeTransport> {
        self.latest(proto::SignalTarget::Publisher)
    }

    pub fn subscriber(&self) -> Arc<FakeTransport> {
        self.latest(proto::SignalTarget::Subscriber)
    }

    pub fn transport_count(&self) -> usize {
        self.transports.lock().len()
    }
}

impl PcFactory for FakeRtc {
    fn create_transport(
        &self,
        target: proto::SignalTarget,
        config: RtcConfiguration,
        options: TransportOptions,
    ) -> Result<Arc<dyn PcTransport>, RtcError> {
        let transport = FakeTransport::new(target, config, options, self.auto_connect);
        self.transports.lock().push(transport.clone());
        let transport: Arc<dyn PcTransport> = transport;
        Ok(transport)
    }
}

pub fn join_response(subscriber_primary: bool, fast_publish: bool) -> proto::JoinResponse {
    proto::JoinResponse {
        room: Some(proto::Room {
            sid: "RM_test".to_owned(),
            name: "test".to_owned(),
            ..Default::default()
        }),
        participant: Some(proto::ParticipantInfo {
            sid: "PA_local".to_owned(),
            identity: "local".to_owned(),
            ..Default::default()
        }),
        subscriber_primary,
        fast_publish,
        ..Default::default()
    }
}

pub fn user_packet(payload: &[u8]) -> proto::DataPacket {
    proto::DataPacket {
        value: Some(proto::data_packet::Value::User(proto::UserPacket {
            payload: payload.to_vec(),
            ..Default::default()
        })),
        ..Default::default()
    }
}

pub fn sdp(sdp_type: SdpType, sdp: &str) -> SessionDescription {
    SessionDescription {
        sdp_type,
        sdp: sdp.to_owned(),
    }
}

/// Builds an engine wired to fresh fakes; does not join.
pub fn new_engine(
    subscriber_primary: bool,
    fast_publish: bool,
    auto_connect: bool,
) -> (RtcEngine, Arc<FakeSignalClient>, Arc<FakeRtc>) {
    let client = FakeSignalClient::new();
    client.push_join_result(Ok(join_response(subscriber_primary, fast_publish)));
    let rtc = FakeRtc::new(auto_connect);
    let engine = RtcEngine::new(client.clone(), rtc.clone());
    (engine, client, rtc)
}

/// Builds an engine and joins it, with transports auto-connecting.
pub async fn connect(
    subscriber_primary: bool,
    fast_publish: bool,
) -> (RtcEngine, Arc<FakeSignalClient>, Arc<FakeRtc>) {
    let (engine, client, rtc) = new_engine(subscriber_primary, fast_publish, true);
    engine
        .join(TEST_URL, TEST_TOKEN, ConnectParams::default())
        .await
        .expect("join failed");
    (engine, client, rtc)
}

/// Polls a condition until it holds, panicking after a generous deadline.
/// The deadline is in virtual time and covers the full backoff schedule.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(300);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met in time");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
