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

//! Abstraction boundary over the underlying WebRTC stack.
//!
//! The engine drives peer connections only through [`PcTransport`] and
//! [`DataChannel`], and obtains them from a [`PcFactory`]. A production
//! build binds these to a native WebRTC implementation; tests bind fakes.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use mediaroom_protocol as proto;

#[derive(Error, Debug)]
pub enum RtcError {
    #[error("sdp failure: {0}")]
    Sdp(String),
    #[error("ice failure: {0}")]
    Ice(String),
    #[error("data channel failure: {0}")]
    DataChannel(String),
    #[error("internal rtc failure: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    PrAnswer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

/// A trickled candidate in its signaling form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidateInit {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IceTransportsType {
    None,
    Relay,
    NoHost,
    #[default]
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_type: IceTransportsType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelInit {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

impl Default for DataChannelInit {
    fn default() -> Self {
        Self {
            ordered: true,
            max_retransmits: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OfferOptions {
    pub ice_restart: bool,
}

/// The candidate pair ICE selected for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePair {
    pub local: String,
    pub remote: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Outbound pacing strategy applied to the sending transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacer {
    NoQueue,
    LeakyBucket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interceptor {
    Nack,
    RtcpReports,
    Twcc,
}

pub struct DataChannelMessage {
    pub data: Vec<u8>,
    /// False for text frames, which use the JSON protocol encoding.
    pub binary: bool,
}

pub type OnOffer = Box<dyn FnMut(SessionDescription) + Send + Sync>;
pub type OnIceCandidate = Box<dyn FnMut(Option<IceCandidateInit>) + Send + Sync>;
pub type OnIceConnectionStateChange = Box<dyn FnMut(IceConnectionState) + Send + Sync>;
pub type OnTrack = Box<dyn FnMut(Arc<dyn MediaTrack>) + Send + Sync>;
pub type OnDataChannel = Box<dyn FnMut(Arc<dyn DataChannel>) + Send + Sync>;
pub type OnRemoteDescriptionSettled = Box<dyn FnMut() + Send + Sync>;
pub type OnMessage = Box<dyn FnMut(DataChannelMessage) + Send + Sync>;
pub type OnRttUpdate = Box<dyn Fn(u32) + Send + Sync>;

/// Creation parameters for a single transport.
#[derive(Default)]
pub struct TransportOptions {
    pub is_sender: bool,
    /// 0 lets the implementation pick its default.
    pub retransmit_buffer_size: u16,
    pub pacer: Option<Pacer>,
    pub interceptors: Vec<Interceptor>,
    pub on_rtt_update: Option<OnRttUpdate>,
}

pub trait MediaTrack: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
}

pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    fn ready_state(&self) -> DataChannelState;
    fn send(&self, data: &[u8], binary: bool) -> Result<(), RtcError>;
    fn buffered_amount(&self) -> u64;
    fn buffered_amount_low_threshold(&self) -> u64;
    fn on_message(&self, handler: Option<OnMessage>);
    fn close(&self);
}

/// One ICE/DTLS/SRTP session in the publisher or subscriber role.
///
/// SDP operations follow the usual offer/answer choreography. Remote
/// candidates received before the remote description are expected to be
/// buffered by the implementation and applied once it settles;
/// [`PcTransport::on_remote_description_settled`] fires after that point.
#[async_trait]
pub trait PcTransport: Send + Sync {
    fn signal_target(&self) -> proto::SignalTarget;
    fn is_connected(&self) -> bool;
    fn ice_connection_state(&self) -> IceConnectionState;
    fn selected_candidate_pair(&self) -> Option<CandidatePair>;

    /// Requests a debounced renegotiation; the resulting offer is delivered
    /// through the [`PcTransport::on_offer`] handler.
    fn negotiate(&self);
    async fn create_and_send_offer(&self, options: OfferOptions) -> Result<(), RtcError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError>;
    async fn create_answer(&self) -> Result<SessionDescription, RtcError>;
    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), RtcError>;
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), RtcError>;
    fn set_configuration(&self, config: RtcConfiguration) -> Result<(), RtcError>;
    fn create_data_channel(
        &self,
        label: &str,
        init: DataChannelInit,
    ) -> Result<Arc<dyn DataChannel>, RtcError>;
    fn set_rtt(&self, rtt: u32);
    fn close(&self);

    fn on_offer(&self, handler: Option<OnOffer>);
    fn on_ice_candidate(&self, handler: Option<OnIceCandidate>);
    fn on_ice_connection_state_change(&self, handler: Option<OnIceConnectionStateChange>);
    fn on_track(&self, handler: Option<OnTrack>);
    fn on_data_channel(&self, handler: Option<OnDataChannel>);
    fn on_remote_description_settled(&self, handler: Option<OnRemoteDescriptionSettled>);
}

pub trait PcFactory: Send + Sync {
    fn create_transport(
        &self,
        target: proto::SignalTarget,
        config: RtcConfiguration,
        options: TransportOptions,
    ) -> Result<Arc<dyn PcTransport>, RtcError>;
}
