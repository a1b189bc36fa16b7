use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use tokio::sync::mpsc;

use mediaroom_protocol as proto;

use crate::rtc::{
    DataChannel, IceCandidateInit, IceConnectionState, MediaTrack, OnDataChannel, OnIceCandidate,
    OnIceConnectionStateChange, OnMessage, OnOffer, OnRemoteDescriptionSettled, OnTrack,
    PcTransport, SessionDescription,
};

pub type RtcEmitter = mpsc::UnboundedSender<RtcEvent>;
pub type RtcEvents = mpsc::UnboundedReceiver<RtcEvent>;

pub enum RtcEvent {
    IceCandidate {
        // None is the end-of-candidates sentinel
        candidate: Option<IceCandidateInit>,
        target: proto::SignalTarget,
    },
    ConnectionChange {
        state: IceConnectionState,
        target: proto::SignalTarget,
    },
    DataChannel {
        channel: Arc<dyn DataChannel>,
        target: proto::SignalTarget,
    },
    Offer {
        offer: SessionDescription,
        target: proto::SignalTarget,
    },
    RemoteDescriptionSettled {
        target: proto::SignalTarget,
    },
    MediaTrack {
        track: Arc<dyn MediaTrack>,
    },
    Data {
        data: Vec<u8>,
        binary: bool,
    },
}

impl Debug for RtcEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IceCandidate { candidate, target } => f
                .debug_struct("IceCandidate")
                .field("candidate", candidate)
                .field("target", target)
                .finish(),
            Self::ConnectionChange { state, target } => f
                .debug_struct("ConnectionChange")
                .field("state", state)
                .field("target", target)
                .finish(),
            Self::DataChannel { channel, target } => f
                .debug_struct("DataChannel")
                .field("label", &channel.label())
                .field("target", target)
                .finish(),
            Self::Offer { offer, target } => f
                .debug_struct("Offer")
                .field("offer", offer)
                .field("target", target)
                .finish(),
            Self::RemoteDescriptionSettled { target } => f
                .debug_struct("RemoteDescriptionSettled")
                .field("target", target)
                .finish(),
            Self::MediaTrack { track } => {
                f.debug_struct("MediaTrack").field("id", &track.id()).finish()
            }
            Self::Data { data, binary } => f
                .debug_struct("Data")
                .field("len", &data.len())
                .field("binary", binary)
                .finish(),
        }
    }
}

/// Handlers used to forward transport events onto the engine's channel.
/// Every callback here is invoked on the implementation's signaling thread.

fn on_ice_candidate(target: proto::SignalTarget, emitter: RtcEmitter) -> OnIceCandidate {
    Box::new(move |candidate| {
        let _ = emitter.send(RtcEvent::IceCandidate { candidate, target });
    })
}

fn on_connection_state_change(
    target: proto::SignalTarget,
    emitter: RtcEmitter,
) -> OnIceConnectionStateChange {
    Box::new(move |state| {
        let _ = emitter.send(RtcEvent::ConnectionChange { state, target });
    })
}

fn on_data_channel(target: proto::SignalTarget, emitter: RtcEmitter) -> OnDataChannel {
    Box::new(move |channel| {
        let _ = emitter.send(RtcEvent::DataChannel { channel, target });
    })
}

fn on_offer(target: proto::SignalTarget, emitter: RtcEmitter) -> OnOffer {
    Box::new(move |offer| {
        let _ = emitter.send(RtcEvent::Offer { offer, target });
    })
}

fn on_remote_description_settled(
    target: proto::SignalTarget,
    emitter: RtcEmitter,
) -> OnRemoteDescriptionSettled {
    Box::new(move || {
        let _ = emitter.send(RtcEvent::RemoteDescriptionSettled { target });
    })
}

fn on_track(emitter: RtcEmitter) -> OnTrack {
    Box::new(move |track| {
        let _ = emitter.send(RtcEvent::MediaTrack { track });
    })
}

fn on_message(emitter: RtcEmitter) -> OnMessage {
    Box::new(move |message| {
        let _ = emitter.send(RtcEvent::Data {
            data: message.data,
            binary: message.binary,
        });
    })
}

pub fn forward_pc_events(transport: &Arc<dyn PcTransport>, emitter: RtcEmitter) {
    let target = transport.signal_target();
    transport.on_ice_candidate(Some(on_ice_candidate(target, emitter.clone())));
    transport.on_ice_connection_state_change(Some(on_connection_state_change(
        target,
        emitter.clone(),
    )));
    transport.on_data_channel(Some(on_data_channel(target, emitter.clone())));
    transport.on_track(Some(on_track(emitter.clone())));
    transport.on_remote_description_settled(Some(on_remote_description_settled(
        target,
        emitter.clone(),
    )));
    transport.on_offer(Some(on_offer(target, emitter)));
}

pub fn forward_dc_events(channel: &Arc<dyn DataChannel>, emitter: RtcEmitter) {
    channel.on_message(Some(on_message(emitter)));
}
