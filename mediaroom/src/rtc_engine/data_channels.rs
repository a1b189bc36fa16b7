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

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use prost::Message;

use mediaroom_protocol as proto;

use super::{EngineError, EngineResult};
use crate::rtc::{DataChannel, DataChannelState};
use crate::DataPacketKind;

pub const LOSSY_DC_LABEL: &str = "_lossy";
pub const RELIABLE_DC_LABEL: &str = "_reliable";

#[derive(Default)]
struct Slots {
    reliable: Option<Arc<dyn DataChannel>>,
    lossy: Option<Arc<dyn DataChannel>>,
    sub_reliable: Option<Arc<dyn DataChannel>>,
    sub_lossy: Option<Arc<dyn DataChannel>>,
}

/// Owns the publisher-side data channels and the subscriber-side channels
/// received from the server.
///
/// The slot lock and the sequence lock are deliberately separate: folding
/// them would serialize slot reads behind every reliable send.
pub(crate) struct DataChannels {
    slots: RwLock<Slots>,
    // Held across stamp, encode and send so wire order matches sequence order.
    reliable_seq: Mutex<u32>,
}

impl DataChannels {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Slots::default()),
            reliable_seq: Mutex::new(1),
        }
    }

    /// Starts a new connection epoch: the next reliable packet is stamped 1.
    pub fn reset_sequence(&self) {
        *self.reliable_seq.lock() = 1;
    }

    pub fn set_publisher_channels(
        &self,
        lossy: Arc<dyn DataChannel>,
        reliable: Arc<dyn DataChannel>,
    ) {
        let mut slots = self.slots.write();
        slots.lossy = Some(lossy);
        slots.reliable = Some(reliable);
    }

    /// Routes a subscriber-side channel into its slot by label. Returns false
    /// for unknown labels, which are ignored.
    pub fn route_subscriber_channel(&self, channel: Arc<dyn DataChannel>) -> bool {
        let mut slots = self.slots.write();
        match channel.label().as_str() {
            RELIABLE_DC_LABEL => slots.sub_reliable = Some(channel),
            LOSSY_DC_LABEL => slots.sub_lossy = Some(channel),
            _ => return false,
        }
        true
    }

    pub fn get(
        &self,
        target: proto::SignalTarget,
        kind: DataPacketKind,
    ) -> Option<Arc<dyn DataChannel>> {
        let slots = self.slots.read();
        match (target, kind) {
            (proto::SignalTarget::Publisher, DataPacketKind::Reliable) => slots.reliable.clone(),
            (proto::SignalTarget::Publisher, DataPacketKind::Lossy) => slots.lossy.clone(),
            (proto::SignalTarget::Subscriber, DataPacketKind::Reliable) => {
                slots.sub_reliable.clone()
            }
            (proto::SignalTarget::Subscriber, DataPacketKind::Lossy) => slots.sub_lossy.clone(),
        }
    }

    pub fn publisher_channels_ready(&self) -> bool {
        let slots = self.slots.read();
        let open = |channel: &Option<Arc<dyn DataChannel>>| {
            channel
                .as_ref()
                .is_some_and(|channel| channel.ready_state() == DataChannelState::Open)
        };
        open(&slots.reliable) && open(&slots.lossy)
    }

    /// Encodes and sends a packet on the matching publisher channel.
    ///
    /// Reliable packets are stamped with the next sequence number under the
    /// sequence lock, which stays held through the send.
    pub fn publish(&self, mut packet: proto::DataPacket, kind: DataPacketKind) -> EngineResult<()> {
        let channel = self
            .get(proto::SignalTarget::Publisher, kind)
            .ok_or(EngineError::DataChannelNotFound)?;

        match kind {
            DataPacketKind::Reliable => {
                let mut seq = self.reliable_seq.lock();
                packet.sequence = *seq;
                *seq += 1;
                channel.send(&packet.encode_to_vec(), true)?;
            }
            DataPacketKind::Lossy => {
                channel.send(&packet.encode_to_vec(), true)?;
            }
        }
        Ok(())
    }

    pub fn is_buffer_status_low(&self, kind: DataPacketKind) -> bool {
        match self.get(proto::SignalTarget::Publisher, kind) {
            Some(channel) => channel.buffered_amount() <= channel.buffered_amount_low_threshold(),
            None => false,
        }
    }
}

/// Decodes an inbound data-channel frame. Text frames use the JSON protocol
/// encoding, binary frames the compact encoding.
pub(crate) fn decode_data_packet(data: &[u8], binary: bool) -> EngineResult<proto::DataPacket> {
    if binary {
        Ok(proto::DataPacket::decode(data)?)
    } else {
        Ok(serde_json::from_slice(data)?)
    }
}
