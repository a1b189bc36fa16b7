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

use serde::{Deserialize, Serialize};

/// A packet exchanged over the `_reliable` / `_lossy` data channels.
///
/// Binary frames use the compact protobuf encoding, text frames the JSON
/// protocol encoding.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataPacket {
    /// Channel kind the packet was sent over. Deprecated on the wire, kept
    /// for compatibility with older senders.
    #[prost(enumeration = "data_packet::Kind", tag = "1")]
    pub kind: i32,
    /// Identity of the sending participant, stamped by the server.
    #[prost(string, tag = "4")]
    pub participant_identity: String,
    #[prost(string, repeated, tag = "5")]
    pub destination_identities: Vec<String>,
    /// Monotonic sequence number, stamped on reliable packets only.
    #[prost(uint32, tag = "16")]
    pub sequence: u32,
    #[prost(
        oneof = "data_packet::Value",
        tags = "2, 6, 7, 10, 11, 12, 13, 14, 15"
    )]
    #[serde(flatten)]
    pub value: Option<data_packet::Value>,
}

pub mod data_packet {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Kind {
        Reliable = 0,
        Lossy = 1,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub enum Value {
        #[prost(message, tag = "2")]
        User(super::UserPacket),
        #[prost(message, tag = "6")]
        SipDtmf(super::SipDtmf),
        #[prost(message, tag = "7")]
        Transcription(super::Transcription),
        #[prost(message, tag = "10")]
        RpcRequest(super::RpcRequest),
        #[prost(message, tag = "11")]
        RpcAck(super::RpcAck),
        #[prost(message, tag = "12")]
        RpcResponse(super::RpcResponse),
        #[prost(message, tag = "13")]
        StreamHeader(super::data_stream::Header),
        #[prost(message, tag = "14")]
        StreamChunk(super::data_stream::Chunk),
        #[prost(message, tag = "15")]
        StreamTrailer(super::data_stream::Trailer),
    }
}

/// An application payload published by a participant.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserPacket {
    /// Deprecated: the enclosing packet carries the identity. Receivers fill
    /// this in when absent, for compatibility with older senders.
    #[prost(string, tag = "1")]
    pub participant_identity: String,
    #[prost(bytes = "vec", tag = "2")]
    #[serde(with = "crate::serde_b64")]
    pub payload: Vec<u8>,
    /// Deprecated: the enclosing packet carries the destinations.
    #[prost(string, repeated, tag = "3")]
    pub destination_identities: Vec<String>,
    #[prost(string, optional, tag = "4")]
    pub topic: Option<String>,
}

/// A DTMF digit relayed from a SIP participant.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SipDtmf {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub digit: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Transcription {
    #[prost(string, tag = "1")]
    pub transcribed_participant_identity: String,
    #[prost(string, tag = "2")]
    pub track_id: String,
    #[prost(message, repeated, tag = "3")]
    pub segments: Vec<TranscriptionSegment>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TranscriptionSegment {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub text: String,
    #[prost(uint64, tag = "3")]
    pub start_time: u64,
    #[prost(uint64, tag = "4")]
    pub end_time: u64,
    #[prost(bool, tag = "5")]
    pub r#final: bool,
    #[prost(string, tag = "6")]
    pub language: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RpcRequest {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub method: String,
    #[prost(string, tag = "3")]
    pub payload: String,
    #[prost(uint32, tag = "4")]
    pub response_timeout_ms: u32,
    #[prost(uint32, tag = "5")]
    pub version: u32,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RpcAck {
    #[prost(string, tag = "1")]
    pub request_id: String,
}

/// Exactly one of payload or error is set.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RpcResponse {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(oneof = "rpc_response::Value", tags = "2, 3")]
    #[serde(flatten)]
    pub value: Option<rpc_response::Value>,
}

pub mod rpc_response {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, PartialEq, ::prost::Oneof, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub enum Value {
        #[prost(string, tag = "2")]
        Payload(String),
        #[prost(message, tag = "3")]
        Error(super::RpcError),
    }
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RpcError {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(string, tag = "3")]
    pub data: String,
}

pub mod data_stream {
    use serde::{Deserialize, Serialize};

    /// Announces an incoming stream; sent before any chunk.
    #[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct Header {
        #[prost(string, tag = "1")]
        pub stream_id: String,
        #[prost(int64, tag = "2")]
        pub timestamp: i64,
        #[prost(string, tag = "3")]
        pub topic: String,
        #[prost(string, tag = "4")]
        pub mime_type: String,
        #[prost(uint64, optional, tag = "5")]
        pub total_length: Option<u64>,
    }

    #[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct Chunk {
        #[prost(string, tag = "1")]
        pub stream_id: String,
        #[prost(uint64, tag = "2")]
        pub chunk_index: u64,
        #[prost(bytes = "vec", tag = "3")]
        #[serde(with = "crate::serde_b64")]
        pub content: Vec<u8>,
    }

    /// Closes a stream; an empty reason means normal completion.
    #[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct Trailer {
        #[prost(string, tag = "1")]
        pub stream_id: String,
        #[prost(string, tag = "2")]
        pub reason: String,
    }
}
