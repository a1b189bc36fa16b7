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

//! Wire protocol types for the mediaroom signaling and data planes.
//!
//! These are hand-maintained prost messages mirroring the server schema.
//! The data-packet tree additionally derives serde so that text frames can
//! be exchanged using the JSON protocol encoding.

mod data;
mod serde_b64;
mod signal;

pub use data::*;
pub use signal::*;
