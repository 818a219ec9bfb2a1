// Copyright 2026 Daniel Pelikan
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

//! Bluetooth communication module.
//!
//! Transport bridges (classic RFCOMM and BLE GATT), link handling and the
//! finder line protocol.

pub mod ble_constants;
pub mod bridge;
pub mod connection;
pub mod framing;
pub mod gatt_queue;
pub mod protocol;
pub mod rfcomm;

#[cfg(feature = "bluez")]
mod gatt_server;
#[cfg(feature = "bluez")]
mod server;

pub use bridge::{
    is_valid_address, BridgeCore, BridgeEvent, BridgeState, ConnectionInfo, DiscoveredDevice,
    Link, TransportBridge,
};
pub use connection::{BoxedStream, ClassicLink, LinkStream};
pub use protocol::{decode_stream, GuardStatus, ListItem, Message, DEFAULT_REPORT_WINDOW_MS};
pub use rfcomm::{Peer, RfcommBridge, SocketAcceptor, SocketRadio};

#[cfg(feature = "bluez")]
pub use gatt_server::{GattBridge, GattTiming};
#[cfg(feature = "bluez")]
pub use server::BluezRadio;
