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

//! Bluetooth UUIDs and timing constants for the finder protocol.

use std::time::Duration;
use uuid::Uuid;

/// Standard SPP UUID used by the classic RFCOMM service.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// Finder GATT service UUID.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x5f1d0c2a_7b3e_4c61_9a8d_2e4b6f0a1c00);

/// Command RX characteristic UUID (the mobile writes requests here).
/// Properties: Write, Write Without Response
pub const COMMAND_RX_UUID: Uuid = Uuid::from_u128(0x5f1d0c2a_7b3e_4c61_9a8d_2e4b6f0a1c01);

/// Response TX characteristic UUID (the beacon notifies responses here).
/// Properties: Notify
pub const RESPONSE_TX_UUID: Uuid = Uuid::from_u128(0x5f1d0c2a_7b3e_4c61_9a8d_2e4b6f0a1c02);

/// Terminates every message carried in BLE notifications.
pub const MESSAGE_DELIMITER: u8 = b';';

/// BLE configuration constants.
pub mod config {
    use super::Duration;

    /// Default MTU (minimum for all BLE devices).
    pub const DEFAULT_MTU: usize = 23;

    /// ATT protocol overhead (3 bytes).
    pub const ATT_OVERHEAD: usize = 3;

    /// Scans stop on their own after this long.
    pub const SCAN_CEILING: Duration = Duration::from_secs(10);

    /// Pause between two queued characteristic requests.
    pub const REQUEST_DELAY: Duration = Duration::from_millis(500);

    /// Largest characteristic value that fits one notification or write.
    pub fn effective_payload_size(mtu: usize) -> usize {
        mtu.saturating_sub(ATT_OVERHEAD).max(1)
    }
}

/// Classic RFCOMM constants.
pub mod rfcomm {
    use super::Duration;

    /// RFCOMM channel to use.
    pub const CHANNEL: u8 = 1;

    /// How long a connect call waits for the link to come up.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

    /// Largest read a connection accepts before treating the link as faulty.
    pub const MAX_PENDING_BYTES: usize = 255;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            SERVICE_UUID.to_string().to_lowercase(),
            "5f1d0c2a-7b3e-4c61-9a8d-2e4b6f0a1c00"
        );
        assert_eq!(
            SPP_UUID.to_string().to_lowercase(),
            "00001101-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_effective_payload() {
        assert_eq!(config::effective_payload_size(23), 20);
        assert_eq!(config::effective_payload_size(512), 509);
        assert_eq!(config::effective_payload_size(0), 1);
    }
}
