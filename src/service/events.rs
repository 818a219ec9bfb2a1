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

//! Events the service publishes to its observers.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use super::state::{Role, ServiceState};
use crate::bluetooth::{BridgeState, ListItem};

const BUS_CAPACITY: usize = 256;

/// Outbound notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum ServiceEvent {
    Connected {
        name: String,
        address: String,
    },
    Disconnected {
        name: String,
        address: String,
    },
    DataReceived {
        name: String,
        address: String,
        text: String,
    },
    DeviceDiscovered {
        name: String,
        address: String,
        rssi: Option<i16>,
    },
    /// A device joined the guarded set, or on a mobile, the beacon accepted us.
    Registered {
        name: String,
        address: String,
    },
    Unregistered {
        address: String,
    },
    UpdateLost {
        name: String,
        address: String,
        lost: bool,
    },
    UpdateFound {
        name: String,
        address: String,
        rssi: i16,
    },
    RegistrationStarted,
    RegistrationFinished,
    ListReceived {
        items: Vec<ListItem>,
    },
    /// OK or ERR reply from the beacon.
    PeerReply {
        ok: bool,
        detail: String,
    },
    /// Report window acknowledged by the beacon.
    ReportWindow {
        window_ms: u64,
    },
    StateChanged {
        state: ServiceState,
        role: Role,
    },
    BluetoothState {
        state: BridgeState,
    },
}

/// Fan-out of service events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServiceEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }
}

impl EventBus {
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ServiceEvent) {
        if self.tx.send(event).is_err() {
            debug!("No event subscribers");
        }
    }
}
