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

//! Daemon-side processing of service events.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use crate::service::ServiceEvent;
use crate::storage::RegisteredStore;

/// Keeps the registered-device store in step with the service and logs
/// what happens.
pub struct EventProcessor {
    store: Arc<RegisteredStore>,
    /// Print events as JSON lines on stdout.
    echo: bool,
}

impl EventProcessor {
    pub fn new(store: Arc<RegisteredStore>) -> Self {
        Self { store, echo: false }
    }

    /// Also print every event as a JSON line.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Process events until the service goes away.
    pub async fn run(mut self, mut events: broadcast::Receiver<ServiceEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = self.process_event(&event) {
                        error!("Error processing event: {}", e);
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!("Event processor missed {} events", missed),
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Event processor stopped");
    }

    /// Process a single event.
    pub fn process_event(&mut self, event: &ServiceEvent) -> Result<()> {
        if self.echo {
            println!("{}", serde_json::to_string(event)?);
        }

        match event {
            ServiceEvent::Connected { name, address } => {
                info!("Device connected: {} ({})", name, address);
            }
            ServiceEvent::Disconnected { name, address } => {
                info!("Device disconnected: {} ({})", name, address);
            }
            ServiceEvent::Registered { name, address } => {
                self.store.add(name, address)?;
                info!("Saved registered device {} ({})", name, address);
            }
            ServiceEvent::Unregistered { address } => {
                if self.store.remove(address)? {
                    info!("Forgot registered device {}", address);
                }
            }
            ServiceEvent::UpdateLost {
                name,
                address,
                lost: true,
            } => {
                warn!("{} ({}) is lost", name, address);
            }
            ServiceEvent::ListReceived { items } => {
                for item in items {
                    info!("  {} {} {}", item.address, item.status.as_str(), item.name);
                }
            }
            ServiceEvent::PeerReply { ok: false, detail } => {
                warn!("Beacon refused: {}", detail);
            }
            ServiceEvent::StateChanged { state, role } => {
                info!("State: {} (role {})", state.as_str(), role.as_str());
            }
            ServiceEvent::BluetoothState { state } => {
                info!("Bluetooth: {}", state.as_str());
            }
            other => debug!("{:?}", other),
        }
        Ok(())
    }
}
