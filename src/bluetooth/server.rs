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

//! BlueZ radio for the classic RFCOMM bridge.

use anyhow::Result;
use async_trait::async_trait;
use bluer::rfcomm::{Listener, SocketAddr, Stream};
use bluer::{Adapter, AdapterEvent, Address};
use futures::{pin_mut, StreamExt};
use std::io;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::ble_constants::SPP_UUID;
use super::bridge::DiscoveredDevice;
use super::connection::BoxedStream;
use super::rfcomm::{Peer, SocketAcceptor, SocketRadio};
use crate::error::{FinderError, FinderResult};

/// Classic sockets and discovery on the default BlueZ adapter.
pub struct BluezRadio {
    adapter: Adapter,
    channel: u8,
}

impl BluezRadio {
    /// Open the default adapter, power it on and make it discoverable.
    pub async fn new(device_name: &str, channel: u8) -> Result<Self> {
        info!("Initializing Bluetooth radio...");

        // Create BlueZ session
        let session = bluer::Session::new().await?;
        info!("BlueZ session created");

        // Get the default adapter
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        // Ensure adapter is powered on
        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        adapter.set_alias(device_name.to_string()).await?;
        adapter.set_discoverable(true).await?;
        adapter.set_pairable(true).await?;
        info!(
            "Adapter {} is discoverable as '{}'",
            adapter.address().await?,
            device_name
        );

        Ok(Self { adapter, channel })
    }
}

/// Best available display name for a remote device.
pub(crate) async fn device_name(adapter: &Adapter, address: Address) -> String {
    let Ok(device) = adapter.device(address) else {
        return address.to_string();
    };
    match device.name().await {
        Ok(Some(name)) => name,
        _ => device
            .alias()
            .await
            .unwrap_or_else(|_| address.to_string()),
    }
}

/// Report every device the adapter announces until `found` closes.
pub(crate) async fn report_devices(
    adapter: &Adapter,
    found: &mpsc::Sender<DiscoveredDevice>,
) -> FinderResult<()> {
    let events = adapter
        .discover_devices()
        .await
        .map_err(|e| FinderError::TransportUnavailable(e.to_string()))?;
    pin_mut!(events);

    while let Some(event) = events.next().await {
        if let AdapterEvent::DeviceAdded(address) = event {
            let rssi = match adapter.device(address) {
                Ok(device) => device.rssi().await.ok().flatten(),
                Err(_) => None,
            };
            let device = DiscoveredDevice {
                name: device_name(adapter, address).await,
                address: address.to_string(),
                rssi,
            };
            if found.send(device).await.is_err() {
                debug!("Discovery receiver closed");
                break;
            }
        }
    }
    Ok(())
}

struct RfcommAcceptor {
    listener: Listener,
    adapter: Adapter,
}

#[async_trait]
impl SocketAcceptor for RfcommAcceptor {
    async fn accept(&mut self) -> io::Result<(BoxedStream, Peer)> {
        let (stream, remote) = self.listener.accept().await?;
        let peer = Peer {
            name: device_name(&self.adapter, remote.addr).await,
            address: remote.addr.to_string(),
        };
        Ok((Box::new(stream), peer))
    }
}

#[async_trait]
impl SocketRadio for BluezRadio {
    async fn is_powered(&self) -> FinderResult<bool> {
        self.adapter
            .is_powered()
            .await
            .map_err(|e| FinderError::TransportUnavailable(e.to_string()))
    }

    async fn bind(&self) -> io::Result<Box<dyn SocketAcceptor>> {
        let local_addr = SocketAddr::new(Address::any(), self.channel);
        let listener = Listener::bind(local_addr).await?;
        info!(
            "RFCOMM server listening on channel {} (SPP {})",
            self.channel, SPP_UUID
        );
        Ok(Box::new(RfcommAcceptor {
            listener,
            adapter: self.adapter.clone(),
        }))
    }

    async fn connect(&self, address: &str) -> io::Result<(BoxedStream, Peer)> {
        let target: Address = address
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, address.to_string()))?;
        let stream = Stream::connect(SocketAddr::new(target, self.channel)).await?;
        let peer = Peer {
            name: device_name(&self.adapter, target).await,
            address: address.to_string(),
        };
        Ok((Box::new(stream), peer))
    }

    async fn discover(&self, found: mpsc::Sender<DiscoveredDevice>) -> FinderResult<()> {
        report_devices(&self.adapter, &found).await
    }
}
