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

//! Classic Bluetooth bridge over stream sockets.
//!
//! The server role binds a listener and accepts one link at a time; the
//! client role connects out and waits for the link to come up.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::ble_constants::rfcomm::CONNECT_TIMEOUT;
use super::bridge::{
    is_valid_address, BridgeCore, BridgeEvent, BridgeState, ConnectionInfo, DiscoveredDevice,
    TransportBridge,
};
use super::connection::{BoxedStream, ClassicLink};
use crate::error::{FinderError, FinderResult};

/// Remote end of an accepted or connected socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub name: String,
    pub address: String,
}

/// A bound listening socket.
#[async_trait]
pub trait SocketAcceptor: Send {
    /// Wait for the next incoming connection.
    async fn accept(&mut self) -> io::Result<(BoxedStream, Peer)>;
}

/// Radio primitives the classic bridge is built on.
#[async_trait]
pub trait SocketRadio: Send + Sync + 'static {
    /// Check whether the radio is powered.
    async fn is_powered(&self) -> FinderResult<bool>;

    /// Bind a listening socket.
    async fn bind(&self) -> io::Result<Box<dyn SocketAcceptor>>;

    /// Open a socket to `address`.
    async fn connect(&self, address: &str) -> io::Result<(BoxedStream, Peer)>;

    /// Report nearby devices on `found` until the receiver closes.
    async fn discover(&self, found: mpsc::Sender<DiscoveredDevice>) -> FinderResult<()>;
}

#[derive(Default)]
struct Workers {
    acceptor: Option<JoinHandle<()>>,
    connector: Option<JoinHandle<()>>,
    discovery: Option<JoinHandle<()>>,
}

impl Workers {
    fn abort_all(&mut self) {
        for handle in [
            self.acceptor.take(),
            self.connector.take(),
            self.discovery.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

/// Classic bridge generic over the radio it drives.
pub struct RfcommBridge<R: SocketRadio> {
    radio: Arc<R>,
    core: Arc<BridgeCore>,
    workers: Mutex<Workers>,
    connect_timeout: Duration,
}

impl<R: SocketRadio> RfcommBridge<R> {
    /// Create a bridge over `radio`.
    pub fn new(radio: R) -> Self {
        Self::with_timeout(radio, CONNECT_TIMEOUT)
    }

    /// Create a bridge with a custom connect timeout.
    pub fn with_timeout(radio: R, connect_timeout: Duration) -> Self {
        Self {
            radio: Arc::new(radio),
            core: BridgeCore::new(),
            workers: Mutex::new(Workers::default()),
            connect_timeout,
        }
    }

    /// Accept loop for incoming connections.
    async fn accept_one(core: Arc<BridgeCore>, mut acceptor: Box<dyn SocketAcceptor>) {
        info!("Waiting for connections...");

        match acceptor.accept().await {
            Ok((stream, peer)) => {
                info!("Connection from: {} ({})", peer.name, peer.address);
                ClassicLink::open(core, peer.name, peer.address, stream).await;
            }
            Err(e) => {
                error!("Accept error: {}", e);
                if core.state() == BridgeState::Listening {
                    core.set_state(BridgeState::Disconnected);
                }
            }
        }
    }

    async fn connect_out(core: Arc<BridgeCore>, radio: Arc<R>, address: String) {
        match radio.connect(&address).await {
            Ok((stream, peer)) => {
                let name = if peer.name.is_empty() {
                    core.discovered_name(&address)
                        .unwrap_or_else(|| address.clone())
                } else {
                    peer.name
                };
                ClassicLink::open(core, name, address, stream).await;
            }
            Err(e) => {
                warn!("Connect to {} failed: {}", address, e);
                if core.state() == BridgeState::Connecting {
                    core.set_state(BridgeState::Disconnected);
                }
            }
        }
    }
}

#[async_trait]
impl<R: SocketRadio> TransportBridge for RfcommBridge<R> {
    async fn initialize(&self, is_server: bool) -> FinderResult<()> {
        if self.core.state() != BridgeState::Unknown {
            debug!("Bridge already initialized");
            return Ok(());
        }
        if !self.radio.is_powered().await? {
            return Err(FinderError::TransportUnavailable(
                "bluetooth adapter is powered off".to_string(),
            ));
        }
        if self.core.begin(is_server) {
            info!(
                "Classic bridge initialized as {}",
                if is_server { "server" } else { "client" }
            );
        }
        Ok(())
    }

    async fn start_device_discovery(&self) {
        if self.core.state() == BridgeState::Unknown {
            warn!("Discovery requested before initialization");
            return;
        }

        let (found_tx, mut found_rx) = mpsc::channel::<DiscoveredDevice>(32);
        let radio = self.radio.clone();
        let core = self.core.clone();
        let handle = tokio::spawn(async move {
            let scan = tokio::spawn(async move {
                if let Err(e) = radio.discover(found_tx).await {
                    warn!("Discovery failed: {}", e);
                }
            });
            while let Some(device) = found_rx.recv().await {
                debug!("Found {} ({})", device.name, device.address);
                core.record_discovered(device).await;
            }
            scan.abort();
        });

        if let Some(previous) = self.workers.lock().discovery.replace(handle) {
            previous.abort();
        }
        info!("Device discovery started");
    }

    async fn stop_device_discovery(&self) {
        if let Some(handle) = self.workers.lock().discovery.take() {
            handle.abort();
            info!("Device discovery stopped");
        }
    }

    async fn listen(&self) -> FinderResult<()> {
        if !self.core.is_server() {
            return Err(FinderError::invalid_state("listen", "client role"));
        }
        self.core
            .transition("listen", &[BridgeState::Disconnected], BridgeState::Listening)?;

        let acceptor = match self.radio.bind().await {
            Ok(acceptor) => acceptor,
            Err(e) => {
                self.core.set_state(BridgeState::Disconnected);
                return Err(FinderError::ConnectionFailure(format!("bind failed: {}", e)));
            }
        };

        let core = self.core.clone();
        let handle = tokio::spawn(Self::accept_one(core, acceptor));
        if let Some(previous) = self.workers.lock().acceptor.replace(handle) {
            previous.abort();
        }
        info!("Listening for incoming connections");
        Ok(())
    }

    async fn connect_device_by_address(&self, address: &str) -> FinderResult<()> {
        if self.core.state() == BridgeState::Unknown {
            return Err(FinderError::TransportUnavailable(
                "bridge not initialized".to_string(),
            ));
        }
        if self.core.is_server() {
            return Err(FinderError::invalid_state("connect", "server role"));
        }
        if !is_valid_address(address) {
            return Err(FinderError::InvalidAddress(address.to_string()));
        }
        self.core.transition(
            "connect",
            &[BridgeState::Disconnected],
            BridgeState::Connecting,
        )?;

        info!("Connecting to {}", address);
        let handle = tokio::spawn(Self::connect_out(
            self.core.clone(),
            self.radio.clone(),
            address.to_string(),
        ));
        if let Some(previous) = self.workers.lock().connector.replace(handle) {
            previous.abort();
        }

        if self
            .core
            .wait_for_connection(address, self.connect_timeout)
            .await
        {
            return Ok(());
        }

        if let Some(handle) = self.workers.lock().connector.take() {
            handle.abort();
        }
        if self.core.state() == BridgeState::Connecting {
            self.core.set_state(BridgeState::Disconnected);
        }
        Err(FinderError::ConnectionFailure(format!(
            "no link to {} after {:?}",
            address, self.connect_timeout
        )))
    }

    async fn broadcast(&self, data: &[u8]) -> FinderResult<()> {
        self.core.broadcast(data).await
    }

    async fn destroy(&self) {
        self.workers.lock().abort_all();
        self.core.teardown();
        info!("Classic bridge destroyed");
    }

    fn set_event_handler(&self, handler: mpsc::Sender<BridgeEvent>) {
        self.core.set_handler(handler);
    }

    fn state(&self) -> BridgeState {
        self.core.state()
    }

    fn connections(&self) -> Vec<ConnectionInfo> {
        self.core.connections()
    }

    fn is_connected_to(&self, address: &str) -> bool {
        self.core.is_connected_to(address)
    }
}
