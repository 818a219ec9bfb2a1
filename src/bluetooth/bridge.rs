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

//! Transport bridge contract and the connection table both bridges share.
//!
//! A bridge moves through
//! `Unknown -> Disconnected -> {Listening | Connecting} -> Connected -> Disconnected`
//! and back to `Unknown` when destroyed. It keeps at most one link per remote
//! address and reports link activity to a single event handler.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::error::{FinderError, FinderResult};

/// State of a transport bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BridgeState {
    Unknown,
    Disconnected,
    Listening,
    Connecting,
    Connected,
}

impl BridgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeState::Unknown => "Unknown",
            BridgeState::Disconnected => "Disconnected",
            BridgeState::Listening => "Listening",
            BridgeState::Connecting => "Connecting...",
            BridgeState::Connected => "Connected",
        }
    }
}

/// A device seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
}

/// Name and address of an active link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub name: String,
    pub address: String,
}

/// Events emitted by a bridge.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Link established.
    Connected { name: String, address: String },
    /// Link closed.
    Disconnected { name: String, address: String },
    /// Bytes received on a link.
    DataReceived {
        name: String,
        address: String,
        data: Vec<u8>,
    },
    /// Device seen during discovery.
    DeviceFound(DiscoveredDevice),
}

/// Radio abstraction driven by the finder service.
#[async_trait]
pub trait TransportBridge: Send + Sync {
    /// Bring the bridge from `Unknown` to `Disconnected`.
    ///
    /// A bridge already past `Unknown` is left alone and reports success.
    async fn initialize(&self, is_server: bool) -> FinderResult<()>;

    /// Start scanning for nearby devices. Fire and forget.
    async fn start_device_discovery(&self);

    /// Stop scanning.
    async fn stop_device_discovery(&self);

    /// Accept one incoming link in the background. Server role only.
    async fn listen(&self) -> FinderResult<()>;

    /// Connect to `address`, waiting until the link is up. Client role only.
    async fn connect_device_by_address(&self, address: &str) -> FinderResult<()>;

    /// Write `data` to every active link.
    async fn broadcast(&self, data: &[u8]) -> FinderResult<()>;

    /// Close every link, stop background work and return to `Unknown`.
    async fn destroy(&self);

    /// Replace the event handler.
    fn set_event_handler(&self, handler: mpsc::Sender<BridgeEvent>);

    /// Current bridge state.
    fn state(&self) -> BridgeState;

    /// Active links.
    fn connections(&self) -> Vec<ConnectionInfo>;

    /// Check for an active link to `address`.
    fn is_connected_to(&self, address: &str) -> bool {
        self.connections().iter().any(|c| c.address == address)
    }
}

/// Writable side of a single active link.
#[async_trait]
pub trait Link: Send + Sync {
    /// Remote device name.
    fn name(&self) -> &str;

    /// Write bytes to the remote device.
    async fn send(&self, data: &[u8]) -> FinderResult<()>;

    /// Stop the link's background work. Must be idempotent.
    fn close(&self);
}

/// Check for the canonical `XX:XX:XX:XX:XX:XX` form, hex digits upper case.
pub fn is_valid_address(address: &str) -> bool {
    let bytes = address.as_bytes();
    if bytes.len() != 17 {
        return false;
    }
    bytes.iter().enumerate().all(|(i, &b)| {
        if i % 3 == 2 {
            b == b':'
        } else {
            b.is_ascii_digit() || (b'A'..=b'F').contains(&b)
        }
    })
}

/// Shared bookkeeping behind every bridge implementation.
pub struct BridgeCore {
    state: Mutex<BridgeState>,
    is_server: Mutex<bool>,
    handler: Mutex<Option<mpsc::Sender<BridgeEvent>>>,
    connections: Mutex<HashMap<String, Arc<dyn Link>>>,
    discovered: Mutex<HashMap<String, DiscoveredDevice>>,
    link_changed: Notify,
}

impl BridgeCore {
    /// Create a core in the `Unknown` state.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BridgeState::Unknown),
            is_server: Mutex::new(false),
            handler: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            discovered: Mutex::new(HashMap::new()),
            link_changed: Notify::new(),
        })
    }

    pub fn state(&self) -> BridgeState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: BridgeState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("Bridge state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    /// Move to `to` if the current state is one of `from`.
    pub fn transition(
        &self,
        operation: &'static str,
        from: &[BridgeState],
        to: BridgeState,
    ) -> FinderResult<()> {
        let mut current = self.state.lock();
        if !from.contains(&*current) {
            warn!("Rejecting {} in bridge state {:?}", operation, *current);
            return Err(FinderError::invalid_state(operation, *current));
        }
        debug!("Bridge state {:?} -> {:?}", *current, to);
        *current = to;
        Ok(())
    }

    /// Mark the bridge initialized. Returns false if it already was.
    pub fn begin(&self, is_server: bool) -> bool {
        let mut state = self.state.lock();
        if *state != BridgeState::Unknown {
            return false;
        }
        *self.is_server.lock() = is_server;
        *state = BridgeState::Disconnected;
        true
    }

    pub fn is_server(&self) -> bool {
        *self.is_server.lock()
    }

    pub fn set_handler(&self, handler: mpsc::Sender<BridgeEvent>) {
        *self.handler.lock() = Some(handler);
    }

    /// Deliver an event to the registered handler.
    pub async fn emit(&self, event: BridgeEvent) {
        let handler = self.handler.lock().clone();
        match handler {
            Some(tx) => {
                if tx.send(event).await.is_err() {
                    debug!("Event handler dropped");
                }
            }
            None => debug!("No event handler for {:?}", event),
        }
    }

    /// Record a discovered device and report it.
    pub async fn record_discovered(&self, device: DiscoveredDevice) {
        self.discovered
            .lock()
            .insert(device.address.clone(), device.clone());
        self.emit(BridgeEvent::DeviceFound(device)).await;
    }

    /// Name of a discovered device, if any.
    pub fn discovered_name(&self, address: &str) -> Option<String> {
        self.discovered.lock().get(address).map(|d| d.name.clone())
    }

    /// Register a new link for `address`, replacing any existing one.
    pub async fn attach(&self, address: &str, link: Arc<dyn Link>) {
        let name = link.name().to_string();
        let previous = {
            let mut connections = self.connections.lock();
            let mut state = self.state.lock();
            if *state == BridgeState::Unknown {
                drop(state);
                drop(connections);
                warn!("Bridge torn down, dropping late link to {}", address);
                link.close();
                return;
            }
            *state = BridgeState::Connected;
            connections.insert(address.to_string(), link)
        };

        if let Some(previous) = previous {
            info!("Replacing existing link to {}", address);
            previous.close();
            self.emit(BridgeEvent::Disconnected {
                name: previous.name().to_string(),
                address: address.to_string(),
            })
            .await;
        }

        info!("Connected to {} ({})", name, address);
        self.link_changed.notify_waiters();
        self.emit(BridgeEvent::Connected {
            name,
            address: address.to_string(),
        })
        .await;
    }

    /// Remove the link for `address` if it is still `link`.
    ///
    /// A reader finishing after its link was replaced must not take the
    /// replacement down with it.
    pub async fn detach_link(&self, address: &str, link: &Arc<dyn Link>) {
        let removed = {
            let mut connections = self.connections.lock();
            match connections.get(address) {
                Some(current) if Arc::ptr_eq(current, link) => connections.remove(address),
                _ => None,
            }
        };
        if let Some(removed) = removed {
            self.finish_detach(address, removed).await;
        }
    }

    /// Remove the link for `address`, whatever it is.
    pub async fn detach(&self, address: &str) {
        let removed = self.connections.lock().remove(address);
        if let Some(removed) = removed {
            self.finish_detach(address, removed).await;
        }
    }

    async fn finish_detach(&self, address: &str, removed: Arc<dyn Link>) {
        removed.close();
        {
            let connections = self.connections.lock();
            let mut state = self.state.lock();
            if connections.is_empty() && *state == BridgeState::Connected {
                *state = BridgeState::Disconnected;
            }
        }
        info!("Disconnected from {} ({})", removed.name(), address);
        self.link_changed.notify_waiters();
        self.emit(BridgeEvent::Disconnected {
            name: removed.name().to_string(),
            address: address.to_string(),
        })
        .await;
    }

    pub fn is_connected_to(&self, address: &str) -> bool {
        self.connections.lock().contains_key(address)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .lock()
            .iter()
            .map(|(address, link)| ConnectionInfo {
                name: link.name().to_string(),
                address: address.clone(),
            })
            .collect()
    }

    /// Wait until a link to `address` exists or `timeout` passes.
    pub async fn wait_for_connection(&self, address: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let changed = self.link_changed.notified();
            if self.is_connected_to(address) {
                return true;
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return self.is_connected_to(address);
            }
        }
    }

    /// Write to every link.
    ///
    /// Every link is attempted. Links whose write fails are closed, and the
    /// call fails if any write failed.
    pub async fn broadcast(&self, data: &[u8]) -> FinderResult<()> {
        let state = self.state();
        if state != BridgeState::Connected {
            warn!("Rejecting broadcast in bridge state {:?}", state);
            return Err(FinderError::invalid_state("broadcast", state));
        }

        let links: Vec<(String, Arc<dyn Link>)> = self
            .connections
            .lock()
            .iter()
            .map(|(address, link)| (address.clone(), link.clone()))
            .collect();

        let mut failed = Vec::new();
        for (address, link) in links {
            if let Err(e) = link.send(data).await {
                warn!("Write to {} failed: {}", address, e);
                self.detach_link(&address, &link).await;
                failed.push(address);
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(FinderError::ConnectionFailure(format!(
                "write failed for {}",
                failed.join(",")
            )))
        }
    }

    /// Close every link and reset to `Unknown`. Safe to call repeatedly.
    pub fn teardown(&self) {
        let links: Vec<Arc<dyn Link>> = self
            .connections
            .lock()
            .drain()
            .map(|(_, link)| link)
            .collect();
        for link in &links {
            link.close();
        }
        self.discovered.lock().clear();
        self.set_state(BridgeState::Unknown);
        self.link_changed.notify_waiters();
        if !links.is_empty() {
            info!("Closed {} link(s)", links.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeLink {
        name: String,
        fail: bool,
        closed: AtomicBool,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl FakeLink {
        fn new(name: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail,
                closed: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Link for FakeLink {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(&self, data: &[u8]) -> FinderResult<()> {
            if self.fail {
                return Err(FinderError::ConnectionFailure("broken pipe".to_string()));
            }
            self.sent.lock().push(data.to_vec());
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    const ADDR_A: &str = "AA:BB:CC:DD:EE:FF";
    const ADDR_B: &str = "11:22:33:44:55:66";

    #[test]
    fn test_address_validation() {
        assert!(is_valid_address(ADDR_A));
        assert!(is_valid_address("00:11:22:33:44:55"));
        assert!(!is_valid_address("aa:bb:cc:dd:ee:ff"));
        assert!(!is_valid_address("AA:BB:CC:DD:EE"));
        assert!(!is_valid_address("AA-BB-CC-DD-EE-FF"));
        assert!(!is_valid_address("AA:BB:CC:DD:EE:FG"));
    }

    #[test]
    fn test_begin_is_idempotent() {
        let core = BridgeCore::new();
        assert!(core.begin(true));
        assert!(core.is_server());
        assert_eq!(core.state(), BridgeState::Disconnected);
        assert!(!core.begin(false));
        assert!(core.is_server());
    }

    #[test]
    fn test_transition_guard() {
        let core = BridgeCore::new();
        assert!(core
            .transition("listen", &[BridgeState::Disconnected], BridgeState::Listening)
            .is_err());
        assert_eq!(core.state(), BridgeState::Unknown);
    }

    #[tokio::test]
    async fn test_attach_replaces_existing_link() {
        let core = BridgeCore::new();
        let (tx, mut rx) = mpsc::channel(16);
        core.set_handler(tx);
        core.begin(false);

        let first = FakeLink::new("phone", false);
        let second = FakeLink::new("phone", false);
        core.attach(ADDR_A, first.clone()).await;
        core.attach(ADDR_A, second.clone()).await;

        assert_eq!(core.connections().len(), 1);
        assert!(first.closed.load(Ordering::SeqCst));
        assert!(!second.closed.load(Ordering::SeqCst));
        assert_eq!(core.state(), BridgeState::Connected);

        assert!(matches!(rx.recv().await, Some(BridgeEvent::Connected { .. })));
        assert!(matches!(rx.recv().await, Some(BridgeEvent::Disconnected { .. })));
        assert!(matches!(rx.recv().await, Some(BridgeEvent::Connected { .. })));
    }

    #[tokio::test]
    async fn test_stale_detach_keeps_replacement() {
        let core = BridgeCore::new();
        core.begin(false);
        let first: Arc<dyn Link> = FakeLink::new("phone", false);
        let second: Arc<dyn Link> = FakeLink::new("phone", false);
        core.attach(ADDR_A, first.clone()).await;
        core.attach(ADDR_A, second.clone()).await;

        core.detach_link(ADDR_A, &first).await;
        assert!(core.is_connected_to(ADDR_A));

        core.detach_link(ADDR_A, &second).await;
        assert!(!core.is_connected_to(ADDR_A));
        assert_eq!(core.state(), BridgeState::Disconnected);
    }

    #[tokio::test]
    async fn test_broadcast_requires_connected() {
        let core = BridgeCore::new();
        core.begin(true);
        assert!(matches!(
            core.broadcast(b"RWO 1\n").await,
            Err(FinderError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_broadcast_reports_partial_failure() {
        let core = BridgeCore::new();
        core.begin(true);
        let good = FakeLink::new("good", false);
        let bad = FakeLink::new("bad", true);
        core.attach(ADDR_A, good.clone()).await;
        core.attach(ADDR_B, bad.clone()).await;

        let result = core.broadcast(b"RWO 1\n").await;
        assert!(matches!(result, Err(FinderError::ConnectionFailure(_))));
        assert_eq!(good.sent.lock().len(), 1);
        assert!(bad.closed.load(Ordering::SeqCst));
        assert!(core.is_connected_to(ADDR_A));
        assert!(!core.is_connected_to(ADDR_B));
        assert_eq!(core.state(), BridgeState::Connected);
    }

    #[tokio::test]
    async fn test_wait_for_connection() {
        let core = BridgeCore::new();
        core.begin(false);
        assert!(!core.wait_for_connection(ADDR_A, Duration::from_millis(20)).await);

        let waiter = {
            let core = core.clone();
            tokio::spawn(async move { core.wait_for_connection(ADDR_A, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        core.attach(ADDR_A, FakeLink::new("beacon", false)).await;
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_teardown_clears_everything() {
        let core = BridgeCore::new();
        core.begin(false);
        let link = FakeLink::new("beacon", false);
        core.attach(ADDR_A, link.clone()).await;
        core.record_discovered(DiscoveredDevice {
            name: "beacon".to_string(),
            address: ADDR_A.to_string(),
            rssi: Some(-60),
        })
        .await;

        core.teardown();
        core.teardown();

        assert!(core.connections().is_empty());
        assert!(core.discovered_name(ADDR_A).is_none());
        assert!(link.closed.load(Ordering::SeqCst));
        assert_eq!(core.state(), BridgeState::Unknown);
    }
}
