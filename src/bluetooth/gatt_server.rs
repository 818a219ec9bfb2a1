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

//! BLE GATT bridge.
//!
//! The server role serves the finder service (a write characteristic for
//! requests, a notify characteristic for responses) and advertises it. The
//! client role connects to that service on a remote beacon and pushes its
//! writes through a [`RequestQueue`].

use anyhow::Result;
use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::local::{
    characteristic_control, Application, ApplicationHandle, Characteristic, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicWrite, CharacteristicWriteMethod,
    CharacteristicWriteRequest, Service,
};
use bluer::gatt::remote::Characteristic as RemoteCharacteristic;
use bluer::{
    Adapter, Address, Device, DeviceEvent, DeviceProperty, DiscoveryFilter, DiscoveryTransport,
};
use futures::{pin_mut, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ble_constants::*;
use super::bridge::{
    is_valid_address, BridgeCore, BridgeEvent, BridgeState, ConnectionInfo, DiscoveredDevice,
    Link, TransportBridge,
};
use super::framing::{frame_message, NotificationBuffer};
use super::gatt_queue::{GattLink, RequestQueue};
use super::server::{device_name, report_devices};
use crate::error::{FinderError, FinderResult};

/// Timing knobs for the GATT bridge.
#[derive(Debug, Clone, Copy)]
pub struct GattTiming {
    pub connect_timeout: Duration,
    pub scan_ceiling: Duration,
    pub request_delay: Duration,
}

impl Default for GattTiming {
    fn default() -> Self {
        Self {
            connect_timeout: rfcomm::CONNECT_TIMEOUT,
            scan_ceiling: config::SCAN_CEILING,
            request_delay: config::REQUEST_DELAY,
        }
    }
}

const NOTIFY_QUEUE_DEPTH: usize = 32;

/// Notification channel of the served application.
///
/// BlueZ fans a notification out to every subscribed central, so all
/// peripheral links push through this one queue. Pushing never waits.
struct Notifier {
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl Notifier {
    fn new() -> Self {
        Self {
            tx: Mutex::new(None),
        }
    }

    fn set(&self, tx: mpsc::Sender<Vec<u8>>) {
        *self.tx.lock() = Some(tx);
    }

    fn clear(&self) {
        *self.tx.lock() = None;
    }

    fn push(&self, packet: Vec<u8>) -> FinderResult<()> {
        let tx = self.tx.lock().clone().ok_or_else(|| {
            FinderError::ConnectionFailure("notifications not registered".to_string())
        })?;
        tx.try_send(packet).map_err(|e| match e {
            TrySendError::Full(_) => FinderError::ConnectionFailure(
                "no central is draining notifications".to_string(),
            ),
            TrySendError::Closed(_) => {
                FinderError::ConnectionFailure("notification channel closed".to_string())
            }
        })
    }
}

/// Make `link` the only served central, dropping any earlier one.
async fn attach_central(core: &BridgeCore, address: &str, link: Arc<dyn Link>) {
    for stale in core
        .connections()
        .into_iter()
        .filter(|c| c.address != address)
    {
        info!("Central {} superseded by {}", stale.address, address);
        core.detach(&stale.address).await;
    }
    core.attach(address, link).await;
}

/// Shared state of the served GATT application.
struct PeripheralState {
    buffers: HashMap<String, NotificationBuffer>,
    negotiated_mtu: usize,
}

#[derive(Default)]
struct Workers {
    discovery: Option<JoinHandle<()>>,
    connector: Option<JoinHandle<()>>,
    app: Option<ApplicationHandle>,
    adv: Option<AdvertisementHandle>,
}

/// Bridge over BLE GATT.
pub struct GattBridge {
    adapter: Adapter,
    core: Arc<BridgeCore>,
    timing: GattTiming,
    device_name: String,
    peripheral: Arc<Mutex<PeripheralState>>,
    notifier: Arc<Notifier>,
    workers: Mutex<Workers>,
}

impl GattBridge {
    /// Create a GATT bridge on the default adapter.
    pub async fn new(device_name: &str, timing: GattTiming) -> Result<Self> {
        info!("Initializing BLE GATT bridge...");

        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        Ok(Self {
            adapter,
            core: BridgeCore::new(),
            timing,
            device_name: device_name.to_string(),
            peripheral: Arc::new(Mutex::new(PeripheralState {
                buffers: HashMap::new(),
                negotiated_mtu: config::DEFAULT_MTU,
            })),
            notifier: Arc::new(Notifier::new()),
            workers: Mutex::new(Workers::default()),
        })
    }

    /// Register the finder service with BlueZ.
    async fn register_gatt_service(&self) -> Result<ApplicationHandle> {
        let core = self.core.clone();
        let adapter = self.adapter.clone();
        let peripheral = self.peripheral.clone();
        let notifier = self.notifier.clone();

        // Build Command RX characteristic
        let (_cmd_rx_control, cmd_rx_control_handle) = characteristic_control();
        let cmd_rx_char = Characteristic {
            uuid: COMMAND_RX_UUID,
            write: Some(CharacteristicWrite {
                write: true,
                write_without_response: true,
                method: CharacteristicWriteMethod::Fun(Box::new(
                    move |data: Vec<u8>, req: CharacteristicWriteRequest| {
                        let core = core.clone();
                        let adapter = adapter.clone();
                        let peripheral = peripheral.clone();
                        let notifier = notifier.clone();

                        Box::pin(async move {
                            Self::handle_command_write(
                                data,
                                req,
                                core,
                                adapter,
                                peripheral,
                                notifier,
                            )
                            .await;
                            Ok(())
                        })
                    },
                )),
                ..Default::default()
            }),
            control_handle: cmd_rx_control_handle,
            ..Default::default()
        };

        // Build Response TX characteristic (notify)
        let (_resp_tx_control, resp_tx_control_handle) = characteristic_control();
        let (resp_notify_tx, resp_notify_rx) = mpsc::channel::<Vec<u8>>(NOTIFY_QUEUE_DEPTH);
        let resp_notify_rx = Arc::new(tokio::sync::Mutex::new(resp_notify_rx));
        self.notifier.set(resp_notify_tx);
        let session_core = self.core.clone();

        let resp_tx_char = Characteristic {
            uuid: RESPONSE_TX_UUID,
            notify: Some(CharacteristicNotify {
                notify: true,
                method: CharacteristicNotifyMethod::Fun(Box::new(move |mut notifier| {
                    let resp_notify_rx = resp_notify_rx.clone();
                    let core = session_core.clone();

                    Box::pin(async move {
                        debug!("Response TX notification loop started");
                        loop {
                            let data = {
                                let mut rx = resp_notify_rx.lock().await;
                                rx.recv().await
                            };

                            match data {
                                Some(data) => {
                                    if let Err(e) = notifier.notify(data).await {
                                        error!("Failed to send notification: {}", e);
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                        info!("Response TX notification loop exited");
                        // Nobody hears replies any more.
                        for link in core.connections() {
                            core.detach(&link.address).await;
                        }
                    })
                })),
                ..Default::default()
            }),
            control_handle: resp_tx_control_handle,
            ..Default::default()
        };

        let app = Application {
            services: vec![Service {
                uuid: SERVICE_UUID,
                primary: true,
                characteristics: vec![cmd_rx_char, resp_tx_char],
                ..Default::default()
            }],
            ..Default::default()
        };

        let handle = self.adapter.serve_gatt_application(app).await?;
        info!("GATT service registered");
        Ok(handle)
    }

    /// Handle writes to the Command RX characteristic.
    async fn handle_command_write(
        data: Vec<u8>,
        req: CharacteristicWriteRequest,
        core: Arc<BridgeCore>,
        adapter: Adapter,
        peripheral: Arc<Mutex<PeripheralState>>,
        notifier: Arc<Notifier>,
    ) {
        let address = req.device_address.to_string();

        let (messages, mtu) = {
            let mut state = peripheral.lock();
            let write_mtu = req.mtu as usize;
            if write_mtu > state.negotiated_mtu {
                info!("MTU updated: {} -> {} bytes", state.negotiated_mtu, write_mtu);
                state.negotiated_mtu = write_mtu;
            }
            let mtu = state.negotiated_mtu;
            let messages = state
                .buffers
                .entry(address.clone())
                .or_default()
                .process_packet(&data);
            (messages, mtu)
        };

        let name = device_name(&adapter, req.device_address).await;
        if !core.is_connected_to(&address) {
            let closed = CancellationToken::new();
            let link: Arc<dyn Link> = Arc::new(PeripheralLink {
                name: name.clone(),
                notifier,
                mtu,
                closed: closed.clone(),
            });
            attach_central(&core, &address, link.clone()).await;
            tokio::spawn(Self::watch_central(
                core.clone(),
                adapter,
                peripheral,
                req.device_address,
                link,
                closed,
            ));
        }

        for message in messages {
            core.emit(BridgeEvent::DataReceived {
                name: name.clone(),
                address: address.clone(),
                data: message,
            })
            .await;
        }
    }

    /// Detach a central's link once BlueZ reports it gone.
    async fn watch_central(
        core: Arc<BridgeCore>,
        adapter: Adapter,
        peripheral: Arc<Mutex<PeripheralState>>,
        target: Address,
        link: Arc<dyn Link>,
        closed: CancellationToken,
    ) {
        let address = target.to_string();
        let gone = async {
            let device = adapter.device(target)?;
            let events = device.events().await?;
            pin_mut!(events);
            while let Some(event) = events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    break;
                }
            }
            Ok::<_, bluer::Error>(())
        };

        tokio::select! {
            _ = closed.cancelled() => return,
            result = gone => {
                if let Err(e) = result {
                    warn!("Lost track of central {}: {}", address, e);
                }
            }
        }

        info!("Central {} disconnected", address);
        peripheral.lock().buffers.remove(&address);
        core.detach_link(&address, &link).await;
    }

    /// Start BLE advertising.
    async fn start_advertising(&self) -> Result<AdvertisementHandle> {
        let adv = Advertisement {
            service_uuids: vec![SERVICE_UUID].into_iter().collect(),
            discoverable: Some(true),
            local_name: Some(self.device_name.clone()),
            ..Default::default()
        };

        let handle = self.adapter.advertise(adv).await?;
        info!("BLE advertising started");
        Ok(handle)
    }

    /// Connect to a beacon and attach a queued client link.
    async fn connect_central(
        core: Arc<BridgeCore>,
        adapter: Adapter,
        address: String,
        request_delay: Duration,
    ) -> Result<()> {
        let target: Address = address.parse()?;
        let device = adapter.device(target)?;
        if !device.is_connected().await? {
            device.connect().await?;
        }

        let (rx_char, tx_char) = find_finder_characteristics(&device).await?;
        let notifications = tx_char.notify().await?;

        let io = Arc::new(RemoteIo {
            command_rx: rx_char,
        });
        let name = device_name(&adapter, target).await;
        let link = Arc::new(CentralLink {
            name: name.clone(),
            device,
            queue: RequestQueue::start(io, request_delay),
            closed: CancellationToken::new(),
        });
        let handle: Arc<dyn Link> = link.clone();
        core.attach(&address, handle.clone()).await;

        let closed = link.closed.clone();
        tokio::spawn(async move {
            pin_mut!(notifications);
            let mut buffer = NotificationBuffer::new();
            loop {
                let packet = tokio::select! {
                    _ = closed.cancelled() => return,
                    packet = notifications.next() => packet,
                };
                let Some(packet) = packet else {
                    info!("Notifications from {} ended", address);
                    break;
                };
                for message in buffer.process_packet(&packet) {
                    core.emit(BridgeEvent::DataReceived {
                        name: name.clone(),
                        address: address.clone(),
                        data: message,
                    })
                    .await;
                }
            }
            core.detach_link(&address, &handle).await;
        });

        Ok(())
    }
}

async fn find_finder_characteristics(
    device: &Device,
) -> Result<(RemoteCharacteristic, RemoteCharacteristic)> {
    for service in device.services().await? {
        if service.uuid().await? != SERVICE_UUID {
            continue;
        }
        let mut rx = None;
        let mut tx = None;
        for characteristic in service.characteristics().await? {
            let uuid = characteristic.uuid().await?;
            if uuid == COMMAND_RX_UUID {
                rx = Some(characteristic);
            } else if uuid == RESPONSE_TX_UUID {
                tx = Some(characteristic);
            }
        }
        if let (Some(rx), Some(tx)) = (rx, tx) {
            return Ok((rx, tx));
        }
    }
    Err(anyhow::anyhow!("finder service not found on {}", device.address()))
}

/// Characteristic access on a remote beacon.
struct RemoteIo {
    command_rx: RemoteCharacteristic,
}

#[async_trait]
impl GattLink for RemoteIo {
    async fn write(&self, characteristic: uuid::Uuid, value: &[u8]) -> FinderResult<()> {
        if characteristic != COMMAND_RX_UUID {
            return Err(FinderError::ConnectionFailure(format!(
                "characteristic {} is not writable",
                characteristic
            )));
        }
        self.command_rx
            .write(value)
            .await
            .map_err(|e| FinderError::ConnectionFailure(e.to_string()))
    }
}

/// Client side link: writes go through the request queue.
struct CentralLink {
    name: String,
    device: Device,
    queue: RequestQueue,
    closed: CancellationToken,
}

#[async_trait]
impl Link for CentralLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, data: &[u8]) -> FinderResult<()> {
        for packet in frame_message(data, config::DEFAULT_MTU) {
            self.queue.write(COMMAND_RX_UUID, packet).await?;
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.queue.close();
        let device = self.device.clone();
        tokio::spawn(async move {
            if let Err(e) = device.disconnect().await {
                debug!("Disconnect failed: {}", e);
            }
        });
    }
}

/// Server side link: writes become notifications.
struct PeripheralLink {
    name: String,
    notifier: Arc<Notifier>,
    mtu: usize,
    closed: CancellationToken,
}

#[async_trait]
impl Link for PeripheralLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, data: &[u8]) -> FinderResult<()> {
        if self.closed.is_cancelled() {
            return Err(FinderError::ConnectionFailure("link closed".to_string()));
        }
        for packet in frame_message(data, self.mtu) {
            self.notifier.push(packet)?;
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl TransportBridge for GattBridge {
    async fn initialize(&self, is_server: bool) -> FinderResult<()> {
        if self.core.state() != BridgeState::Unknown {
            debug!("Bridge already initialized");
            return Ok(());
        }
        let powered = self
            .adapter
            .is_powered()
            .await
            .map_err(|e| FinderError::TransportUnavailable(e.to_string()))?;
        if !powered {
            return Err(FinderError::TransportUnavailable(
                "bluetooth adapter is powered off".to_string(),
            ));
        }
        if self.core.begin(is_server) {
            info!(
                "GATT bridge initialized as {}",
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

        let filter = DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            ..Default::default()
        };
        if let Err(e) = self.adapter.set_discovery_filter(filter).await {
            warn!("Failed to set LE discovery filter: {}", e);
        }

        let adapter = self.adapter.clone();
        let core = self.core.clone();
        let ceiling = self.timing.scan_ceiling;
        let handle = tokio::spawn(async move {
            let (found_tx, mut found_rx) = mpsc::channel::<DiscoveredDevice>(32);
            let relay = async {
                while let Some(device) = found_rx.recv().await {
                    core.record_discovered(device).await;
                }
            };
            let scan = async {
                if let Err(e) = report_devices(&adapter, &found_tx).await {
                    warn!("Discovery failed: {}", e);
                }
                drop(found_tx);
            };
            if tokio::time::timeout(ceiling, futures::future::join(scan, relay))
                .await
                .is_err()
            {
                info!("Scan stopped after {:?}", ceiling);
            }
        });

        if let Some(previous) = self.workers.lock().discovery.replace(handle) {
            previous.abort();
        }
        info!("BLE scan started");
    }

    async fn stop_device_discovery(&self) {
        if let Some(handle) = self.workers.lock().discovery.take() {
            handle.abort();
            info!("BLE scan stopped");
        }
    }

    async fn listen(&self) -> FinderResult<()> {
        if !self.core.is_server() {
            return Err(FinderError::invalid_state("listen", "client role"));
        }
        self.core
            .transition("listen", &[BridgeState::Disconnected], BridgeState::Listening)?;

        let registered = self.workers.lock().app.is_some();
        if !registered {
            let served = async {
                let app = self.register_gatt_service().await?;
                let adv = self.start_advertising().await?;
                Ok::<_, anyhow::Error>((app, adv))
            }
            .await;
            match served {
                Ok((app, adv)) => {
                    let mut workers = self.workers.lock();
                    workers.app = Some(app);
                    workers.adv = Some(adv);
                }
                Err(e) => {
                    self.core.set_state(BridgeState::Disconnected);
                    return Err(FinderError::ConnectionFailure(e.to_string()));
                }
            }
        }
        info!("Advertising finder service");
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

        let core = self.core.clone();
        let adapter = self.adapter.clone();
        let target = address.to_string();
        let delay = self.timing.request_delay;
        let handle = tokio::spawn(async move {
            if let Err(e) = Self::connect_central(core.clone(), adapter, target.clone(), delay).await
            {
                warn!("GATT connect to {} failed: {}", target, e);
                if core.state() == BridgeState::Connecting {
                    core.set_state(BridgeState::Disconnected);
                }
            }
        });
        if let Some(previous) = self.workers.lock().connector.replace(handle) {
            previous.abort();
        }

        if self
            .core
            .wait_for_connection(address, self.timing.connect_timeout)
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
            "no GATT link to {} after {:?}",
            address, self.timing.connect_timeout
        )))
    }

    async fn broadcast(&self, data: &[u8]) -> FinderResult<()> {
        self.core.broadcast(data).await
    }

    async fn destroy(&self) {
        {
            let mut workers = self.workers.lock();
            for handle in [workers.discovery.take(), workers.connector.take()]
                .into_iter()
                .flatten()
            {
                handle.abort();
            }
            // Dropping the handles unregisters the service and advertisement.
            workers.app = None;
            workers.adv = None;
        }
        self.notifier.clear();
        self.peripheral.lock().buffers.clear();
        self.core.teardown();
        info!("GATT bridge destroyed");
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
