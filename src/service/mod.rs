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

//! Finder service: the mode controller sitting between callers and a
//! transport bridge.
//!
//! A sidekick listens for registrations in `Setup` and watches its guarded
//! devices in `Guard`. A mobile connects out to register (`Setup` ->
//! `Registering` -> `Report`) and then checks in periodically.

pub mod commands;
pub mod events;
pub mod state;

pub use commands::{Command, Reply, USAGE};
pub use events::{EventBus, ServiceEvent};
pub use state::{GuardSettings, ModeState, Role, ServiceSettings, ServiceState};

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alarm::{Alarm, WakeAlarm};
use crate::bluetooth::ble_constants::rfcomm::MAX_PENDING_BYTES;
use crate::bluetooth::{
    decode_stream, is_valid_address, BridgeEvent, BridgeState, DiscoveredDevice, Message,
    TransportBridge,
};
use crate::error::{FinderError, FinderResult};
use crate::registry::{CheckMode, GuardedItem, Registry};

const BRIDGE_EVENT_CAPACITY: usize = 64;

/// A background loop and the token that ends it.
struct CyclicTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl CyclicTask {
    fn stop(self) {
        self.cancel.cancel();
        drop(self.handle);
    }
}

#[derive(Default)]
struct Tasks {
    register: Option<CyclicTask>,
    guard: Option<CyclicTask>,
    wake: Option<WakeAlarm>,
}

struct Inner {
    bridge: Arc<dyn TransportBridge>,
    registry: Arc<Registry>,
    alarm: Arc<dyn Alarm>,
    bus: EventBus,
    mode: ModeState,
    settings: RwLock<ServiceSettings>,
    /// Last window a beacon acknowledged.
    report_window_ms: AtomicU64,
    link_activity: Notify,
    tasks: Mutex<Tasks>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

/// Handle to the finder service. Clones share one service.
#[derive(Clone)]
pub struct FinderService {
    inner: Arc<Inner>,
}

impl FinderService {
    /// Create a service driving `bridge`. Must be called inside a runtime.
    pub fn new(
        bridge: Arc<dyn TransportBridge>,
        registry: Arc<Registry>,
        alarm: Arc<dyn Alarm>,
        settings: ServiceSettings,
    ) -> Self {
        let (tx, rx) = mpsc::channel(BRIDGE_EVENT_CAPACITY);
        bridge.set_event_handler(tx);

        let inner = Arc::new(Inner {
            bridge,
            registry,
            alarm,
            bus: EventBus::default(),
            mode: ModeState::default(),
            settings: RwLock::new(settings),
            report_window_ms: AtomicU64::new(settings.report_window.as_millis() as u64),
            link_activity: Notify::new(),
            tasks: Mutex::new(Tasks::default()),
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(Self::pump(Arc::downgrade(&inner), rx));
        *inner.pump.lock() = Some(pump);
        Self { inner }
    }

    /// Forward bridge events into the service until the bridge goes away.
    async fn pump(inner: Weak<Inner>, mut rx: mpsc::Receiver<BridgeEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            FinderService { inner }.handle_bridge_event(event).await;
        }
        debug!("Bridge event pump stopped");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.bus.subscribe()
    }

    pub fn state(&self) -> ServiceState {
        self.inner.mode.get()
    }

    pub fn role(&self) -> Role {
        self.inner.mode.role()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn bridge(&self) -> &Arc<dyn TransportBridge> {
        &self.inner.bridge
    }

    pub fn settings(&self) -> ServiceSettings {
        *self.inner.settings.read()
    }

    /// Report window most recently acknowledged by a beacon.
    pub fn report_window_ms(&self) -> u64 {
        self.inner.report_window_ms.load(Ordering::SeqCst)
    }

    /// Run one command.
    pub async fn dispatch(&self, command: Command) -> FinderResult<Reply> {
        debug!("Dispatching {:?}", command);
        match command {
            Command::StartSetup => self.start_setup_mode().await?,
            Command::StartGuard => self.start_guard_mode().await?,
            Command::StartReport { address, offset_ms } => {
                self.start_report_mode(&address, offset_ms).await?
            }
            Command::Stop => self.stop().await,
            Command::StartDiscover => self.start_discovery().await?,
            Command::StopDiscover => self.stop_discovery().await,
            Command::Connect(address) => self.connect(&address).await?,
            Command::SendRegister(address) => self.send_register_request(&address).await?,
            Command::SendGetList(address) => self.send_get_list_request(&address).await?,
            Command::SendUnregister { address, targets } => {
                self.send_unregister_request(&address, &targets).await?
            }
            Command::SetAsSidekick => self.set_role(Role::Sidekick),
            Command::SetAsMobile => self.set_role(Role::Mobile),
            Command::Disconnect => self.disconnect().await,
            Command::QueryState => return Ok(self.query_state()),
            Command::QueryBluetoothState => return Ok(self.query_bluetooth_state()),
            Command::SetAlarmToggle(enabled) => self.set_alarm_toggle(enabled),
            Command::SetSleepTime(ms) => self.set_sleep_time(ms)?,
            Command::SetCheckMode(mode) => self.set_check_mode(&mode)?,
        }
        Ok(Reply::Done)
    }

    fn publish(&self, event: ServiceEvent) {
        self.inner.bus.publish(event);
    }

    fn publish_state(&self) {
        self.publish(ServiceEvent::StateChanged {
            state: self.inner.mode.get(),
            role: self.inner.mode.role(),
        });
    }

    fn set_state(&self, state: ServiceState) {
        if self.inner.mode.set(state) != state {
            self.publish_state();
        }
    }

    fn transition(
        &self,
        operation: &'static str,
        from: &[ServiceState],
        to: ServiceState,
    ) -> FinderResult<()> {
        let before = self.inner.mode.get();
        self.inner.mode.transition(operation, from, to)?;
        if before != to {
            self.publish_state();
        }
        Ok(())
    }

    /// Choose the role. The first choice sticks.
    pub fn set_role(&self, role: Role) {
        let before = self.inner.mode.role();
        if self.inner.mode.set_role(role) != before {
            self.publish_state();
        }
    }

    fn require_mobile(&self, operation: &'static str) -> FinderResult<()> {
        match self.inner.mode.role() {
            Role::Mobile => Ok(()),
            role => {
                warn!("Rejecting {} for role {}", operation, role.as_str());
                Err(FinderError::invalid_state(operation, role))
            }
        }
    }

    /// Bring the bridge up for the current role if it is down.
    async fn ensure_bridge(&self, operation: &'static str) -> FinderResult<Role> {
        let role = self.inner.mode.require_role(operation)?;
        if self.inner.bridge.state() == BridgeState::Unknown {
            self.inner.bridge.initialize(role.is_server()).await?;
        }
        Ok(role)
    }

    async fn connect_if_needed(&self, address: &str) -> FinderResult<()> {
        if !is_valid_address(address) {
            return Err(FinderError::InvalidAddress(address.to_string()));
        }
        self.ensure_bridge("connect").await?;
        if self.inner.bridge.is_connected_to(address) {
            return Ok(());
        }
        self.inner.bridge.connect_device_by_address(address).await
    }

    /// Enter `Setup`. A sidekick also opens its registration window.
    pub async fn start_setup_mode(&self) -> FinderResult<()> {
        self.inner
            .mode
            .require("start_setup_mode", &[ServiceState::Unknown])?;
        let role = self.ensure_bridge("start_setup_mode").await?;
        self.transition(
            "start_setup_mode",
            &[ServiceState::Unknown],
            ServiceState::Setup,
        )?;

        if role == Role::Sidekick {
            let service = self.clone();
            let task = self.spawn_task(move |cancel| async move {
                service.register_loop(cancel).await;
            });
            if let Some(previous) = self.inner.tasks.lock().register.replace(task) {
                previous.stop();
            }
        }
        Ok(())
    }

    /// Enter `Guard` and start the scan loop.
    pub async fn start_guard_mode(&self) -> FinderResult<()> {
        const FROM: &[ServiceState] = &[ServiceState::Unknown, ServiceState::Setup];

        self.inner.mode.require("start_guard_mode", FROM)?;
        self.ensure_bridge("start_guard_mode").await?;
        self.transition("start_guard_mode", FROM, ServiceState::Guard)?;

        let service = self.clone();
        let task = self.spawn_task(move |cancel| async move {
            service.guard_loop(cancel).await;
        });
        let mut tasks = self.inner.tasks.lock();
        if let Some(register) = tasks.register.take() {
            register.stop();
        }
        if let Some(previous) = tasks.guard.replace(task) {
            previous.stop();
        }
        Ok(())
    }

    /// Arm the wake alarm that sends a REPORT to `address` every `offset_ms`.
    pub async fn start_report_mode(&self, address: &str, offset_ms: u64) -> FinderResult<()> {
        self.inner
            .mode
            .require("start_report_mode", &[ServiceState::Report])?;
        if !is_valid_address(address) {
            return Err(FinderError::InvalidAddress(address.to_string()));
        }
        if offset_ms == 0 {
            return Err(FinderError::MalformedMessage(
                "report offset must be positive".to_string(),
            ));
        }

        let service = Arc::downgrade(&self.inner);
        let target = address.to_string();
        let wake = WakeAlarm::arm(Duration::from_millis(offset_ms), move || {
            let service = service.clone();
            let target = target.clone();
            async move {
                let Some(inner) = service.upgrade() else {
                    return;
                };
                let service = FinderService { inner };
                if let Err(e) = service.send_report_request(&target).await {
                    warn!("Scheduled report to {} failed: {}", target, e);
                }
            }
        });
        if let Some(previous) = self.inner.tasks.lock().wake.replace(wake) {
            previous.cancel();
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.shutdown("stop").await;
    }

    pub async fn disconnect(&self) {
        self.shutdown("disconnect").await;
    }

    /// Cancel every task, tear the bridge down and return to `Unknown`.
    async fn shutdown(&self, reason: &str) {
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in [tasks.register, tasks.guard].into_iter().flatten() {
            task.stop();
        }
        if let Some(wake) = tasks.wake {
            wake.cancel();
        }

        self.set_state(ServiceState::Unknown);
        self.inner.alarm.stop();
        self.inner.bridge.stop_device_discovery().await;
        self.inner.bridge.destroy().await;
        info!("Service reset to Unknown ({})", reason);
    }

    fn spawn_task<F, Fut>(&self, body: F) -> CyclicTask
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(body(cancel.clone()));
        CyclicTask { cancel, handle }
    }

    /// Keep the bridge listening while in `Setup`.
    ///
    /// Gives up once no link has come or gone for the registration wait.
    /// There is no overall ceiling: each connect or disconnect restarts the
    /// wait.
    async fn register_loop(&self, cancel: CancellationToken) {
        let wait = self.inner.settings.read().registration_wait;
        self.publish(ServiceEvent::RegistrationStarted);
        info!("Registration window open");

        let mut deadline = Instant::now() + wait;
        loop {
            let activity = self.inner.link_activity.notified();
            if cancel.is_cancelled() || self.inner.mode.get() != ServiceState::Setup {
                break;
            }
            if self.inner.bridge.state() == BridgeState::Disconnected {
                if let Err(e) = self.inner.bridge.listen().await {
                    warn!("Listen failed: {}", e);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = activity => deadline = Instant::now() + wait,
                _ = tokio::time::sleep_until(deadline) => {
                    info!("No registration activity for {:?}, giving up", wait);
                    break;
                }
            }
        }

        self.publish(ServiceEvent::RegistrationFinished);
        info!("Registration window closed");
    }

    /// Scan, wait, and recompute lost items while in `Guard`.
    async fn guard_loop(&self, cancel: CancellationToken) {
        info!(
            "Guarding {} item(s)",
            self.inner.registry.guarded_items().len()
        );

        loop {
            if cancel.is_cancelled() || self.inner.mode.get() != ServiceState::Guard {
                break;
            }
            let sleep_time = self.inner.settings.read().guard.sleep_time;

            // Stay reachable for check-ins.
            if self.inner.mode.role() == Role::Sidekick
                && self.inner.bridge.state() == BridgeState::Disconnected
            {
                if let Err(e) = self.inner.bridge.listen().await {
                    debug!("Listen failed: {}", e);
                }
            }

            self.inner.bridge.stop_device_discovery().await;
            self.inner.registry.begin_scan();
            self.inner.bridge.start_device_discovery().await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep_time) => {}
            }
            if self.inner.mode.get() != ServiceState::Guard {
                break;
            }
            self.check_for_lost_items();
        }

        self.inner.alarm.stop();
        self.inner.bridge.stop_device_discovery().await;
        info!("Guard loop stopped");
    }

    /// Recompute lost items, publish their status and drive the alarm.
    pub fn check_for_lost_items(&self) -> Vec<GuardedItem> {
        let guard = self.inner.settings.read().guard;
        let lost = self
            .inner
            .registry
            .check_for_lost_items(guard.check_mode, Instant::now());

        for item in self.inner.registry.guarded_items() {
            self.publish(ServiceEvent::UpdateLost {
                name: item.device.name.clone(),
                address: item.device.address.clone(),
                lost: item.is_lost,
            });
        }

        if lost.is_empty() {
            self.inner.alarm.stop();
        } else {
            warn!("{} guarded item(s) lost", lost.len());
            if guard.alarm_enabled {
                self.inner.alarm.play();
            }
        }
        lost
    }

    pub async fn connect(&self, address: &str) -> FinderResult<()> {
        self.connect_if_needed(address).await
    }

    pub async fn start_discovery(&self) -> FinderResult<()> {
        self.ensure_bridge("start_discovery").await?;
        self.inner.bridge.start_device_discovery().await;
        Ok(())
    }

    pub async fn stop_discovery(&self) {
        self.inner.bridge.stop_device_discovery().await;
    }

    /// Ask the beacon at `address` to guard this device.
    pub async fn send_register_request(&self, address: &str) -> FinderResult<()> {
        self.require_mobile("send_register_request")?;
        self.inner
            .mode
            .require("send_register_request", &[ServiceState::Setup])?;
        self.connect_if_needed(address).await?;

        // The RWO ack may arrive before broadcast returns.
        self.transition(
            "send_register_request",
            &[ServiceState::Setup],
            ServiceState::Registering,
        )?;
        if let Err(e) = self
            .inner
            .bridge
            .broadcast(&Message::Register.to_bytes())
            .await
        {
            let _ = self.transition(
                "send_register_request",
                &[ServiceState::Registering],
                ServiceState::Setup,
            );
            return Err(e);
        }
        Ok(())
    }

    /// Check in with the beacon at `address`.
    pub async fn send_report_request(&self, address: &str) -> FinderResult<()> {
        self.require_mobile("send_report_request")?;
        self.inner
            .mode
            .require("send_report_request", &[ServiceState::Report])?;
        self.connect_if_needed(address).await?;
        self.inner
            .bridge
            .broadcast(&Message::Report.to_bytes())
            .await
    }

    pub async fn send_get_list_request(&self, address: &str) -> FinderResult<()> {
        self.require_mobile("send_get_list_request")?;
        self.inner.mode.require(
            "send_get_list_request",
            &[ServiceState::Setup, ServiceState::Report],
        )?;
        self.connect_if_needed(address).await?;
        self.inner.bridge.broadcast(&Message::List.to_bytes()).await
    }

    /// Ask the beacon at `address` to stop guarding `targets`.
    pub async fn send_unregister_request(
        &self,
        address: &str,
        targets: &[String],
    ) -> FinderResult<()> {
        self.require_mobile("send_unregister_request")?;
        self.inner.mode.require(
            "send_unregister_request",
            &[ServiceState::Setup, ServiceState::Report],
        )?;
        if targets.is_empty() {
            return Err(FinderError::MalformedMessage(
                "no devices to unregister".to_string(),
            ));
        }
        if let Some(bad) = targets.iter().find(|t| !is_valid_address(t)) {
            return Err(FinderError::InvalidAddress(bad.clone()));
        }
        self.connect_if_needed(address).await?;
        self.inner
            .bridge
            .broadcast(&Message::Delete(targets.to_vec()).to_bytes())
            .await
    }

    pub fn query_state(&self) -> Reply {
        let state = self.inner.mode.get();
        let role = self.inner.mode.role();
        self.publish(ServiceEvent::StateChanged { state, role });
        Reply::State { state, role }
    }

    pub fn query_bluetooth_state(&self) -> Reply {
        let state = self.inner.bridge.state();
        self.publish(ServiceEvent::BluetoothState { state });
        Reply::Bluetooth(state)
    }

    pub fn set_alarm_toggle(&self, enabled: bool) {
        self.inner.settings.write().guard.alarm_enabled = enabled;
        if !enabled {
            self.inner.alarm.stop();
        }
        info!("Alarm {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn set_sleep_time(&self, ms: u64) -> FinderResult<()> {
        if ms == 0 {
            return Err(FinderError::MalformedMessage(
                "sleep time must be positive".to_string(),
            ));
        }
        self.inner.settings.write().guard.sleep_time = Duration::from_millis(ms);
        info!("Guard sleep time set to {} ms", ms);
        Ok(())
    }

    pub fn set_check_mode(&self, mode: &str) -> FinderResult<()> {
        let mode = CheckMode::parse(mode)
            .ok_or_else(|| FinderError::MalformedMessage(format!("unknown check mode {:?}", mode)))?;
        self.inner.settings.write().guard.check_mode = mode;
        info!("Check mode set to {}", mode.as_str());
        Ok(())
    }

    async fn handle_bridge_event(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::Connected { name, address } => {
                self.inner.link_activity.notify_waiters();
                self.publish(ServiceEvent::Connected { name, address });
            }
            BridgeEvent::Disconnected { name, address } => {
                self.inner.link_activity.notify_waiters();
                self.publish(ServiceEvent::Disconnected { name, address });
            }
            BridgeEvent::DataReceived {
                name,
                address,
                data,
            } => {
                self.publish(ServiceEvent::DataReceived {
                    name: name.clone(),
                    address: address.clone(),
                    text: String::from_utf8_lossy(&data).trim().to_string(),
                });
                for message in decode_stream(&data) {
                    self.handle_message(&name, &address, message).await;
                }
            }
            BridgeEvent::DeviceFound(device) => self.handle_device_found(device),
        }
    }

    fn handle_device_found(&self, device: DiscoveredDevice) {
        let guarded = self.inner.registry.record_found(&device);
        self.publish(ServiceEvent::DeviceDiscovered {
            name: device.name,
            address: device.address,
            rssi: device.rssi,
        });
        if let Some(item) = guarded {
            if self.inner.mode.get() == ServiceState::Guard {
                self.publish(ServiceEvent::UpdateFound {
                    name: item.device.name,
                    address: item.device.address,
                    rssi: item.rssi,
                });
            }
        }
    }

    /// Act on one message from `name` at `address`.
    ///
    /// A sidekick answers every request, with `ERR:<reason>` when it cannot
    /// serve it. A mobile only acts on responses.
    pub async fn handle_message(&self, name: &str, address: &str, message: Message) {
        debug!("{} from {} ({})", message.keyword(), name, address);
        let role = self.inner.mode.role();

        if message.is_request() {
            if role != Role::Sidekick {
                warn!("Ignoring {} request as {}", message.keyword(), role.as_str());
                return;
            }
            let reply = self
                .handle_request(name, address, message)
                .unwrap_or_else(|e| Message::Err(e.to_string()));
            if let Err(e) = self.inner.bridge.broadcast(&reply.to_bytes()).await {
                warn!("Failed to send {} to {}: {}", reply.keyword(), address, e);
            }
        } else {
            if role != Role::Mobile {
                debug!("Ignoring {} response as {}", message.keyword(), role.as_str());
                return;
            }
            self.handle_response(name, address, message);
        }
    }

    fn handle_request(&self, name: &str, address: &str, message: Message) -> FinderResult<Message> {
        match message {
            Message::Register => self.handle_register_request(name, address),
            Message::Report => self.handle_report_request(name, address),
            Message::List => self.handle_get_list_request(),
            Message::Delete(addresses) => self.handle_delete_request(&addresses),
            other => Err(FinderError::MalformedMessage(format!(
                "{} is not a request",
                other.keyword()
            ))),
        }
    }

    fn report_window(&self) -> Duration {
        self.inner.settings.read().report_window
    }

    /// Guard the requesting device and hand it its report window.
    pub fn handle_register_request(&self, name: &str, address: &str) -> FinderResult<Message> {
        self.inner
            .mode
            .require("handle_register_request", &[ServiceState::Setup])?;
        let window = self.report_window();
        self.inner.registry.register(name, address, window);
        info!("Registered {} ({})", name, address);
        self.publish(ServiceEvent::Registered {
            name: name.to_string(),
            address: address.to_string(),
        });
        Ok(Message::Rwo(window.as_millis() as u64))
    }

    /// Refresh the report window of a guarded device.
    pub fn handle_report_request(&self, name: &str, address: &str) -> FinderResult<Message> {
        self.inner
            .mode
            .require("handle_report_request", &[ServiceState::Guard])?;
        let window = self.report_window();
        if !self.inner.registry.refresh_report_window(address, window) {
            warn!("Report from unregistered {} ({})", name, address);
            return Ok(Message::Err(format!("{} is not registered", address)));
        }
        debug!("Report window of {} refreshed", address);
        Ok(Message::Rwo(window.as_millis() as u64))
    }

    pub fn handle_get_list_request(&self) -> FinderResult<Message> {
        self.inner
            .mode
            .require("handle_get_list_request", &[ServiceState::Setup])?;
        let items = self.inner.registry.list_items();
        let total = items.len();
        let (reply, left_out) = Message::rlist_within(items, MAX_PENDING_BYTES);
        if left_out > 0 {
            warn!("RLIST carries {} of {} devices", total - left_out, total);
        }
        Ok(reply)
    }

    /// Unregister `addresses`. Addresses that were not guarded come back in
    /// an `ERR` reply.
    pub fn handle_delete_request(&self, addresses: &[String]) -> FinderResult<Message> {
        self.inner
            .mode
            .require("handle_delete_request", &[ServiceState::Setup])?;
        let failed = self.inner.registry.unregister_many(addresses);
        for address in addresses.iter().filter(|a| !failed.contains(a)) {
            self.publish(ServiceEvent::Unregistered {
                address: address.clone(),
            });
        }
        if failed.is_empty() {
            Ok(Message::Ok(String::new()))
        } else {
            warn!("Could not unregister {}", failed.join(","));
            Ok(Message::Err(failed.join(",")))
        }
    }

    fn handle_response(&self, name: &str, address: &str, message: Message) {
        match message {
            Message::Rwo(window_ms) => {
                if let Err(e) = self.handle_rwo_response(name, address, window_ms) {
                    debug!("Dropped RWO from {}: {}", address, e);
                }
            }
            Message::RList(items) => {
                info!("{} guards {} device(s)", name, items.len());
                self.publish(ServiceEvent::ListReceived { items });
            }
            Message::Ok(detail) => self.publish(ServiceEvent::PeerReply { ok: true, detail }),
            Message::Err(detail) => {
                warn!("{} replied ERR:{}", name, detail);
                if self.inner.mode.get() == ServiceState::Registering {
                    let _ = self.transition(
                        "handle_err_response",
                        &[ServiceState::Registering],
                        ServiceState::Setup,
                    );
                }
                self.publish(ServiceEvent::PeerReply { ok: false, detail });
            }
            other => debug!("Unexpected {} response", other.keyword()),
        }
    }

    /// Cache the acknowledged window and finish a pending registration.
    pub fn handle_rwo_response(&self, name: &str, address: &str, window_ms: u64) -> FinderResult<()> {
        self.inner.mode.require(
            "handle_rwo_response",
            &[ServiceState::Report, ServiceState::Registering],
        )?;
        self.inner
            .report_window_ms
            .store(window_ms, Ordering::SeqCst);
        self.publish(ServiceEvent::ReportWindow { window_ms });

        let window = Duration::from_millis(window_ms);
        if self.inner.mode.get() == ServiceState::Registering {
            self.transition(
                "handle_rwo_response",
                &[ServiceState::Registering],
                ServiceState::Report,
            )?;
            self.inner.registry.register(name, address, window);
            info!("Registered with {} ({}), window {} ms", name, address, window_ms);
            self.publish(ServiceEvent::Registered {
                name: name.to_string(),
                address: address.to_string(),
            });
        } else {
            self.inner.registry.refresh_report_window(address, window);
        }
        Ok(())
    }
}
