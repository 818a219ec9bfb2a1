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

//! Known and guarded device registry.
//!
//! Devices are keyed by address. Known devices come from discovery and
//! registration; guarded items are the registered subset the guard loop
//! watches for.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bluetooth::{DiscoveredDevice, GuardStatus, ListItem};

/// Last known presence of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PresenceStatus {
    Unknown,
    NotFound,
    Found,
}

/// How the guard loop decides an item is lost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckMode {
    /// Lost when not seen during the last scan.
    #[default]
    Discovery,
    /// Lost when the report window passed without a check-in.
    ReportWindow,
}

impl CheckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckMode::Discovery => "discovery",
            CheckMode::ReportWindow => "report_window",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "discovery" => Some(CheckMode::Discovery),
            "report_window" | "report-window" => Some(CheckMode::ReportWindow),
            _ => None,
        }
    }
}

/// Identity record of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnownDevice {
    pub name: String,
    pub address: String,
    pub status: PresenceStatus,
    pub registered: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl KnownDevice {
    fn new(name: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            status: PresenceStatus::Unknown,
            registered: false,
            last_seen: None,
        }
    }
}

/// A registered device the guard loop watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedItem {
    pub device: KnownDevice,
    pub report_window_deadline: Instant,
    pub is_lost: bool,
    pub rssi: i16,
}

impl GuardedItem {
    pub fn name(&self) -> &str {
        &self.device.name
    }

    pub fn address(&self) -> &str {
        &self.device.address
    }
}

#[derive(Default)]
struct Inner {
    known: Vec<KnownDevice>,
    guarded: Vec<GuardedItem>,
    found: HashMap<String, i16>,
}

impl Inner {
    fn known_mut(&mut self, name: &str, address: &str) -> &mut KnownDevice {
        match self.known.iter().position(|d| d.address == address) {
            Some(index) => {
                let device = &mut self.known[index];
                if !name.is_empty() && device.name != name {
                    debug!("Renaming {} from {} to {}", address, device.name, name);
                    device.name = name.to_string();
                }
                device
            }
            None => {
                self.known.push(KnownDevice::new(name, address));
                let last = self.known.len() - 1;
                &mut self.known[last]
            }
        }
    }
}

/// Shared device registry. All read-modify-write sequences hold one lock.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a known device or update its name.
    pub fn upsert_known(&self, name: &str, address: &str) -> KnownDevice {
        self.inner.lock().known_mut(name, address).clone()
    }

    /// Register `address` as guarded with a report window of `window`.
    ///
    /// Returns true when the device was not guarded before. Registering an
    /// existing address updates it in place.
    pub fn register(&self, name: &str, address: &str, window: Duration) -> bool {
        let mut inner = self.inner.lock();
        let device = {
            let device = inner.known_mut(name, address);
            device.registered = true;
            device.clone()
        };
        let deadline = Instant::now() + window;

        match inner.guarded.iter_mut().find(|g| g.device.address == address) {
            Some(item) => {
                item.device = device;
                item.report_window_deadline = deadline;
                item.is_lost = false;
                false
            }
            None => {
                info!("Guarding {} ({})", device.name, device.address);
                inner.guarded.push(GuardedItem {
                    device,
                    report_window_deadline: deadline,
                    is_lost: false,
                    rssi: 0,
                });
                true
            }
        }
    }

    /// Push the report window of a guarded item `window` into the future.
    pub fn refresh_report_window(&self, address: &str, window: Duration) -> bool {
        let mut inner = self.inner.lock();
        match inner.guarded.iter_mut().find(|g| g.device.address == address) {
            Some(item) => {
                item.report_window_deadline = Instant::now() + window;
                item.is_lost = false;
                true
            }
            None => false,
        }
    }

    /// Stop guarding `address`. Returns false if it was not guarded.
    pub fn unregister(&self, address: &str) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.guarded.len();
        inner.guarded.retain(|g| g.device.address != address);
        if inner.guarded.len() == before {
            return false;
        }
        if let Some(device) = inner.known.iter_mut().find(|d| d.address == address) {
            device.registered = false;
        }
        info!("Stopped guarding {}", address);
        true
    }

    /// Unregister every address, returning the ones that were not guarded.
    pub fn unregister_many(&self, addresses: &[String]) -> Vec<String> {
        addresses
            .iter()
            .filter(|address| !self.unregister(address))
            .cloned()
            .collect()
    }

    pub fn guarded(&self, address: &str) -> Option<GuardedItem> {
        self.inner
            .lock()
            .guarded
            .iter()
            .find(|g| g.device.address == address)
            .cloned()
    }

    pub fn guarded_items(&self) -> Vec<GuardedItem> {
        self.inner.lock().guarded.clone()
    }

    pub fn known_devices(&self) -> Vec<KnownDevice> {
        self.inner.lock().known.clone()
    }

    /// Entries for an RLIST response, guarded devices first.
    pub fn list_items(&self) -> Vec<ListItem> {
        let inner = self.inner.lock();
        let (guarded, others): (Vec<&KnownDevice>, Vec<&KnownDevice>) =
            inner.known.iter().partition(|d| d.registered);
        guarded
            .into_iter()
            .chain(others)
            .map(|d| ListItem {
                name: d.name.clone(),
                address: d.address.clone(),
                status: if d.registered {
                    GuardStatus::Guarded
                } else {
                    GuardStatus::NotGuarded
                },
            })
            .collect()
    }

    /// Clear the found-set ahead of a new scan.
    pub fn begin_scan(&self) {
        self.inner.lock().found.clear();
    }

    /// Record a device seen by discovery.
    ///
    /// Returns the guarded item when the device is guarded.
    pub fn record_found(&self, seen: &DiscoveredDevice) -> Option<GuardedItem> {
        let rssi = seen.rssi.unwrap_or(0);
        let mut inner = self.inner.lock();
        inner.found.insert(seen.address.clone(), rssi);

        let device = {
            let device = inner.known_mut(&seen.name, &seen.address);
            device.status = PresenceStatus::Found;
            device.last_seen = Some(Utc::now());
            device.clone()
        };

        let item = inner
            .guarded
            .iter_mut()
            .find(|g| g.device.address == seen.address)?;
        item.device = device;
        item.rssi = rssi;
        Some(item.clone())
    }

    /// Addresses seen since the last [`Registry::begin_scan`].
    pub fn found_addresses(&self) -> HashSet<String> {
        self.inner.lock().found.keys().cloned().collect()
    }

    /// Recompute `is_lost` for every guarded item and return the lost ones.
    pub fn check_for_lost_items(&self, mode: CheckMode, now: Instant) -> Vec<GuardedItem> {
        let mut inner = self.inner.lock();
        let lost: HashSet<String> = match mode {
            CheckMode::Discovery => {
                let found: HashSet<String> = inner.found.keys().cloned().collect();
                lost_items(&inner.guarded, &found)
                    .into_iter()
                    .map(|g| g.device.address)
                    .collect()
            }
            CheckMode::ReportWindow => inner
                .guarded
                .iter()
                .filter(|g| g.report_window_deadline <= now)
                .map(|g| g.device.address.clone())
                .collect(),
        };

        for item in inner.guarded.iter_mut() {
            item.is_lost = lost.contains(&item.device.address);
            item.device.status = if item.is_lost {
                PresenceStatus::NotFound
            } else {
                PresenceStatus::Found
            };
        }
        let statuses: Vec<(String, PresenceStatus)> = inner
            .guarded
            .iter()
            .map(|g| (g.device.address.clone(), g.device.status))
            .collect();
        for (address, status) in statuses {
            if let Some(device) = inner.known.iter_mut().find(|d| d.address == address) {
                device.status = status;
            }
        }

        inner.guarded.iter().filter(|g| g.is_lost).cloned().collect()
    }

    /// Guard `name,address` pairs loaded from the registered-device store.
    pub fn restore(&self, devices: &[(String, String)], window: Duration) {
        for (name, address) in devices {
            self.register(name, address, window);
        }
        if !devices.is_empty() {
            info!("Restored {} registered device(s)", devices.len());
        }
    }
}

/// Guarded items whose address is missing from `found`.
pub fn lost_items(guarded: &[GuardedItem], found: &HashSet<String>) -> Vec<GuardedItem> {
    guarded
        .iter()
        .filter(|g| !found.contains(&g.device.address))
        .cloned()
        .collect()
}
