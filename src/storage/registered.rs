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

//! Registered-device list.
//!
//! Stored as a JSON array of `"name,address"` strings in `registered.json`.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One persisted device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredDevice {
    pub name: String,
    pub address: String,
}

impl RegisteredDevice {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// `name,address`, with commas in the name replaced.
    pub fn encode(&self) -> String {
        format!("{},{}", self.name.replace(',', " "), self.address)
    }

    /// Split on the last comma; addresses never contain one.
    pub fn decode(entry: &str) -> Option<Self> {
        let (name, address) = entry.rsplit_once(',')?;
        let address = address.trim();
        if address.is_empty() {
            return None;
        }
        Some(Self::new(name.trim(), address))
    }
}

/// Registered-device store backed by a JSON file.
pub struct RegisteredStore {
    /// Path to the registered.json file.
    path: PathBuf,
    devices: RwLock<Vec<RegisteredDevice>>,
}

impl RegisteredStore {
    /// Open the store in `data_dir`, loading any saved devices.
    pub fn new(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("registered.json");
        let devices = Self::load_from_file(&path)?;
        info!("Loaded {} registered device(s)", devices.len());
        Ok(Self {
            path,
            devices: RwLock::new(devices),
        })
    }

    fn load_from_file(path: &Path) -> Result<Vec<RegisteredDevice>> {
        if !path.exists() {
            debug!("Registered device file doesn't exist, starting empty");
            return Ok(Vec::new());
        }

        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let entries: Vec<String> = serde_json::from_str(&content)
            .with_context(|| "Failed to parse registered.json")?;

        let mut devices: Vec<RegisteredDevice> = Vec::new();
        for entry in entries {
            match RegisteredDevice::decode(&entry) {
                Some(device) => {
                    devices.retain(|d| d.address != device.address);
                    devices.push(device);
                }
                None => warn!("Skipping malformed registered entry {:?}", entry),
            }
        }
        Ok(devices)
    }

    /// Save current devices to file.
    pub fn save(&self) -> Result<()> {
        let entries: Vec<String> = self.devices.read().iter().map(|d| d.encode()).collect();

        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(&entries)?;
        std::fs::write(&self.path, content)?;

        debug!("Saved {} registered device(s)", entries.len());
        Ok(())
    }

    /// Add or rename a device and save.
    pub fn add(&self, name: &str, address: &str) -> Result<()> {
        {
            let mut devices = self.devices.write();
            match devices.iter_mut().find(|d| d.address == address) {
                Some(device) => device.name = name.to_string(),
                None => devices.push(RegisteredDevice::new(name, address)),
            }
        }
        self.save()
    }

    /// Remove a device and save. Returns false if it was not stored.
    pub fn remove(&self, address: &str) -> Result<bool> {
        let removed = {
            let mut devices = self.devices.write();
            let before = devices.len();
            devices.retain(|d| d.address != address);
            devices.len() != before
        };
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn devices(&self) -> Vec<RegisteredDevice> {
        self.devices.read().clone()
    }

    /// `(name, address)` pairs for restoring into the registry.
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.devices
            .read()
            .iter()
            .map(|d| (d.name.clone(), d.address.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_entry_encoding() {
        let device = RegisteredDevice::new("Bob's, phone", "AA:BB:CC:DD:EE:FF");
        assert_eq!(device.encode(), "Bob's  phone,AA:BB:CC:DD:EE:FF");
        assert_eq!(
            RegisteredDevice::decode("phone1,AA:BB:CC:DD:EE:FF"),
            Some(RegisteredDevice::new("phone1", "AA:BB:CC:DD:EE:FF"))
        );
        assert_eq!(RegisteredDevice::decode("no address"), None);
        assert_eq!(RegisteredDevice::decode("phone,"), None);
    }

    #[test]
    fn test_add_remove_persist() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = RegisteredStore::new(temp_dir.path())?;
        assert!(store.devices().is_empty());

        store.add("phone", "AA:BB:CC:DD:EE:FF")?;
        store.add("phone1", "AA:BB:CC:DD:EE:FF")?;
        store.add("beacon", "11:22:33:44:55:66")?;
        assert_eq!(store.devices().len(), 2);

        let reopened = RegisteredStore::new(temp_dir.path())?;
        assert_eq!(
            reopened.pairs(),
            vec![
                ("phone1".to_string(), "AA:BB:CC:DD:EE:FF".to_string()),
                ("beacon".to_string(), "11:22:33:44:55:66".to_string()),
            ]
        );

        assert!(reopened.remove("AA:BB:CC:DD:EE:FF")?);
        assert!(!reopened.remove("AA:BB:CC:DD:EE:FF")?);
        assert_eq!(RegisteredStore::new(temp_dir.path())?.devices().len(), 1);
        Ok(())
    }

    #[test]
    fn test_file_format_is_string_array() -> Result<()> {
        let temp_dir = TempDir::new()?;
        std::fs::write(
            temp_dir.path().join("registered.json"),
            r#"["phone1,AA:BB:CC:DD:EE:FF", "garbage"]"#,
        )?;
        let store = RegisteredStore::new(temp_dir.path())?;
        assert_eq!(store.devices(), vec![RegisteredDevice::new("phone1", "AA:BB:CC:DD:EE:FF")]);
        Ok(())
    }
}
