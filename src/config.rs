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

//! Configuration module.
//!
//! Handles loading and saving daemon settings.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bluetooth::ble_constants::{config as ble, rfcomm};
use crate::bluetooth::DEFAULT_REPORT_WINDOW_MS;
use crate::registry::CheckMode;
use crate::service::{GuardSettings, Role, ServiceSettings};

const APP_DIR: &str = "sidekick-finder";

/// Daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for the registered-device list.
    #[serde(skip)]
    pub data_dir: PathBuf,

    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// Service settings.
    pub service: ServiceConfig,

    /// Guard loop settings.
    pub guard: GuardConfig,
}

/// Which bridge carries the protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Rfcomm,
    Gatt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Name the adapter advertises.
    pub device_name: String,

    pub transport: Transport,

    /// RFCOMM channel the server binds and the client dials.
    pub rfcomm_channel: u8,

    pub connect_timeout_ms: u64,

    /// BLE scans stop on their own after this long.
    pub scan_ceiling_ms: u64,

    /// Pause between queued GATT requests.
    pub gatt_request_delay_ms: u64,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            device_name: "Sidekick".to_string(),
            transport: Transport::Rfcomm,
            rfcomm_channel: rfcomm::CHANNEL,
            connect_timeout_ms: rfcomm::CONNECT_TIMEOUT.as_millis() as u64,
            scan_ceiling_ms: ble::SCAN_CEILING.as_millis() as u64,
            gatt_request_delay_ms: ble::REQUEST_DELAY.as_millis() as u64,
        }
    }
}

impl BluetoothConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn scan_ceiling(&self) -> Duration {
        Duration::from_millis(self.scan_ceiling_ms)
    }

    pub fn gatt_request_delay(&self) -> Duration {
        Duration::from_millis(self.gatt_request_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Role chosen at start-up. Left unset, the console picks it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,

    /// Window a beacon hands out in RWO replies.
    pub report_window_ms: u64,

    /// Registration gives up after this long without link activity.
    pub registration_wait_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            role: None,
            report_window_ms: DEFAULT_REPORT_WINDOW_MS,
            registration_wait_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Pause between scan start and the lost check.
    pub sleep_time_ms: u64,

    pub alarm_enabled: bool,

    pub check_mode: CheckMode,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            sleep_time_ms: 15_000,
            alarm_enabled: true,
            check_mode: CheckMode::Discovery,
        }
    }
}

impl Config {
    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);

        Self::load_from(&config_dir, data_dir)
    }

    /// Load `config.toml` from `config_dir`, writing defaults if it is missing.
    pub fn load_from(config_dir: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(config_dir)?;

        let config_path = config_dir.join("config.toml");

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            let config = Self::default();
            let content = toml::to_string_pretty(&config)?;
            std::fs::write(&config_path, content)?;
            config
        };
        config.validate()?;

        // Set data directory
        config.data_dir = data_dir;
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.guard.sleep_time_ms == 0 {
            bail!("guard.sleep_time_ms must be positive");
        }
        if self.service.report_window_ms == 0 {
            bail!("service.report_window_ms must be positive");
        }
        if self.bluetooth.rfcomm_channel == 0 || self.bluetooth.rfcomm_channel > 30 {
            bail!(
                "bluetooth.rfcomm_channel must be 1-30, got {}",
                self.bluetooth.rfcomm_channel
            );
        }
        Ok(())
    }

    /// Service tuning derived from this configuration.
    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            report_window: Duration::from_millis(self.service.report_window_ms),
            registration_wait: Duration::from_millis(self.service.registration_wait_ms),
            guard: GuardSettings {
                sleep_time: Duration::from_millis(self.guard.sleep_time_ms),
                alarm_enabled: self.guard.alarm_enabled,
                check_mode: self.guard.check_mode,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_writes_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config = Config::load_from(temp_dir.path(), temp_dir.path().join("data"))?;

        assert!(temp_dir.path().join("config.toml").exists());
        assert!(config.data_dir.exists());
        assert_eq!(config.bluetooth.transport, Transport::Rfcomm);
        assert_eq!(config.bluetooth.rfcomm_channel, 1);
        assert_eq!(config.service_settings(), ServiceSettings::default());
        Ok(())
    }

    #[test]
    fn test_partial_file_keeps_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        std::fs::write(
            temp_dir.path().join("config.toml"),
            "[service]\nrole = \"sidekick\"\n\n[guard]\nsleep_time_ms = 5000\ncheck_mode = \"report_window\"\n",
        )?;
        let config = Config::load_from(temp_dir.path(), temp_dir.path().join("data"))?;

        assert_eq!(config.service.role, Some(Role::Sidekick));
        assert_eq!(config.guard.sleep_time_ms, 5000);
        assert_eq!(config.guard.check_mode, CheckMode::ReportWindow);
        assert!(config.guard.alarm_enabled);
        assert_eq!(config.bluetooth.connect_timeout(), Duration::from_secs(15));
        Ok(())
    }

    #[test]
    fn test_zero_sleep_time_is_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        std::fs::write(
            temp_dir.path().join("config.toml"),
            "[guard]\nsleep_time_ms = 0\n",
        )?;
        assert!(Config::load_from(temp_dir.path(), temp_dir.path().join("data")).is_err());
        Ok(())
    }
}
