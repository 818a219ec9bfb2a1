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

//! Service mode state management.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{FinderError, FinderResult};
use crate::registry::CheckMode;

/// Service mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceState {
    Unknown,
    Setup,
    Registering,
    Guard,
    Report,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Unknown => "Unknown",
            ServiceState::Setup => "Setup",
            ServiceState::Registering => "Registering",
            ServiceState::Guard => "Guard",
            ServiceState::Report => "Report",
        }
    }
}

/// Which side of the protocol this node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Unknown,
    /// Stationary beacon accepting registrations.
    Sidekick,
    /// Phone connecting out to a beacon.
    Mobile,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Unknown => "Unknown",
            Role::Sidekick => "Sidekick",
            Role::Mobile => "Mobile",
        }
    }

    /// Beacons act as the transport server.
    pub fn is_server(&self) -> bool {
        matches!(self, Role::Sidekick)
    }
}

/// Guard loop tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardSettings {
    /// Pause between a scan start and the lost check.
    pub sleep_time: Duration,
    pub alarm_enabled: bool,
    pub check_mode: CheckMode,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            sleep_time: Duration::from_millis(15_000),
            alarm_enabled: true,
            check_mode: CheckMode::Discovery,
        }
    }
}

/// Service tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSettings {
    /// Window handed to peers in RWO replies.
    pub report_window: Duration,
    /// How long the registration loop waits without link activity.
    pub registration_wait: Duration,
    pub guard: GuardSettings,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            report_window: Duration::from_millis(crate::bluetooth::DEFAULT_REPORT_WINDOW_MS),
            registration_wait: Duration::from_millis(60_000),
            guard: GuardSettings::default(),
        }
    }
}

/// Mode and role, each behind its own lock.
#[derive(Debug)]
pub struct ModeState {
    state: RwLock<ServiceState>,
    role: RwLock<Role>,
}

impl Default for ModeState {
    fn default() -> Self {
        Self {
            state: RwLock::new(ServiceState::Unknown),
            role: RwLock::new(Role::Unknown),
        }
    }
}

impl ModeState {
    pub fn get(&self) -> ServiceState {
        *self.state.read()
    }

    /// Set the mode unconditionally. Returns the previous mode.
    pub fn set(&self, state: ServiceState) -> ServiceState {
        let mut current = self.state.write();
        let previous = *current;
        if previous != state {
            info!("Service state {} -> {}", previous.as_str(), state.as_str());
            *current = state;
        }
        previous
    }

    /// Move to `to` if the current mode is one of `from`.
    pub fn transition(
        &self,
        operation: &'static str,
        from: &[ServiceState],
        to: ServiceState,
    ) -> FinderResult<()> {
        let mut current = self.state.write();
        if !from.contains(&*current) {
            warn!("Rejecting {} in state {}", operation, current.as_str());
            return Err(FinderError::invalid_state(operation, *current));
        }
        if *current != to {
            info!("Service state {} -> {}", current.as_str(), to.as_str());
            *current = to;
        }
        Ok(())
    }

    /// Fail unless the mode is one of `allowed`.
    pub fn require(&self, operation: &'static str, allowed: &[ServiceState]) -> FinderResult<()> {
        let current = self.get();
        if allowed.contains(&current) {
            Ok(())
        } else {
            warn!("Rejecting {} in state {}", operation, current.as_str());
            Err(FinderError::invalid_state(operation, current))
        }
    }

    pub fn role(&self) -> Role {
        *self.role.read()
    }

    /// Set the role once. Later calls leave it unchanged and still succeed.
    pub fn set_role(&self, role: Role) -> Role {
        let mut current = self.role.write();
        if *current == Role::Unknown && role != Role::Unknown {
            info!("Role set to {}", role.as_str());
            *current = role;
        } else if *current != role {
            debug!("Role already {}, ignoring {}", current.as_str(), role.as_str());
        }
        *current
    }

    /// Fail unless a role has been chosen.
    pub fn require_role(&self, operation: &'static str) -> FinderResult<Role> {
        match self.role() {
            Role::Unknown => {
                warn!("Rejecting {}: no role set", operation);
                Err(FinderError::invalid_state(operation, Role::Unknown))
            }
            role => Ok(role),
        }
    }
}
