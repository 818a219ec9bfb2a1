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

//! Commands accepted by the service and their console syntax.

use std::str::FromStr;

use super::state::{Role, ServiceState};
use crate::bluetooth::{is_valid_address, BridgeState};
use crate::error::FinderError;

/// Inbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartSetup,
    StartGuard,
    StartReport { address: String, offset_ms: u64 },
    Stop,
    StartDiscover,
    StopDiscover,
    Connect(String),
    SendRegister(String),
    SendGetList(String),
    SendUnregister { address: String, targets: Vec<String> },
    SetAsSidekick,
    SetAsMobile,
    Disconnect,
    QueryState,
    QueryBluetoothState,
    SetAlarmToggle(bool),
    SetSleepTime(u64),
    SetCheckMode(String),
}

/// Result of a successfully dispatched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Done,
    State { state: ServiceState, role: Role },
    Bluetooth(BridgeState),
}

/// Console usage text.
pub const USAGE: &str = "\
commands:
  sidekick | mobile                 choose the role (first choice sticks)
  start-setup | start-guard         enter setup or guard mode
  start-report <addr> <ms>          check in with a beacon every <ms>
  register <addr>                   send REGISTER to a beacon
  list <addr>                       ask a beacon for its device list
  unregister <addr> <a,b,...>       ask a beacon to forget devices
  connect <addr>                    open a link to a beacon
  discover | stop-discover          start or stop scanning
  alarm on|off                      enable or disable the alarm tone
  sleep <ms>                        guard scan interval
  check-mode discovery|report_window
  state | bt-state                  print service or bluetooth state
  stop | disconnect                 leave the current mode";

fn malformed(line: &str, why: &str) -> FinderError {
    FinderError::MalformedMessage(format!("{}: {}", why, line.trim()))
}

fn address_arg(line: &str, arg: Option<&str>) -> Result<String, FinderError> {
    let address = arg
        .ok_or_else(|| malformed(line, "missing address"))?
        .to_uppercase();
    if is_valid_address(&address) {
        Ok(address)
    } else {
        Err(FinderError::InvalidAddress(address))
    }
}

fn number_arg(line: &str, arg: Option<&str>) -> Result<u64, FinderError> {
    arg.ok_or_else(|| malformed(line, "missing number"))?
        .parse()
        .map_err(|_| malformed(line, "not a number"))
}

impl FromStr for Command {
    type Err = FinderError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let keyword = words.next().ok_or_else(|| malformed(line, "empty command"))?;

        let command = match keyword.to_lowercase().as_str() {
            "start-setup" => Command::StartSetup,
            "start-guard" => Command::StartGuard,
            "start-report" => {
                let address = address_arg(line, words.next())?;
                let offset_ms = number_arg(line, words.next())?;
                Command::StartReport { address, offset_ms }
            }
            "stop" => Command::Stop,
            "discover" => Command::StartDiscover,
            "stop-discover" => Command::StopDiscover,
            "connect" => Command::Connect(address_arg(line, words.next())?),
            "register" => Command::SendRegister(address_arg(line, words.next())?),
            "list" => Command::SendGetList(address_arg(line, words.next())?),
            "unregister" => {
                let address = address_arg(line, words.next())?;
                let targets = words
                    .next()
                    .ok_or_else(|| malformed(line, "missing devices"))?
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| address_arg(line, Some(s)))
                    .collect::<Result<Vec<_>, _>>()?;
                Command::SendUnregister { address, targets }
            }
            "sidekick" => Command::SetAsSidekick,
            "mobile" => Command::SetAsMobile,
            "disconnect" => Command::Disconnect,
            "state" => Command::QueryState,
            "bt-state" => Command::QueryBluetoothState,
            "alarm" => match words.next().map(|w| w.to_lowercase()).as_deref() {
                Some("on") => Command::SetAlarmToggle(true),
                Some("off") => Command::SetAlarmToggle(false),
                _ => return Err(malformed(line, "expected on or off")),
            },
            "sleep" => Command::SetSleepTime(number_arg(line, words.next())?),
            "check-mode" => Command::SetCheckMode(
                words
                    .next()
                    .ok_or_else(|| malformed(line, "missing mode"))?
                    .to_string(),
            ),
            _ => return Err(malformed(line, "unknown command")),
        };

        if words.next().is_some() {
            return Err(malformed(line, "unexpected arguments"));
        }
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!("start-setup".parse(), Ok(Command::StartSetup));
        assert_eq!("  STOP ".parse(), Ok(Command::Stop));
        assert_eq!("bt-state".parse(), Ok(Command::QueryBluetoothState));
        assert_eq!("alarm off".parse(), Ok(Command::SetAlarmToggle(false)));
        assert_eq!("sleep 5000".parse(), Ok(Command::SetSleepTime(5000)));
    }

    #[test]
    fn test_parse_address_commands() {
        assert_eq!(
            "register aa:bb:cc:dd:ee:ff".parse(),
            Ok(Command::SendRegister("AA:BB:CC:DD:EE:FF".to_string()))
        );
        assert_eq!(
            "start-report AA:BB:CC:DD:EE:FF 30000".parse(),
            Ok(Command::StartReport {
                address: "AA:BB:CC:DD:EE:FF".to_string(),
                offset_ms: 30000,
            })
        );
        assert_eq!(
            "unregister AA:BB:CC:DD:EE:FF 00:00:00:00:00:01,00:00:00:00:00:02".parse(),
            Ok(Command::SendUnregister {
                address: "AA:BB:CC:DD:EE:FF".to_string(),
                targets: vec![
                    "00:00:00:00:00:01".to_string(),
                    "00:00:00:00:00:02".to_string(),
                ],
            })
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            "connect nowhere".parse::<Command>(),
            Err(FinderError::InvalidAddress(_))
        ));
        assert!(matches!(
            "sleep soon".parse::<Command>(),
            Err(FinderError::MalformedMessage(_))
        ));
        assert!("fly".parse::<Command>().is_err());
        assert!("".parse::<Command>().is_err());
        assert!("stop now".parse::<Command>().is_err());
    }
}
