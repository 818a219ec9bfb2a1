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

//! Sidekick Finder daemon

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sidekick_finder::alarm::LogAlarm;
use sidekick_finder::bluetooth::TransportBridge;
use sidekick_finder::config::Config;
use sidekick_finder::events::EventProcessor;
use sidekick_finder::service::USAGE;
use sidekick_finder::storage::RegisteredStore;
use sidekick_finder::{Command, FinderService, Registry, Reply};

#[cfg(feature = "bluez")]
async fn create_bridge(config: &Config) -> Result<Arc<dyn TransportBridge>> {
    use sidekick_finder::bluetooth::{BluezRadio, GattBridge, GattTiming, RfcommBridge};
    use sidekick_finder::config::Transport;

    let bluetooth = &config.bluetooth;
    match bluetooth.transport {
        Transport::Rfcomm => {
            let radio = BluezRadio::new(&bluetooth.device_name, bluetooth.rfcomm_channel).await?;
            Ok(Arc::new(RfcommBridge::with_timeout(
                radio,
                bluetooth.connect_timeout(),
            )))
        }
        Transport::Gatt => {
            let timing = GattTiming {
                connect_timeout: bluetooth.connect_timeout(),
                scan_ceiling: bluetooth.scan_ceiling(),
                request_delay: bluetooth.gatt_request_delay(),
            };
            Ok(Arc::new(
                GattBridge::new(&bluetooth.device_name, timing).await?,
            ))
        }
    }
}

#[cfg(not(feature = "bluez"))]
async fn create_bridge(_config: &Config) -> Result<Arc<dyn TransportBridge>> {
    anyhow::bail!("built without BlueZ support, rebuild with the `bluez` feature")
}

async fn handle_line(service: &FinderService, line: &str) {
    if line == "help" {
        println!("{}", USAGE);
        return;
    }

    let command = match line.parse::<Command>() {
        Ok(command) => command,
        Err(e) => {
            println!("{}", e);
            println!("{}", USAGE);
            return;
        }
    };

    match service.dispatch(command).await {
        Ok(Reply::Done) => println!("OK"),
        Ok(Reply::State { state, role }) => println!("{} ({})", state.as_str(), role.as_str()),
        Ok(Reply::Bluetooth(state)) => println!("{}", state.as_str()),
        Err(e) => println!("Failed: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sidekick_finder=info".parse()?),
        )
        .init();

    info!("Starting Sidekick Finder v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    // Restore registered devices
    let store = Arc::new(RegisteredStore::new(&config.data_dir)?);
    let settings = config.service_settings();
    let registry = Arc::new(Registry::new());
    registry.restore(&store.pairs(), settings.report_window);

    let bridge = create_bridge(&config).await?;
    info!(
        "Bluetooth bridge ready ({:?}) as '{}'",
        config.bluetooth.transport, config.bluetooth.device_name
    );

    let service = FinderService::new(bridge, registry, Arc::new(LogAlarm::new()), settings);
    let echo = std::env::args().any(|arg| arg == "--json");
    tokio::spawn(
        EventProcessor::new(store.clone())
            .with_echo(echo)
            .run(service.subscribe()),
    );

    if let Some(role) = config.service.role {
        service.set_role(role);
    }

    info!("Ready. Type 'help' for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if !line.is_empty() {
                            handle_line(&service, line).await;
                        }
                    }
                    Ok(None) => {
                        info!("Console closed, waiting for shutdown signal");
                        tokio::signal::ctrl_c().await?;
                        break;
                    }
                    Err(e) => {
                        error!("Console read error: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    service.stop().await;
    info!("Sidekick Finder stopped");
    Ok(())
}
