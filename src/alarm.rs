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

//! Alarm tone and the periodic wake timer used for report check-ins.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Audible alert raised while a guarded item is lost.
pub trait Alarm: Send + Sync {
    fn play(&self);
    fn stop(&self);
    fn is_playing(&self) -> bool;
}

/// Alarm that reports through the log.
#[derive(Debug, Default)]
pub struct LogAlarm {
    playing: AtomicBool,
    plays: AtomicUsize,
}

impl LogAlarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the alarm started playing.
    pub fn play_count(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }
}

impl Alarm for LogAlarm {
    fn play(&self) {
        if !self.playing.swap(true, Ordering::SeqCst) {
            self.plays.fetch_add(1, Ordering::SeqCst);
            warn!("\x07Alarm: a guarded item is lost");
        }
    }

    fn stop(&self) {
        if self.playing.swap(false, Ordering::SeqCst) {
            info!("Alarm stopped");
        }
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

/// Periodic wake-up that runs a callback every `period` until cancelled.
///
/// The first run happens one period after arming.
pub struct WakeAlarm {
    period: Duration,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl WakeAlarm {
    pub fn arm<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        debug!("Wake alarm fired");
                        tick().await;
                    }
                }
            }
        });
        info!("Wake alarm armed every {:?}", period);
        Self {
            period,
            cancel,
            handle,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            info!("Wake alarm cancelled");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for WakeAlarm {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
