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

//! Serialized characteristic requests for a GATT client link.
//!
//! Peripherals handle one outstanding request at a time, so writes are
//! queued and drained in order with a fixed pause between them.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{FinderError, FinderResult};

/// Characteristic operations on a connected peripheral.
#[async_trait]
pub trait GattLink: Send + Sync + 'static {
    /// Write a characteristic value.
    async fn write(&self, characteristic: Uuid, value: &[u8]) -> FinderResult<()>;
}

struct GattRequest {
    characteristic: Uuid,
    value: Vec<u8>,
    reply: oneshot::Sender<FinderResult<()>>,
}

/// FIFO of characteristic requests drained one at a time.
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<GattRequest>,
    worker: JoinHandle<()>,
}

impl RequestQueue {
    /// Start draining requests against `link`.
    pub fn start(link: Arc<dyn GattLink>, delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::drain(link, rx, delay));
        Self { tx, worker }
    }

    async fn drain(
        link: Arc<dyn GattLink>,
        mut rx: mpsc::UnboundedReceiver<GattRequest>,
        delay: Duration,
    ) {
        while let Some(GattRequest {
            characteristic,
            value,
            reply,
        }) = rx.recv().await
        {
            debug!(
                "Writing {} bytes to characteristic {}",
                value.len(),
                characteristic
            );
            let result = link.write(characteristic, &value).await;
            if let Err(ref e) = result {
                warn!("Characteristic write failed: {}", e);
            }
            let _ = reply.send(result);
            tokio::time::sleep(delay).await;
        }
        debug!("GATT request queue drained and closed");
    }

    /// Queue a write and wait for its result.
    pub async fn write(&self, characteristic: Uuid, value: Vec<u8>) -> FinderResult<()> {
        let (reply, result) = oneshot::channel();
        self.tx
            .send(GattRequest {
                characteristic,
                value,
                reply,
            })
            .map_err(|_| closed())?;
        result.await.map_err(|_| closed())?
    }

    /// Stop draining; pending requests fail.
    pub fn close(&self) {
        self.worker.abort();
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

fn closed() -> FinderError {
    FinderError::ConnectionFailure("GATT request queue closed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    const CHAR: Uuid = Uuid::from_u128(0x1234);

    #[derive(Default)]
    struct RecordingLink {
        writes: Mutex<Vec<(Instant, Vec<u8>)>>,
    }

    #[async_trait]
    impl GattLink for RecordingLink {
        async fn write(&self, _characteristic: Uuid, value: &[u8]) -> FinderResult<()> {
            if value == b"fail" {
                return Err(FinderError::ConnectionFailure("rejected".to_string()));
            }
            self.writes.lock().push((Instant::now(), value.to_vec()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_requests_drain_in_order_with_delay() {
        let link = Arc::new(RecordingLink::default());
        let queue = Arc::new(RequestQueue::start(link.clone(), Duration::from_millis(30)));

        let first = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.write(CHAR, b"one".to_vec()).await })
        };
        tokio::task::yield_now().await;
        let second = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.write(CHAR, b"two".to_vec()).await })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let writes = link.writes.lock();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].1, b"one");
        assert_eq!(writes[1].1, b"two");
        assert!(writes[1].0 - writes[0].0 >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_failed_write_does_not_stall_queue() {
        let link = Arc::new(RecordingLink::default());
        let queue = RequestQueue::start(link.clone(), Duration::from_millis(1));

        assert!(queue.write(CHAR, b"fail".to_vec()).await.is_err());
        queue.write(CHAR, b"LIST".to_vec()).await.unwrap();
        assert_eq!(link.writes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_queue_fails() {
        let link = Arc::new(RecordingLink::default());
        let queue = RequestQueue::start(link, Duration::from_millis(1));
        queue.close();
        tokio::task::yield_now().await;
        assert!(queue.write(CHAR, b"late".to_vec()).await.is_err());
    }
}
