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

//! Individual classic (stream socket) connection handler.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bridge::{BridgeCore, BridgeEvent, Link};
use super::framing::LineBuffer;
use crate::error::{FinderError, FinderResult};

const READ_BUFFER_SIZE: usize = 1024;

/// Byte stream a classic link runs over.
pub trait LinkStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> LinkStream for T {}

/// Type-erased link stream.
pub type BoxedStream = Box<dyn LinkStream>;

/// Handler for a single classic connection.
pub struct ClassicLink {
    name: String,
    address: String,
    writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    cancel: CancellationToken,
}

impl ClassicLink {
    /// Attach `stream` to the bridge and start its read loop.
    pub async fn open(
        core: Arc<BridgeCore>,
        name: String,
        address: String,
        stream: BoxedStream,
    ) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(stream);
        let link = Arc::new(Self {
            name,
            address: address.clone(),
            writer: tokio::sync::Mutex::new(writer),
            cancel: CancellationToken::new(),
        });

        let handle: Arc<dyn Link> = link.clone();
        core.attach(&address, handle.clone()).await;

        let cancel = link.cancel.clone();
        let name = link.name.clone();
        tokio::spawn(async move {
            Self::read_loop(core, handle, name, address, reader, cancel).await;
        });

        link
    }

    /// Read until EOF, error, overload or close, emitting one event per line.
    async fn read_loop(
        core: Arc<BridgeCore>,
        handle: Arc<dyn Link>,
        name: String,
        address: String,
        mut reader: ReadHalf<BoxedStream>,
        cancel: CancellationToken,
    ) {
        info!("Connection handler started for {}", address);
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut lines = LineBuffer::new();

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Connection to {} closed locally", address);
                    return;
                }
                read = reader.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    info!("Connection closed by remote {}", address);
                    break;
                }
                Ok(n) => {
                    debug!("Received {} bytes from {}", n, address);
                    let complete = match lines.push(&buf[..n]) {
                        Ok(complete) => complete,
                        Err(e) => {
                            warn!("Dropping {}: {}", address, e);
                            break;
                        }
                    };
                    for line in complete {
                        core.emit(BridgeEvent::DataReceived {
                            name: name.clone(),
                            address: address.clone(),
                            data: line,
                        })
                        .await;
                    }
                }
                Err(e) => {
                    error!("Read error on {}: {}", address, e);
                    break;
                }
            }
        }

        core.detach_link(&address, &handle).await;
    }
}

#[async_trait]
impl Link for ClassicLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, data: &[u8]) -> FinderResult<()> {
        if self.cancel.is_cancelled() {
            return Err(FinderError::ConnectionFailure(format!(
                "link to {} is closed",
                self.address
            )));
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .await
            .map_err(|e| FinderError::ConnectionFailure(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| FinderError::ConnectionFailure(e.to_string()))?;
        debug!("Sent {} bytes to {}", data.len(), self.address);
        Ok(())
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::bridge::BridgeState;
    use tokio::sync::mpsc;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    async fn setup() -> (
        Arc<BridgeCore>,
        mpsc::Receiver<BridgeEvent>,
        Arc<ClassicLink>,
        tokio::io::DuplexStream,
    ) {
        let core = BridgeCore::new();
        let (tx, rx) = mpsc::channel(16);
        core.set_handler(tx);
        core.begin(true);

        let (local, remote) = tokio::io::duplex(4096);
        let link = ClassicLink::open(core.clone(), "phone1".to_string(), ADDR.to_string(), Box::new(local)).await;
        (core, rx, link, remote)
    }

    #[tokio::test]
    async fn test_data_is_delivered() {
        let (_core, mut rx, _link, mut remote) = setup().await;
        assert!(matches!(rx.recv().await, Some(BridgeEvent::Connected { .. })));

        remote.write_all(b"REGISTER\n").await.unwrap();
        match rx.recv().await {
            Some(BridgeEvent::DataReceived { name, address, data }) => {
                assert_eq!(name, "phone1");
                assert_eq!(address, ADDR);
                assert_eq!(data, b"REGISTER");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_line_split_across_writes() {
        let (core, mut rx, _link, mut remote) = setup().await;
        assert!(matches!(rx.recv().await, Some(BridgeEvent::Connected { .. })));

        remote.write_all(b"REGI").await.unwrap();
        remote.flush().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        remote.write_all(b"STER\nLIST\n").await.unwrap();

        for expected in [&b"REGISTER"[..], &b"LIST"[..]] {
            match rx.recv().await {
                Some(BridgeEvent::DataReceived { data, .. }) => assert_eq!(data, expected),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert!(core.is_connected_to(ADDR));
    }

    #[tokio::test]
    async fn test_long_burst_of_short_lines_is_kept() {
        let (core, mut rx, _link, mut remote) = setup().await;
        assert!(matches!(rx.recv().await, Some(BridgeEvent::Connected { .. })));

        let burst = b"REPORT\n".repeat(50);
        remote.write_all(&burst).await.unwrap();
        for _ in 0..50 {
            assert!(matches!(
                rx.recv().await,
                Some(BridgeEvent::DataReceived { .. })
            ));
        }
        assert!(core.is_connected_to(ADDR));
    }

    #[tokio::test]
    async fn test_send_writes_to_stream() {
        let (_core, _rx, link, mut remote) = setup().await;
        link.send(b"RWO 10000\n").await.unwrap();

        let mut buf = [0u8; 32];
        let n = remote.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"RWO 10000\n");
    }

    #[tokio::test]
    async fn test_unterminated_overload_disconnects() {
        let (core, mut rx, _link, mut remote) = setup().await;
        assert!(matches!(rx.recv().await, Some(BridgeEvent::Connected { .. })));

        remote.write_all(&[b'A'; 300]).await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(BridgeEvent::Disconnected { .. })
        ));
        assert!(core.connections().is_empty());
        assert_eq!(core.state(), BridgeState::Disconnected);
    }

    #[tokio::test]
    async fn test_remote_close_disconnects() {
        let (core, mut rx, _link, remote) = setup().await;
        assert!(matches!(rx.recv().await, Some(BridgeEvent::Connected { .. })));

        drop(remote);
        assert!(matches!(
            rx.recv().await,
            Some(BridgeEvent::Disconnected { .. })
        ));
        assert!(!core.is_connected_to(ADDR));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (_core, _rx, link, _remote) = setup().await;
        link.close();
        assert!(link.send(b"LIST\n").await.is_err());
    }
}
