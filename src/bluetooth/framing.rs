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

//! Message framing for both transports.
//!
//! Notifications and characteristic writes carry at most one MTU worth of
//! bytes, so a message may arrive split across several packets. Each BLE
//! message ends with [`MESSAGE_DELIMITER`]; the buffer collects packets until
//! the delimiter shows up. Classic sockets carry newline terminated lines
//! that may likewise be split across reads.

use tracing::{debug, warn};

use super::ble_constants::{config, rfcomm::MAX_PENDING_BYTES, MESSAGE_DELIMITER};
use crate::error::{FinderError, FinderResult};

/// Upper bound on bytes held while waiting for a delimiter.
pub const MAX_BUFFERED_BYTES: usize = 1024;

/// Collects notification packets into complete messages.
pub struct NotificationBuffer {
    buffer: Vec<u8>,
}

impl NotificationBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
        }
    }

    /// Process an incoming packet.
    ///
    /// Returns every message completed by this packet, delimiter stripped.
    /// Empty messages (back to back delimiters) are skipped.
    pub fn process_packet(&mut self, packet: &[u8]) -> Vec<Vec<u8>> {
        let mut complete = Vec::new();

        for &byte in packet {
            if byte == MESSAGE_DELIMITER {
                if !self.buffer.is_empty() {
                    debug!("Message complete: {} bytes", self.buffer.len());
                    complete.push(std::mem::take(&mut self.buffer));
                }
                continue;
            }

            if self.buffer.len() >= MAX_BUFFERED_BYTES {
                warn!(
                    "No delimiter within {} bytes, discarding partial message",
                    MAX_BUFFERED_BYTES
                );
                self.reset();
            }
            self.buffer.push(byte);
        }

        complete
    }

    /// Drop any partial message.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Check if a partial message is pending.
    pub fn is_in_progress(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Get current buffer size.
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for NotificationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects classic socket reads into complete lines.
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            pending: Vec::with_capacity(MAX_PENDING_BYTES),
        }
    }

    /// Append a read, returning every line it completes without the newline.
    ///
    /// Fails once more than [`MAX_PENDING_BYTES`] are waiting for a newline;
    /// the link is expected to drop the peer then.
    pub fn push(&mut self, data: &[u8]) -> FinderResult<Vec<Vec<u8>>> {
        let mut lines = Vec::new();
        for &byte in data {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.pending);
                if !line.iter().all(u8::is_ascii_whitespace) {
                    lines.push(line);
                }
                continue;
            }
            self.pending.push(byte);
            if self.pending.len() > MAX_PENDING_BYTES {
                let pending = self.pending.len();
                self.pending.clear();
                return Err(FinderError::BufferOverload(pending));
            }
        }
        Ok(lines)
    }

    /// Bytes waiting for a newline.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminate a message and chunk it into MTU sized packets.
pub fn frame_message(data: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    let mut framed: Vec<u8> = data
        .iter()
        .copied()
        .filter(|&b| b != b'\n' && b != MESSAGE_DELIMITER)
        .collect();
    if framed.is_empty() {
        return vec![];
    }
    framed.push(MESSAGE_DELIMITER);

    framed
        .chunks(config::effective_payload_size(mtu))
        .map(<[u8]>::to_vec)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_packet_message() {
        let mut buffer = NotificationBuffer::new();
        let result = buffer.process_packet(b"RWO 10000;");
        assert_eq!(result, vec![b"RWO 10000".to_vec()]);
        assert!(!buffer.is_in_progress());
    }

    #[test]
    fn test_split_message() {
        let mut buffer = NotificationBuffer::new();
        assert!(buffer.process_packet(b"RLIST pho").is_empty());
        assert!(buffer.is_in_progress());
        assert_eq!(buffer.buffer_size(), 9);

        let result = buffer.process_packet(b"ne|AA:BB:CC:DD:EE:FF|Guarded;");
        assert_eq!(
            result,
            vec![b"RLIST phone|AA:BB:CC:DD:EE:FF|Guarded".to_vec()]
        );
    }

    #[test]
    fn test_two_messages_in_one_packet() {
        let mut buffer = NotificationBuffer::new();
        let result = buffer.process_packet(b"OK;;ERR:x;RW");
        assert_eq!(result, vec![b"OK".to_vec(), b"ERR:x".to_vec()]);
        assert_eq!(buffer.buffer_size(), 2);
    }

    #[test]
    fn test_overflow_discards_partial() {
        let mut buffer = NotificationBuffer::new();
        let junk = vec![b'A'; MAX_BUFFERED_BYTES + 10];
        assert!(buffer.process_packet(&junk).is_empty());
        assert!(buffer.buffer_size() <= MAX_BUFFERED_BYTES);

        buffer.reset();
        assert_eq!(buffer.process_packet(b"LIST;"), vec![b"LIST".to_vec()]);
    }

    #[test]
    fn test_line_split_across_reads() {
        let mut lines = LineBuffer::new();
        assert!(lines.push(b"REGI").unwrap().is_empty());
        assert_eq!(lines.pending(), 4);
        assert_eq!(lines.push(b"STER\nLI").unwrap(), vec![b"REGISTER".to_vec()]);
        assert_eq!(lines.push(b"ST\n\n").unwrap(), vec![b"LIST".to_vec()]);
        assert_eq!(lines.pending(), 0);
    }

    #[test]
    fn test_ceiling_applies_to_unterminated_bytes() {
        let mut lines = LineBuffer::new();
        let mut burst = Vec::new();
        for _ in 0..40 {
            burst.extend_from_slice(b"REPORT\n");
        }
        assert!(burst.len() > MAX_PENDING_BYTES);
        assert_eq!(lines.push(&burst).unwrap().len(), 40);

        assert!(lines.push(&[b'A'; MAX_PENDING_BYTES]).unwrap().is_empty());
        assert!(matches!(
            lines.push(b"A"),
            Err(FinderError::BufferOverload(n)) if n == MAX_PENDING_BYTES + 1
        ));
        assert_eq!(lines.pending(), 0);
    }

    #[test]
    fn test_frame_message_chunks_by_mtu() {
        let packets = frame_message(b"RLIST phone|AA:BB:CC:DD:EE:FF|Guarded\n", 23);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].len(), 20);
        assert_eq!(*packets[1].last().unwrap(), MESSAGE_DELIMITER);

        let mut buffer = NotificationBuffer::new();
        let mut complete = Vec::new();
        for packet in packets {
            complete.extend(buffer.process_packet(&packet));
        }
        assert_eq!(
            complete,
            vec![b"RLIST phone|AA:BB:CC:DD:EE:FF|Guarded".to_vec()]
        );
    }

    #[test]
    fn test_frame_empty_message() {
        assert!(frame_message(b"\n", 23).is_empty());
    }
}
