//! Byte transports the driver talks through.
//!
//! The protocol only needs an ordered, reliable byte stream with a read
//! timeout. A USB-serial port is the production backend; [`MockTransport`]
//! scripts device replies for tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, SerialPort};

use crate::errors::Result;

/// Default serial baud rate (ignored by USB CDC firmware, required by the OS API).
pub const BAUD_RATE: u32 = 115200;

/// Default read timeout for replies and stream frames.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Read + Write + Send plus the availability primitives the driver needs.
pub trait Transport: Read + Write + Send {
    /// Bytes that can be read without blocking.
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Drop anything already buffered on the input side.
    fn discard_input(&mut self) -> io::Result<()>;
}

impl Transport for Box<dyn SerialPort> {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.bytes_to_read()? as usize)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// Where and how to open the module's serial port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    #[serde(with = "millis")]
    pub timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: BAUD_RATE,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl SerialSettings {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    /// Open the port described by these settings.
    pub fn open(&self) -> Result<Box<dyn SerialPort>> {
        debug!(
            "Opening serial port {} at {} baud (timeout {:?})",
            self.port, self.baud_rate, self.timeout
        );
        let port = serialport::new(&self.port, self.baud_rate)
            .timeout(self.timeout)
            .open()?;
        Ok(port)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

// ============================================================================
// Mock Transport
// ============================================================================

#[derive(Debug, Default)]
struct MockInner {
    replies: VecDeque<u8>,
    deferred: Vec<u8>,
    written: Vec<u8>,
    writes: usize,
    discards: usize,
}

/// Scripted in-memory transport.
///
/// Clones share the same buffers, so a test keeps one handle while the
/// session owns the other. Reading from an empty reply queue fails with
/// `TimedOut`, like a serial port whose read timeout expired.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockInner>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock that answers the handshake with the given firmware version.
    pub fn with_handshake(firmware: u32) -> Self {
        let mock = Self::new();
        mock.push_reply(&[crate::framer::HANDSHAKE_REPLY]);
        mock.push_reply(&firmware.to_le_bytes());
        mock
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue bytes the "device" will send next.
    pub fn push_reply(&self, bytes: &[u8]) {
        self.lock().replies.extend(bytes.iter().copied());
    }

    /// Queue bytes that only arrive once the input buffer is discarded.
    pub fn push_reply_after_discard(&self, bytes: &[u8]) {
        self.lock().deferred.extend_from_slice(bytes);
    }

    /// Queue `n` success acknowledgments.
    pub fn push_acks(&self, n: usize) {
        self.lock().replies.extend(std::iter::repeat(1u8).take(n));
    }

    /// Every byte written so far, in order.
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    /// Number of `write` calls so far.
    pub fn write_calls(&self) -> usize {
        self.lock().writes
    }

    /// Number of `discard_input` calls so far.
    pub fn discards(&self) -> usize {
        self.lock().discards
    }

    /// Replies not consumed yet.
    pub fn pending_replies(&self) -> usize {
        self.lock().replies.len()
    }

    /// Forget everything written so far.
    pub fn clear_written(&self) {
        let mut inner = self.lock();
        inner.written.clear();
        inner.writes = 0;
    }
}

impl Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inner = self.lock();
        if inner.replies.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "mock reply queue empty"));
        }
        let n = buf.len().min(inner.replies.len());
        for (slot, byte) in buf.iter_mut().zip(inner.replies.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.lock();
        inner.written.extend_from_slice(buf);
        inner.writes += 1;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockTransport {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.lock().replies.len())
    }

    fn discard_input(&mut self) -> io::Result<()> {
        let mut inner = self.lock();
        let deferred = std::mem::take(&mut inner.deferred);
        inner.replies.clear();
        inner.replies.extend(deferred);
        inner.discards += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_times_out_when_empty() {
        let mut mock = MockTransport::new();
        let mut buf = [0u8; 2];
        let err = mock.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn clones_share_buffers() {
        let handle = MockTransport::new();
        let mut owned = handle.clone();
        handle.push_reply(&[7, 8, 9]);
        assert_eq!(owned.bytes_available().unwrap(), 3);

        let mut buf = [0u8; 2];
        assert_eq!(owned.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [7, 8]);

        owned.write_all(&[213, b'Z']).unwrap();
        assert_eq!(handle.written(), vec![213, b'Z']);

        owned.discard_input().unwrap();
        assert_eq!(handle.pending_replies(), 0);
        assert_eq!(handle.discards(), 1);
    }

    #[test]
    fn serial_settings_from_toml() {
        let settings: SerialSettings = toml::from_str("port = \"/dev/ttyACM0\"\ntimeout = 250").unwrap();
        assert_eq!(settings.port, "/dev/ttyACM0");
        assert_eq!(settings.baud_rate, BAUD_RATE);
        assert_eq!(settings.timeout, Duration::from_millis(250));
    }
}
