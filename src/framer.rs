//! Command framing and reply decoding.
//!
//! Every command is `[OPCODE, command, payload...]` with multi-byte fields
//! little-endian. Configuration commands are answered by a single ack byte.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use log::{debug, trace};

use crate::errors::{DriverError, Result};
use crate::transport::Transport;

/// Menu-access byte prefixing every command.
pub const OPCODE: u8 = 213;

/// Reply to a successful handshake.
pub const HANDSHAKE_REPLY: u8 = 161;

/// Newest firmware this driver knows about.
pub const CURRENT_FIRMWARE: u32 = 3;

/// Longest time [`flush_input`] keeps reading.
pub const FLUSH_WINDOW: Duration = Duration::from_millis(200);
const FLUSH_MAX_READS: usize = 64;

/// Words read per `read_exact` call; bounds allocation ahead of real data.
const READ_CHUNK_WORDS: usize = 4096;

const ACK_OK: u8 = 1;
const ACK_REJECTED: u8 = 0;

// Command bytes
pub const CMD_HANDSHAKE: u8 = b'O';
pub const CMD_SAMPLING_RATE: u8 = b'F';
pub const CMD_ACTIVE_CHANNELS: u8 = b'A';
pub const CMD_RANGES: u8 = b'R';
pub const CMD_THRESHOLDS: u8 = b'T';
pub const CMD_SM_EVENTS: u8 = b'K';
pub const CMD_STREAM_ROUTING: u8 = b'C';
pub const CMD_STREAM_PREFIX: u8 = b'P';
pub const CMD_SAMPLES_TO_LOG: u8 = b'W';
pub const CMD_STREAM: u8 = b'S';
pub const CMD_EVENTS: u8 = b'E';
pub const CMD_LOGGING: u8 = b'L';
pub const CMD_ZERO: u8 = b'Z';
pub const CMD_LOGGED_DATA: u8 = b'D';

/// Stream / event-reporting target selector (second byte of `S` and `E`).
pub const TARGET_USB: u8 = 0;
pub const TARGET_MODULE: u8 = 1;

/// An outgoing command under construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    bytes: Vec<u8>,
}

impl CommandFrame {
    pub fn new(command: u8) -> Self {
        let mut bytes = Vec::with_capacity(36);
        bytes.push(OPCODE);
        bytes.push(command);
        Self { bytes }
    }

    pub fn u8(mut self, value: u8) -> Self {
        self.bytes.push(value);
        self
    }

    pub fn bytes(mut self, values: &[u8]) -> Self {
        self.bytes.extend_from_slice(values);
        self
    }

    pub fn u16_array(mut self, values: &[u16]) -> Self {
        let start = self.bytes.len();
        self.bytes.resize(start + values.len() * 2, 0);
        LittleEndian::write_u16_into(values, &mut self.bytes[start..]);
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.bytes.extend_from_slice(&buf);
        self
    }

    pub fn command(&self) -> u8 {
        self.bytes[1]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Write a frame and flush it.
pub fn send(transport: &mut dyn Transport, frame: &CommandFrame) -> Result<()> {
    trace!("-> {:?}", frame.as_bytes());
    transport
        .write_all(frame.as_bytes())
        .and_then(|_| transport.flush())
        .map_err(DriverError::from_transport)
}

pub fn read_u8(transport: &mut dyn Transport) -> Result<u8> {
    transport.read_u8().map_err(DriverError::from_transport)
}

pub fn read_u32(transport: &mut dyn Transport) -> Result<u32> {
    transport
        .read_u32::<LittleEndian>()
        .map_err(DriverError::from_transport)
}

/// Read `n` little-endian u16 words.
///
/// The buffer grows with the bytes actually received, so a bogus `n` ends
/// in a timeout instead of a huge allocation.
pub fn read_u16_array(transport: &mut dyn Transport, n: usize) -> Result<Vec<u16>> {
    let mut words = Vec::with_capacity(n.min(READ_CHUNK_WORDS));
    let mut raw = [0u8; READ_CHUNK_WORDS * 2];
    let mut remaining = n;
    while remaining > 0 {
        let take = remaining.min(READ_CHUNK_WORDS);
        let chunk = &mut raw[..take * 2];
        transport
            .read_exact(chunk)
            .map_err(DriverError::from_transport)?;
        words.extend(chunk.chunks_exact(2).map(LittleEndian::read_u16));
        remaining -= take;
    }
    Ok(words)
}

/// Read and drop bytes still arriving from the device.
///
/// Stops once nothing is buffered, or after [`FLUSH_WINDOW`]. Returns the
/// number of bytes dropped.
pub fn flush_input(transport: &mut dyn Transport) -> Result<usize> {
    let mut buf = [0u8; 256];
    let start = Instant::now();
    let mut dropped = 0;
    for _ in 0..FLUSH_MAX_READS {
        let available = transport
            .bytes_available()
            .map_err(DriverError::from_transport)?;
        if available == 0 || start.elapsed() > FLUSH_WINDOW {
            break;
        }
        match transport.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => dropped += n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                break
            }
            Err(e) => return Err(DriverError::from_transport(e)),
        }
    }
    if dropped > 0 {
        debug!("Flushed {dropped} stale input bytes");
    }
    Ok(dropped)
}

/// Read and interpret one acknowledgment byte.
pub fn read_ack(transport: &mut dyn Transport, parameter: &'static str) -> Result<()> {
    let mut byte = [0u8; 1];
    match transport.read(&mut byte) {
        Ok(1) => {}
        Ok(_) => {
            return Err(DriverError::NoAcknowledgment {
                parameter,
                reply: None,
            })
        }
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(DriverError::NoAcknowledgment {
                parameter,
                reply: None,
            })
        }
        Err(e) => return Err(DriverError::from_transport(e)),
    }
    match byte[0] {
        ACK_OK => {
            debug!("{parameter}: acknowledged");
            Ok(())
        }
        ACK_REJECTED => Err(DriverError::RejectedByDevice { parameter }),
        other => Err(DriverError::NoAcknowledgment {
            parameter,
            reply: Some(other),
        }),
    }
}

/// Send a configuration command and wait for its ack.
pub fn transact(
    transport: &mut dyn Transport,
    frame: &CommandFrame,
    parameter: &'static str,
) -> Result<()> {
    debug!(
        "{parameter}: sending '{}' ({} bytes)",
        frame.command() as char,
        frame.as_bytes().len()
    );
    send(transport, frame)?;
    read_ack(transport, parameter)
}

/// How the reported firmware compares with [`CURRENT_FIRMWARE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareStatus {
    Current,
    /// Older than this driver expects; usable, but should be updated.
    Old { found: u32 },
    /// Newer than this driver; usable, but the driver should be updated.
    Future { found: u32 },
}

impl FirmwareStatus {
    pub fn classify(found: u32) -> Self {
        match found.cmp(&CURRENT_FIRMWARE) {
            std::cmp::Ordering::Less => FirmwareStatus::Old { found },
            std::cmp::Ordering::Equal => FirmwareStatus::Current,
            std::cmp::Ordering::Greater => FirmwareStatus::Future { found },
        }
    }

    pub fn is_advisory(self) -> bool {
        self != FirmwareStatus::Current
    }
}

/// Run the open handshake and return the firmware version.
pub fn handshake(transport: &mut dyn Transport) -> Result<u32> {
    send(transport, &CommandFrame::new(CMD_HANDSHAKE))?;
    let mut reply = [0u8; 1];
    let actual = match transport.read(&mut reply) {
        Ok(1) => Some(reply[0]),
        Ok(_) => None,
        Err(e) if matches!(
            e.kind(),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::UnexpectedEof
        ) =>
        {
            None
        }
        Err(e) => return Err(DriverError::Io(e)),
    };
    if actual != Some(HANDSHAKE_REPLY) {
        return Err(DriverError::Handshake {
            expected: HANDSHAKE_REPLY,
            actual,
        });
    }
    let firmware = read_u32(transport)?;
    debug!("Handshake ok, firmware v{firmware}");
    Ok(firmware)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::transport::MockTransport;

    #[test]
    fn frame_layout_is_little_endian() {
        let frame = CommandFrame::new(CMD_SAMPLING_RATE).u32(1000);
        assert_eq!(frame.as_bytes(), &[213, b'F', 0xE8, 0x03, 0, 0]);

        let frame = CommandFrame::new(CMD_THRESHOLDS).u16_array(&[8192, 1]);
        assert_eq!(frame.as_bytes(), &[213, b'T', 0x00, 0x20, 0x01, 0x00]);

        let frame = CommandFrame::new(CMD_STREAM).u8(TARGET_USB).bytes(&[1]);
        assert_eq!(frame.as_bytes(), &[213, b'S', 0, 1]);
    }

    #[test]
    fn ack_bytes() {
        let mut mock = MockTransport::new();
        mock.push_reply(&[1, 0, 2]);
        assert!(read_ack(&mut mock, "x").is_ok());
        assert_eq!(read_ack(&mut mock, "x").unwrap_err().kind(), ErrorKind::RejectedByDevice);
        match read_ack(&mut mock, "x").unwrap_err() {
            DriverError::NoAcknowledgment { reply, .. } => assert_eq!(reply, Some(2)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(read_ack(&mut mock, "x").unwrap_err().kind(), ErrorKind::TransportTimeout);
    }

    #[test]
    fn handshake_reads_firmware() {
        let mut mock = MockTransport::with_handshake(3);
        assert_eq!(handshake(&mut mock).unwrap(), 3);
        assert_eq!(mock.written(), vec![213, b'O']);

        let mut mock = MockTransport::new();
        mock.push_reply(&[160]);
        match handshake(&mut mock).unwrap_err() {
            DriverError::Handshake { actual, .. } => assert_eq!(actual, Some(160)),
            other => panic!("unexpected {other:?}"),
        }

        let mut silent = MockTransport::new();
        assert_eq!(handshake(&mut silent).unwrap_err().kind(), ErrorKind::Handshake);
    }

    #[test]
    fn word_arrays_span_read_chunks() {
        let mut mock = MockTransport::new();
        let n = READ_CHUNK_WORDS + 3;
        for i in 0..n {
            mock.push_reply(&(i as u16).to_le_bytes());
        }
        let words = read_u16_array(&mut mock, n).unwrap();
        assert_eq!(words.len(), n);
        assert_eq!(words[READ_CHUNK_WORDS + 2], (READ_CHUNK_WORDS + 2) as u16);
        assert_eq!(mock.pending_replies(), 0);
    }

    #[test]
    fn oversized_word_count_times_out() {
        let mut mock = MockTransport::new();
        mock.push_reply(&[1, 0, 2, 0]);
        let err = read_u16_array(&mut mock, u32::MAX as usize).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportTimeout);
    }

    #[test]
    fn flush_drops_buffered_bytes() {
        let mut mock = MockTransport::new();
        mock.push_reply(&[b'R', 0, 0x10, 0, 1]);
        assert_eq!(flush_input(&mut mock).unwrap(), 5);
        assert_eq!(mock.pending_replies(), 0);
        assert_eq!(flush_input(&mut mock).unwrap(), 0);
    }

    #[test]
    fn firmware_classification() {
        assert_eq!(FirmwareStatus::classify(3), FirmwareStatus::Current);
        assert_eq!(FirmwareStatus::classify(2), FirmwareStatus::Old { found: 2 });
        assert!(FirmwareStatus::classify(4).is_advisory());
    }
}
