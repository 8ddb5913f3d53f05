//! USB stream frame decoding.
//!
//! While USB streaming is on, the device emits back-to-back frames of
//! `[prefix, sync, sample_0 (u16 LE), ..., sample_{n-1} (u16 LE)]` with no
//! delimiter. The prefix pair is normally `[stream_prefix, 0]`; when the
//! trial controller injects a sync byte the device substitutes
//! `[sync_byte, sync_data]` for that one frame. Both bytes are forwarded
//! as-is.

use std::io::{self, Read};

use byteorder::{ByteOrder, LittleEndian};
use log::{trace, warn};

use crate::errors::{DriverError, Result};
use crate::range::InputRange;

/// One decoded stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    /// First prefix byte: the stream prefix, or an injected sync byte.
    pub prefix: u8,
    /// Second prefix byte: 0, or the data that came with a sync byte.
    pub sync: u8,
    /// One code per streamed channel.
    pub samples: Vec<u16>,
}

impl StreamFrame {
    pub fn prefix_pair(&self) -> (u8, u8) {
        (self.prefix, self.sync)
    }

    /// Convert samples to volts; `ranges[i]` is the range of the channel behind `samples[i]`.
    pub fn volts(&self, ranges: &[InputRange]) -> Vec<f64> {
        self.samples
            .iter()
            .zip(ranges)
            .map(|(&code, range)| range.code_to_volts(code))
            .collect()
    }
}

/// Decoder for a fixed number of streamed channels.
#[derive(Debug, Clone)]
pub struct StreamDecoder {
    n_channels: usize,
    frames_decoded: u64,
}

impl StreamDecoder {
    pub fn new(n_channels: usize) -> Self {
        Self {
            n_channels,
            frames_decoded: 0,
        }
    }

    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    /// Bytes per frame: two prefix bytes plus two per channel.
    pub fn frame_len(&self) -> usize {
        2 + 2 * self.n_channels
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Read exactly one frame.
    ///
    /// A timeout before the first byte is [`DriverError::TransportTimeout`];
    /// a timeout or EOF part-way through is [`DriverError::Decode`], since the
    /// stream position is then unknown.
    pub fn read_frame<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<StreamFrame> {
        let expected = self.frame_len();
        let mut buf = vec![0u8; expected];
        let mut filled = 0;
        while filled < expected {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => return Err(self.short_frame(filled)),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e)
                    if filled > 0
                        && matches!(
                            e.kind(),
                            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                        ) =>
                {
                    return Err(self.short_frame(filled))
                }
                Err(e) => return Err(DriverError::from_transport(e)),
            }
        }
        self.decode_frame(&buf)
    }

    /// Decode a buffer holding exactly one frame.
    pub fn decode_frame(&mut self, bytes: &[u8]) -> Result<StreamFrame> {
        if bytes.len() != self.frame_len() {
            return Err(self.short_frame(bytes.len()));
        }
        let mut samples = vec![0u16; self.n_channels];
        LittleEndian::read_u16_into(&bytes[2..], &mut samples);
        self.frames_decoded += 1;
        trace!("stream frame prefix=({}, {}) samples={:?}", bytes[0], bytes[1], samples);
        Ok(StreamFrame {
            prefix: bytes[0],
            sync: bytes[1],
            samples,
        })
    }

    /// Decode a buffer of back-to-back frames; its length must be a whole number of frames.
    pub fn decode_all(&mut self, bytes: &[u8]) -> Result<Vec<StreamFrame>> {
        let len = self.frame_len();
        if bytes.len() % len != 0 {
            return Err(self.short_frame(bytes.len()));
        }
        bytes.chunks_exact(len).map(|c| self.decode_frame(c)).collect()
    }

    fn short_frame(&self, actual: usize) -> DriverError {
        warn!(
            "stream desync after {} frames: got {} of {} bytes",
            self.frames_decoded,
            actual,
            self.frame_len()
        );
        DriverError::Decode {
            expected: self.frame_len(),
            actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::transport::MockTransport;

    #[test]
    fn sync_prefix_passes_through() {
        let mut mock = MockTransport::new();
        mock.push_reply(&[35, 4, 100, 0, 200, 0]);
        let mut decoder = StreamDecoder::new(2);
        let frame = decoder.read_frame(&mut mock).unwrap();
        assert_eq!(frame.prefix_pair(), (35, 4));
        assert_eq!(frame.samples, vec![100, 200]);
        assert_eq!(decoder.frames_decoded(), 1);
    }

    #[test]
    fn consecutive_frames() {
        let mut decoder = StreamDecoder::new(3);
        let bytes = [
            b'R', 0, 0x00, 0x10, 0xFF, 0x1F, 0x01, 0x00, //
            b'#', 7, 0x00, 0x00, 0x00, 0x20, 0x02, 0x00,
        ];
        let frames = decoder.decode_all(&bytes).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].prefix_pair(), (b'R', 0));
        assert_eq!(frames[0].samples, vec![4096, 8191, 1]);
        assert_eq!(frames[1].prefix_pair(), (b'#', 7));
        assert_eq!(frames[1].samples, vec![0, 8192, 2]);
    }

    #[test]
    fn partial_frame_is_decode_error() {
        let mut mock = MockTransport::new();
        mock.push_reply(&[b'R', 0, 1]);
        let mut decoder = StreamDecoder::new(2);
        match decoder.read_frame(&mut mock).unwrap_err() {
            DriverError::Decode { expected, actual } => {
                assert_eq!(expected, 6);
                assert_eq!(actual, 3);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(
            decoder.decode_all(&[0u8; 7]).unwrap_err().kind(),
            ErrorKind::Decode
        );
    }

    #[test]
    fn idle_stream_is_timeout() {
        let mut mock = MockTransport::new();
        let mut decoder = StreamDecoder::new(1);
        assert_eq!(
            decoder.read_frame(&mut mock).unwrap_err().kind(),
            ErrorKind::TransportTimeout
        );
    }

    #[test]
    fn volts_follow_channel_ranges() {
        let frame = StreamFrame {
            prefix: b'R',
            sync: 0,
            samples: vec![4096, 8192],
        };
        let volts = frame.volts(&[InputRange::Bipolar10V, InputRange::Unipolar10V]);
        approx::assert_abs_diff_eq!(volts[0], 0.0);
        approx::assert_abs_diff_eq!(volts[1], 10.0);
    }
}
