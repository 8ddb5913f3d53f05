use std::io;
use thiserror::Error;

/// Every failure the analog input driver can report.
///
/// Validation variants (`InvalidRange`, `OutOfRange`, `UnknownRange`,
/// `InvalidChannel`, `WrongChannelCount`, `InvalidFlag`, `StreamingActive`)
/// are raised before any byte is written. Protocol variants leave the
/// mirrored configuration untouched.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("handshake failed: expected reply {expected}, got {actual:?}")]
    Handshake { expected: u8, actual: Option<u8> },
    #[error("device rejected {parameter}")]
    RejectedByDevice { parameter: &'static str },
    #[error("no acknowledgment for {parameter} (reply: {reply:?})")]
    NoAcknowledgment {
        parameter: &'static str,
        reply: Option<u8>,
    },
    #[error("{parameter} must be in [{min}, {max}], got {value}")]
    InvalidRange {
        parameter: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("{parameter} for channel {channel} is {value} V, outside the channel range [{min}, {max}] V")]
    OutOfRange {
        parameter: &'static str,
        channel: usize,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("unknown input range {0:?} (valid: -10V:10V, -5V:5V, -2.5V:2.5V, 0V:10V)")]
    UnknownRange(String),
    #[error("invalid channel {0} (must be 0-7)")]
    InvalidChannel(usize),
    #[error("{parameter} needs exactly {expected} values, got {actual}")]
    WrongChannelCount {
        parameter: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{parameter} values must be 0 or 1, channel {channel} is {value}")]
    InvalidFlag {
        parameter: &'static str,
        channel: usize,
        value: u8,
    },
    #[error("cannot change {0} while USB streaming is active")]
    StreamingActive(&'static str),
    #[error("transport timed out: {0}")]
    TransportTimeout(String),
    #[error("stream decode failed: expected {expected} bytes, got {actual}")]
    Decode { expected: usize, actual: usize },
    #[error("device reported {samples} logged samples x {channels} channels, more than can be addressed")]
    LogSize { samples: u32, channels: usize },
    #[error("USB stream is not running")]
    NotStreaming,
    #[error("not connected: {0}")]
    NotConnected(&'static str),
    #[error("device state is indeterminate, call resync() or close the session")]
    NeedsResync,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("config error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),
}

/// Fieldless discriminant of [`DriverError`], for callers that branch on kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Handshake,
    RejectedByDevice,
    NoAcknowledgment,
    InvalidRange,
    OutOfRange,
    UnknownRange,
    InvalidChannel,
    WrongChannelCount,
    InvalidFlag,
    StreamingActive,
    TransportTimeout,
    Decode,
    NotStreaming,
    NotConnected,
    NeedsResync,
    Io,
    Serial,
    Config,
}

impl DriverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::Handshake { .. } => ErrorKind::Handshake,
            DriverError::RejectedByDevice { .. } => ErrorKind::RejectedByDevice,
            DriverError::NoAcknowledgment { .. } => ErrorKind::NoAcknowledgment,
            DriverError::InvalidRange { .. } => ErrorKind::InvalidRange,
            DriverError::OutOfRange { .. } => ErrorKind::OutOfRange,
            DriverError::UnknownRange(_) => ErrorKind::UnknownRange,
            DriverError::InvalidChannel(_) => ErrorKind::InvalidChannel,
            DriverError::WrongChannelCount { .. } => ErrorKind::WrongChannelCount,
            DriverError::InvalidFlag { .. } => ErrorKind::InvalidFlag,
            DriverError::StreamingActive(_) => ErrorKind::StreamingActive,
            DriverError::TransportTimeout(_) => ErrorKind::TransportTimeout,
            DriverError::Decode { .. } | DriverError::LogSize { .. } => ErrorKind::Decode,
            DriverError::NotStreaming => ErrorKind::NotStreaming,
            DriverError::NotConnected(_) => ErrorKind::NotConnected,
            DriverError::NeedsResync => ErrorKind::NeedsResync,
            DriverError::Io(_) => ErrorKind::Io,
            DriverError::Serial(_) => ErrorKind::Serial,
            DriverError::Config(_) | DriverError::ConfigWrite(_) => ErrorKind::Config,
        }
    }

    /// Map an I/O failure from the transport, turning read timeouts into
    /// [`DriverError::TransportTimeout`].
    pub(crate) fn from_transport(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                DriverError::TransportTimeout(err.to_string())
            }
            _ => DriverError::Io(err),
        }
    }

    /// True when the device may hold state the mirror does not know about.
    pub fn leaves_device_indeterminate(&self) -> bool {
        matches!(
            self,
            DriverError::TransportTimeout(_) | DriverError::Io(_) | DriverError::LogSize { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
