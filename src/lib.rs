//! Driver for the 8-channel analog input module, with optional Python bindings.
//!
//! The module digitizes up to eight channels, reports threshold crossings
//! to a trial state machine, logs samples internally and streams them over
//! USB. This crate speaks its serial command protocol: every configuration
//! command is `[213, command, payload...]` answered by a one-byte ack.
//!
//! # Example
//! ```ignore
//! use analog_input_rs::{AnalogInput, InputRange, SerialSettings};
//!
//! let mut ai = AnalogInput::open_serial(&SerialSettings::new("/dev/ttyACM0"))?;
//! ai.set_n_active_channels(2)?;
//! ai.set_channel_range(0, InputRange::Bipolar5V)?;
//! ai.set_channel_threshold(0, 2.5)?;
//! ai.start_usb_stream()?;
//! let frame = ai.read_stream_frame()?;
//! println!("{:?} -> {:?} V", frame.prefix_pair(), ai.frame_volts(&frame));
//! ai.stop_usb_stream()?;
//! ```
//!
//! # Threshold units
//!
//! Thresholds and reset voltages are set in volts and sent as codes on a
//! 0-8192 scale relative to the channel's input range. Changing a range
//! re-sends both, clamped into the new span.

pub mod analog_input;
pub mod config;
mod errors;
pub mod framer;
pub mod logging;
#[cfg(feature = "python")]
mod python;
pub mod range;
pub mod state;
pub mod stream;
pub mod transport;

pub use analog_input::{AnalogInput, EventTarget, Lifecycle, LoggedData, SharedAnalogInput};
pub use config::ModuleConfig;
pub use errors::*;
pub use framer::FirmwareStatus;
pub use range::InputRange;
pub use state::{ChannelConfig, ChannelFlags, DeviceState, SamplesToLog, N_CHANNELS};
pub use stream::{StreamDecoder, StreamFrame};
pub use transport::{MockTransport, SerialSettings, Transport};
