//! Analog input module driver.
//!
//! [`AnalogInput`] owns the transport and a mirror of the device
//! configuration. Every setter validates its input, encodes it, sends it,
//! waits for the ack and only then commits the new value to the mirror.
//!
//! # Lifecycle
//!
//! - `Unbound`: no transport. Setters validate and stage values locally;
//!   they are sent when a transport is bound.
//! - `Bound`: every setter is a blocking round trip.
//! - `Programming`: transient, while a range change and its dependent
//!   threshold/reset update are on the wire.
//! - `Desynchronized`: a transport timeout (or a failure half-way through a
//!   range change) left the device in an unknown state. Only
//!   [`resync`](AnalogInput::resync), [`stop_usb_stream`](AnalogInput::stop_usb_stream)
//!   and [`close`](AnalogInput::close) are accepted.
//!
//! # Threading
//!
//! Replies carry no request id, so commands to one device must never
//! overlap. Share a session between threads through
//! [`into_shared`](AnalogInput::into_shared).

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::ModuleConfig;
use crate::errors::{DriverError, Result};
use crate::framer::{self, CommandFrame, FirmwareStatus};
use crate::range::InputRange;
use crate::state::{
    check_channel, check_len, check_volts, migrate_levels, volts_to_codes, ChannelFlags,
    DeviceState, SamplesToLog, MAX_SAMPLING_RATE, MIN_SAMPLING_RATE, N_CHANNELS,
};
use crate::stream::{StreamDecoder, StreamFrame};
use crate::transport::{SerialSettings, Transport};

/// Time for the device to finish the frame in flight after a stream stop.
const STOP_SETTLE: Duration = Duration::from_millis(100);

/// Session shared between threads; the mutex is the single-writer lock.
pub type SharedAnalogInput = Arc<Mutex<AnalogInput>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unbound,
    Bound,
    Programming,
    Desynchronized,
}

/// Where threshold-crossing events are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    /// Digital events to the trial state machine.
    StateMachine,
    /// Event bytes over USB.
    Usb,
}

impl EventTarget {
    fn wire(self) -> u8 {
        match self {
            EventTarget::StateMachine => framer::TARGET_MODULE,
            EventTarget::Usb => framer::TARGET_USB,
        }
    }
}

/// Samples pulled from the device's log, one row per active channel.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedData {
    pub codes: Vec<Vec<u16>>,
    pub volts: Vec<Vec<f64>>,
}

impl LoggedData {
    pub fn n_samples(&self) -> usize {
        self.codes.first().map_or(0, Vec::len)
    }
}

/// Driver session for one analog input module.
pub struct AnalogInput {
    transport: Option<Box<dyn Transport>>,
    lifecycle: Lifecycle,
    state: DeviceState,
    firmware: Option<u32>,
    decoder: StreamDecoder,
}

impl Default for AnalogInput {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalogInput {
    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Unbound session with the default configuration.
    pub fn new() -> Self {
        let state = DeviceState::default();
        let decoder = StreamDecoder::new(state.usb_streamed_channels().len());
        Self {
            transport: None,
            lifecycle: Lifecycle::Unbound,
            state,
            firmware: None,
            decoder,
        }
    }

    /// Handshake over `transport` and push the default configuration.
    pub fn connect<T: Transport + 'static>(transport: T) -> Result<Self> {
        let mut session = Self::new();
        session.bind(transport)?;
        Ok(session)
    }

    /// Open a serial port and connect.
    pub fn open_serial(settings: &SerialSettings) -> Result<Self> {
        let port = settings.open()?;
        Self::connect(port)
    }

    /// Attach a transport, handshake, and send every staged value.
    pub fn bind<T: Transport + 'static>(&mut self, transport: T) -> Result<FirmwareStatus> {
        if self.transport.is_some() {
            warn!("Binding a new transport; closing the previous one");
            self.close()?;
        }
        let mut transport: Box<dyn Transport> = Box::new(transport);
        let firmware = framer::handshake(transport.as_mut())?;
        let status = self.record_firmware(firmware);

        self.transport = Some(transport);
        self.clear_modes();
        self.push_state()?;
        info!(
            "Analog input module connected (firmware v{firmware}, {} channels at {} Hz)",
            self.state.n_active_channels, self.state.sampling_rate_hz
        );
        Ok(status)
    }

    /// Re-handshake and re-send the whole mirror after a desync.
    pub fn resync(&mut self) -> Result<FirmwareStatus> {
        let transport = self
            .transport
            .as_deref_mut()
            .ok_or(DriverError::NotConnected("resync"))?;
        let handshake = transport
            .discard_input()
            .map_err(DriverError::from_transport)
            .and_then(|_| framer::handshake(transport));
        let firmware = match handshake {
            Ok(firmware) => firmware,
            Err(e) => {
                self.lifecycle = Lifecycle::Desynchronized;
                return Err(e);
            }
        };
        let status = self.record_firmware(firmware);
        self.clear_modes();
        self.push_state()?;
        info!("Analog input module resynchronized");
        Ok(status)
    }

    /// Stop USB streaming if needed, then release the transport.
    ///
    /// The mirror keeps its last committed values and the session returns
    /// to `Unbound`, so the same configuration is sent on the next bind.
    pub fn close(&mut self) -> Result<Option<Box<dyn Transport>>> {
        let result = if self.state.usb_stream_enabled && self.transport.is_some() {
            self.stop_usb_stream()
        } else {
            Ok(())
        };
        let transport = self.transport.take();
        self.lifecycle = Lifecycle::Unbound;
        self.firmware = None;
        self.clear_modes();
        if transport.is_some() {
            info!("Analog input module closed");
        }
        result.map(|_| transport)
    }

    pub fn into_shared(self) -> SharedAnalogInput {
        Arc::new(Mutex::new(self))
    }

    fn record_firmware(&mut self, firmware: u32) -> FirmwareStatus {
        self.firmware = Some(firmware);
        let status = FirmwareStatus::classify(firmware);
        match status {
            FirmwareStatus::Current => {}
            FirmwareStatus::Old { found } => warn!(
                "Analog input firmware v{found} is older than v{}; please update the module firmware",
                framer::CURRENT_FIRMWARE
            ),
            FirmwareStatus::Future { found } => warn!(
                "Analog input firmware v{found} is newer than v{} known to this driver; please update the driver",
                framer::CURRENT_FIRMWARE
            ),
        }
        status
    }

    /// Fresh handshake: the device is idle.
    fn clear_modes(&mut self) {
        self.state.logging_enabled = false;
        self.state.usb_stream_enabled = false;
        self.state.module_stream_enabled = false;
        self.state.sm_event_reporting_enabled = false;
        self.state.usb_event_reporting_enabled = false;
    }

    /// Send every configuration value in the mirror.
    fn push_state(&mut self) -> Result<()> {
        let state = self.state.clone();
        let frames = [
            (
                "active channels",
                CommandFrame::new(framer::CMD_ACTIVE_CHANNELS).u8(state.n_active_channels),
            ),
            (
                "sampling rate",
                CommandFrame::new(framer::CMD_SAMPLING_RATE).u32(state.sampling_rate_hz),
            ),
            ("input ranges", ranges_frame(&state.ranges())),
            (
                "thresholds",
                levels_frame(&state.ranges(), &state.thresholds(), &state.resets()),
            ),
            (
                "SM events",
                CommandFrame::new(framer::CMD_SM_EVENTS).bytes(&state.sm_events().to_bytes()),
            ),
            (
                "stream routing",
                routing_frame(state.usb_routing(), state.module_routing()),
            ),
            (
                "stream prefix",
                CommandFrame::new(framer::CMD_STREAM_PREFIX).u8(state.stream_prefix),
            ),
            (
                "samples to log",
                CommandFrame::new(framer::CMD_SAMPLES_TO_LOG).u32(state.samples_to_log.wire_value()),
            ),
        ];
        let transport = self
            .transport
            .as_deref_mut()
            .ok_or(DriverError::NotConnected("sync"))?;
        self.lifecycle = Lifecycle::Programming;
        for &(parameter, ref frame) in &frames {
            if let Err(e) = framer::transact(transport, frame, parameter) {
                warn!("Initial sync failed at {parameter}: {e}");
                self.lifecycle = Lifecycle::Desynchronized;
                return Err(e);
            }
        }
        self.lifecycle = Lifecycle::Bound;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_bound(&self) -> bool {
        self.lifecycle == Lifecycle::Bound
    }

    /// False while a range change is being programmed.
    pub fn is_committed(&self) -> bool {
        self.lifecycle != Lifecycle::Programming
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn firmware_version(&self) -> Option<u32> {
        self.firmware
    }

    pub fn firmware_status(&self) -> Option<FirmwareStatus> {
        self.firmware.map(FirmwareStatus::classify)
    }

    /// Snapshot of the mirrored configuration.
    pub fn config(&self) -> ModuleConfig {
        ModuleConfig::from(&self.state)
    }

    /// Apply a full configuration through the ordinary setters.
    pub fn apply_config(&mut self, config: &ModuleConfig) -> Result<()> {
        self.set_n_active_channels(config.n_active_channels)?;
        self.set_sampling_rate(config.sampling_rate_hz)?;
        self.set_input_ranges(&config.input_ranges)?;
        self.set_thresholds(&config.thresholds)?;
        self.set_resets(&config.resets)?;
        self.set_sm_events(&flags_to_bytes(&config.sm_events))?;
        self.set_stream_routing(
            &flags_to_bytes(&config.stream_to_usb),
            &flags_to_bytes(&config.stream_to_module),
        )?;
        self.set_stream_prefix(config.stream_prefix)?;
        self.set_samples_to_log(config.samples_to_log)
    }

    // ------------------------------------------------------------------------
    // Setters
    // ------------------------------------------------------------------------

    /// Sample channels `0..n`.
    pub fn set_n_active_channels(&mut self, n: u8) -> Result<()> {
        check_int("active channels", i64::from(n), 1, N_CHANNELS as i64)?;
        let frame = CommandFrame::new(framer::CMD_ACTIVE_CHANNELS).u8(n);
        self.apply("active channels", &frame, |s| s.n_active_channels = n)
    }

    pub fn set_sampling_rate(&mut self, hz: u32) -> Result<()> {
        check_int(
            "sampling rate",
            i64::from(hz),
            i64::from(MIN_SAMPLING_RATE),
            i64::from(MAX_SAMPLING_RATE),
        )?;
        let frame = CommandFrame::new(framer::CMD_SAMPLING_RATE).u32(hz);
        self.apply("sampling rate", &frame, |s| s.sampling_rate_hz = hz)
    }

    /// Set all eight ranges, carrying thresholds and resets over to them.
    pub fn set_input_ranges(&mut self, ranges: &[InputRange]) -> Result<()> {
        check_len("input ranges", ranges.len())?;
        let mut new_ranges = [InputRange::default(); N_CHANNELS];
        new_ranges.copy_from_slice(ranges);
        self.guard("input ranges")?;

        let (thresholds, resets) = migrate_levels(&self.state.channels, &new_ranges);
        let commit = |s: &mut DeviceState| {
            s.set_ranges(&new_ranges);
            s.set_thresholds(&thresholds);
            s.set_resets(&resets);
        };

        let Some(transport) = self.transport.as_deref_mut() else {
            commit(&mut self.state);
            debug!("input ranges staged: {new_ranges:?}");
            return Ok(());
        };

        self.lifecycle = Lifecycle::Programming;
        if let Err(e) = framer::transact(transport, &ranges_frame(&new_ranges), "input ranges") {
            self.lifecycle = after_failure(&e);
            return Err(e);
        }
        // Device now holds the new ranges; its threshold codes must follow.
        let levels = levels_frame(&new_ranges, &thresholds, &resets);
        if let Err(e) = framer::transact(transport, &levels, "thresholds") {
            warn!("Range change half-applied ({e}); device needs resync");
            self.lifecycle = Lifecycle::Desynchronized;
            return Err(e);
        }
        commit(&mut self.state);
        self.lifecycle = Lifecycle::Bound;
        debug!("input ranges committed: {new_ranges:?}");
        Ok(())
    }

    /// Parse range names (e.g. `"-5V:5V"`) and set them.
    pub fn set_input_range_names<S: AsRef<str>>(&mut self, names: &[S]) -> Result<()> {
        let ranges = names
            .iter()
            .map(|n| n.as_ref().parse())
            .collect::<Result<Vec<InputRange>>>()?;
        self.set_input_ranges(&ranges)
    }

    pub fn set_thresholds(&mut self, volts: &[f64]) -> Result<()> {
        let ranges = self.state.ranges();
        let thresholds = check_volts("thresholds", volts, &ranges)?;
        let frame = levels_frame(&ranges, &thresholds, &self.state.resets());
        self.apply("thresholds", &frame, |s| s.set_thresholds(&thresholds))
    }

    pub fn set_resets(&mut self, volts: &[f64]) -> Result<()> {
        let ranges = self.state.ranges();
        let resets = check_volts("reset voltages", volts, &ranges)?;
        let frame = levels_frame(&ranges, &self.state.thresholds(), &resets);
        self.apply("reset voltages", &frame, |s| s.set_resets(&resets))
    }

    pub fn set_sm_events(&mut self, flags: &[u8]) -> Result<()> {
        let flags = ChannelFlags::from_slice("SM events", flags)?;
        let frame = CommandFrame::new(framer::CMD_SM_EVENTS).bytes(&flags.to_bytes());
        self.apply("SM events", &frame, |s| s.set_sm_events(flags))
    }

    /// Route channels to the USB stream; module routing is re-sent unchanged.
    pub fn set_usb_routing(&mut self, flags: &[u8]) -> Result<()> {
        let usb = ChannelFlags::from_slice("USB stream routing", flags)?;
        let module = self.state.module_routing();
        self.send_routing(usb, module)
    }

    /// Route channels to the module stream; USB routing is re-sent unchanged.
    pub fn set_module_routing(&mut self, flags: &[u8]) -> Result<()> {
        let module = ChannelFlags::from_slice("module stream routing", flags)?;
        let usb = self.state.usb_routing();
        self.send_routing(usb, module)
    }

    /// Set both routing arrays in one command.
    pub fn set_stream_routing(&mut self, usb: &[u8], module: &[u8]) -> Result<()> {
        let usb = ChannelFlags::from_slice("USB stream routing", usb)?;
        let module = ChannelFlags::from_slice("module stream routing", module)?;
        self.send_routing(usb, module)
    }

    fn send_routing(&mut self, usb: ChannelFlags, module: ChannelFlags) -> Result<()> {
        let frame = routing_frame(usb, module);
        self.apply("stream routing", &frame, |s| s.set_routing(usb, module))
    }

    pub fn set_stream_prefix(&mut self, prefix: u8) -> Result<()> {
        let frame = CommandFrame::new(framer::CMD_STREAM_PREFIX).u8(prefix);
        self.apply("stream prefix", &frame, |s| s.stream_prefix = prefix)
    }

    pub fn set_samples_to_log(&mut self, samples: SamplesToLog) -> Result<()> {
        if let SamplesToLog::Limited(n) = samples {
            check_int("samples to log", i64::from(n), 1, i64::from(u32::MAX))?;
        }
        let frame = CommandFrame::new(framer::CMD_SAMPLES_TO_LOG).u32(samples.wire_value());
        self.apply("samples to log", &frame, |s| s.samples_to_log = samples)
    }

    // Single-channel setters: validate the index, then go through the bulk setter.

    pub fn set_channel_range(&mut self, channel: usize, range: InputRange) -> Result<()> {
        check_channel(channel)?;
        let mut ranges = self.state.ranges();
        ranges[channel] = range;
        self.set_input_ranges(&ranges)
    }

    pub fn set_channel_threshold(&mut self, channel: usize, volts: f64) -> Result<()> {
        check_channel(channel)?;
        let mut thresholds = self.state.thresholds();
        thresholds[channel] = volts;
        self.set_thresholds(&thresholds)
    }

    pub fn set_channel_reset(&mut self, channel: usize, volts: f64) -> Result<()> {
        check_channel(channel)?;
        let mut resets = self.state.resets();
        resets[channel] = volts;
        self.set_resets(&resets)
    }

    pub fn set_channel_sm_event(&mut self, channel: usize, enabled: bool) -> Result<()> {
        check_channel(channel)?;
        let flags = self.state.sm_events().with(channel, enabled);
        self.set_sm_events(&flags.to_bytes())
    }

    pub fn set_channel_usb_stream(&mut self, channel: usize, enabled: bool) -> Result<()> {
        check_channel(channel)?;
        let flags = self.state.usb_routing().with(channel, enabled);
        self.set_usb_routing(&flags.to_bytes())
    }

    pub fn set_channel_module_stream(&mut self, channel: usize, enabled: bool) -> Result<()> {
        check_channel(channel)?;
        let flags = self.state.module_routing().with(channel, enabled);
        self.set_module_routing(&flags.to_bytes())
    }

    // ------------------------------------------------------------------------
    // Modes
    // ------------------------------------------------------------------------

    pub fn start_usb_stream(&mut self) -> Result<()> {
        self.require_bound("start USB stream")?;
        self.check_lifecycle()?;
        if self.state.usb_stream_enabled {
            debug!("USB stream already running");
            return Ok(());
        }
        let frame = CommandFrame::new(framer::CMD_STREAM).u8(framer::TARGET_USB).u8(1);
        self.apply("USB stream", &frame, |s| s.usb_stream_enabled = true)?;
        self.decoder = StreamDecoder::new(self.state.usb_streamed_channels().len());
        info!(
            "USB streaming started ({} channels)",
            self.decoder.n_channels()
        );
        Ok(())
    }

    /// Stop USB streaming. No ack is read: the input still holds stream
    /// bytes, so the device gets a short settle delay to go quiet, then the input
    /// is discarded and anything still trickling in is flushed.
    pub fn stop_usb_stream(&mut self) -> Result<()> {
        let transport = self
            .transport
            .as_deref_mut()
            .ok_or(DriverError::NotConnected("stop USB stream"))?;
        let frame = CommandFrame::new(framer::CMD_STREAM).u8(framer::TARGET_USB).u8(0);
        let stopped = framer::send(transport, &frame).and_then(|_| {
            thread::sleep(STOP_SETTLE);
            transport
                .discard_input()
                .map_err(DriverError::from_transport)?;
            framer::flush_input(transport)
        });
        if let Err(e) = stopped {
            self.lifecycle = after_failure(&e);
            return Err(e);
        }
        self.state.usb_stream_enabled = false;
        info!(
            "USB streaming stopped after {} frames",
            self.decoder.frames_decoded()
        );
        Ok(())
    }

    pub fn start_module_stream(&mut self) -> Result<()> {
        self.set_module_stream(true)
    }

    pub fn stop_module_stream(&mut self) -> Result<()> {
        self.set_module_stream(false)
    }

    fn set_module_stream(&mut self, on: bool) -> Result<()> {
        self.require_bound("module stream")?;
        let frame = CommandFrame::new(framer::CMD_STREAM)
            .u8(framer::TARGET_MODULE)
            .u8(u8::from(on));
        self.apply("module stream", &frame, |s| s.module_stream_enabled = on)
    }

    pub fn start_event_reporting(&mut self, target: EventTarget) -> Result<()> {
        self.set_event_reporting(target, true)
    }

    pub fn stop_event_reporting(&mut self, target: EventTarget) -> Result<()> {
        self.set_event_reporting(target, false)
    }

    fn set_event_reporting(&mut self, target: EventTarget, on: bool) -> Result<()> {
        self.require_bound("event reporting")?;
        let frame = CommandFrame::new(framer::CMD_EVENTS)
            .u8(target.wire())
            .u8(u8::from(on));
        self.apply("event reporting", &frame, |s| match target {
            EventTarget::StateMachine => s.sm_event_reporting_enabled = on,
            EventTarget::Usb => s.usb_event_reporting_enabled = on,
        })
    }

    pub fn start_logging(&mut self) -> Result<()> {
        self.set_logging(true)
    }

    pub fn stop_logging(&mut self) -> Result<()> {
        self.set_logging(false)
    }

    fn set_logging(&mut self, on: bool) -> Result<()> {
        self.require_bound("logging")?;
        let frame = CommandFrame::new(framer::CMD_LOGGING).u8(u8::from(on));
        self.apply("logging", &frame, |s| s.logging_enabled = on)
    }

    /// Zero the device. The device sends no reply.
    pub fn zero(&mut self) -> Result<()> {
        self.require_bound("zero")?;
        self.guard("zero")?;
        let transport = self
            .transport
            .as_deref_mut()
            .ok_or(DriverError::NotConnected("zero"))?;
        framer::send(transport, &CommandFrame::new(framer::CMD_ZERO))
    }

    // ------------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------------

    /// Read one USB stream frame.
    pub fn read_stream_frame(&mut self) -> Result<StreamFrame> {
        if !self.state.usb_stream_enabled {
            return Err(DriverError::NotStreaming);
        }
        let transport = self
            .transport
            .as_deref_mut()
            .ok_or(DriverError::NotConnected("read stream frame"))?;
        self.decoder.read_frame(transport)
    }

    /// Ranges of the channels in each stream frame, in frame order.
    pub fn streamed_ranges(&self) -> Vec<InputRange> {
        self.state
            .usb_streamed_channels()
            .into_iter()
            .map(|ch| self.state.channels[ch].input_range)
            .collect()
    }

    /// Convert a stream frame to volts using the current channel ranges.
    pub fn frame_volts(&self, frame: &StreamFrame) -> Vec<f64> {
        frame.volts(&self.streamed_ranges())
    }

    /// Download everything the device has logged.
    ///
    /// Reply: u32 sample count, then `count * active channels` codes,
    /// sample-major.
    pub fn get_logged_data(&mut self) -> Result<LoggedData> {
        self.require_bound("logged data")?;
        self.guard("logged data")?;
        let n_active = self.state.n_active_channels as usize;
        let ranges = self.state.ranges();
        let transport = self
            .transport
            .as_deref_mut()
            .ok_or(DriverError::NotConnected("logged data"))?;

        let read = |transport: &mut dyn Transport| -> Result<Vec<u16>> {
            framer::send(transport, &CommandFrame::new(framer::CMD_LOGGED_DATA))?;
            let n_samples = framer::read_u32(transport)?;
            let n_codes = usize::try_from(n_samples)
                .ok()
                .and_then(|n| n.checked_mul(n_active))
                .ok_or(DriverError::LogSize {
                    samples: n_samples,
                    channels: n_active,
                })?;
            debug!("Downloading {n_samples} logged samples x {n_active} channels");
            framer::read_u16_array(transport, n_codes)
        };
        let raw = match read(transport) {
            Ok(raw) => raw,
            Err(e) => {
                if e.leaves_device_indeterminate() {
                    self.lifecycle = Lifecycle::Desynchronized;
                }
                return Err(e);
            }
        };

        let mut codes = vec![Vec::with_capacity(raw.len() / n_active.max(1)); n_active];
        for sample in raw.chunks_exact(n_active) {
            for (row, &code) in codes.iter_mut().zip(sample) {
                row.push(code);
            }
        }
        let volts = codes
            .iter()
            .zip(ranges)
            .map(|(row, range)| row.iter().map(|&c| range.code_to_volts(c)).collect())
            .collect();
        Ok(LoggedData { codes, volts })
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    fn check_lifecycle(&self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Desynchronized | Lifecycle::Programming => Err(DriverError::NeedsResync),
            _ => Ok(()),
        }
    }

    /// Reject commands the session cannot send right now.
    fn guard(&self, parameter: &'static str) -> Result<()> {
        self.check_lifecycle()?;
        if self.state.usb_stream_enabled {
            return Err(DriverError::StreamingActive(parameter));
        }
        Ok(())
    }

    fn require_bound(&self, what: &'static str) -> Result<()> {
        if self.transport.is_none() {
            return Err(DriverError::NotConnected(what));
        }
        Ok(())
    }

    /// Stage (unbound) or send-ack-commit (bound) one command.
    fn apply<F>(&mut self, parameter: &'static str, frame: &CommandFrame, commit: F) -> Result<()>
    where
        F: FnOnce(&mut DeviceState),
    {
        self.guard(parameter)?;
        let Some(transport) = self.transport.as_deref_mut() else {
            commit(&mut self.state);
            debug!("{parameter} staged");
            return Ok(());
        };
        match framer::transact(transport, frame, parameter) {
            Ok(()) => {
                commit(&mut self.state);
                Ok(())
            }
            Err(e) => {
                self.lifecycle = after_failure(&e);
                Err(e)
            }
        }
    }
}

impl Drop for AnalogInput {
    fn drop(&mut self) {
        if self.state.usb_stream_enabled && self.transport.is_some() {
            if let Err(e) = self.stop_usb_stream() {
                warn!("Failed to stop USB stream on drop: {e}");
            }
        }
    }
}

fn after_failure(err: &DriverError) -> Lifecycle {
    if err.leaves_device_indeterminate() {
        warn!("Device state indeterminate after: {err}");
        Lifecycle::Desynchronized
    } else {
        Lifecycle::Bound
    }
}

fn check_int(parameter: &'static str, value: i64, min: i64, max: i64) -> Result<()> {
    if value < min || value > max {
        return Err(DriverError::InvalidRange {
            parameter,
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn flags_to_bytes(flags: &[bool]) -> Vec<u8> {
    flags.iter().map(|&f| u8::from(f)).collect()
}

fn ranges_frame(ranges: &[InputRange; N_CHANNELS]) -> CommandFrame {
    CommandFrame::new(framer::CMD_RANGES).bytes(&ranges.map(InputRange::index))
}

/// Thresholds then resets, as codes, in one payload.
fn levels_frame(
    ranges: &[InputRange; N_CHANNELS],
    thresholds: &[f64; N_CHANNELS],
    resets: &[f64; N_CHANNELS],
) -> CommandFrame {
    CommandFrame::new(framer::CMD_THRESHOLDS)
        .u16_array(&volts_to_codes(thresholds, ranges))
        .u16_array(&volts_to_codes(resets, ranges))
}

/// USB flags then module flags.
fn routing_frame(usb: ChannelFlags, module: ChannelFlags) -> CommandFrame {
    CommandFrame::new(framer::CMD_STREAM_ROUTING)
        .bytes(&usb.to_bytes())
        .bytes(&module.to_bytes())
}
