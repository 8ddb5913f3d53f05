//! Mirrored device configuration.
//!
//! [`DeviceState`] holds the last configuration the device acknowledged
//! (or, before connecting, the configuration staged for it).

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{DriverError, Result};
use crate::range::InputRange;

/// Physical channels on the module.
pub const N_CHANNELS: usize = 8;

pub const MIN_SAMPLING_RATE: u32 = 1;
pub const MAX_SAMPLING_RATE: u32 = 10_000;

pub const DEFAULT_SAMPLING_RATE: u32 = 1000;

/// Prefix byte the device puts in front of each USB-streamed sample frame.
pub const DEFAULT_STREAM_PREFIX: u8 = b'R';

/// One on/off flag per physical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelFlags([bool; N_CHANNELS]);

impl ChannelFlags {
    pub const NONE: ChannelFlags = ChannelFlags([false; N_CHANNELS]);
    pub const ALL: ChannelFlags = ChannelFlags([true; N_CHANNELS]);

    pub fn new(flags: [bool; N_CHANNELS]) -> Self {
        Self(flags)
    }

    /// Build from a caller-supplied list of `0`/`1` values.
    pub fn from_slice(parameter: &'static str, values: &[u8]) -> Result<Self> {
        check_len(parameter, values.len())?;
        let mut flags = [false; N_CHANNELS];
        for (channel, (&value, slot)) in values.iter().zip(flags.iter_mut()).enumerate() {
            *slot = match value {
                0 => false,
                1 => true,
                _ => {
                    return Err(DriverError::InvalidFlag {
                        parameter,
                        channel,
                        value,
                    })
                }
            };
        }
        Ok(Self(flags))
    }

    pub fn get(&self, channel: usize) -> bool {
        self.0[channel]
    }

    /// Copy with one channel changed.
    pub fn with(mut self, channel: usize, enabled: bool) -> Self {
        self.0[channel] = enabled;
        self
    }

    /// Wire encoding: one byte per channel.
    pub fn to_bytes(self) -> [u8; N_CHANNELS] {
        self.0.map(u8::from)
    }

    pub fn as_array(&self) -> [bool; N_CHANNELS] {
        self.0
    }
}

/// How many samples the device logs before stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplesToLog {
    #[default]
    Unbounded,
    Limited(u32),
}

impl SamplesToLog {
    /// Value sent in the `W` command; 0 means unbounded.
    pub fn wire_value(self) -> u32 {
        match self {
            SamplesToLog::Unbounded => 0,
            SamplesToLog::Limited(n) => n,
        }
    }
}

impl Serialize for SamplesToLog {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            SamplesToLog::Unbounded => s.serialize_str("infinite"),
            SamplesToLog::Limited(n) => s.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for SamplesToLog {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(u32),
            Word(String),
        }
        match Raw::deserialize(d)? {
            Raw::Count(0) => Ok(SamplesToLog::Unbounded),
            Raw::Count(n) => Ok(SamplesToLog::Limited(n)),
            Raw::Word(w) if w.eq_ignore_ascii_case("infinite") => Ok(SamplesToLog::Unbounded),
            Raw::Word(w) => Err(serde::de::Error::custom(format!(
                "samples_to_log must be a count or \"infinite\", got {w:?}"
            ))),
        }
    }
}

/// Per-channel configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelConfig {
    pub input_range: InputRange,
    /// Volts; always inside `input_range`.
    pub threshold_volts: f64,
    /// Volts; the signal must cross back over this before the threshold can fire again.
    pub reset_volts: f64,
    pub sm_event_enabled: bool,
    pub stream_to_usb: bool,
    pub stream_to_module: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        let input_range = InputRange::default();
        Self {
            input_range,
            threshold_volts: input_range.volts_max(),
            reset_volts: input_range.volts_min(),
            sm_event_enabled: false,
            stream_to_usb: true,
            stream_to_module: false,
        }
    }
}

/// Everything the driver mirrors from the device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub channels: [ChannelConfig; N_CHANNELS],
    /// Channels `0..n_active_channels` are sampled.
    pub n_active_channels: u8,
    pub sampling_rate_hz: u32,
    pub samples_to_log: SamplesToLog,
    pub stream_prefix: u8,
    pub logging_enabled: bool,
    pub usb_stream_enabled: bool,
    pub module_stream_enabled: bool,
    /// Threshold events reported to the trial controller.
    pub sm_event_reporting_enabled: bool,
    /// Threshold events reported over USB.
    pub usb_event_reporting_enabled: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            channels: [ChannelConfig::default(); N_CHANNELS],
            n_active_channels: N_CHANNELS as u8,
            sampling_rate_hz: DEFAULT_SAMPLING_RATE,
            samples_to_log: SamplesToLog::Unbounded,
            stream_prefix: DEFAULT_STREAM_PREFIX,
            logging_enabled: false,
            usb_stream_enabled: false,
            module_stream_enabled: false,
            sm_event_reporting_enabled: false,
            usb_event_reporting_enabled: false,
        }
    }
}

impl DeviceState {
    pub fn ranges(&self) -> [InputRange; N_CHANNELS] {
        self.channels.map(|c| c.input_range)
    }

    pub fn thresholds(&self) -> [f64; N_CHANNELS] {
        self.channels.map(|c| c.threshold_volts)
    }

    pub fn resets(&self) -> [f64; N_CHANNELS] {
        self.channels.map(|c| c.reset_volts)
    }

    pub fn sm_events(&self) -> ChannelFlags {
        ChannelFlags(self.channels.map(|c| c.sm_event_enabled))
    }

    pub fn usb_routing(&self) -> ChannelFlags {
        ChannelFlags(self.channels.map(|c| c.stream_to_usb))
    }

    pub fn module_routing(&self) -> ChannelFlags {
        ChannelFlags(self.channels.map(|c| c.stream_to_module))
    }

    /// Channels whose samples appear in each USB stream frame, in order.
    pub fn usb_streamed_channels(&self) -> Vec<usize> {
        (0..self.n_active_channels as usize)
            .filter(|&ch| self.channels[ch].stream_to_usb)
            .collect()
    }

    pub(crate) fn set_ranges(&mut self, ranges: &[InputRange; N_CHANNELS]) {
        for (channel, range) in self.channels.iter_mut().zip(ranges) {
            channel.input_range = *range;
        }
    }

    pub(crate) fn set_thresholds(&mut self, thresholds: &[f64; N_CHANNELS]) {
        for (channel, v) in self.channels.iter_mut().zip(thresholds) {
            channel.threshold_volts = *v;
        }
    }

    pub(crate) fn set_resets(&mut self, resets: &[f64; N_CHANNELS]) {
        for (channel, v) in self.channels.iter_mut().zip(resets) {
            channel.reset_volts = *v;
        }
    }

    pub(crate) fn set_sm_events(&mut self, flags: ChannelFlags) {
        for (channel, on) in self.channels.iter_mut().zip(flags.0) {
            channel.sm_event_enabled = on;
        }
    }

    pub(crate) fn set_routing(&mut self, usb: ChannelFlags, module: ChannelFlags) {
        for (ch, channel) in self.channels.iter_mut().enumerate() {
            channel.stream_to_usb = usb.0[ch];
            channel.stream_to_module = module.0[ch];
        }
    }
}

pub(crate) fn check_len(parameter: &'static str, actual: usize) -> Result<()> {
    if actual != N_CHANNELS {
        return Err(DriverError::WrongChannelCount {
            parameter,
            expected: N_CHANNELS,
            actual,
        });
    }
    Ok(())
}

pub(crate) fn check_channel(channel: usize) -> Result<()> {
    if channel >= N_CHANNELS {
        return Err(DriverError::InvalidChannel(channel));
    }
    Ok(())
}

/// Check every voltage against its channel's range.
pub(crate) fn check_volts(
    parameter: &'static str,
    values: &[f64],
    ranges: &[InputRange; N_CHANNELS],
) -> Result<[f64; N_CHANNELS]> {
    check_len(parameter, values.len())?;
    let mut out = [0.0; N_CHANNELS];
    for (channel, (&value, range)) in values.iter().zip(ranges).enumerate() {
        if !range.contains(value) {
            return Err(DriverError::OutOfRange {
                parameter,
                channel,
                value,
                min: range.volts_min(),
                max: range.volts_max(),
            });
        }
        out[channel] = value;
    }
    Ok(out)
}

/// Thresholds and resets carried over to new ranges.
///
/// Values are clamped into the new span. A threshold sitting exactly on the
/// old maximum moves to the new maximum, and a reset sitting exactly on the
/// old minimum moves to the new minimum.
pub fn migrate_levels(
    channels: &[ChannelConfig; N_CHANNELS],
    new_ranges: &[InputRange; N_CHANNELS],
) -> ([f64; N_CHANNELS], [f64; N_CHANNELS]) {
    let mut thresholds = [0.0; N_CHANNELS];
    let mut resets = [0.0; N_CHANNELS];
    for (ch, (old, new)) in channels.iter().zip(new_ranges).enumerate() {
        let old_range = old.input_range;
        thresholds[ch] = if old.threshold_volts == old_range.volts_max() {
            new.volts_max()
        } else {
            new.clamp(old.threshold_volts)
        };
        resets[ch] = if old.reset_volts == old_range.volts_min() {
            new.volts_min()
        } else {
            new.clamp(old.reset_volts)
        };
    }
    (thresholds, resets)
}

/// Device codes for a set of voltages.
pub fn volts_to_codes(
    volts: &[f64; N_CHANNELS],
    ranges: &[InputRange; N_CHANNELS],
) -> [u16; N_CHANNELS] {
    let mut codes = [0u16; N_CHANNELS];
    for (code, (v, range)) in codes.iter_mut().zip(volts.iter().zip(ranges)) {
        *code = range.volts_to_code(*v);
    }
    codes
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn channels_with(range: InputRange, threshold: f64, reset: f64) -> [ChannelConfig; N_CHANNELS] {
        [ChannelConfig {
            input_range: range,
            threshold_volts: threshold,
            reset_volts: reset,
            ..ChannelConfig::default()
        }; N_CHANNELS]
    }

    #[test]
    fn defaults() {
        let state = DeviceState::default();
        assert_eq!(state.n_active_channels, 8);
        assert_eq!(state.sampling_rate_hz, 1000);
        assert_eq!(state.ranges(), [InputRange::Bipolar10V; N_CHANNELS]);
        assert_eq!(state.thresholds(), [10.0; N_CHANNELS]);
        assert_eq!(state.resets(), [-10.0; N_CHANNELS]);
        assert_eq!(state.usb_streamed_channels(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn flags_validate_length_and_values() {
        let flags = ChannelFlags::from_slice("f", &[1, 0, 0, 1, 0, 0, 0, 1]).unwrap();
        assert!(flags.get(0) && flags.get(3) && !flags.get(1));
        assert_eq!(flags.to_bytes(), [1, 0, 0, 1, 0, 0, 0, 1]);

        assert!(matches!(
            ChannelFlags::from_slice("f", &[1, 0, 0]),
            Err(DriverError::WrongChannelCount { actual: 3, .. })
        ));
        assert!(matches!(
            ChannelFlags::from_slice("f", &[1, 0, 0, 2, 0, 0, 0, 0]),
            Err(DriverError::InvalidFlag { channel: 3, value: 2, .. })
        ));
    }

    #[test]
    fn streamed_channels_limited_to_active() {
        let mut state = DeviceState::default();
        state.n_active_channels = 4;
        state.set_routing(
            ChannelFlags::new([true, false, true, true, true, false, false, true]),
            ChannelFlags::NONE,
        );
        assert_eq!(state.usb_streamed_channels(), vec![0, 2, 3]);
    }

    #[test]
    fn check_volts_reports_first_bad_channel() {
        let ranges = [InputRange::Bipolar10V; N_CHANNELS];
        let err = check_volts("thresholds", &[0.0, 0.0, 12.0, 0.0, 0.0, 0.0, 0.0, 11.0], &ranges)
            .unwrap_err();
        assert!(matches!(err, DriverError::OutOfRange { channel: 2, .. }));
    }

    #[rstest]
    fn migration_stays_in_new_range(
        #[values(InputRange::Bipolar10V, InputRange::Bipolar5V, InputRange::Bipolar2V5, InputRange::Unipolar10V)]
        old: InputRange,
        #[values(InputRange::Bipolar10V, InputRange::Bipolar5V, InputRange::Bipolar2V5, InputRange::Unipolar10V)]
        new: InputRange,
        #[values(0.0, 0.25, 0.5, 0.9, 1.0)] fraction: f64,
    ) {
        let span = old.volts_max() - old.volts_min();
        let level = old.volts_min() + span * fraction;
        let channels = channels_with(old, level, level);
        let (thresholds, resets) = migrate_levels(&channels, &[new; N_CHANNELS]);
        for ch in 0..N_CHANNELS {
            assert!(new.contains(thresholds[ch]));
            assert!(new.contains(resets[ch]));
        }
        if fraction == 1.0 {
            assert_eq!(thresholds[0], new.volts_max());
        }
        if fraction == 0.0 {
            assert_eq!(resets[0], new.volts_min());
        }
    }

    #[test]
    fn migration_clamps_and_keeps_in_range_values() {
        // 7 V threshold does not fit -5V:5V, 2 V does.
        let mut channels = channels_with(InputRange::Bipolar10V, 7.0, -7.0);
        channels[1].threshold_volts = 2.0;
        channels[1].reset_volts = -1.0;
        let (thresholds, resets) = migrate_levels(&channels, &[InputRange::Bipolar5V; N_CHANNELS]);
        assert_eq!(thresholds[0], 5.0);
        assert_eq!(resets[0], -5.0);
        assert_eq!(thresholds[1], 2.0);
        assert_eq!(resets[1], -1.0);
    }

    #[test]
    fn max_threshold_carries_to_new_max() {
        // At the old max of 2.5 V: moves to 10 V rather than staying at 2.5 V.
        let channels = channels_with(InputRange::Bipolar2V5, 2.5, -2.5);
        let (thresholds, resets) = migrate_levels(&channels, &[InputRange::Unipolar10V; N_CHANNELS]);
        assert_eq!(thresholds[0], 10.0);
        assert_eq!(resets[0], 0.0);
    }

    #[test]
    fn samples_to_log_serde() {
        #[derive(Deserialize, Serialize)]
        struct Wrap {
            n: SamplesToLog,
        }
        let w: Wrap = toml::from_str("n = \"infinite\"").unwrap();
        assert_eq!(w.n, SamplesToLog::Unbounded);
        let w: Wrap = toml::from_str("n = 5000").unwrap();
        assert_eq!(w.n, SamplesToLog::Limited(5000));
        assert!(toml::from_str::<Wrap>("n = \"infinte\"").is_err());
        assert_eq!(SamplesToLog::Unbounded.wire_value(), 0);
    }
}
