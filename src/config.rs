//! Serializable module configuration.
//!
//! The device keeps no configuration across power cycles, so callers save a
//! [`ModuleConfig`] and re-apply it after reconnecting.
//!
//! ```toml
//! n_active_channels = 2
//! sampling_rate_hz = 5000
//! input_ranges = ["-5V:5V", "0V:10V", "-10V:10V", "-10V:10V",
//!                 "-10V:10V", "-10V:10V", "-10V:10V", "-10V:10V"]
//! samples_to_log = "infinite"
//!
//! [serial]
//! port = "/dev/ttyACM0"
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::range::InputRange;
use crate::state::{DeviceState, SamplesToLog, N_CHANNELS};
use crate::transport::SerialSettings;

/// Full configuration of one module. Missing keys take device defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    pub n_active_channels: u8,
    pub sampling_rate_hz: u32,
    pub input_ranges: Vec<InputRange>,
    pub thresholds: Vec<f64>,
    pub resets: Vec<f64>,
    pub sm_events: Vec<bool>,
    pub stream_to_usb: Vec<bool>,
    pub stream_to_module: Vec<bool>,
    pub stream_prefix: u8,
    pub samples_to_log: SamplesToLog,
    /// Only used by binaries that open the port themselves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<SerialSettings>,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self::from(&DeviceState::default())
    }
}

impl From<&DeviceState> for ModuleConfig {
    fn from(state: &DeviceState) -> Self {
        Self {
            n_active_channels: state.n_active_channels,
            sampling_rate_hz: state.sampling_rate_hz,
            input_ranges: state.ranges().to_vec(),
            thresholds: state.thresholds().to_vec(),
            resets: state.resets().to_vec(),
            sm_events: state.sm_events().as_array().to_vec(),
            stream_to_usb: state.usb_routing().as_array().to_vec(),
            stream_to_module: state.module_routing().as_array().to_vec(),
            stream_prefix: state.stream_prefix,
            samples_to_log: state.samples_to_log,
            serial: None,
        }
    }
}

impl ModuleConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ModuleConfig = toml::from_str(text)?;
        config.check_lengths()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    fn check_lengths(&self) -> Result<()> {
        let lists = [
            ("input_ranges", self.input_ranges.len()),
            ("thresholds", self.thresholds.len()),
            ("resets", self.resets.len()),
            ("sm_events", self.sm_events.len()),
            ("stream_to_usb", self.stream_to_usb.len()),
            ("stream_to_module", self.stream_to_module.len()),
        ];
        for (parameter, actual) in lists {
            if actual != N_CHANNELS {
                return Err(DriverError::WrongChannelCount {
                    parameter,
                    expected: N_CHANNELS,
                    actual,
                });
            }
        }
        Ok(())
    }
}
