//! Input ranges and voltage/code conversion.
//!
//! Each channel's front end digitizes one of four voltage spans. The device
//! stores thresholds and reset voltages as fixed-point codes on a 0-8192
//! scale, so every voltage sent to the wire goes through
//! [`InputRange::volts_to_code`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DriverError;

/// Full-scale ADC code.
pub const FULL_SCALE_CODE: u16 = 8192;

/// Voltage span a channel is configured to digitize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InputRange {
    #[default]
    #[serde(rename = "-10V:10V")]
    Bipolar10V,
    #[serde(rename = "-5V:5V")]
    Bipolar5V,
    #[serde(rename = "-2.5V:2.5V")]
    Bipolar2V5,
    #[serde(rename = "0V:10V")]
    Unipolar10V,
}

impl InputRange {
    pub const ALL: [InputRange; 4] = [
        InputRange::Bipolar10V,
        InputRange::Bipolar5V,
        InputRange::Bipolar2V5,
        InputRange::Unipolar10V,
    ];

    /// Index sent in the set-ranges command.
    pub fn index(self) -> u8 {
        match self {
            InputRange::Bipolar10V => 0,
            InputRange::Bipolar5V => 1,
            InputRange::Bipolar2V5 => 2,
            InputRange::Unipolar10V => 3,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            InputRange::Bipolar10V => "-10V:10V",
            InputRange::Bipolar5V => "-5V:5V",
            InputRange::Bipolar2V5 => "-2.5V:2.5V",
            InputRange::Unipolar10V => "0V:10V",
        }
    }

    /// Span width in volts.
    pub fn multiplier(self) -> f64 {
        match self {
            InputRange::Bipolar10V => 20.0,
            InputRange::Bipolar5V => 10.0,
            InputRange::Bipolar2V5 => 5.0,
            InputRange::Unipolar10V => 10.0,
        }
    }

    /// Shift that moves the lower bound to 0 V.
    pub fn offset(self) -> f64 {
        match self {
            InputRange::Bipolar10V => 10.0,
            InputRange::Bipolar5V => 5.0,
            InputRange::Bipolar2V5 => 2.5,
            InputRange::Unipolar10V => 0.0,
        }
    }

    pub fn volts_min(self) -> f64 {
        -self.offset()
    }

    pub fn volts_max(self) -> f64 {
        self.multiplier() - self.offset()
    }

    pub fn contains(self, volts: f64) -> bool {
        volts >= self.volts_min() && volts <= self.volts_max()
    }

    /// Clamp `volts` into `[volts_min, volts_max]`.
    pub fn clamp(self, volts: f64) -> f64 {
        volts.clamp(self.volts_min(), self.volts_max())
    }

    /// `round(((volts + offset) / multiplier) * 8192)`.
    ///
    /// Callers validate `volts` against the range first; out-of-span input
    /// saturates at 0 or 8192.
    pub fn volts_to_code(self, volts: f64) -> u16 {
        let code = ((volts + self.offset()) / self.multiplier()) * f64::from(FULL_SCALE_CODE);
        code.round().clamp(0.0, f64::from(FULL_SCALE_CODE)) as u16
    }

    /// Inverse of [`volts_to_code`](Self::volts_to_code), used for logged and streamed samples.
    pub fn code_to_volts(self, code: u16) -> f64 {
        f64::from(code) / f64::from(FULL_SCALE_CODE) * self.multiplier() - self.offset()
    }
}

impl fmt::Display for InputRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for InputRange {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .into_iter()
            .find(|r| r.name().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| DriverError::UnknownRange(s.to_string()))
    }
}
