//! Operating limits and unit scaling for each supported load model.
//!
//! The public API works in milli-units (mA, mW, mΩ, mV). Each load mode has its
//! own raw wire unit, and its own range, described here by a [`ModeSpec`].

use crate::{
    error::EncodingError,
    types::{LoadMode, POWER_MW_PER_RAW, RESISTANCE_MOHM_PER_RAW},
};

/// Longest program step the loads accept, in seconds.
pub const MAX_STEP_SECS: u32 = 60_000;

/// Program steps which fit in the two program upload frames.
pub const MAX_PROGRAM_STEPS: usize = 10;

/// Wire code, range and scaling of one load mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSpec {
    /// Mode code sent in the parameter and program frames.
    pub code: u8,
    /// Largest accepted setpoint, in milli-units.
    pub max_milli: u32,
    /// Milli-units per raw wire unit (e.g. 100 means the raw value is in 0.1 W).
    pub milli_per_raw: u32,
}

impl ModeSpec {
    pub const fn new(code: u8, max_milli: u32, milli_per_raw: u32) -> Self {
        Self {
            code,
            max_milli,
            milli_per_raw,
        }
    }

    /// Convert a setpoint in milli-units to the raw wire value.
    ///
    /// Rounds down to the wire resolution. A mode with a `milli_per_raw` of
    /// zero can't encode anything.
    pub const fn to_raw(&self, milli: u32) -> Result<u16, EncodingError> {
        if milli > self.max_milli {
            return Err(EncodingError::OutOfRange {
                value: milli,
                max: self.max_milli,
            });
        }
        let Some(raw) = milli.checked_div(self.milli_per_raw) else {
            return Err(EncodingError::ZeroScale);
        };
        if raw > u16::MAX as u32 {
            return Err(EncodingError::OutOfRange {
                value: milli,
                max: self.max_milli,
            });
        }
        Ok(raw as u16)
    }

    /// Convert a raw wire value to milli-units.
    #[inline]
    pub const fn raw_to_milli(&self, raw: u16) -> u32 {
        raw as u32 * self.milli_per_raw
    }
}

/// Everything the driver needs to know about a load model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    pub current: ModeSpec,
    pub power: ModeSpec,
    pub resistance: ModeSpec,
    /// `None` for loads without a constant voltage mode.
    pub voltage: Option<ModeSpec>,
    /// Limit for the max current parameter, in milliamps.
    pub max_current_limit_ma: u32,
    /// Limit for the max power parameter, in milliwatts.
    pub max_power_limit_mw: u32,
    pub max_program_steps: usize,
    pub max_step_secs: u32,
}

impl DeviceProfile {
    /// Array 3710A, also sold by Gossen, Tekpower and Circuit Specialists under the same model number.
    ///
    /// 30 A, 200 W, 500 Ω.
    pub const ARRAY_3710A: Self = Self {
        current: ModeSpec::new(0x01, 30_000, 1),
        power: ModeSpec::new(0x02, 200_000, POWER_MW_PER_RAW),
        resistance: ModeSpec::new(0x03, 500_000, RESISTANCE_MOHM_PER_RAW),
        voltage: None,
        max_current_limit_ma: 30_000,
        max_power_limit_mw: 200_000,
        max_program_steps: MAX_PROGRAM_STEPS,
        max_step_secs: MAX_STEP_SECS,
    };

    /// Code, range and scaling for `mode`, or `None` if this load can't run in it.
    pub const fn mode_spec(&self, mode: LoadMode) -> Option<ModeSpec> {
        match mode {
            LoadMode::Current => Some(self.current),
            LoadMode::Power => Some(self.power),
            LoadMode::Resistance => Some(self.resistance),
            LoadMode::Voltage => self.voltage,
        }
    }

    /// The setpoint which draws the least from the device under test.
    ///
    /// Zero for every mode but resistance, where zero ohms would be a short.
    pub fn safe_setpoint(&self, mode: LoadMode) -> u32 {
        match (mode, self.mode_spec(mode)) {
            (LoadMode::Resistance, Some(spec)) => spec.max_milli,
            _ => 0,
        }
    }
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::ARRAY_3710A
    }
}
