//! Load programs: a list of timed steps the load runs on its own.
//!
//! A program is uploaded in two frames. The first carries the load mode, the
//! step count and steps 1 - 5, the second steps 6 - 10 and the run mode. Unused
//! step slots are zero.

use fugit::Duration;

use crate::{
    error::ValidationError,
    frame::PAYLOAD_LEN,
    profile::{DeviceProfile, MAX_PROGRAM_STEPS},
    types::{LoadMode, RunMode},
};

const STEPS_PER_FRAME: usize = MAX_PROGRAM_STEPS / 2;
const STEP_LEN: usize = 4;

/// One step of a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramStep {
    /// How long the step lasts.
    pub duration: Duration<u32, 1, 1>,
    /// Setpoint in milli-units of `mode` (mA, mW, mΩ or mV).
    pub setpoint: u32,
    pub mode: LoadMode,
}

impl ProgramStep {
    pub fn new(mode: LoadMode, setpoint: u32, duration: Duration<u32, 1, 1>) -> Self {
        Self {
            duration,
            setpoint,
            mode,
        }
    }
}

/// Payloads for the two program upload frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramPayload {
    /// Payload for [`Command::UploadProgramLow`](crate::command::Command::UploadProgramLow).
    pub low: [u8; PAYLOAD_LEN],
    /// Payload for [`Command::UploadProgramHigh`](crate::command::Command::UploadProgramHigh).
    pub high: [u8; PAYLOAD_LEN],
}

/// Use this type to validate and serialize a program.
#[derive(Debug, Clone, Copy)]
pub struct ProgramBuilder {
    profile: DeviceProfile,
    run_mode: RunMode,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new(DeviceProfile::default())
    }
}

impl ProgramBuilder {
    pub fn new(profile: DeviceProfile) -> Self {
        Self {
            profile,
            run_mode: RunMode::default(),
        }
    }

    /// Run the program once, or loop it until stopped.
    pub fn with_run_mode(mut self, run_mode: RunMode) -> Self {
        self.run_mode = run_mode;
        self
    }

    /// Let's build it!
    pub fn build(&self, steps: &[ProgramStep]) -> Result<ProgramPayload, ValidationError> {
        let first = steps.first().ok_or(ValidationError::Empty)?;
        let max = self.profile.max_program_steps.min(MAX_PROGRAM_STEPS);
        if steps.len() > max {
            return Err(ValidationError::TooManySteps {
                count: steps.len(),
                max,
            });
        }
        let mode = first.mode;
        let spec = self
            .profile
            .mode_spec(mode)
            .ok_or(ValidationError::UnsupportedMode { index: 0 })?;

        let mut raw_steps = [(0u16, 0u16); MAX_PROGRAM_STEPS];
        for (index, step) in steps.iter().enumerate() {
            if step.mode != mode {
                return Err(if self.profile.mode_spec(step.mode).is_none() {
                    ValidationError::UnsupportedMode { index }
                } else {
                    ValidationError::MixedModes { index }
                });
            }
            let secs = step.duration.to_secs();
            if secs == 0 {
                return Err(ValidationError::ZeroDuration { index });
            }
            if secs > self.profile.max_step_secs {
                return Err(ValidationError::DurationTooLong {
                    index,
                    max_secs: self.profile.max_step_secs,
                });
            }
            let setpoint = spec
                .to_raw(step.setpoint)
                .map_err(|_| ValidationError::SetpointOutOfRange {
                    index,
                    max: spec.max_milli,
                })?;
            // The wire field is 16 bits, whatever the profile allows.
            let secs = u16::try_from(secs).map_err(|_| ValidationError::DurationTooLong {
                index,
                max_secs: u16::MAX as u32,
            })?;
            raw_steps[index] = (setpoint, secs);
        }

        let mut low = [0u8; PAYLOAD_LEN];
        low[0] = spec.code;
        low[1] = steps.len() as u8;
        write_steps(&mut low[2..], &raw_steps[..STEPS_PER_FRAME]);

        let mut high = [0u8; PAYLOAD_LEN];
        write_steps(&mut high, &raw_steps[STEPS_PER_FRAME..]);
        high[STEPS_PER_FRAME * STEP_LEN] = self.run_mode.into();

        Ok(ProgramPayload { low, high })
    }
}

fn write_steps(out: &mut [u8], steps: &[(u16, u16)]) {
    for (chunk, (setpoint, secs)) in out.chunks_exact_mut(STEP_LEN).zip(steps) {
        chunk[..2].copy_from_slice(&setpoint.to_le_bytes());
        chunk[2..].copy_from_slice(&secs.to_le_bytes());
    }
}
