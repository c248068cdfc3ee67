//! Sessions: the command API for one load on a shared bus.
//!
//! Every command runs as one exchange unit through the bus's
//! [`PacingController`]. A status query is a write and its reply. The loads
//! never reply to anything else, so other commands are confirmed by a status
//! query of their own once written. A failed unit is retried whole, with the
//! same frames, until the controller calls for recovery.

use embedded_io::Error as _;
use tracing::{debug, trace, warn};

use crate::{
    address::{self, DeviceAddress},
    command::Command,
    error::{EncodingError, Error, Fault, Result},
    frame::{self, DecodeResult, FRAME_LEN, Frame, Validity},
    pacing::{BusClock, BusDuration, BusInstant, Escalation, PacingController, StdClock},
    profile::{DeviceProfile, ModeSpec},
    program::{ProgramBuilder, ProgramStep},
    types::{LoadMode, LoadStateFlags, LoadStatus, RunMode},
};

/// Receive buffer, room for one frame plus a partial one.
const RX_LEN: usize = FRAME_LEN * 2;

/// Where a session is in an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No exchange in progress.
    Idle,
    /// A frame was sent and the reply is awaited.
    AwaitingResponse,
    /// The last attempt failed, waiting to retry.
    Backoff,
    /// Too many failures, the bus is being kept quiet.
    Recovering,
}

/// Per session settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long to wait for a reply to arrive in full.
    pub response_timeout: BusDuration,
    /// Follow write-only commands with a status query, and retry them if it fails.
    pub confirm_writes: bool,
    /// Frames for other loads tolerated while waiting for one reply.
    pub mismatch_ceiling: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_timeout: BusDuration::millis(1_000),
            confirm_writes: true,
            mismatch_ceiling: 8,
        }
    }
}

/// The parameter block of a load.
///
/// The load only accepts all of these at once, so a session keeps the last
/// block it sent and changes one field at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadParameters {
    pub max_current_ma: u32,
    pub max_power_mw: u32,
    pub mode: LoadMode,
    /// Setpoint in milli-units of `mode`.
    pub setpoint: u32,
}

impl LoadParameters {
    /// Full limits, resistance mode at its highest (safest) resistance.
    pub fn for_profile(profile: &DeviceProfile) -> Self {
        Self {
            max_current_ma: profile.max_current_limit_ma,
            max_power_mw: profile.max_power_limit_mw,
            mode: LoadMode::Resistance,
            setpoint: profile.safe_setpoint(LoadMode::Resistance),
        }
    }

    /// Payload of [`Command::SetParameters`] for a load which is to answer at `address`.
    pub fn to_payload(
        &self,
        profile: &DeviceProfile,
        address: DeviceAddress,
    ) -> core::result::Result<[u8; 8], EncodingError> {
        let max_current = ModeSpec::new(0, profile.max_current_limit_ma, profile.current.milli_per_raw)
            .to_raw(self.max_current_ma)?;
        let max_power = ModeSpec::new(0, profile.max_power_limit_mw, profile.power.milli_per_raw)
            .to_raw(self.max_power_mw)?;
        let spec = profile
            .mode_spec(self.mode)
            .ok_or(EncodingError::UnsupportedMode)?;
        let setpoint = spec.to_raw(self.setpoint)?;

        let mut payload = [0u8; 8];
        payload[0..2].copy_from_slice(&max_current.to_le_bytes());
        payload[2..4].copy_from_slice(&max_power.to_le_bytes());
        payload[4] = address.into();
        payload[5] = spec.code;
        payload[6..8].copy_from_slice(&setpoint.to_le_bytes());
        Ok(payload)
    }
}

enum Outcome {
    Reply(Frame),
    Sent,
    Failed(Fault),
}

/// One load on a bus.
///
/// Sessions borrow the bus's [`PacingController`], so any number of them can
/// share a bus, from one thread or several.
pub struct LoadSession<'b, S, C = StdClock> {
    bus: &'b PacingController<S, C>,
    address: DeviceAddress,
    profile: DeviceProfile,
    config: SessionConfig,
    state: SessionState,
    consecutive_failures: u8,
    last_exchange: Option<BusInstant>,
    parameters: LoadParameters,
    load_state: LoadStateFlags,
    last_status: Option<LoadStatus>,
}

impl<S: embedded_io::Read + embedded_io::Write, C: BusClock> PacingController<S, C> {
    /// Open a session for the load at `address` on this bus.
    pub fn open_session(&self, address: DeviceAddress) -> LoadSession<'_, S, C> {
        LoadSession::open(self, address)
    }
}

impl<'b, S, C> LoadSession<'b, S, C>
where
    S: embedded_io::Read + embedded_io::Write,
    C: BusClock,
{
    /// Open a session for a 3710A at `address`. Nothing is sent until the first command.
    ///
    /// The load's limits and flags are read before the first write, so writes
    /// never reset what was set on the front panel.
    pub fn open(bus: &'b PacingController<S, C>, address: DeviceAddress) -> Self {
        let profile = DeviceProfile::default();
        Self {
            bus,
            address,
            profile,
            config: SessionConfig::default(),
            state: SessionState::Idle,
            consecutive_failures: 0,
            last_exchange: None,
            parameters: LoadParameters::for_profile(&profile),
            load_state: LoadStateFlags::new(),
            last_status: None,
        }
    }

    /// Use another load model's limits.
    pub fn with_profile(mut self, profile: DeviceProfile) -> Self {
        self.profile = profile;
        self.parameters = LoadParameters::for_profile(&profile);
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u8 {
        self.consecutive_failures
    }

    /// When the last exchange completed, on the bus's clock.
    pub fn last_exchange(&self) -> Option<BusInstant> {
        self.last_exchange
    }

    /// The most recent status reply.
    pub fn last_status(&self) -> Option<&LoadStatus> {
        self.last_status.as_ref()
    }

    /// The parameter block last written, with limits as last reported by the load.
    pub fn parameters(&self) -> &LoadParameters {
        &self.parameters
    }

    /// Read measurements, limits and flags.
    pub fn query_status(&mut self) -> Result<LoadStatus, S::Error> {
        let reply = self.transact(Command::QueryStatus, &[], self.address)?;
        // A status query always ends in a reply when it succeeds.
        reply.ok_or(Error::BusCommunication {
            address: self.address,
            attempts: 1,
            last: Fault::Malformed,
        })
    }

    /// Switch to constant current and draw `current_ma`.
    pub fn set_current_ma(&mut self, current_ma: u32) -> Result<(), S::Error> {
        self.set_setpoint(LoadMode::Current, current_ma)
    }

    /// Switch to constant voltage at `voltage_mv`. Only for loads with a voltage mode.
    pub fn set_voltage_mv(&mut self, voltage_mv: u32) -> Result<(), S::Error> {
        self.set_setpoint(LoadMode::Voltage, voltage_mv)
    }

    /// Switch to constant power and draw `power_mw`.
    pub fn set_power_mw(&mut self, power_mw: u32) -> Result<(), S::Error> {
        self.set_setpoint(LoadMode::Power, power_mw)
    }

    /// Switch to constant resistance at `resistance_mohm`.
    pub fn set_resistance_mohm(&mut self, resistance_mohm: u32) -> Result<(), S::Error> {
        self.set_setpoint(LoadMode::Resistance, resistance_mohm)
    }

    /// Switch mode. The setpoint starts at the mode's safe value.
    pub fn set_mode(&mut self, mode: LoadMode) -> Result<(), S::Error> {
        let setpoint = self.profile.safe_setpoint(mode);
        self.set_setpoint(mode, setpoint)
    }

    pub fn set_max_current_ma(&mut self, max_current_ma: u32) -> Result<(), S::Error> {
        self.write_parameters(|parameters| LoadParameters {
            max_current_ma,
            ..parameters
        })
    }

    pub fn set_max_power_mw(&mut self, max_power_mw: u32) -> Result<(), S::Error> {
        self.write_parameters(|parameters| LoadParameters {
            max_power_mw,
            ..parameters
        })
    }

    /// Take over (or hand back) the front panel.
    pub fn set_remote_control(&mut self, remote: bool) -> Result<(), S::Error> {
        self.write_load_state(|flags| flags.with_remote_control(remote))
    }

    /// Turn the load input on or off.
    pub fn set_load_on(&mut self, on: bool) -> Result<(), S::Error> {
        self.write_load_state(|flags| flags.with_load_on(on))
    }

    /// Validate `steps` and upload them as the load's program.
    pub fn upload_program(
        &mut self,
        steps: &[ProgramStep],
        run_mode: RunMode,
    ) -> Result<(), S::Error> {
        let payload = ProgramBuilder::new(self.profile)
            .with_run_mode(run_mode)
            .build(steps)?;
        debug!(address = %self.address, steps = steps.len(), "uploading program");
        self.transact(Command::UploadProgramLow, &payload.low, self.address)?;
        let high_len = Command::UploadProgramHigh.payload_len();
        self.transact(
            Command::UploadProgramHigh,
            &payload.high[..high_len],
            self.address,
        )?;
        Ok(())
    }

    /// Start the uploaded program, then turn the load on if `turn_on_load` is set.
    ///
    /// A program only draws current while the load is on.
    pub fn start_program(&mut self, turn_on_load: bool) -> Result<(), S::Error> {
        self.transact(Command::StartProgram, &[], self.address)?;
        if turn_on_load {
            self.refresh_if_stale()?;
            if !self.load_state.load_on() {
                self.set_load_on(true)?;
            }
        }
        Ok(())
    }

    /// Stop the running program, then turn the load off if `turn_off_load` is set.
    pub fn stop_program(&mut self, turn_off_load: bool) -> Result<(), S::Error> {
        self.transact(Command::StopProgram, &[], self.address)?;
        if turn_off_load {
            self.refresh_if_stale()?;
            if self.load_state.load_on() {
                self.set_load_on(false)?;
            }
        }
        Ok(())
    }

    /// Move the load to `new_address`.
    ///
    /// The session follows the load only once it answers at the new address.
    pub fn set_address(&mut self, new_address: DeviceAddress) -> Result<(), S::Error> {
        self.parameters.to_payload(&self.profile, new_address)?;
        self.refresh_if_stale()?;
        let payload = self.parameters.to_payload(&self.profile, new_address)?;
        self.transact(Command::SetParameters, &payload, new_address)?;
        debug!(address = %self.address, new_address = %new_address, "load moved");
        self.address = new_address;
        Ok(())
    }

    fn set_setpoint(&mut self, mode: LoadMode, setpoint: u32) -> Result<(), S::Error> {
        self.write_parameters(|parameters| LoadParameters {
            mode,
            setpoint,
            ..parameters
        })
    }

    /// Read the load's status unless one has been read already.
    fn refresh_if_stale(&mut self) -> Result<(), S::Error> {
        if self.last_status.is_none() {
            self.query_status()?;
        }
        Ok(())
    }

    /// Write the parameter block with one change applied by `update`.
    fn write_parameters(
        &mut self,
        update: impl Fn(LoadParameters) -> LoadParameters,
    ) -> Result<(), S::Error> {
        // Bad values fail before anything goes on the bus.
        update(self.parameters).to_payload(&self.profile, self.address)?;
        self.refresh_if_stale()?;

        let parameters = update(self.parameters);
        let payload = parameters.to_payload(&self.profile, self.address)?;
        self.transact(Command::SetParameters, &payload, self.address)?;
        self.parameters = parameters;
        Ok(())
    }

    fn write_load_state(
        &mut self,
        update: impl Fn(LoadStateFlags) -> LoadStateFlags,
    ) -> Result<(), S::Error> {
        self.refresh_if_stale()?;
        let flags = update(self.load_state);
        self.transact(Command::SetLoadState, &flags.into_bytes(), self.address)?;
        self.load_state = flags;
        Ok(())
    }

    /// Run one exchange unit to completion, retrying as the bus directs.
    fn transact(
        &mut self,
        command: Command,
        payload: &[u8],
        reply_from: DeviceAddress,
    ) -> Result<Option<LoadStatus>, S::Error> {
        let request = frame::encode(self.address, command, payload)?;
        let confirmation = if !command.expects_reply() && self.config.confirm_writes {
            Some(frame::encode(reply_from, Command::QueryStatus, &[])?)
        } else {
            None
        };

        loop {
            self.state = SessionState::AwaitingResponse;
            trace!(address = %self.address, ?command, "sending");
            let outcome = match self.attempt(&request, command, confirmation.as_ref(), reply_from) {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.state = SessionState::Idle;
                    return Err(err);
                }
            };

            let fault = match outcome {
                Outcome::Reply(frame) => {
                    let status = LoadStatus::from_frame(&frame);
                    self.parameters.max_current_ma = status.max_current_ma;
                    self.parameters.max_power_mw = status.max_power_mw;
                    self.load_state = self
                        .load_state
                        .with_remote_control(status.flags.remote_control())
                        .with_load_on(status.flags.load_on());
                    self.last_status = Some(status);
                    self.succeeded();
                    return Ok(Some(status));
                }
                Outcome::Sent => {
                    self.succeeded();
                    return Ok(None);
                }
                Outcome::Failed(fault) => fault,
            };

            self.state = SessionState::Backoff;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            debug!(address = %self.address, ?command, fault = %fault, "exchange failed");

            match self.bus.record_failure(self.address, self.consecutive_failures) {
                Escalation::Retry(delay) => self.bus.pause(delay),
                Escalation::Recover(pause) => {
                    let attempts = self.consecutive_failures;
                    self.state = SessionState::Recovering;
                    self.bus.quiesce(pause);
                    self.consecutive_failures = 0;
                    self.state = SessionState::Idle;
                    warn!(address = %self.address, ?command, attempts, "giving up on command");
                    return Err(Error::BusCommunication {
                        address: self.address,
                        attempts,
                        last: fault,
                    });
                }
            }
        }
    }

    fn succeeded(&mut self) {
        self.bus.record_success(self.address);
        self.consecutive_failures = 0;
        self.state = SessionState::Idle;
        self.last_exchange = Some(self.bus.clock().now());
    }

    fn attempt(
        &self,
        request: &[u8; FRAME_LEN],
        command: Command,
        confirmation: Option<&[u8; FRAME_LEN]>,
        reply_from: DeviceAddress,
    ) -> Result<Outcome, S::Error> {
        if command.expects_reply() {
            let mut bus = self.bus.acquire();
            send(&mut *bus, request)?;
            return self.receive(&mut *bus, reply_from);
        }

        send(&mut *self.bus.acquire(), request)?;
        match confirmation {
            Some(query) => {
                let mut bus = self.bus.acquire();
                send(&mut *bus, query)?;
                self.receive(&mut *bus, reply_from)
            }
            None => Ok(Outcome::Sent),
        }
    }

    /// Read until a status reply from `reply_from` arrives, something else goes
    /// wrong, or the port or the response timeout runs out.
    fn receive(&self, bus: &mut S, reply_from: DeviceAddress) -> Result<Outcome, S::Error> {
        let clock = self.bus.clock();
        let deadline = clock.now() + self.config.response_timeout;
        let mut buf: heapless::Vec<u8, RX_LEN> = heapless::Vec::new();
        let mut chunk = [0u8; FRAME_LEN];
        let mut mismatches = 0u8;
        let mut stray_bytes = false;

        loop {
            loop {
                match frame::decode_stream(&buf) {
                    DecodeResult::Incomplete => break,
                    DecodeResult::Noise(count) => {
                        stray_bytes = true;
                        consume(&mut buf, count);
                    }
                    DecodeResult::Frame(response, count) => {
                        consume(&mut buf, count);
                        let response = address::screen(response, reply_from);
                        match response.validity() {
                            Validity::Valid => {
                                return Ok(match response.frame() {
                                    Some(frame) if frame.command == Command::QueryStatus => {
                                        Outcome::Reply(frame.clone())
                                    }
                                    _ => Outcome::Failed(Fault::Malformed),
                                });
                            }
                            Validity::AddressMismatch => {
                                mismatches = mismatches.saturating_add(1);
                                trace!(address = %self.address, mismatches, "ignoring frame for another load");
                                if mismatches > self.config.mismatch_ceiling {
                                    return Ok(Outcome::Failed(Fault::AddressMismatch));
                                }
                            }
                            Validity::ChecksumInvalid => {
                                return Ok(Outcome::Failed(Fault::ChecksumInvalid));
                            }
                            Validity::Malformed => return Ok(Outcome::Failed(Fault::Malformed)),
                        }
                    }
                }
            }

            if clock.now() >= deadline {
                break;
            }
            let room = (buf.capacity() - buf.len()).min(chunk.len());
            match bus.read(&mut chunk[..room]) {
                Ok(0) => break,
                Ok(count) => {
                    if buf.extend_from_slice(&chunk[..count]).is_err() {
                        return Ok(Outcome::Failed(Fault::Malformed));
                    }
                }
                Err(e) if matches!(e.kind(), embedded_io::ErrorKind::TimedOut) => break,
                Err(e) => return Err(Error::SerialError(e)),
            }
        }

        Ok(Outcome::Failed(if stray_bytes || !buf.is_empty() {
            Fault::Malformed
        } else {
            Fault::Timeout
        }))
    }
}

fn send<S: embedded_io::Write>(bus: &mut S, bytes: &[u8]) -> Result<(), S::Error> {
    bus.write_all(bytes).map_err(Error::SerialError)?;
    bus.flush().map_err(Error::SerialError)
}

/// Drop `count` bytes off the front of the receive buffer.
fn consume(buf: &mut heapless::Vec<u8, RX_LEN>, count: usize) {
    let len = buf.len();
    buf.rotate_left(count);
    buf.truncate(len - count);
}
