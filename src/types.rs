//! This module contains types relevant to the load's data.

use modular_bitfield::prelude::*;
use strum_macros::EnumIter;

use crate::frame::Frame;

/// Raw power values are in units of 0.1 W.
pub const POWER_MW_PER_RAW: u32 = 100;

/// Raw resistance values are in units of 0.01 Ω.
pub const RESISTANCE_MOHM_PER_RAW: u32 = 10;

/// What quantity the load regulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum LoadMode {
    /// Constant current (CC).
    Current,
    /// Constant power (CW).
    Power,
    /// Constant resistance (CR).
    Resistance,
    /// Constant voltage (CV). Only on loads whose profile declares it.
    Voltage,
}

/// Whether an uploaded program runs once or loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RunMode {
    #[default]
    Once = 0x00,
    Repeat = 0x01,
}

impl From<RunMode> for u8 {
    fn from(value: RunMode) -> Self {
        value as u8
    }
}

/// Baud rates these loads work reliably at.
///
/// The loads can also be set to 19200 and 38400 baud, but errors are seen on
/// both, so they are not offered here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum BaudRate {
    _4800,
    /// This is the default load baud rate.
    _9600,
}

impl BaudRate {
    pub const fn bits_per_second(&self) -> u32 {
        match self {
            BaudRate::_4800 => 4800,
            BaudRate::_9600 => 9600,
        }
    }

    /// Time taken to clock one whole frame onto the wire, rounded up. 8N1 framing.
    pub const fn frame_time_ms(&self) -> u64 {
        let bits = (crate::frame::FRAME_LEN as u64) * 10 * 1000;
        let bps = self.bits_per_second() as u64;
        bits.div_ceil(bps)
    }
}

/// Status flag byte reported by the load.
#[bitfield(bits = 8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusFlags {
    pub remote_control: bool,
    pub load_on: bool,
    pub wrong_polarity: bool,
    pub over_temperature: bool,
    pub over_voltage: bool,
    pub over_power: bool,
    #[skip]
    __: B2,
}

impl StatusFlags {
    /// Whether any protection is tripped.
    pub fn any_fault(&self) -> bool {
        self.wrong_polarity() || self.over_temperature() || self.over_voltage() || self.over_power()
    }
}

/// Flags byte sent with [`Command::SetLoadState`](crate::command::Command::SetLoadState).
///
/// Note the bit order differs from the status flags the load reports.
#[bitfield(bits = 8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadStateFlags {
    pub load_on: bool,
    pub remote_control: bool,
    #[skip]
    __: B6,
}

/// Everything the load reports in reply to a status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadStatus {
    /// Measured current in milliamps.
    pub current_ma: u32,
    /// Measured voltage in millivolts.
    pub voltage_mv: u32,
    /// Measured power in milliwatts.
    pub power_mw: u32,
    /// Configured current limit in milliamps.
    pub max_current_ma: u32,
    /// Configured power limit in milliwatts.
    pub max_power_mw: u32,
    /// Resistance setting in milliohms.
    pub resistance_mohm: u32,
    pub flags: StatusFlags,
}

impl LoadStatus {
    /// Interpret the payload of a status reply.
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            current_ma: frame.payload_u16(0) as u32,
            voltage_mv: frame.payload_u32(2),
            power_mw: frame.payload_u16(6) as u32 * POWER_MW_PER_RAW,
            max_current_ma: frame.payload_u16(8) as u32,
            max_power_mw: frame.payload_u16(10) as u32 * POWER_MW_PER_RAW,
            resistance_mohm: frame.payload_u16(12) as u32 * RESISTANCE_MOHM_PER_RAW,
            flags: StatusFlags::from_bytes([frame.payload[14]]),
        }
    }

    /// Build the 22 byte payload a load would send for this status. Values are
    /// truncated to the wire units.
    pub fn to_payload(&self) -> [u8; crate::frame::PAYLOAD_LEN] {
        let mut payload = [0u8; crate::frame::PAYLOAD_LEN];
        payload[0..2].copy_from_slice(&(self.current_ma as u16).to_le_bytes());
        payload[2..6].copy_from_slice(&self.voltage_mv.to_le_bytes());
        payload[6..8].copy_from_slice(&((self.power_mw / POWER_MW_PER_RAW) as u16).to_le_bytes());
        payload[8..10].copy_from_slice(&(self.max_current_ma as u16).to_le_bytes());
        payload[10..12]
            .copy_from_slice(&((self.max_power_mw / POWER_MW_PER_RAW) as u16).to_le_bytes());
        payload[12..14].copy_from_slice(
            &((self.resistance_mohm / RESISTANCE_MOHM_PER_RAW) as u16).to_le_bytes(),
        );
        payload[14] = self.flags.into_bytes()[0];
        payload
    }
}
