//! This module defines the command codes understood by the Array loads.

use strum_macros::{EnumCount, EnumIter};

/// Every frame on the bus carries one of these command codes in byte 2.
#[derive(Debug, Copy, Clone, PartialEq, Eq, EnumIter, EnumCount)]
#[repr(u8)]
pub enum Command {
    /// __W__ - Max current, max power, address, load mode and setpoint in one block.
    ///
    /// The load does not reply to this command.
    SetParameters = 0x90,
    /// __R__ - Measured values, limits and status flags.
    QueryStatus = 0x91,
    /// __W__ - Load on/off and remote control flags.
    SetLoadState = 0x92,
    /// __W__ - Program mode, step count and steps 1 - 5.
    UploadProgramLow = 0x93,
    /// __W__ - Steps 6 - 10 and run mode.
    UploadProgramHigh = 0x94,
    /// __W__ - Start running the uploaded program.
    StartProgram = 0x95,
    /// __W__ - Stop a running program.
    StopProgram = 0x96,
}

impl Command {
    /// Number of payload bytes this command actually uses when sent to the load.
    /// The remainder of the 22 byte payload field is zero padding.
    pub const fn payload_len(&self) -> usize {
        match self {
            Command::SetParameters => 8,
            Command::QueryStatus => 0,
            Command::SetLoadState => 1,
            Command::UploadProgramLow => 22,
            Command::UploadProgramHigh => 21,
            Command::StartProgram | Command::StopProgram => 0,
        }
    }

    /// Number of payload bytes in the load's reply to this command.
    pub const fn reply_payload_len(&self) -> usize {
        match self {
            Command::QueryStatus => 22,
            _ => 0,
        }
    }

    /// Whether the load answers this command with a frame of its own.
    pub const fn expects_reply(&self) -> bool {
        self.reply_payload_len() > 0
    }
}

impl From<Command> for u8 {
    fn from(value: Command) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Command as C;
        match value {
            0x90 => Ok(C::SetParameters),
            0x91 => Ok(C::QueryStatus),
            0x92 => Ok(C::SetLoadState),
            0x93 => Ok(C::UploadProgramLow),
            0x94 => Ok(C::UploadProgramHigh),
            0x95 => Ok(C::StartProgram),
            0x96 => Ok(C::StopProgram),
            other => Err(other),
        }
    }
}
