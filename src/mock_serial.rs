//! We use this mocking module in unit tests to emulate a bus of loads behind a serial port.
//!
//! Every complete frame written to the port is inspected. Status queries are
//! answered from the scripted reply queue first, then by any emulated load at
//! the queried address. Everything else is silence, as on a real bus.

use std::collections::{BTreeMap, VecDeque};

use crate::{
    address::DeviceAddress,
    command::Command,
    frame::{self, FRAME_LEN},
    types::{LoadStatus, StatusFlags},
};

/// Status reply captured from a 3710A at address 0: idle, 30 A / 200 W limits, 500 Ω.
pub const CANNED_STATUS: [u8; FRAME_LEN] = [
    0xAA, 0x00, 0x91, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x30, 0x75, 0xD0, 0x07,
    0x50, 0xC3, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x50, 0xC3, 0xDE,
];

/// Encode a status reply from `address`.
pub fn status_frame(address: u8, status: &LoadStatus) -> [u8; FRAME_LEN] {
    let address = DeviceAddress::new(address).unwrap();
    frame::encode_reply(address, Command::QueryStatus, &status.to_payload()).unwrap()
}

/// The status of a freshly powered 3710A.
pub fn idle_status() -> LoadStatus {
    LoadStatus {
        current_ma: 0,
        voltage_mv: 0,
        power_mw: 0,
        max_current_ma: 30_000,
        max_power_mw: 200_000,
        resistance_mohm: 500_000,
        flags: StatusFlags::new(),
    }
}

/// Our mock type used to emulate a serial port.
pub struct MockSerial {
    /// Everything written to the port.
    written: Vec<u8>,
    /// Bytes of the frame currently being written.
    pending: Vec<u8>,
    /// Bytes waiting to be read.
    read_buffer: VecDeque<u8>,
    /// Replies for the next status queries, ahead of the emulated loads. An empty reply is silence.
    script: VecDeque<Vec<u8>>,
    /// Emulated loads by address.
    loads: BTreeMap<u8, LoadStatus>,
    /// Flag to simulate write errors
    should_error_on_write: bool,
    /// Flag to simulate read errors
    should_error_on_read: bool,
}

#[derive(Debug)]
pub enum MockSerialError {
    /// Nothing to read before the port timeout.
    Timeout,
    /// Generic simulated error for testing
    SimulatedError,
}

impl core::fmt::Display for MockSerialError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl core::error::Error for MockSerialError {}

impl embedded_io::Error for MockSerialError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            MockSerialError::Timeout => embedded_io::ErrorKind::TimedOut,
            MockSerialError::SimulatedError => embedded_io::ErrorKind::Other,
        }
    }
}

impl embedded_io::ErrorType for MockSerial {
    type Error = MockSerialError;
}

impl embedded_io::Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }
        for &byte in buf {
            self.written.push(byte);
            self.pending.push(byte);
            if self.pending.len() == FRAME_LEN {
                let request: Vec<u8> = self.pending.drain(..).collect();
                self.respond(&request);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        if self.should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }
        Ok(())
    }
}

impl embedded_io::Read for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.should_error_on_read {
            return Err(MockSerialError::SimulatedError);
        }
        if self.read_buffer.is_empty() {
            return Err(MockSerialError::Timeout);
        }
        let count = buf.len().min(self.read_buffer.len());
        for (slot, byte) in buf.iter_mut().zip(self.read_buffer.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }
}

impl MockSerial {
    /// A bus with nothing on it.
    pub fn new() -> Self {
        Self {
            written: Vec::new(),
            pending: Vec::new(),
            read_buffer: VecDeque::new(),
            script: VecDeque::new(),
            loads: BTreeMap::new(),
            should_error_on_write: false,
            should_error_on_read: false,
        }
    }

    /// A bus with idle loads at each of `addresses`.
    pub fn with_loads(addresses: &[u8]) -> Self {
        let mut mock = Self::new();
        for &address in addresses {
            mock.loads.insert(address, idle_status());
        }
        mock
    }

    /// Queue the reply to the next status query. Pass an empty slice to stay silent.
    pub fn queue_reply(&mut self, bytes: &[u8]) {
        self.script.push_back(bytes.to_vec());
    }

    /// Emulated load at `address`, if any.
    pub fn load(&self, address: u8) -> Option<&LoadStatus> {
        self.loads.get(&address)
    }

    /// Get a reference to the data that was written to this mock serial port
    pub fn written_data(&self) -> &[u8] {
        &self.written
    }

    /// Every complete frame written so far.
    pub fn written_frames(&self) -> Vec<[u8; FRAME_LEN]> {
        self.written
            .chunks_exact(FRAME_LEN)
            .map(|chunk| chunk.try_into().unwrap())
            .collect()
    }

    /// Configure whether write operations should fail with an error
    pub fn set_write_error(&mut self, should_error: bool) {
        self.should_error_on_write = should_error;
    }

    /// Configure whether read operations should fail with an error
    pub fn set_read_error(&mut self, should_error: bool) {
        self.should_error_on_read = should_error;
    }

    fn respond(&mut self, request: &[u8]) {
        let Some(request) = frame::decode(request).frame().cloned() else {
            return;
        };
        let address = u8::from(request.address);
        match request.command {
            Command::QueryStatus => {
                let reply = match self.script.pop_front() {
                    Some(reply) => reply,
                    None => match self.loads.get(&address) {
                        Some(status) => status_frame(address, status).to_vec(),
                        None => Vec::new(),
                    },
                };
                self.read_buffer.extend(reply);
            }
            Command::SetParameters => {
                if let Some(mut status) = self.loads.remove(&address) {
                    status.max_current_ma = request.payload_u16(0) as u32;
                    status.max_power_mw = request.payload_u16(2) as u32 * 100;
                    self.loads.insert(request.payload[4], status);
                }
            }
            Command::SetLoadState => {
                if let Some(status) = self.loads.get_mut(&address) {
                    status.flags = status
                        .flags
                        .with_load_on(request.payload[0] & 0b01 != 0)
                        .with_remote_control(request.payload[0] & 0b10 != 0);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io::{Error, Read, Write};

    fn query(address: u8) -> [u8; FRAME_LEN] {
        frame::encode(DeviceAddress::new(address).unwrap(), Command::QueryStatus, &[]).unwrap()
    }

    fn decode_status(bytes: &[u8]) -> LoadStatus {
        LoadStatus::from_frame(frame::decode(bytes).frame().unwrap())
    }

    #[test]
    fn test_canned_status_matches_idle_load() {
        // The captured frame has junk in its reserved bytes, so compare values.
        assert_eq!(decode_status(&CANNED_STATUS), idle_status());
    }

    #[test]
    fn test_status_frames_decode() {
        let status = LoadStatus {
            current_ma: 1_234,
            voltage_mv: 12_345,
            flags: StatusFlags::new().with_load_on(true),
            ..idle_status()
        };
        let bytes = status_frame(4, &status);
        let response = frame::decode(&bytes);
        assert!(response.is_valid());
        assert_eq!(response.frame().unwrap().address, DeviceAddress::new(4).unwrap());
        assert_eq!(decode_status(&bytes), status);
    }

    #[test]
    fn test_errors_are_embedded_io_errors() {
        fn kind_of<E: embedded_io::Error>(err: &E) -> embedded_io::ErrorKind {
            err.kind()
        }
        let err: &dyn core::error::Error = &MockSerialError::Timeout;
        assert_eq!(err.to_string(), "Timeout");
        assert_eq!(kind_of(&MockSerialError::Timeout), embedded_io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_empty_bus_times_out() {
        let mut mock = MockSerial::new();
        mock.write_all(&query(0)).unwrap();
        let mut buffer = [0u8; FRAME_LEN];
        let err = mock.read(&mut buffer).unwrap_err();
        assert_eq!(err.kind(), embedded_io::ErrorKind::TimedOut);
        assert_eq!(mock.written_data(), &query(0));
    }

    #[test]
    fn test_emulated_load_answers_its_address_only() {
        let mut mock = MockSerial::with_loads(&[0]);
        mock.write_all(&query(1)).unwrap();
        let mut buffer = [0u8; FRAME_LEN];
        assert!(mock.read(&mut buffer).is_err());

        mock.write_all(&query(0)).unwrap();
        assert_eq!(mock.read(&mut buffer).unwrap(), FRAME_LEN);
        assert_eq!(decode_status(&buffer), idle_status());
    }

    #[test]
    fn test_frames_written_in_pieces() {
        let mut mock = MockSerial::with_loads(&[2]);
        let request = query(2);
        mock.write_all(&request[..10]).unwrap();
        mock.write_all(&request[10..]).unwrap();
        let mut buffer = [0u8; 8];
        assert_eq!(mock.read(&mut buffer).unwrap(), 8);
        assert_eq!(&buffer[..3], &[0xAA, 0x02, 0x91]);
        assert_eq!(mock.written_frames(), vec![request]);
    }

    #[test]
    fn test_script_takes_precedence() {
        let mut mock = MockSerial::with_loads(&[0]);
        mock.queue_reply(&[]);
        mock.queue_reply(&[0x01, 0x02]);

        let mut buffer = [0u8; FRAME_LEN];
        mock.write_all(&query(0)).unwrap();
        assert!(mock.read(&mut buffer).is_err());
        mock.write_all(&query(0)).unwrap();
        assert_eq!(mock.read(&mut buffer).unwrap(), 2);
        mock.write_all(&query(0)).unwrap();
        assert_eq!(mock.read(&mut buffer).unwrap(), FRAME_LEN);
    }

    #[test]
    fn test_parameters_move_load() {
        let mut mock = MockSerial::with_loads(&[0]);
        let payload = [0x10, 0x27, 0xE8, 0x03, 0x05, 0x01, 0x00, 0x00];
        let request =
            frame::encode(DeviceAddress::new(0).unwrap(), Command::SetParameters, &payload)
                .unwrap();
        mock.write_all(&request).unwrap();
        assert!(mock.load(0).is_none());
        let load = mock.load(5).unwrap();
        assert_eq!(load.max_current_ma, 10_000);
        assert_eq!(load.max_power_mw, 100_000);
    }

    #[test]
    fn test_error_simulation() {
        let mut mock = MockSerial::with_loads(&[0]);
        mock.set_write_error(true);
        assert!(matches!(
            mock.write(&query(0)).unwrap_err(),
            MockSerialError::SimulatedError
        ));
        assert!(mock.flush().is_err());
        mock.set_write_error(false);
        mock.write_all(&query(0)).unwrap();

        mock.set_read_error(true);
        let mut buffer = [0u8; 4];
        let err = mock.read(&mut buffer).unwrap_err();
        assert_eq!(err.kind(), embedded_io::ErrorKind::Other);
    }
}
