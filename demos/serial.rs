use std::env;

use array_eload::{
    address::DeviceAddress,
    pacing::{PacingConfig, PacingController},
    program::ProgramStep,
    types::{BaudRate, LoadMode, RunMode},
};
use fugit::Duration;
use inquire::Select;
use serialport::SerialPort;
use tracing_subscriber::EnvFilter;

// Configuration constants - adjust these for your setup
const BAUD_RATE: BaudRate = BaudRate::_9600;
// A little over two frame times at 9600 baud. A timed out read ends a reply.
const SERIAL_TIMEOUT_MS: u64 = 60;
const LOAD_ADDRESSES: [u8; 2] = [0x00, 0x01];
const CURRENT_MA: u32 = 500; // 0.5A
const MAX_POWER_MW: u32 = 10_000; // 10W
const STABILIZATION_DELAY_MS: u64 = 1000;

pub struct PortWrapper(Box<dyn SerialPort>);

#[derive(Debug)]
pub struct IoError(std::io::Error);

impl core::fmt::Display for IoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl embedded_io::Error for IoError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self.0.kind() {
            std::io::ErrorKind::NotFound => embedded_io::ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => embedded_io::ErrorKind::PermissionDenied,
            std::io::ErrorKind::BrokenPipe => embedded_io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::InvalidInput => embedded_io::ErrorKind::InvalidInput,
            std::io::ErrorKind::InvalidData => embedded_io::ErrorKind::InvalidData,
            std::io::ErrorKind::TimedOut => embedded_io::ErrorKind::TimedOut,
            std::io::ErrorKind::Interrupted => embedded_io::ErrorKind::Interrupted,
            std::io::ErrorKind::Unsupported => embedded_io::ErrorKind::Unsupported,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

impl embedded_io::ErrorType for PortWrapper {
    type Error = IoError;
}

impl embedded_io::Read for PortWrapper {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        std::io::Read::read(&mut self.0, buf).map_err(IoError)
    }
}

impl embedded_io::Write for PortWrapper {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        std::io::Write::write(&mut self.0, buf).map_err(IoError)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        std::io::Write::flush(&mut self.0).map_err(IoError)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Get serial port from command line arg or interactive selection
    let port_name = env::args().nth(1).unwrap_or_else(|| {
        let ports = serialport::available_ports().expect("Failed to enumerate serial ports");

        if ports.is_empty() {
            eprintln!("No serial ports found!");
            std::process::exit(1);
        }

        let port_names: Vec<String> = ports.iter().map(|p| p.port_name.clone()).collect();

        Select::new("Select a serial port:", port_names)
            .prompt()
            .expect("Failed to select port")
    });

    println!("Using port: {}", port_name);

    let port = serialport::new(&port_name, BAUD_RATE.bits_per_second())
        .timeout(std::time::Duration::from_millis(SERIAL_TIMEOUT_MS))
        .open()
        .expect("Failed to open serial port");

    // One controller for the bus, shared by every load on it.
    let bus = PacingController::new(PortWrapper(port), PacingConfig::for_baud_rate(BAUD_RATE));

    let mut loads: Vec<_> = LOAD_ADDRESSES
        .iter()
        .map(|&address| bus.open_session(DeviceAddress::new(address).expect("Invalid address")))
        .collect();

    for load in loads.iter_mut() {
        match load.query_status() {
            Ok(status) => println!("Load {}: {:#?}", load.address(), status),
            Err(e) => println!("Load {} is not answering: {}", load.address(), e),
        }
    }

    let load = &mut loads[0];
    load.set_remote_control(true).unwrap();
    load.set_max_power_mw(MAX_POWER_MW).unwrap();
    load.set_current_ma(CURRENT_MA).unwrap();
    println!("Load {} set to {}A", load.address(), CURRENT_MA as f32 / 1000.0);

    load.set_load_on(true).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(STABILIZATION_DELAY_MS));
    let status = load.query_status().unwrap();
    println!(
        "Measured: {:.3}V {:.3}A {:.1}W",
        status.voltage_mv as f32 / 1000.0,
        status.current_ma as f32 / 1000.0,
        status.power_mw as f32 / 1000.0
    );
    load.set_load_on(false).unwrap();

    // A short discharge profile: 1A, 2A, 1A for ten seconds each.
    println!("\n--- Uploading Program ---");
    let steps = [
        ProgramStep::new(LoadMode::Current, 1_000, Duration::<u32, 1, 1>::secs(10)),
        ProgramStep::new(LoadMode::Current, 2_000, Duration::<u32, 1, 1>::secs(10)),
        ProgramStep::new(LoadMode::Current, 1_000, Duration::<u32, 1, 1>::secs(10)),
    ];
    load.upload_program(&steps, RunMode::Once).unwrap();
    load.start_program(true).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(STABILIZATION_DELAY_MS));
    load.stop_program(true).unwrap();
    load.set_remote_control(false).unwrap();

    let stats = bus.stats();
    println!("\n{:#?}", stats);
}
