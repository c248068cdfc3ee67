//! This crate provides a driver for Array programmable DC electronic loads which share one serial bus.
//!
//! Any number of loads can hang off one RS232/TTL bus, each answering at the
//! address set on its front panel. Every load hears every frame, and a load fed
//! commands faster than it can parse them stops responding until the bus goes
//! quiet. The driver takes care of framing, picking each load's replies out of
//! the shared traffic, and pacing, retrying and recovering the bus.
//!
//! Load models which this should work with:
//! * Array 3710A
//! * Tekpower / Gossen / Circuit Specialists 3710A rebadges
//!
//! Other models with the same command set can be described with a
//! [`DeviceProfile`](profile::DeviceProfile).
//!
//! The serial port used for load comms should be configured like so:
//! * Baud rate: 9600 (load default) or 4800. 19200 and 38400 are unreliable.
//! * Data bits: 8
//! * Stop bits: 1
//! * Parity: None
//! * Read timeout: a few frame times, the driver treats a timed out read as the end of a reply.
//!
//! The frame codec, address filter, profiles and program builder are `no_std`.
//! The bus and session layer need the `std` feature (on by default).
//!
//! ```no_run
//! # fn demo<S: embedded_io::Read + embedded_io::Write>(port: S) {
//! use array_eload::{address::DeviceAddress, pacing::{PacingConfig, PacingController}};
//!
//! let bus = PacingController::new(port, PacingConfig::default());
//! let mut load = bus.open_session(DeviceAddress::new(1).unwrap());
//! let status = load.query_status();
//! # }
//! ```

#![cfg_attr(not(any(feature = "std", test)), no_std)]

pub mod address;
pub mod command;
pub mod error;
pub mod frame;
pub mod profile;
pub mod program;
pub mod types;

#[cfg(feature = "std")]
pub mod pacing;
#[cfg(feature = "std")]
pub mod session;

#[cfg(all(test, feature = "std"))]
mod mock_clock;
#[cfg(test)]
mod mock_serial;
