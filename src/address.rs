//! Load addresses and response filtering.
//!
//! Every load on the bus sees every byte, so every session sees every reply
//! as well. A well formed reply for another address is sibling traffic, not an
//! error, and is screened out here.

use core::fmt;

use crate::{error::EncodingError, frame::Response};

/// Highest address a load can be configured to from its front panel.
pub const MAX_ADDRESS: u8 = 0xFE;

/// Address of one load on the bus. Assigned by the operator on the load itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceAddress(u8);

impl DeviceAddress {
    /// Create an address, rejecting the reserved `0xFF`.
    pub const fn new(address: u8) -> Result<Self, EncodingError> {
        if address > MAX_ADDRESS {
            Err(EncodingError::ReservedAddress(address))
        } else {
            Ok(Self(address))
        }
    }

    /// Addresses read off the wire are taken as they are.
    pub(crate) const fn from_wire(address: u8) -> Self {
        Self(address)
    }

    pub const fn is_reserved(&self) -> bool {
        self.0 > MAX_ADDRESS
    }
}

impl From<DeviceAddress> for u8 {
    fn from(value: DeviceAddress) -> Self {
        value.0
    }
}

impl TryFrom<u8> for DeviceAddress {
    type Error = EncodingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Whether `response` is a valid reply addressed to `expected`.
pub fn accepts(response: &Response, expected: DeviceAddress) -> bool {
    response.is_valid() && response.frame().is_some_and(|frame| frame.address == expected)
}

/// Re-label a valid response for some other load as [`Validity::AddressMismatch`](crate::frame::Validity::AddressMismatch).
///
/// Responses which are already invalid are returned untouched.
pub fn screen(response: Response, expected: DeviceAddress) -> Response {
    if response.is_valid() && !accepts(&response, expected) {
        response.mark_address_mismatch()
    } else {
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::Command,
        frame::{self, Validity},
    };

    fn status_from(address: u8) -> Response {
        let bytes = frame::encode(DeviceAddress::new(address).unwrap(), Command::QueryStatus, &[])
            .unwrap();
        frame::decode(&bytes)
    }

    #[test]
    fn address_range() {
        assert!(DeviceAddress::new(0).is_ok());
        assert!(DeviceAddress::new(MAX_ADDRESS).is_ok());
        assert_eq!(DeviceAddress::new(0xFF), Err(EncodingError::ReservedAddress(0xFF)));
        assert!(DeviceAddress::from_wire(0xFF).is_reserved());
    }

    #[test]
    fn accepts_own_address_only() {
        let a = DeviceAddress::new(3).unwrap();
        let b = DeviceAddress::new(4).unwrap();
        let response = status_from(3);
        assert!(accepts(&response, a));
        assert!(!accepts(&response, b));
    }

    #[test]
    fn screen_marks_sibling_traffic() {
        let b = DeviceAddress::new(4).unwrap();
        let screened = screen(status_from(3), b);
        assert_eq!(screened.validity(), Validity::AddressMismatch);
        assert!(!accepts(&screened, b));

        let own = screen(status_from(4), b);
        assert_eq!(own.validity(), Validity::Valid);
    }

    #[test]
    fn screen_keeps_invalid_classification() {
        let mut bytes =
            frame::encode(DeviceAddress::new(3).unwrap(), Command::QueryStatus, &[]).unwrap();
        bytes[25] ^= 0xFF;
        let screened = screen(frame::decode(&bytes), DeviceAddress::new(4).unwrap());
        assert_eq!(screened.validity(), Validity::ChecksumInvalid);
    }

    #[test]
    fn display_as_hex() {
        assert_eq!(DeviceAddress::new(0x0A).unwrap().to_string(), "0x0a");
    }
}
