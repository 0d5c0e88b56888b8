//! Non-Linux stand-in for the i2c-dev bus.
//!
//! This exists so the crate (and binary) can compile off-target. Every
//! transaction fails, so an enabled gas channel is disabled at init.

use embedded_hal::i2c::{Error, ErrorKind, ErrorType, I2c, Operation};

/// Error returned by every transaction on this platform.
#[derive(Debug)]
pub struct Unsupported;

impl Error for Unsupported {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

pub struct I2cBusDevice;

impl I2cBusDevice {
    pub fn new(_number: u8) -> Self {
        Self
    }
}

impl ErrorType for I2cBusDevice {
    type Error = Unsupported;
}

impl I2c for I2cBusDevice {
    fn transaction(
        &mut self,
        _address: u8,
        _operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        Err(Unsupported)
    }
}
