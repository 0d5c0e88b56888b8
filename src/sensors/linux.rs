//! Linux i2c-dev backend for the shared sensor bus.

use embedded_hal::i2c::{ErrorType, I2c, Operation};
use linux_embedded_hal::{I2CError, I2cdev};

/// `/dev/i2c-N`, opened on the first transaction.
///
/// Creating the handle never touches the system, so channels that only need
/// the bus lock (the IIO climate driver) work without an i2c-dev node.
pub struct I2cBusDevice {
    number: u8,
    dev: Option<I2cdev>,
}

impl I2cBusDevice {
    pub fn new(number: u8) -> Self {
        Self { number, dev: None }
    }

    fn dev(&mut self) -> Result<&mut I2cdev, I2CError> {
        let dev = match self.dev.take() {
            Some(dev) => dev,
            None => I2cdev::new(format!("/dev/i2c-{}", self.number)).map_err(I2CError::from)?,
        };
        Ok(self.dev.insert(dev))
    }
}

impl ErrorType for I2cBusDevice {
    type Error = I2CError;
}

impl I2c for I2cBusDevice {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        self.dev()?.transaction(address, operations)
    }
}
