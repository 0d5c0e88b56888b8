//! Sharing one physical I2C bus between channels.
//!
//! Each bus is a process-lifetime `Mutex` around the bus device. Drivers
//! that speak I2C get a [`MutexDevice`], which implements
//! [`embedded_hal::i2c::I2c`] and locks the bus around every transaction.
//! Drivers that reach their chip through a kernel driver instead hold the
//! same lock for the duration of their read.

use crate::sensors::I2cBusDevice;
use embedded_hal_bus::i2c::MutexDevice;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Hands out one [`SharedBus`] per bus number.
///
/// Cloning the arbiter shares the same set of buses.
#[derive(Clone, Default)]
pub struct BusArbiter {
    buses: Arc<Mutex<HashMap<u8, SharedBus>>>,
}

impl BusArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for bus `number`; the device node is opened on first use.
    pub fn bus(&self, number: u8) -> SharedBus {
        let mut buses = self.buses.lock().unwrap_or_else(PoisonError::into_inner);
        *buses
            .entry(number)
            .or_insert_with(|| SharedBus::new(number, I2cBusDevice::new(number)))
    }
}

/// A bus shared by every channel wired to the same bus number.
pub struct SharedBus<B: 'static = I2cBusDevice> {
    number: u8,
    bus: &'static Mutex<B>,
}

impl<B> Clone for SharedBus<B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for SharedBus<B> {}

impl<B> SharedBus<B> {
    /// Wrap `device` as bus `number`. Buses live until the process exits.
    pub fn new(number: u8, device: B) -> Self {
        Self {
            number,
            bus: Box::leak(Box::new(Mutex::new(device))),
        }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    /// `I2c` handle that takes the bus for each transaction.
    pub fn device(&self) -> MutexDevice<'static, B> {
        MutexDevice::new(self.bus)
    }

    /// Hold the bus idle until the guard drops.
    pub fn lock(&self) -> MutexGuard<'static, B> {
        self.bus.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.bus.try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::{ErrorKind, ErrorType, I2c, Operation};

    /// Records the address of every transaction.
    #[derive(Default)]
    struct Recorder {
        addresses: Vec<u8>,
    }

    impl ErrorType for Recorder {
        type Error = ErrorKind;
    }

    impl I2c for Recorder {
        fn transaction(
            &mut self,
            address: u8,
            _operations: &mut [Operation<'_>],
        ) -> Result<(), ErrorKind> {
            self.addresses.push(address);
            Ok(())
        }
    }

    #[test]
    fn test_same_number_shares_one_bus() {
        let arbiter = BusArbiter::new();
        let climate = arbiter.bus(1);
        let gas = arbiter.bus(1);

        let guard = climate.lock();
        assert!(gas.is_locked());
        drop(guard);
        assert!(!gas.is_locked());
    }

    #[test]
    fn test_different_buses_are_independent() {
        let arbiter = BusArbiter::new();
        let a = arbiter.bus(0);
        let b = arbiter.bus(1);

        let _guard = a.lock();
        assert!(!b.is_locked());
        assert_eq!(b.number(), 1);
    }

    #[test]
    fn test_devices_reach_the_shared_bus() {
        let bus = SharedBus::new(1, Recorder::default());
        let mut gas = bus.device();
        let mut other = bus.device();

        gas.write(0x74, &[0x00]).unwrap();
        other.write_read(0x77, &[0xD0], &mut [0u8; 1]).unwrap();

        assert_eq!(bus.lock().addresses, vec![0x74, 0x77]);
        assert!(!bus.is_locked());
    }
}
