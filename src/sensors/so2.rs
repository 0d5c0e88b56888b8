//! Electrochemical SO2 sensor on I2C (DFRobot Gravity style).
//!
//! The module answers with 8-byte frames `FF 86 hi lo ...`; the
//! concentration is `hi << 8 | lo` in ppm. Firmware revisions map the frame
//! to different registers, so the candidates are tried in order.
//!
//! A single transfer cannot be interrupted from user space; the i2c-dev
//! adapter timeout bounds it. The budget is checked between candidates.

use crate::sensors::bus::SharedBus;
use crate::sensors::types::{Gas, SensorError};
use crate::sensors::{I2cBusDevice, Sensor};
use embedded_hal::i2c::I2c;
use embedded_hal_bus::i2c::MutexDevice;
use std::time::{Duration, Instant};

pub const FRAME_LEN: usize = 8;
pub const DEFAULT_ADDRESS: u8 = 0x74;
const CANDIDATE_REGISTERS: [u8; 3] = [0x00, 0x86, 0x78];

/// Decode an `FF 86` frame; only the first four bytes carry data.
pub fn decode_frame(frame: &[u8]) -> Result<Gas, SensorError> {
    if frame.len() < 4 {
        return Err(SensorError::malformed(
            format!("short frame ({} bytes)", frame.len()),
            frame,
        ));
    }
    if frame[0] != 0xFF || frame[1] != 0x86 {
        return Err(SensorError::malformed("missing FF 86 header", frame));
    }

    let byte0 = frame[2];
    let byte1 = frame[3];
    let raw = u16::from_be_bytes([byte0, byte1]);
    Ok(Gas {
        ppm: f64::from(raw),
        raw,
        byte0,
        byte1,
    })
}

/// Gas channel on any `embedded-hal` I2C device.
pub struct So2Sensor<I> {
    name: String,
    address: u8,
    i2c: I,
}

impl So2Sensor<MutexDevice<'static, I2cBusDevice>> {
    /// Sensor at `address` on a bus shared with other channels.
    pub fn on_bus(name: impl Into<String>, bus: &SharedBus, address: u8) -> Self {
        Self::new(name, bus.device(), address)
    }
}

impl<I: I2c> So2Sensor<I> {
    pub fn new(name: impl Into<String>, i2c: I, address: u8) -> Self {
        Self {
            name: name.into(),
            address,
            i2c,
        }
    }
}

impl<I: I2c> Sensor for So2Sensor<I> {
    type Output = Gas;

    fn name(&self) -> &str {
        &self.name
    }

    /// Address the module once; no acknowledgement disables the channel.
    fn init(&mut self) -> Result<(), SensorError> {
        let mut probe = [0u8; 1];
        self.i2c.read(self.address, &mut probe).map_err(|e| {
            SensorError::Unavailable(format!("no answer at {:#04x}: {e:?}", self.address))
        })
    }

    fn read(&mut self, budget: Duration) -> Result<Gas, SensorError> {
        let deadline = Instant::now() + budget;
        let mut rejected: Option<SensorError> = None;
        let mut bus_error: Option<String> = None;

        for register in CANDIDATE_REGISTERS {
            if Instant::now() >= deadline {
                return Err(SensorError::Timeout { budget });
            }
            let mut buf = [0u8; FRAME_LEN];
            match self.i2c.write_read(self.address, &[register], &mut buf) {
                // An idle bus reads back as all ones.
                Ok(()) if buf.iter().all(|b| *b == 0xFF) => {}
                Ok(()) => match decode_frame(&buf) {
                    Ok(gas) => return Ok(gas),
                    Err(e) => rejected = Some(e),
                },
                Err(e) => bus_error = Some(format!("register {register:#04x}: {e:?}")),
            }
        }

        if let Some(e) = rejected {
            return Err(e);
        }
        if let Some(detail) = bus_error {
            return Err(SensorError::Transient(detail));
        }
        Err(SensorError::NoFrame)
    }
}
