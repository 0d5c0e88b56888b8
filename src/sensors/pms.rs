//! PMS5003-style particulate sensor over a serial stream.
//!
//! Frame layout (32 bytes, big endian):
//!
//! ```text
//! 0x42 0x4D | len (=28) | 13 x u16 data | u16 checksum
//! ```
//!
//! Data words 1-3 are CF=1 mass, 4-6 atmospheric mass, 7-12 particle counts.
//! The checksum is the 16-bit sum of every byte before it.

use crate::sensors::types::{Particulate, PmsDetail, SensorError};
use crate::sensors::Sensor;
use serialport::SerialPort;
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub const FRAME_LEN: usize = 32;
const HEADER: [u8; 2] = [0x42, 0x4D];
const DATA_LEN: u16 = 28;
const MAX_BUFFERED: usize = 4 * FRAME_LEN;
const POLL_PAUSE: Duration = Duration::from_millis(10);
/// Serial read timeout; one read never outlasts the budget by more than this.
const SERIAL_TIMEOUT: Duration = Duration::from_millis(100);

/// Decoded frame contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmsFrame {
    pub words: [u16; 13],
}

impl PmsFrame {
    pub fn to_particulate(&self) -> Particulate {
        let w = &self.words;
        Particulate {
            pm1: f64::from(w[3]),
            pm25: f64::from(w[4]),
            pm10: f64::from(w[5]),
            detail: Some(PmsDetail {
                cf1: [w[0], w[1], w[2]],
                counts: [w[6], w[7], w[8], w[9], w[10], w[11]],
            }),
        }
    }
}

/// Validate and decode exactly one frame starting at the header.
pub fn decode_frame(frame: &[u8]) -> Result<PmsFrame, SensorError> {
    if frame.len() != FRAME_LEN {
        return Err(SensorError::malformed(
            format!("expected {FRAME_LEN} bytes, got {}", frame.len()),
            frame,
        ));
    }
    if frame[..2] != HEADER {
        return Err(SensorError::malformed("missing 0x42 0x4D header", frame));
    }

    let length = u16::from_be_bytes([frame[2], frame[3]]);
    if length != DATA_LEN {
        return Err(SensorError::malformed(
            format!("declared length {length}, expected {DATA_LEN}"),
            frame,
        ));
    }

    let expected = u16::from_be_bytes([frame[30], frame[31]]);
    let computed = frame[..30]
        .iter()
        .fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)));
    if computed != expected {
        return Err(SensorError::malformed(
            format!("checksum {computed:#06x} != {expected:#06x}"),
            frame,
        ));
    }

    let mut words = [0u16; 13];
    for (i, word) in words.iter_mut().enumerate() {
        let at = 4 + i * 2;
        *word = u16::from_be_bytes([frame[at], frame[at + 1]]);
    }
    Ok(PmsFrame { words })
}

/// Incremental frame finder for a byte stream that may start mid-frame.
#[derive(Debug, Default)]
pub struct PmsDecoder {
    buf: Vec<u8>,
}

impl PmsDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > MAX_BUFFERED {
            let excess = self.buf.len() - MAX_BUFFERED;
            self.buf.drain(..excess);
        }
    }

    /// Next complete frame in the buffer, if any.
    ///
    /// A rejected frame only consumes its first header byte so a real header
    /// hidden inside the garbage is still found on the next call.
    pub fn next_frame(&mut self) -> Option<Result<PmsFrame, SensorError>> {
        let start = self.buf.windows(2).position(|w| w == HEADER);
        match start {
            Some(start) => {
                self.buf.drain(..start);
            }
            None => {
                // Keep a trailing 0x42 that may pair with the next chunk.
                let keep = usize::from(self.buf.last() == Some(&HEADER[0]));
                let cut = self.buf.len() - keep;
                self.buf.drain(..cut);
                return None;
            }
        }

        if self.buf.len() < FRAME_LEN {
            return None;
        }

        match decode_frame(&self.buf[..FRAME_LEN]) {
            Ok(frame) => {
                self.buf.drain(..FRAME_LEN);
                Some(Ok(frame))
            }
            Err(e) => {
                self.buf.drain(..1);
                Some(Err(e))
            }
        }
    }
}

type Opener<R> = Box<dyn FnMut() -> io::Result<R> + Send>;

/// Particulate channel reading frames from a byte source.
pub struct PmsSensor<R> {
    name: String,
    decoder: PmsDecoder,
    port: Option<R>,
    opener: Opener<R>,
}

impl PmsSensor<Box<dyn SerialPort>> {
    /// Sensor on a serial device such as `/dev/ttyAMA0`, 8N1.
    pub fn serial(name: impl Into<String>, path: PathBuf, baudrate: u32) -> Self {
        Self::with_opener(name, move || {
            let port = serialport::new(path.to_string_lossy(), baudrate)
                .timeout(SERIAL_TIMEOUT)
                .open()?;
            port.clear(serialport::ClearBuffer::Input)?;
            Ok(port)
        })
    }
}

impl<R: Read> PmsSensor<R> {
    /// Sensor over any byte source; `opener` is called at init and after I/O errors.
    pub fn with_opener(
        name: impl Into<String>,
        opener: impl FnMut() -> io::Result<R> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            decoder: PmsDecoder::new(),
            port: None,
            opener: Box::new(opener),
        }
    }

    fn port(&mut self) -> Result<&mut R, SensorError> {
        if self.port.is_none() {
            let port = (self.opener)()?;
            self.port = Some(port);
        }
        self.port
            .as_mut()
            .ok_or_else(|| SensorError::Transient("serial port not open".to_string()))
    }
}

impl<R: Read> Sensor for PmsSensor<R> {
    type Output = Particulate;

    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self) -> Result<(), SensorError> {
        let port = (self.opener)().map_err(|e| SensorError::Unavailable(e.to_string()))?;
        self.port = Some(port);
        Ok(())
    }

    fn read(&mut self, budget: Duration) -> Result<Particulate, SensorError> {
        let deadline = Instant::now() + budget;
        let mut latest: Option<PmsFrame> = None;
        let mut rejected: Option<SensorError> = None;
        let mut chunk = [0u8; 64];

        loop {
            let port = self.port()?;
            let n = match port.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => 0,
                Err(e) => {
                    // Reopen on the next read.
                    self.port = None;
                    return Err(e.into());
                }
            };
            self.decoder.push(&chunk[..n]);

            while let Some(result) = self.decoder.next_frame() {
                match result {
                    Ok(frame) => latest = Some(frame),
                    Err(e) => rejected = Some(e),
                }
            }

            // Drain whatever is already buffered so the newest frame wins.
            if latest.is_some() && n < chunk.len() {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            if n == 0 {
                std::thread::sleep(POLL_PAUSE);
            }
        }

        match (latest, rejected) {
            (Some(frame), _) => Ok(frame.to_particulate()),
            (None, Some(e)) => Err(e),
            (None, None) => Err(SensorError::NoFrame),
        }
    }
}
