//! Durable storage for sampled rows.

pub mod daily_writer;
pub mod status;

pub use daily_writer::{daily_file_name, DailyWriter, WriterError};
pub use status::{node_status, read_status, SensorState, StatusError, StatusReport};
