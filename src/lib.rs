//! EMIS node - unattended environmental field logger.
//!
//! Samples a small set of sensors at a fixed cadence, derives agreement
//! diagnostics for a pair of co-located particulate sensors, and appends
//! one row per tick to a durable daily CSV file.
//!
//! # Guarantees
//!
//! - **Fixed schema**: every row has the same columns in the same order
//! - **Fault isolation**: a failing sensor blanks its own columns only
//! - **Durability**: each row is synced to disk before the next tick
//! - **Raw values untouched**: diagnostics are extra columns, never corrections
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        EMIS node                           │
//! ├────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐       │
//! │  │  Sensors    │──▶│  Scheduler  │──▶│ DailyWriter │       │
//! │  │ bme/pms/so2 │   │  (tick k)   │   │  (CSV/day)  │       │
//! │  └─────────────┘   └─────────────┘   └─────────────┘       │
//! │                           │                                │
//! │                           ▼                                │
//! │                    ┌─────────────┐                         │
//! │                    │  Agreement  │                         │
//! │                    │   Engine    │                         │
//! │                    └─────────────┘                         │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use emis_node::{BusArbiter, Config, DailyWriter, Scheduler, SensorSet, Shutdown, SystemClock};
//!
//! let config = Config::load(&Config::config_path()).expect("valid config");
//! let sensors = SensorSet::from_config(&config.sensors, &BusArbiter::new());
//! let writer = DailyWriter::new(config.data_dir(), config.node_id.clone(), config.writer.clone());
//! let scheduler = Scheduler::new(&config, sensors, writer, SystemClock).expect("valid zone");
//!
//! let shutdown = Shutdown::new();
//! scheduler.run(&shutdown).expect("writer healthy");
//! ```

pub mod config;
pub mod core;
pub mod logging;
pub mod sensors;
pub mod storage;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError};
pub use core::{
    AgreementEngine, AgreementResult, Clock, ManualClock, PairFlag, Row, RunStats, Scheduler,
    Shutdown, SuspectSensor, SystemClock, COLUMNS,
};
pub use sensors::{BusArbiter, Reading, ReadingStatus, Sensor, SensorError, SensorSet};
pub use storage::{DailyWriter, WriterError};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
