//! Core logic of the node.
//!
//! This module contains:
//! - Rolling per-sensor baselines
//! - Paired particulate agreement diagnostics
//! - The canonical output row
//! - The fixed-cadence sampling scheduler

pub mod agreement;
pub mod baseline;
pub mod row;
pub mod scheduler;

pub use agreement::{AgreementEngine, AgreementResult, PairFlag, SuspectSensor};
pub use baseline::RollingBaseline;
pub use row::{Row, COLUMNS};
pub use scheduler::{Cadence, Clock, ManualClock, RunStats, Scheduler, Shutdown, Slot, SystemClock};
