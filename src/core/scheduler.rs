//! Fixed-cadence sampling loop.
//!
//! Each tick captures one instant, reads every channel in row order, runs
//! the pair diagnostics and hands the row to the daily writer. Tick `k` is
//! due at `start + k * period`; ticks that cannot start on time are skipped,
//! never replayed, so the cadence does not drift.

use crate::config::{Config, ConfigError};
use crate::core::agreement::{AgreementEngine, AgreementResult};
use crate::core::row::Row;
use crate::sensors::SensorSet;
use crate::storage::{DailyWriter, WriterError};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cooperative stop signal shared with the signal handler.
#[derive(Clone)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            tx,
            rx,
        }
    }

    /// Ask the loop to stop after the current tick. Safe to call repeatedly.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        let _ = self.tx.try_send(());
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Block up to `timeout`; returns true if shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_requested() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => self.is_requested(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Source of time for the scheduler and read budgets.
pub trait Clock {
    /// Monotonic instant for cadence and budget arithmetic.
    fn now(&self) -> Instant;

    /// Wall-clock time for row timestamps.
    fn utc_now(&self) -> DateTime<Utc>;

    /// Sleep up to `timeout`, returning early (true) on shutdown.
    fn wait(&self, timeout: Duration, shutdown: &Shutdown) -> bool;
}

/// Real time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn wait(&self, timeout: Duration, shutdown: &Shutdown) -> bool {
        shutdown.wait_timeout(timeout)
    }
}

/// Virtual time that only moves when told to.
///
/// Waiting advances the clock instantly. With a horizon set, a wait that
/// reaches it reports shutdown, which ends a scheduler run after a fixed
/// amount of virtual time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Rc<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    origin: Instant,
    wall_origin: DateTime<Utc>,
    elapsed: Cell<Duration>,
    horizon: Cell<Option<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(DateTime::<Utc>::default())
    }

    /// Clock whose wall time starts at `wall`.
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            inner: Rc::new(ManualState {
                origin: Instant::now(),
                wall_origin: wall,
                elapsed: Cell::new(Duration::ZERO),
                horizon: Cell::new(None),
            }),
        }
    }

    /// Treat reaching `after` of virtual time as a shutdown request.
    pub fn stop_after(&self, after: Duration) {
        self.inner.horizon.set(Some(after));
    }

    pub fn advance(&self, by: Duration) {
        self.inner.elapsed.set(self.inner.elapsed.get() + by);
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.elapsed.get()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.inner.origin + self.inner.elapsed.get()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.inner.elapsed.get())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.inner.wall_origin + elapsed
    }

    fn wait(&self, timeout: Duration, shutdown: &Shutdown) -> bool {
        if shutdown.is_requested() {
            return true;
        }
        let target = self.inner.elapsed.get() + timeout;
        match self.inner.horizon.get() {
            Some(horizon) if target >= horizon => {
                self.inner.elapsed.set(horizon.max(self.inner.elapsed.get()));
                true
            }
            _ => {
                self.inner.elapsed.set(target);
                false
            }
        }
    }
}

/// What the cadence says to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Too early; sleep this long.
    Wait(Duration),
    /// Run tick `index`; `missed` earlier ticks were skipped.
    Due { index: u64, missed: u64 },
}

/// Tick deadlines anchored at a fixed start instant.
#[derive(Debug, Clone)]
pub struct Cadence {
    start: Instant,
    period: Duration,
    next: u64,
}

impl Cadence {
    pub fn new(start: Instant, period: Duration) -> Self {
        Self {
            start,
            period: period.max(Duration::from_nanos(1)),
            next: 0,
        }
    }

    /// Scheduled start of tick `index`.
    pub fn deadline(&self, index: u64) -> Instant {
        let nanos = self.period.as_nanos().saturating_mul(u128::from(index));
        self.start + Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Index of the next tick that has not run yet.
    pub fn next_index(&self) -> u64 {
        self.next
    }

    pub fn poll(&mut self, now: Instant) -> Slot {
        let due = self.deadline(self.next);
        if now < due {
            return Slot::Wait(due - now);
        }
        let elapsed = now.saturating_duration_since(self.start).as_nanos();
        let current = u64::try_from(elapsed / self.period.as_nanos()).unwrap_or(u64::MAX);
        let index = current.max(self.next);
        let missed = index - self.next;
        self.next = index.saturating_add(1);
        Slot::Due { index, missed }
    }
}

/// Counters reported when a run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub ticks: u64,
    pub skipped: u64,
}

/// Owns every component of a logging run.
pub struct Scheduler<C: Clock> {
    node_id: String,
    tz: Tz,
    period: Duration,
    read_budget: Duration,
    clock: C,
    sensors: SensorSet,
    engine: AgreementEngine,
    writer: DailyWriter,
    stats: RunStats,
}

impl<C: Clock> Scheduler<C> {
    pub fn new(
        config: &Config,
        sensors: SensorSet,
        writer: DailyWriter,
        clock: C,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            node_id: config.node_id.clone(),
            tz: config.tz()?,
            period: config.tick(),
            read_budget: config.read_budget(),
            clock,
            sensors,
            engine: AgreementEngine::new(config.agreement.clone()),
            writer,
            stats: RunStats::default(),
        })
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    /// Sample, diagnose and persist one row.
    pub fn tick(&mut self) -> Result<(), WriterError> {
        let timestamp_utc = self.clock.utc_now();
        let timestamp_local = timestamp_utc.with_timezone(&self.tz);

        let readings = self.sensors.sample_all(self.read_budget, &self.clock);
        let agreement = if self.sensors.pair_enabled() {
            self.engine.evaluate(&readings.pms1, &readings.pms2)
        } else {
            AgreementResult::incomplete()
        };

        let row = Row {
            timestamp_utc,
            timestamp_local,
            node_id: self.node_id.clone(),
            readings,
            agreement,
        };
        self.writer.write(&row)?;

        self.stats.ticks += 1;
        debug!(
            tick = self.stats.ticks,
            pair_flag = %agreement.pair_flag(),
            "row written"
        );
        Ok(())
    }

    /// Run until `shutdown` is requested or the writer gives up.
    ///
    /// The daily file is flushed and closed on every exit path.
    pub fn run(mut self, shutdown: &Shutdown) -> Result<RunStats, WriterError> {
        let mut cadence = Cadence::new(self.clock.now(), self.period);
        info!(
            node_id = %self.node_id,
            period_ms = self.period.as_millis() as u64,
            channels = ?self.sensors.enabled_labels(),
            "sampling started"
        );

        let result = self.run_loop(&mut cadence, shutdown);
        let closed = self.writer.close();

        info!(
            ticks = self.stats.ticks,
            skipped = self.stats.skipped,
            "sampling stopped"
        );
        result?;
        closed?;
        Ok(self.stats)
    }

    fn run_loop(&mut self, cadence: &mut Cadence, shutdown: &Shutdown) -> Result<(), WriterError> {
        while !shutdown.is_requested() {
            match cadence.poll(self.clock.now()) {
                Slot::Wait(delay) => {
                    if self.clock.wait(delay, shutdown) {
                        break;
                    }
                }
                Slot::Due { index, missed } => {
                    if missed > 0 {
                        self.stats.skipped += missed;
                        warn!(index, missed, "tick overran its period; skipping missed ticks");
                    }
                    self.tick()?;
                }
            }
        }
        Ok(())
    }
}
