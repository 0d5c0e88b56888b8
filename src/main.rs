//! EMIS node CLI
//!
//! Unattended environmental field logger.

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use emis_node::{
    config::Config,
    logging,
    sensors::{BusArbiter, Reading, SensorSet},
    storage::{node_status, DailyWriter, WriterError},
    Scheduler, Shutdown, SystemClock, VERSION,
};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, info_span};
use uuid::Uuid;

/// Exit code when the daily writer gave up; distinguishes lost data from bad setup.
const EXIT_WRITER_FAILED: u8 = 2;

#[derive(Parser)]
#[command(name = "emis-node")]
#[command(version = VERSION)]
#[command(about = "Environmental field logger with paired particulate diagnostics", long_about = None)]
struct Cli {
    /// Path to node.yaml (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample sensors and append rows until SIGINT/SIGTERM
    Run,

    /// Initialise every enabled sensor and take one reading each
    Probe,

    /// Report sensor state from the latest daily CSV
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the resolved configuration
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(Config::config_path);

    match cli.command {
        Commands::Run => cmd_run(&config_path),
        Commands::Probe => cmd_probe(&config_path),
        Commands::Status { json } => cmd_status(&config_path, json),
        Commands::Config => cmd_config(&config_path),
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::load(path).with_context(|| format!("loading configuration from {}", path.display()))
}

fn cmd_run(config_path: &Path) -> ExitCode {
    match run(config_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            if e.downcast_ref::<WriterError>().is_some() {
                ExitCode::from(EXIT_WRITER_FAILED)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let log_file = logging::init(Some(config.log_dir().as_path())).context("initialising logging")?;

    let run_id = Uuid::new_v4();
    let span = info_span!("run", %run_id);
    let _guard = span.enter();
    info!(
        version = VERSION,
        node_id = %config.node_id,
        timezone = %config.timezone,
        tick_seconds = config.tick_seconds,
        config = %config_path.display(),
        data_dir = %config.data_dir().display(),
        log_file = ?log_file,
        "starting"
    );

    let shutdown = Shutdown::new();
    let handler = shutdown.clone();
    ctrlc::set_handler(move || handler.request()).context("installing signal handler")?;

    let sensors = SensorSet::from_config(&config.sensors, &BusArbiter::new());
    let writer = DailyWriter::new(
        config.data_dir(),
        config.node_id.clone(),
        config.writer.clone(),
    );
    let scheduler = Scheduler::new(&config, sensors, writer, SystemClock)?;

    let stats = scheduler.run(&shutdown)?;
    info!(ticks = stats.ticks, skipped = stats.skipped, "clean shutdown");
    Ok(())
}

fn cmd_probe(config_path: &Path) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logging::init(None) {
        eprintln!("Warning: logging unavailable: {e}");
    }

    println!("EMIS node v{VERSION} - sensor probe ({})", config.node_id);
    println!();

    let mut sensors = SensorSet::from_config(&config.sensors, &BusArbiter::new());
    let readings = sensors.sample_all(config.read_budget(), &SystemClock);

    let mut healthy = true;
    healthy &= print_probe("bme", sensors.climate.is_enabled(), &readings.climate);
    healthy &= print_probe("pms1", sensors.pms1.is_enabled(), &readings.pms1);
    healthy &= print_probe("pms2", sensors.pms2.is_enabled(), &readings.pms2);
    healthy &= print_probe("so2", sensors.gas.is_enabled(), &readings.gas);

    if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Print one probe line; false when an enabled channel failed.
fn print_probe<T: Debug>(label: &str, enabled: bool, reading: &Reading<T>) -> bool {
    match reading {
        Reading::Valid(value) => {
            println!("  {label:<5} OK      {value:?}");
            true
        }
        Reading::NoData if !enabled => {
            println!("  {label:<5} disabled");
            true
        }
        Reading::NoData => {
            println!("  {label:<5} NODATA");
            false
        }
        Reading::Failed(e) => {
            println!("  {label:<5} ERROR   {e}");
            false
        }
    }
}

fn cmd_status(config_path: &Path, json: bool) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    let today = match config.tz() {
        Ok(tz) => Utc::now().with_timezone(&tz).date_naive(),
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let report = match node_status(&config.data_dir(), &config.node_id, today) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                eprintln!("Error serializing: {e}");
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }

    println!("Sensor Status");
    println!("=============");
    println!();
    println!("File: {}", report.path.display());
    println!("Rows: {}", report.rows);
    if let Some(ts) = &report.last_timestamp {
        println!("Last row: {ts}");
    }
    println!();
    for sensor in &report.sensors {
        println!("  {:<5} {}", sensor.name, sensor.state);
    }
    if let Some(flag) = report.pair_flag {
        let suspect = report
            .suspect
            .map(|s| s.to_string())
            .unwrap_or_else(|| "?".into());
        println!();
        println!("PM2.5 pair: {flag} (suspect: {suspect})");
    }
    ExitCode::SUCCESS
}

fn cmd_config(config_path: &Path) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {}", config_path.display());
    println!("Data dir:    {}", config.data_dir().display());
    println!("Log dir:     {}", config.log_dir().display());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&config).unwrap_or_else(|_| "Error".to_string())
    );
    ExitCode::SUCCESS
}
