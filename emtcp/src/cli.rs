//! Parses the command line arguments and runs the chosen simulation.
//!
//! Basic usage for a lossy transfer with logging on:
//!
//! ```cargo run -p emtcp -- --scenario transfer --loss 0.2 --log```

use crate::{
    simulation::{SimulationError, SimulationOptions},
    simulations,
};
use clap::{Parser, ValueEnum};
use emtcp_core::TcpConfig;
use std::{
    fs::{create_dir_all, OpenOptions},
    io,
    sync::Arc,
    time::Duration,
};
use thiserror::Error as ThisError;
use tracing::{level_filters::LevelFilter, subscriber::SetGlobalDefaultError};
use tracing_subscriber::FmtSubscriber;

/// The prebuilt simulations that can be run from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// Open and close a connection
    Handshake,
    /// Move a block of data and close
    Transfer,
    /// Connect to a port nobody listens on
    Refused,
}

/// Stores the different command line arguments.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// Logging flag. Writes JSON events to a file under ./logs.
    #[arg(short, long)]
    pub log: bool,
    /// The simulation to run
    #[arg(short, long, value_enum, default_value_t = Scenario::Transfer)]
    pub scenario: Scenario,
    /// Bytes to move in the transfer scenario
    #[arg(short, long, default_value_t = 16 * 1024)]
    pub bytes: usize,
    /// Probability that the link loses a frame, in the range [0, 1]
    #[arg(long, default_value_t = 0.0)]
    pub loss: f64,
    /// One-way link latency in milliseconds
    #[arg(long, default_value_t = 0)]
    pub latency_ms: u64,
    /// Wall-clock milliseconds per protocol tick
    #[arg(long, default_value_t = 100)]
    pub tick_ms: u64,
    /// Seed for the links and the initial sequence numbers
    #[arg(long, default_value_t = 0xBAD5EED)]
    pub seed: u64,
    /// Retransmissions of data and FIN segments before giving up
    #[arg(long)]
    pub max_retries: Option<u8>,
    /// Retransmissions of a SYN before giving up
    #[arg(long)]
    pub connect_retries: Option<u8>,
    /// The MSS both stacks advertise
    #[arg(long)]
    pub mss: Option<u16>,
}

#[derive(Debug, ThisError)]
pub enum CliError {
    #[error("Loss rate {0} is outside of [0, 1]")]
    LossRate(f64),
    #[error("A tick must last at least one millisecond")]
    Tick,
    #[error(transparent)]
    Simulation(#[from] SimulationError),
    #[error("Could not open the log file: {0}")]
    LogFile(#[from] io::Error),
    #[error(transparent)]
    Subscriber(#[from] SetGlobalDefaultError),
}

impl Args {
    /// The simulation options the arguments describe
    pub fn options(&self) -> Result<SimulationOptions, CliError> {
        if !(0.0..=1.0).contains(&self.loss) {
            Err(CliError::LossRate(self.loss))?
        }
        if self.tick_ms == 0 {
            Err(CliError::Tick)?
        }
        let defaults = TcpConfig::default();
        let config = TcpConfig {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            connect_retries: self.connect_retries.unwrap_or(defaults.connect_retries),
            max_segment_size: self.mss.unwrap_or(defaults.max_segment_size),
            ..defaults
        };
        config.validate().map_err(SimulationError::from)?;
        Ok(SimulationOptions {
            config,
            tick: Duration::from_millis(self.tick_ms),
            success_rate: 1.0 - self.loss,
            latency: Duration::from_millis(self.latency_ms),
            seed: self.seed,
            bytes: self.bytes,
            ..Default::default()
        })
    }
}

/// Parses the command line and runs the simulation it names.
pub async fn initialize_from_arguments() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("{e}");
    }
}

async fn run(args: Args) -> Result<(), CliError> {
    let options = args.options()?;
    initialize_logging(args.log)?;
    match args.scenario {
        Scenario::Handshake => simulations::handshake(options).await?,
        Scenario::Transfer => {
            let report = simulations::transfer(options).await?;
            println!("{report}");
        }
        Scenario::Refused => simulations::refused(options).await?,
    }
    Ok(())
}

/// Installs the global subscriber. Only should be called once when the
/// program starts.
///
/// With `to_file`, every event down to TRACE is written as JSON to a
/// timestamped file under ./logs. Otherwise warnings and errors go to
/// stderr.
fn initialize_logging(to_file: bool) -> Result<(), CliError> {
    if to_file {
        let main_path = "./logs";
        create_dir_all(main_path)?;
        let file_path = format!(
            "{}/emtcp-{}.log",
            main_path,
            chrono::offset::Local::now().format("%y-%m-%d_%H-%M-%S")
        );
        let file = OpenOptions::new()
            .write(true)
            .append(true)
            .create(true)
            .open(file_path)?;
        let subscriber = FmtSubscriber::builder()
            .with_writer(Arc::new(file))
            .with_max_level(LevelFilter::TRACE)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_writer(io::stderr)
            .with_max_level(LevelFilter::WARN)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::parse_from(["emtcp"]);
        assert_eq!(args.scenario, Scenario::Transfer);
        assert!(!args.log);
        let options = args.options().unwrap();
        assert_eq!(options.config, TcpConfig::default());
        assert_eq!(options.tick, Duration::from_millis(100));
        assert_eq!(options.success_rate, 1.0);
    }

    #[test]
    fn overrides() {
        let args = Args::parse_from([
            "emtcp",
            "--scenario",
            "refused",
            "--loss",
            "0.25",
            "--max-retries",
            "9",
            "--mss",
            "536",
            "--tick-ms",
            "10",
        ]);
        assert_eq!(args.scenario, Scenario::Refused);
        let options = args.options().unwrap();
        assert_eq!(options.config.max_retries, 9);
        assert_eq!(options.config.max_segment_size, 536);
        assert_eq!(options.success_rate, 0.75);
        assert_eq!(options.tick, Duration::from_millis(10));
    }

    #[test]
    fn rejects_bad_values() {
        let args = Args::parse_from(["emtcp", "--loss", "1.5"]);
        assert!(matches!(args.options(), Err(CliError::LossRate(_))));
        let args = Args::parse_from(["emtcp", "--mss", "100"]);
        assert!(matches!(args.options(), Err(CliError::Simulation(_))));
        assert!(Args::try_parse_from(["emtcp", "--scenario", "nope"]).is_err());
    }
}
