//! daq-probe: connect one instrument, set knobs, read meters, disconnect.
//!
//! # Usage
//!
//! List what the configuration declares:
//! ```bash
//! daq-probe --config config/daq_comm.toml list
//! ```
//!
//! Drive a configured device (presets on connect, postsets on exit):
//! ```bash
//! daq-probe run --device henon --set a=1.2 --measure x --measure y --repeat 5
//! ```
//!
//! Drive a driver without a config entry:
//! ```bash
//! daq-probe run --driver henon --address sim --measure x
//! ```
//!
//! Exit codes: 0 on success, 2 when the instrument stopped answering
//! (communication lost), 1 for any other failure.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use daq_comm::config::{CommConfig, DeviceDefinition, DEFAULT_CONFIG_PATH};
use daq_comm::drivers::{self, DRIVER_NAMES};
use daq_comm::tracing_setup::{self, OutputFormat, TracingConfig};
use daq_comm::{Address, ChannelMediator, CommError, Device, Value};

#[derive(Parser)]
#[command(name = "daq-probe")]
#[command(about = "Talk to one instrument through a resilient session", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format (overrides the configuration)
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured devices and available drivers
    List,

    /// Connect a device, apply settings, take readings, disconnect
    Run {
        /// Device name from the configuration
        #[arg(long, conflicts_with_all = ["driver", "address"])]
        device: Option<String>,

        /// Driver identifier, for a device not in the configuration
        #[arg(long, requires = "address")]
        driver: Option<String>,

        /// Instrument address, used with --driver
        #[arg(long, requires = "driver")]
        address: Option<Address>,

        /// Knob assignment `name=value`, applied in order
        #[arg(long = "set", value_parser = parse_assignment)]
        sets: Vec<(String, Value)>,

        /// Knob to read back after the assignments
        #[arg(long = "get")]
        gets: Vec<String>,

        /// Meter to read
        #[arg(long = "measure")]
        measures: Vec<String>,

        /// Number of times to read the meters
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormat> for OutputFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Pretty => OutputFormat::Pretty,
            LogFormat::Compact => OutputFormat::Compact,
            LogFormat::Json => OutputFormat::Json,
        }
    }
}

/// `knob=value`; booleans and numbers are recognized, anything else is text.
fn parse_assignment(raw: &str) -> Result<(String, Value), String> {
    let (knob, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", raw))?;
    let knob = knob.trim();
    if knob.is_empty() {
        return Err(format!("missing knob name in '{}'", raw));
    }
    Ok((knob.to_string(), parse_value(value.trim())))
}

fn parse_value(raw: &str) -> Value {
    if let Ok(b) = raw.parse::<bool>() {
        Value::Bool(b)
    } else if let Ok(i) = raw.parse::<i64>() {
        Value::Int(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        Value::Float(f)
    } else {
        Value::Text(raw.to_string())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            let lost = e.chain().any(|cause| {
                matches!(
                    cause.downcast_ref::<CommError>(),
                    Some(CommError::CommunicationLost { .. })
                )
            });
            if lost {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = CommConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let mut logging = TracingConfig::from_config(&config)?;
    if let Some(format) = cli.log_format {
        logging = logging.with_format(format.into());
    }
    logging.level = match cli.verbose {
        0 => logging.level,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_setup::init(logging)?;

    match cli.command {
        Commands::List => {
            list(&config);
            Ok(())
        }
        Commands::Run {
            device,
            driver,
            address,
            sets,
            gets,
            measures,
            repeat,
        } => {
            let definition = match (device, driver, address) {
                (Some(name), _, _) => config
                    .device(&name)
                    .cloned()
                    .ok_or_else(|| anyhow!("no device named '{}' in configuration", name))?,
                (None, Some(driver), Some(address)) => DeviceDefinition {
                    name: driver.clone(),
                    driver,
                    address,
                    backend: None,
                    transport: None,
                    presets: Vec::new(),
                    postsets: Vec::new(),
                    enabled: true,
                },
                _ => bail!("either --device or --driver with --address is required"),
            };
            probe(&config, &definition, &sets, &gets, &measures, repeat).await
        }
    }
}

fn list(config: &CommConfig) {
    println!("Devices:");
    if config.devices.is_empty() {
        println!("  (none configured)");
    }
    for device in &config.devices {
        let backend = device
            .backend
            .map(|kind| kind.to_string())
            .unwrap_or_else(|| "driver default".to_string());
        println!(
            "  {:<16} driver={:<10} address={:<18} backend={}{}",
            device.name,
            device.driver,
            device.address,
            backend,
            if device.enabled { "" } else { " (disabled)" }
        );
    }
    println!("Drivers: {}", DRIVER_NAMES.join(", "));
}

async fn probe(
    config: &CommConfig,
    definition: &DeviceDefinition,
    sets: &[(String, Value)],
    gets: &[String],
    measures: &[String],
    repeat: u32,
) -> Result<()> {
    let driver = drivers::driver_for(&definition.driver)
        .ok_or_else(|| anyhow!("unknown driver '{}'", definition.driver))?;
    let mediator = Arc::new(ChannelMediator::new());
    let options = config.device_options(definition, mediator)?;

    let device = Device::open(driver, definition.address.clone(), options).await?;
    println!(
        "Connected {} at {} (knobs: {}; meters: {})",
        device.name(),
        device.address(),
        device.capabilities().knob_names().join(", "),
        device.capabilities().meter_names().join(", ")
    );

    let outcome = exercise(&device, sets, gets, measures, repeat).await;

    // Postsets run even when the readings failed
    let shutdown = device.disconnect().await;
    outcome?;
    shutdown?;
    println!("Disconnected {}", device.name());
    Ok(())
}

async fn exercise(
    device: &Device,
    sets: &[(String, Value)],
    gets: &[String],
    measures: &[String],
    repeat: u32,
) -> Result<(), CommError> {
    for (knob, value) in sets {
        device.set(knob, value.clone()).await?;
        println!("set {} = {}", knob, value);
    }

    for knob in gets {
        match device.get(knob).await? {
            Some(value) => println!("{} = {}", knob, value),
            None => println!("{} = (unknown)", knob),
        }
    }

    for round in 0..repeat {
        for meter in measures {
            let value = device.measure(meter).await?;
            if repeat > 1 {
                println!("[{}] {} = {}", round + 1, meter, value);
            } else {
                println!("{} = {}", meter, value);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            parse_assignment("a=1.2").unwrap(),
            ("a".to_string(), Value::Float(1.2))
        );
        assert_eq!(
            parse_assignment("output = true").unwrap(),
            ("output".to_string(), Value::Bool(true))
        );
        assert_eq!(parse_assignment("range=10").unwrap().1, Value::Int(10));
        assert_eq!(
            parse_assignment("mode=CURR").unwrap().1,
            Value::Text("CURR".into())
        );
        assert!(parse_assignment("novalue").is_err());
        assert!(parse_assignment("=3").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "daq-probe", "-v", "run", "--driver", "henon", "--address", "sim", "--set", "a=1.1",
            "--measure", "x", "--repeat", "3",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Run {
                driver,
                sets,
                measures,
                repeat,
                ..
            } => {
                assert_eq!(driver.as_deref(), Some("henon"));
                assert_eq!(sets.len(), 1);
                assert_eq!(measures, vec!["x".to_string()]);
                assert_eq!(repeat, 3);
            }
            Commands::List => panic!("expected run"),
        }
    }
}
