//! Harpcom CLI
//!
//! Talks to one Harp device over a serial port, or to the built-in virtual
//! device with `--simulate`.

use clap::{Parser, Subcommand};
use harpcom_core::cli::{CliResult, ExitCodes, OutputFormat};
use harpcom_core::config::{self, AppConfig, ConfigError, LogFormat, LoggingConfig};
use harpcom_core::core::registers::RegisterCatalog;
use harpcom_core::core::transport::{self, TransportError};
use harpcom_core::{
    DataType, DeviceSession, Frame, HarpError, HarpTimestamp, Payload, VirtualDevice,
    VirtualDeviceConfig,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Harpcom CLI
#[derive(Parser, Debug)]
#[command(
    name = "harpcom",
    author = "Harpcom Team",
    version,
    about = "Talk to Harp protocol devices over serial links",
    long_about = None
)]
struct Cli {
    /// Serial port (overrides the config file)
    #[arg(short, long, global = true, env = "HARPCOM_PORT")]
    port: Option<String>,

    /// Baud rate (overrides the config file)
    #[arg(short, long, global = true)]
    baud: Option<u32>,

    /// Config file (defaults to the platform config dir)
    #[arg(short, long, global = true, env = "HARPCOM_CONFIG")]
    config: Option<PathBuf>,

    /// Per-attempt reply timeout in milliseconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Use the built-in virtual device instead of a serial port
    #[arg(long, global = true)]
    simulate: bool,

    /// More logging (repeatable)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Errors only
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    ListPorts,

    /// Show device identity and versions
    Info,

    /// Read a register
    Read {
        /// Register address or core register name (e.g. 8 or TIMESTAMP_SECOND)
        register: String,

        /// Payload type (u8, s8, u16, s16, u32, s32, u64, s64, float); defaults to the catalog type
        #[arg(short = 't', long = "type")]
        data_type: Option<DataType>,
    },

    /// Write a register
    Write {
        /// Register address or core register name
        register: String,

        /// Payload type; defaults to the catalog type
        #[arg(short = 't', long = "type")]
        data_type: Option<DataType>,

        /// Values to write
        #[arg(required = true, num_args = 1..)]
        values: Vec<String>,
    },

    /// Enable heartbeat events and print them
    Heartbeat {
        /// How long to listen, in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },

    /// Set the device clock
    SetTime {
        /// Seconds to set (defaults to host UTC time)
        #[arg(short, long)]
        seconds: Option<u32>,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct UsageError(String);

#[derive(Debug, thiserror::Error)]
#[error("cancelled")]
struct Cancelled;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(ExitCodes::CONFIG_ERROR);
        }
    };

    let _log_guard = init_logging(&cli, &config.logging);
    debug!("Starting harpcom v{}", env!("CARGO_PKG_VERSION"));

    let result = match run(&cli, config).await {
        Ok(()) => CliResult::success(),
        Err(e) => classify(&e),
    };
    if let Some(msg) = result.message() {
        if !result.is_success() {
            eprintln!("Error: {msg}");
        }
    }
    result.to_exit_code()
}

fn load_config(cli: &Cli) -> Result<AppConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load().or_else(|e| match e {
            ConfigError::NoConfigDir => Ok(AppConfig::default()),
            other => Err(other),
        })?,
    };
    if let Some(port) = &cli.port {
        config.serial.port.clone_from(port);
    }
    if let Some(baud) = cli.baud {
        config.serial.baud_rate = baud;
    }
    if let Some(timeout) = cli.timeout {
        config.session.response_timeout_ms = timeout;
    }
    Ok(config)
}

fn init_logging(
    cli: &Cli,
    logging: &LoggingConfig,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => logging.level.as_str(),
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = if cli.verbose == 0 && !cli.quiet {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    } else {
        EnvFilter::new(level)
    };

    let text = (logging.format == LogFormat::Text).then(|| fmt::layer().with_writer(std::io::stderr));
    let json = (logging.format == LogFormat::Json).then(|| fmt::layer().json().with_writer(std::io::stderr));

    let mut guard = None;
    let file = logging
        .file
        .then(|| logging.directory.clone().or_else(config::log_dir))
        .flatten()
        .map(|dir| {
            let appender = tracing_appender::rolling::daily(dir, "harpcom.log");
            let (writer, worker) = tracing_appender::non_blocking(appender);
            guard = Some(worker);
            fmt::layer().with_ansi(false).with_writer(writer)
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .with(file)
        .init();
    guard
}

fn classify(err: &anyhow::Error) -> CliResult {
    if let Some(harp) = err.downcast_ref::<HarpError>() {
        return CliResult::from(harp);
    }
    if err.downcast_ref::<UsageError>().is_some() {
        return CliResult::error(ExitCodes::INVALID_ARGS, err.to_string());
    }
    if err.downcast_ref::<Cancelled>().is_some() {
        return CliResult::error(ExitCodes::CANCELLED, err.to_string());
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return CliResult::error(ExitCodes::CONFIG_ERROR, err.to_string());
    }
    if let Some(transport) = err.downcast_ref::<TransportError>() {
        let code = match transport {
            TransportError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
            TransportError::PortNotFound(_) => ExitCodes::PORT_NOT_FOUND,
            _ => ExitCodes::CONNECTION_FAILED,
        };
        return CliResult::error(code, err.to_string());
    }
    CliResult::error(ExitCodes::ERROR, format!("{err:#}"))
}

async fn run(cli: &Cli, config: AppConfig) -> anyhow::Result<()> {
    if matches!(cli.command, Commands::ListPorts) {
        return list_ports(cli);
    }

    let session = connect(cli, config)?;
    let result = match &cli.command {
        Commands::ListPorts => Ok(()),
        Commands::Info => show_info(cli, &session).await,
        Commands::Read { register, data_type } => read(cli, &session, register, *data_type).await,
        Commands::Write {
            register,
            data_type,
            values,
        } => write(cli, &session, register, *data_type, values).await,
        Commands::Heartbeat { duration } => heartbeat(cli, &session, Duration::from_secs(*duration)).await,
        Commands::SetTime { seconds } => set_time(cli, &session, *seconds).await,
    };

    let stats = session.stats();
    debug!(
        frames_sent = stats.frames_sent,
        frames_received = stats.frames_received,
        retries = stats.retries,
        corrupt_runs = stats.corrupt_runs,
        "Session statistics"
    );
    session.close().await;
    result
}

fn connect(cli: &Cli, config: AppConfig) -> anyhow::Result<DeviceSession> {
    if cli.simulate {
        let now = chrono::Utc::now();
        let start_micros = u64::try_from(now.timestamp_micros()).unwrap_or_default();
        let (transport, _device) = VirtualDevice::connect(VirtualDeviceConfig {
            start_micros,
            ..VirtualDeviceConfig::default()
        });
        info!("Using virtual device");
        return Ok(DeviceSession::open(transport, config.session)?);
    }

    if config.serial.port.is_empty() {
        return Err(UsageError("no serial port given; use --port, the config file or --simulate".into()).into());
    }
    info!("Opening {} at {} baud", config.serial.port, config.serial.baud_rate);
    Ok(DeviceSession::open_serial(config.serial, config.session)?)
}

fn list_ports(cli: &Cli) -> anyhow::Result<()> {
    let ports = transport::list_ports()?;

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&ports)?),
        OutputFormat::Text => {
            if ports.is_empty() {
                if !cli.quiet {
                    println!("No serial ports found.");
                }
                return Ok(());
            }
            for port in &ports {
                let product = port.product.as_deref().unwrap_or("");
                println!("{:<24} {:<10} {}", port.name, port.kind, product);
            }
        }
    }
    Ok(())
}

/// Resolve a register argument to an address and the type to use
fn resolve(
    catalog: &RegisterCatalog,
    register: &str,
    data_type: Option<DataType>,
) -> anyhow::Result<(u8, DataType)> {
    let address = match register.parse::<u8>() {
        Ok(address) => address,
        Err(_) => catalog
            .by_name(register)
            .map(|r| r.address)
            .ok_or_else(|| UsageError(format!("unknown register '{register}'")))?,
    };
    let data_type = data_type
        .or_else(|| catalog.lookup(address).map(|r| r.data_type))
        .ok_or_else(|| UsageError(format!("register {address} is not catalogued; pass --type")))?;
    Ok((address, data_type))
}

fn frame_json(frame: &Frame) -> serde_json::Value {
    serde_json::json!({
        "message_type": frame.message_type.name(),
        "address": frame.address,
        "port": frame.port,
        "payload": frame.value(),
        "timestamp": frame.timestamp.map(|t| t.as_secs_f64()),
        "raw": hex::encode(&frame.payload),
    })
}

async fn show_info(cli: &Cli, session: &DeviceSession) -> anyhow::Result<()> {
    let info = session.device_info().await?;
    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
        OutputFormat::Text => println!("{info}"),
    }
    Ok(())
}

async fn read(
    cli: &Cli,
    session: &DeviceSession,
    register: &str,
    data_type: Option<DataType>,
) -> anyhow::Result<()> {
    let (address, data_type) = resolve(session.catalog(), register, data_type)?;
    let reply = session.read_register(address, data_type).await?;
    print_reply(cli, session, &reply);
    Ok(())
}

async fn write(
    cli: &Cli,
    session: &DeviceSession,
    register: &str,
    data_type: Option<DataType>,
    values: &[String],
) -> anyhow::Result<()> {
    let (address, data_type) = resolve(session.catalog(), register, data_type)?;
    let payload = Payload::parse_values(data_type, values).map_err(UsageError)?;
    let reply = session.write_register(address, &payload).await?;
    print_reply(cli, session, &reply);
    Ok(())
}

fn print_reply(cli: &Cli, session: &DeviceSession, reply: &Frame) {
    match cli.format {
        OutputFormat::Json => println!("{}", frame_json(reply)),
        OutputFormat::Text => {
            let name = session
                .catalog()
                .lookup(reply.address)
                .map_or("", |r| r.name);
            let value = reply.value().map(|v| v.to_string()).unwrap_or_default();
            match reply.timestamp {
                Some(ts) => println!("{} {name} = {value} (t={ts})", reply.address),
                None => println!("{} {name} = {value}", reply.address),
            }
        }
    }
}

async fn heartbeat(cli: &Cli, session: &DeviceSession, duration: Duration) -> anyhow::Result<()> {
    session.enable_heartbeat().await?;
    let deadline = Instant::now() + duration;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut cancelled = false;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                cancelled = true;
                break;
            }
            event = session.poll_event(remaining) => match event {
                Some(event) => print_event(cli, &event),
                None if !session.is_open() => break,
                None => {}
            }
        }
    }

    if let Err(e) = session.disable_heartbeat().await {
        warn!("Failed to disable heartbeat: {e}");
    }
    let stats = session.stats();
    if stats.events_dropped > 0 {
        warn!("{} events dropped", stats.events_dropped);
    }
    if cancelled {
        return Err(Cancelled.into());
    }
    Ok(())
}

fn print_event(cli: &Cli, event: &Frame) {
    match cli.format {
        OutputFormat::Json => println!("{}", frame_json(event)),
        OutputFormat::Text => {
            let seconds = event
                .value()
                .and_then(|v| v.as_u32().and_then(|s| s.first().copied()));
            match (event.timestamp, seconds) {
                (Some(ts), _) => println!("event {} t={ts}", event.address),
                (None, Some(s)) => println!("event {} seconds={s}", event.address),
                (None, None) => println!("{event}"),
            }
        }
    }
}

async fn set_time(cli: &Cli, session: &DeviceSession, seconds: Option<u32>) -> anyhow::Result<()> {
    let seconds = match seconds {
        Some(seconds) => seconds,
        None => u32::try_from(chrono::Utc::now().timestamp())
            .map_err(|_| UsageError("host clock outside the device clock range".into()))?,
    };
    session.set_harp_seconds(seconds).await?;
    let now: HarpTimestamp = session.harp_time().await?;
    match cli.format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({ "requested": seconds, "device_time": now.as_secs_f64() })
        ),
        OutputFormat::Text => println!("Device clock set to {seconds} (now {now})"),
    }
    Ok(())
}
