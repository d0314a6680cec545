use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use scopelink_client::{ClientConfig, CommandClient};

use crate::exit::{client_error, CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod monitor;
pub mod send;
pub mod simulate;
pub mod stats;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send one request and print the reply.
    Send(SendArgs),
    /// Print controller notifications as they arrive.
    Monitor(MonitorArgs),
    /// Connect, optionally probe, and print engine statistics.
    Stats(StatsArgs),
    /// Run a minimal instrument simulator on localhost.
    Simulate(SimulateArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Send(args) => send::run(args, format),
        Command::Monitor(args) => monitor::run(args, format),
        Command::Stats(args) => stats::run(args, format),
        Command::Simulate(args) => simulate::run(args),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Controller IPv4 address.
    pub ip: String,
    /// Command port; the live channel is port + 1.
    #[arg(long, short = 'p')]
    pub port: u16,
    /// Command code (decimal or 0x-prefixed hex).
    #[arg(long, short = 'c', value_parser = parse_code)]
    pub code: u32,
    /// Integer parameter, repeatable (up to 7).
    #[arg(long = "param", allow_hyphen_values = true)]
    pub params: Vec<i64>,
    /// Floating-point parameter.
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    pub value: f64,
    /// String sent as additional data after the frame.
    #[arg(long)]
    pub data: Option<String>,
    /// Maximum time to wait for the reply (e.g. 2s, 500ms).
    #[arg(long, default_value = "2s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct MonitorArgs {
    /// Controller IPv4 address.
    pub ip: String,
    /// Command port; the live channel is port + 1.
    #[arg(long, short = 'p')]
    pub port: u16,
    /// Notification codes to print (comma-separated). Default: all known notifications.
    #[arg(long, value_delimiter = ',', value_parser = parse_code)]
    pub codes: Option<Vec<u32>>,
    /// Exit after printing N notifications.
    #[arg(long)]
    pub count: Option<usize>,
    /// Exit after this long (e.g. 10s).
    #[arg(long)]
    pub duration: Option<String>,
}

#[derive(Args, Debug)]
pub struct StatsArgs {
    /// Controller IPv4 address.
    pub ip: String,
    /// Command port; the live channel is port + 1.
    #[arg(long, short = 'p')]
    pub port: u16,
    /// Send one request with this code before collecting statistics.
    #[arg(long, value_parser = parse_code)]
    pub probe_code: Option<u32>,
    /// Reply timeout for the probe.
    #[arg(long, default_value = "2s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Command port to bind on 127.0.0.1; the live channel binds port + 1.
    #[arg(long, short = 'p')]
    pub port: u16,
    /// Interval between system-state notifications.
    #[arg(long, default_value = "1s")]
    pub notify_interval: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Connect a client configured with `config`.
pub fn connect(ip: &str, port: u16, config: ClientConfig) -> CliResult<CommandClient> {
    let client = CommandClient::with_config(config);
    client
        .connect(ip, port)
        .map_err(|err| client_error("connect failed", err))?;
    Ok(client)
}

pub fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

/// Accepts decimal or `0x`-prefixed hexadecimal.
pub fn parse_code(input: &str) -> Result<u32, String> {
    let input = input.trim();
    let parsed = match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => input.parse(),
    };
    parsed.map_err(|_| format!("invalid command code: {input}"))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
