//! Command-line front end for the hwio remoting protocol: `serve` runs a
//! server backed by an in-memory mock bus, the other subcommands act as a
//! one-shot client for manual poking and scripting.

use std::{
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::{Parser, Subcommand};
use hwio_bus::MockBus;
use hwio_client::HwioClient;
use hwio_server::{EventLoop, ServerConfig};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "hwio-cli", about = "hwio remoting protocol server and client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs a server backed by an in-memory mock bus.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8896")]
        addr: String,
        #[arg(long, default_value_t = 500)]
        poll_timeout_ms: u32,
        #[arg(long, default_value_t = 16)]
        max_pending_connections: i32,
        /// Pre-populates the mock bus with a device, `name:register_len`.
        /// May be repeated.
        #[arg(long = "device", value_name = "NAME:SIZE")]
        devices: Vec<String>,
    },
    /// Connects and sends a single PING_REQUEST.
    Ping {
        #[arg(long, default_value = "127.0.0.1:8896")]
        addr: String,
    },
    /// Connects and queries for matching devices.
    Query {
        #[arg(long, default_value = "127.0.0.1:8896")]
        addr: String,
        #[arg(long = "name", required = true)]
        names: Vec<String>,
    },
    /// Reads bytes from a device this process has queried for.
    Read {
        #[arg(long, default_value = "127.0.0.1:8896")]
        addr: String,
        #[arg(long = "device-handle")]
        device_handle: u32,
        #[arg(long)]
        offset: u32,
        #[arg(long)]
        size: u32,
    },
    /// Writes bytes (given as hex) to a device this process has queried for.
    Write {
        #[arg(long, default_value = "127.0.0.1:8896")]
        addr: String,
        #[arg(long = "device-handle")]
        device_handle: u32,
        #[arg(long)]
        offset: u32,
        #[arg(long)]
        data: String,
    },
}

fn parse_device_spec(spec: &str) -> Result<(String, usize), String> {
    let (name, len) = spec
        .split_once(':')
        .ok_or_else(|| format!("device spec {spec:?} must be NAME:SIZE"))?;
    let len: usize = len.parse().map_err(|_| format!("invalid register length in {spec:?}"))?;
    Ok((name.to_string(), len))
}

fn parse_hex(data: &str) -> Result<Vec<u8>, String> {
    if data.len() % 2 != 0 {
        return Err("hex data must have an even number of digits".to_string());
    }
    (0..data.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&data[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

fn run_serve(
    addr: String,
    poll_timeout_ms: u32,
    max_pending_connections: i32,
    devices: Vec<String>,
) -> Result<(), String> {
    let specs = devices.iter().map(|s| parse_device_spec(s)).collect::<Result<Vec<_>, _>>()?;
    let bus = MockBus::with_devices(specs);
    let config = ServerConfig { addr, poll_timeout_ms, max_pending_connections };

    // Register a signal handler that flips a flag the main loop polls,
    // rather than acting from inside the handler itself.
    let running = Arc::new(AtomicBool::new(true));
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        let flag = Arc::clone(&running);
        // SAFETY: the closure only performs an atomic store, which is
        // async-signal-safe.
        unsafe {
            signal_hook::low_level::register(sig, move || flag.store(false, Ordering::Relaxed))
                .map_err(|e| e.to_string())?;
        }
    }

    let mut server = EventLoop::bind(config, bus).map_err(|e| e.to_string())?;
    info!("hwio-cli serve ready, Ctrl-C to stop");
    server.run(&running).map_err(|e| e.to_string())
}

fn run_client(addr: &str, command: Command) -> Result<(), String> {
    let mut client = HwioClient::connect(addr).map_err(|e| e.to_string())?;
    match command {
        Command::Ping { .. } => {
            client.ping().map_err(|e| e.to_string())?;
            println!("ping ok");
        }
        Command::Query { names, .. } => {
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let handles = client.query(&refs).map_err(|e| e.to_string())?;
            for handle in handles {
                println!("{handle}");
            }
        }
        Command::Read { device_handle, offset, size, .. } => {
            let data = client.read(device_handle, offset, size).map_err(|e| e.to_string())?;
            println!("{}", data.iter().map(|b| format!("{b:02x}")).collect::<String>());
        }
        Command::Write { device_handle, offset, data, .. } => {
            let bytes = parse_hex(&data)?;
            client.write(device_handle, offset, &bytes).map_err(|e| e.to_string())?;
            println!("write ok");
        }
        Command::Serve { .. } => unreachable!("dispatched separately"),
    }
    client.close().map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Serve { addr, poll_timeout_ms, max_pending_connections, devices } => {
            run_serve(addr, poll_timeout_ms, max_pending_connections, devices)
        }
        other => {
            let addr = match &other {
                Command::Ping { addr }
                | Command::Query { addr, .. }
                | Command::Read { addr, .. }
                | Command::Write { addr, .. } => addr.clone(),
                Command::Serve { .. } => unreachable!("handled above"),
            };
            run_client(&addr, other)
        }
    };

    if let Err(e) = result {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
