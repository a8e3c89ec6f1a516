//! # infuse-gatewayd
//!
//! Daemon wiring for the gateway service: configuration, logging, transport
//! selection (serial device or Segger RTT), credential loading, and
//! signal-driven shutdown. All routing logic lives in `infuse-gateway`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;

use infuse_db::{CredentialStore, DeviceDatabase, NoResolver};
use infuse_gateway::{Gateway, GatewayConfig, RttPort, Transport};

#[derive(Parser)]
#[command(name = "infuse-gatewayd", about = "Connect a local Infuse-IoT gateway device")]
struct Args {
    /// Gateway serial port (e.g. /dev/ttyACM0)
    #[arg(long, conflicts_with = "rtt")]
    serial: Option<String>,

    /// Segger RTT telnet address (e.g. localhost:19021)
    #[arg(long)]
    rtt: Option<String>,

    /// Additional RTT channel to capture as an nRF modem trace
    #[arg(long, requires = "rtt")]
    modem_trace: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = infuse_common::config::init()?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "infuse=debug,device=info".into()),
        )
        .with_target(true)
        .init();

    tracing::info!("Starting infuse-gatewayd v{}", env!("CARGO_PKG_VERSION"));

    // === Credentials & registry ===
    let credentials = match CredentialStore::load(&config.credentials.path) {
        Ok(store) => store,
        Err(err) => {
            tracing::warn!(path = %config.credentials.path, error = %err,
                "No credential store; network-keyed traffic will not decode");
            CredentialStore::default()
        }
    };
    let db = DeviceDatabase::new(credentials, Box::new(NoResolver));

    // === Transport ===
    let transport: Box<dyn Transport> = match (&args.serial, &args.rtt) {
        (Some(path), None) => {
            #[cfg(unix)]
            {
                Box::new(infuse_gateway::SerialPort::open(path, config.transport.baud)?)
            }
            #[cfg(not(unix))]
            {
                anyhow::bail!("serial transport requires a unix host (got {path})");
            }
        }
        (None, Some(addr)) => {
            let port = RttPort::connect(addr)?;
            let port = match &args.modem_trace {
                Some(trace_addr) => port.with_modem_trace(trace_addr)?,
                None => port,
            };
            Box::new(port)
        }
        _ => anyhow::bail!("exactly one of --serial or --rtt is required"),
    };

    // === Service ===
    let gateway_config = GatewayConfig {
        group: config.bus.group.parse()?,
        port: config.bus.port,
        ..GatewayConfig::default()
    };
    let gateway = Gateway::new(transport, db, gateway_config)?;
    let handle = gateway.start()?;
    tracing::info!(
        group = %config.bus.group,
        port = config.bus.port,
        "Bus up, clients may connect"
    );

    // Run until interrupted; workers check the stop flag each iteration.
    install_sigint_handler();
    while !INTERRUPTED.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(500));
    }

    tracing::info!("Stopping");
    gateway.stop();
    handle.join();
    Ok(())
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
fn install_sigint_handler() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    extern "C" fn on_sigint(_signal: i32) {
        // Only async-signal-safe work here.
        INTERRUPTED.store(true, Ordering::Relaxed);
    }

    let action = SigAction::new(
        SigHandler::Handler(on_sigint),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // Replaces the default terminate disposition so the workers get a
    // clean stop and the transport is flushed.
    if let Err(err) = unsafe { sigaction(Signal::SIGINT, &action) } {
        tracing::warn!(error = %err, "SIGINT handler not installed");
    }
}

#[cfg(not(unix))]
fn install_sigint_handler() {
    // Ctrl-C terminates the process directly on non-unix hosts.
}
