//! vpn-sessiond: VPN session orchestration daemon
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo ./vpn-sessiond
//!
//! # Run with custom configuration
//! sudo ./vpn-sessiond -c /path/to/config.json
//!
//! # Run with environment overrides
//! VPN_SESSIOND_LOG_LEVEL=debug sudo ./vpn-sessiond
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use vpn_sessiond::config::{load_config_with_env, DaemonConfig};
use vpn_sessiond::ipc::{IpcHandler, IpcServer};
use vpn_sessiond::platform::{LinuxTun, TunPlatform};
use vpn_sessiond::session::SessionController;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/vpn-sessiond/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("vpn-sessiond v{}", vpn_sessiond::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"vpn-sessiond v{}

VPN session orchestration daemon.

USAGE:
    vpn-sessiond [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/vpn-sessiond/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    VPN_SESSIOND_LOG_LEVEL     Override log level (trace, debug, info, warn, error)
    VPN_SESSIOND_IPC_SOCKET    Override IPC socket path
    VPN_SESSIOND_PROXY_BIN     Override proxy engine binary path
    VPN_SESSIOND_FORWARDER_BIN Override forwarder binary path

REQUIREMENTS:
    - Linux kernel with TUN support (/dev/net/tun)
    - CAP_NET_ADMIN capability (or root)
"#,
        vpn_sessiond::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &DaemonConfig) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("tokio=warn".parse().expect("static directive"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    if args.generate_config {
        vpn_sessiond::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration from {:?}: {}",
            args.config_path,
            e
        )
    })?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("vpn-sessiond v{}", vpn_sessiond::VERSION);
    info!(path = %args.config_path.display(), "configuration loaded");

    let platform = Arc::new(LinuxTun::new());
    if let Err(e) = platform.check_permission() {
        // Do not fail here; start requests re-check and report over IPC
        tracing::warn!(error = %e, "tunnel capability not available at startup");
    }

    let ipc_socket = config.ipc_socket.clone();
    let controller = SessionController::new(config, platform);

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
    let handler = Arc::new(IpcHandler::new(
        Arc::clone(&controller),
        shutdown_tx.clone(),
    ));

    let ipc_server = IpcServer::new(&ipc_socket, handler);
    let ipc_shutdown = ipc_server.shutdown_sender();

    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = ipc_server.run().await {
            error!(error = %e, "IPC server error");
        }
    });

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
        _ = shutdown_rx.recv() => {
            info!("Shutdown requested over IPC");
        }
    }

    info!("Shutting down...");

    // Tear down any live session before exiting
    controller.shutdown().await;

    let _ = ipc_shutdown.send(());
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), ipc_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
