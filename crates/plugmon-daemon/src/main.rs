//! Plugmon daemon entry point.
//!
//! This binary loads the service registry and starts the socket server that
//! plugins and control clients connect to.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use plugmon_core::config::{Config, Directories};
use plugmon_core::{RegistryOptions, ServiceRegistry};
use plugmon_daemon::ServerOptions;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Plugmon daemon - plugin event server
#[derive(Parser, Debug)]
#[command(name = "plugmon-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Custom socket path (defaults to `$XDG_RUNTIME_DIR/plugmon.sock` or `/tmp/plugmon.sock`)
    #[arg(long, value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Also accept connections on this TCP address
    #[arg(long, value_name = "ADDR")]
    tcp: Option<SocketAddr>,

    /// Config file (defaults to `config.json` in the config directory)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Keep config, services and reports under this directory
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,
}

/// Set up logging with file output for debugging.
/// In debug builds, defaults to debug level and logs to timestamped file.
/// In release builds, defaults to info level and logs to stderr.
fn setup_logging() {
    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("plugmon={default_level}")));

    if cfg!(debug_assertions) {
        let temp_dir = std::env::temp_dir();
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let log_filename = format!("plugmon-daemon-{timestamp}.log");
        let log_path = temp_dir.join(&log_filename);

        #[cfg(unix)]
        {
            let symlink_path = temp_dir.join("plugmon-daemon.log");
            let _ = std::fs::remove_file(&symlink_path);
            let _ = std::os::unix::fs::symlink(&log_path, &symlink_path);
        }

        let file_appender = tracing_appender::rolling::never(&temp_dir, &log_filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        std::mem::forget(guard);

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_line_number(true);

        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer)
            .with(filter)
            .init();

        eprintln!("Logging to: {} (and stderr)", log_path.display());
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    setup_logging();

    info!("Starting plugmon daemon...");

    let dirs = match args.data_dir {
        Some(base) => Directories::with_base(base),
        None => Directories::new()?,
    };
    dirs.ensure_exists()?;

    let config_path = args.config.unwrap_or_else(|| dirs.config_file.clone());
    let config = Config::load(&config_path)?;

    let registry = Arc::new(ServiceRegistry::new(RegistryOptions::from_config(
        &config, &dirs,
    )));
    let restored = registry.load().await?;
    info!("Restored {} services", restored);

    let options = ServerOptions {
        socket_path: args
            .socket_path
            .or(config.socket_path)
            .unwrap_or_else(plugmon_rpc::socket_path),
        tcp_listen: args.tcp.or(config.tcp_listen),
    };

    plugmon_daemon::run(options, registry).await?;

    info!("Plugmon daemon stopped");
    Ok(())
}
