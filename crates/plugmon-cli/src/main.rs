//! Plugmon CLI
//!
//! Talks to a running plugmon daemon: registers and inspects services,
//! submits reports, pushes broadcasts, and can attach as a plugin to watch
//! the events a service sends.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use plugmon_rpc::{ControlClient, ControlRequest, PluginClient, socket_path};
use plugmon_types::{ClientInfo, DownEvent, Envelope, ServiceLocator};
use serde_json::{Value, json};

/// Plugmon CLI
#[derive(Parser)]
#[command(name = "plugmon")]
#[command(about = "Plugmon - plugin event server control")]
#[command(version)]
#[command(after_help = "\
Examples:
  plugmon register weather                  Register a service, print its id
  plugmon fetch name/weather                Show a service and its clients
  plugmon report name/weather --level error --description boom --info trace
  plugmon broadcast name/weather 'reload' --highlight
  plugmon listen name/weather               Attach and print down-events
  plugmon shutdown                          Stop the daemon
")]
struct Cli {
    /// Custom socket path (defaults to `$XDG_RUNTIME_DIR/plugmon.sock`)
    #[arg(long, global = true, value_name = "PATH")]
    socket_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new service under a fresh id
    Register {
        /// Service name
        name: String,
    },

    /// Describe a service (`sid/<uuid>` or `name/<name>`)
    Fetch { service: ServiceLocator },

    /// Submit a report on behalf of a service
    Report {
        service: ServiceLocator,

        /// info, warn, fails, error or crash
        #[arg(long)]
        level: String,

        #[arg(long)]
        description: String,

        #[arg(long)]
        info: Option<String>,

        /// JSON error object, e.g. '{"name":"TypeError","message":"..."}'
        #[arg(long)]
        error: Option<String>,
    },

    /// Push a broadcast to every connection of a service
    Broadcast {
        service: ServiceLocator,
        message: String,

        #[arg(long)]
        highlight: bool,
    },

    /// Persist the service registry now
    Save,

    /// List every registered service
    List,

    /// Check whether the daemon is running
    Status,

    /// Stop the daemon
    Shutdown,

    /// Attach to a service as a plugin and print the events it receives
    Listen {
        service: ServiceLocator,

        /// Client name announced to the daemon
        #[arg(long, default_value = "plugmon-cli")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let socket = cli.socket_path.unwrap_or_else(socket_path);

    match cli.command {
        Commands::Register { name } => run_register(&socket, name).await,
        Commands::Fetch { service } => {
            let data = request_data(&socket, &ControlRequest::Fetch { service }).await?;
            print_json(&data)
        }
        Commands::Report {
            service,
            level,
            description,
            info,
            error,
        } => {
            let mut report = json!({"level": level, "description": description});
            if let Some(info) = info {
                report["info"] = Value::String(info);
            }
            if let Some(error) = error {
                report["error"] = Value::String(error);
            }
            let envelope = request(&socket, &ControlRequest::Report { service, report }).await?;
            println!("{}", envelope.msg.unwrap_or_else(|| "OK".to_string()));
            Ok(())
        }
        Commands::Broadcast {
            service,
            message,
            highlight,
        } => {
            request(
                &socket,
                &ControlRequest::Broadcast {
                    service,
                    message,
                    highlight,
                },
            )
            .await?;
            println!("Broadcast sent");
            Ok(())
        }
        Commands::Save => {
            request(&socket, &ControlRequest::Save).await?;
            println!("Services saved");
            Ok(())
        }
        Commands::List => run_list(&socket).await,
        Commands::Status => run_status(&socket).await,
        Commands::Shutdown => {
            request(&socket, &ControlRequest::Shutdown).await?;
            println!("Daemon shutting down");
            Ok(())
        }
        Commands::Listen { service, name } => run_listen(&socket, service, name).await,
    }
}

async fn connect(socket: &Path) -> Result<ControlClient> {
    ControlClient::connect_to(socket)
        .await
        .with_context(|| format!("Failed to connect to daemon at {}", socket.display()))
}

/// Send one request, failing on any non-2xx envelope
async fn request(socket: &Path, request: &ControlRequest) -> Result<Envelope> {
    let mut client = connect(socket).await?;
    let envelope = client
        .request(request)
        .await
        .with_context(|| format!("{} request failed", request.op()))?;

    if !envelope.is_success() {
        bail!(
            "{} failed ({}): {}",
            request.op(),
            envelope.code,
            envelope.msg.unwrap_or_default()
        );
    }
    Ok(envelope)
}

async fn request_data(socket: &Path, req: &ControlRequest) -> Result<Value> {
    Ok(request(socket, req).await?.data.unwrap_or(Value::Null))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_register(socket: &Path, name: String) -> Result<()> {
    let data = request_data(socket, &ControlRequest::Register { name }).await?;
    let Some(id) = data.as_str() else {
        bail!("Daemon returned no service id");
    };
    println!("{id}");
    Ok(())
}

async fn run_list(socket: &Path) -> Result<()> {
    let data = request_data(socket, &ControlRequest::List).await?;
    let services = data.as_array().map(Vec::as_slice).unwrap_or_default();

    if services.is_empty() {
        println!("No services registered");
        return Ok(());
    }

    for service in services {
        let id = service.get("id").and_then(Value::as_str).unwrap_or("?");
        let name = service.get("name").and_then(Value::as_str).unwrap_or("-");
        let clients = service
            .get("clients")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        println!("{id}  {name:<31}  {clients} client(s)");
    }
    Ok(())
}

async fn run_status(socket: &Path) -> Result<()> {
    if !socket.exists() {
        println!("Status: Not running");
        println!("Socket: {} (not found)", socket.display());
        return Ok(());
    }

    match request_data(socket, &ControlRequest::List).await {
        Ok(data) => {
            let services = data.as_array().map_or(0, Vec::len);
            println!("Status: Running");
            println!("Socket: {}", socket.display());
            println!("Services: {services}");
        }
        Err(e) => {
            println!("Status: Not responding");
            println!("Socket: {}", socket.display());
            println!("Error: {e:#}");
        }
    }
    Ok(())
}

async fn run_listen(socket: &Path, service: ServiceLocator, name: String) -> Result<()> {
    let mut client = PluginClient::connect_to(socket, service, Some(ClientInfo::named(name)))
        .await
        .with_context(|| format!("Failed to attach through {}", socket.display()))?;

    eprintln!(
        "Attached to service {} as connection {}",
        client.service_id(),
        client
            .connection_id()
            .map_or_else(|| "?".to_string(), |id| id.to_string())
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = client.recv() => match event? {
                Some(event) => print_event(&event)?,
                None => {
                    eprintln!("Daemon closed the connection");
                    break;
                }
            },
        }
    }

    client.close().await?;
    Ok(())
}

fn print_event(event: &DownEvent) -> Result<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}
