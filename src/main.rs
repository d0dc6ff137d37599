mod configs;
mod error;
mod ipc;
mod process;
mod socket;

use crate::configs::NodewardenConfig;
use crate::ipc::{read_message, send_request, BridgeRequest, BridgeResponse};
use crate::process::{FaultSpec, NodeLauncher};
use crate::socket::Bridge;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use std::path::PathBuf;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file
    #[arg(
        short,
        long,
        env = "NODEWARDEN_CONFIG",
        value_name = "FILE",
        default_value = "/etc/nodewarden/config.yml"
    )]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Supervise the node and serve the control socket (default)
    Run,
    /// Send one request to a running supervisor and print the reply
    Ctl {
        /// Control socket, read from the configuration file when unset
        #[arg(short, long, env = "NODEWARDEN_SOCKET", value_name = "SOCKET")]
        socket: Option<PathBuf>,
        #[command(subcommand)]
        request: CtlRequest,
    },
}

#[derive(Subcommand, Debug)]
enum CtlRequest {
    GetStatus,
    /// Replace the stored status with a JSON document
    SetStatus { status: String },
    GetState,
    GetTlsConfig,
    GetSnapshot,
    AwaitUpdate,
    Restart {
        #[arg(long)]
        forced: bool,
    },
    Stop {
        #[arg(long)]
        forced: bool,
    },
    /// One of crash, unresponsive, unrecoverable, error
    InjectFault { fault: String },
    /// Print notifications until the supervisor goes away
    Subscribe,
}

impl CtlRequest {
    fn into_request(self) -> Result<BridgeRequest> {
        Ok(match self {
            CtlRequest::GetStatus => BridgeRequest::GetStatus,
            CtlRequest::SetStatus { status } => BridgeRequest::SetStatus {
                status: serde_json::from_str(&status).wrap_err("Status is not valid JSON")?,
            },
            CtlRequest::GetState => BridgeRequest::GetState,
            CtlRequest::GetTlsConfig => BridgeRequest::GetTlsConfig,
            CtlRequest::GetSnapshot => BridgeRequest::GetSnapshot,
            CtlRequest::AwaitUpdate => BridgeRequest::AwaitUpdate,
            CtlRequest::Restart { forced } => BridgeRequest::Restart { forced },
            CtlRequest::Stop { forced } => BridgeRequest::Stop { forced },
            CtlRequest::InjectFault { fault } => {
                let fault: FaultSpec = serde_json::from_value(serde_json::Value::String(fault))
                    .wrap_err("Unknown fault")?;
                BridgeRequest::InjectFault { fault }
            }
            CtlRequest::Subscribe => BridgeRequest::Subscribe,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let code = match args.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = NodewardenConfig::load(&args.config)?;
            init_logging(&config.log_filter);
            run(config).await?
        }
        Commands::Ctl { socket, request } => {
            init_logging("warn");
            let socket = match socket {
                Some(socket) => socket,
                None => NodewardenConfig::load(&args.config)?
                    .socket
                    .ok_or_else(|| eyre!("No socket configured"))?,
            };
            ctl(socket, request.into_request()?).await?;
            0
        }
    };
    std::process::exit(code)
}

fn init_logging(default_filter: &str) {
    if std::env::var("NODEWARDEN_LOG").is_err() {
        std::env::set_var("NODEWARDEN_LOG", default_filter);
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("NODEWARDEN_LOG"))
        .init();
}

/// Supervises the node until interrupted or an update asks for a relaunch.
/// Returns the exit code for the process.
async fn run(config: NodewardenConfig) -> Result<i32> {
    info!("{:#?}", config);
    let supervisor = process::spawn(config.node.clone(), NodeLauncher);
    let (exit, mut exit_requested) = mpsc::unbounded_channel();
    socket::setup(&config, Bridge::new(supervisor.clone(), exit)).await?;

    if let Err(err) = supervisor.request_start().await {
        error!(%err, "Failed to start node");
    }

    let mut terminate = signal(SignalKind::terminate()).wrap_err("Failed to listen for SIGTERM")?;
    let code = select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            0
        }
        _ = terminate.recv() => {
            info!("Terminated");
            0
        }
        Some(code) = exit_requested.recv() => code,
    };

    match supervisor.request_stop(false).await {
        Ok(state) => info!(%state, "Supervisor shut down"),
        Err(err) => warn!(%err, "Node did not stop cleanly"),
    }
    socket::cleanup(&config);
    Ok(code)
}

async fn ctl(socket: PathBuf, request: BridgeRequest) -> Result<()> {
    let subscribe = request == BridgeRequest::Subscribe;
    let (response, mut stream) = send_request(&socket, &request)
        .await
        .wrap_err_with(|| format!("Request to {} failed", socket.to_string_lossy()))?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if subscribe {
        while let Some(message) = read_message::<_, BridgeResponse>(&mut stream).await? {
            println!("{}", serde_json::to_string(&message)?);
        }
    }
    Ok(())
}
