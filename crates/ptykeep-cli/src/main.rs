//! ptykeep CLI and daemon entry point.

mod args;

use clap::Parser;
use tracing::{error, info};

use ptykeep_cli::daemon::{daemon_reachable, DaemonClient, DaemonServer};
use ptykeep_core::protocol::{Command, ResponseData};

use crate::args::{Cli, Commands};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    // Daemon command runs the server, all other commands are clients
    if let Commands::Daemon = cli.command {
        run_daemon();
        return;
    }

    if let Err(e) = run_client_command(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

/// Convert CLI args to a protocol Command.
fn cli_to_command(cli: &Cli) -> Command {
    match &cli.command {
        Commands::List => Command::List,
        Commands::Kill(args) => Command::Kill {
            session_id: args.session_id.clone(),
            delete_history: args.delete_history,
        },
        Commands::KillAll => Command::KillAll,
        Commands::KillWorkspace(args) => Command::KillForWorkspace {
            workspace_id: args.workspace_id.clone(),
        },
        Commands::Stop => Command::Shutdown,
        Commands::Daemon => unreachable!("Daemon command handled separately"),
    }
}

/// Run a client command by connecting to the daemon.
fn run_client_command(cli: Cli) -> anyhow::Result<()> {
    let command = cli_to_command(&cli);
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        // Management commands have nothing to do without a daemon;
        // don't start one just to talk to an empty registry.
        if !daemon_reachable().await {
            println!("No daemon is running");
            return Ok(());
        }

        let (client, _notices) = DaemonClient::connect().await?;

        let response = match client.request(command).await {
            Ok(response) => response,
            Err(e) => {
                client.dispose();
                anyhow::bail!("{}", e);
            }
        };
        client.dispose();

        if response.success {
            if let Some(data) = response.data {
                match data {
                    ResponseData::Ok { message } => println!("{}", message),
                    ResponseData::Killed { count } => println!("Killed {} session(s)", count),
                    other => println!("{}", serde_json::to_string_pretty(&other)?),
                }
            }
        } else if let Some(err) = response.error {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }

        Ok(())
    })
}

/// Run the daemon server with graceful signal handling.
///
/// Handles SIGINT (Ctrl+C) and SIGTERM for clean shutdown. The
/// DaemonServer's Drop impl cleans up the socket, PID, and token files.
fn run_daemon() {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        let server = match DaemonServer::bind().await {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to start daemon: {}", e);
                std::process::exit(1);
            }
        };

        tokio::select! {
            result = server.run() => {
                if let Err(e) = result {
                    error!("Daemon error: {}", e);
                    std::process::exit(1);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down gracefully");
            }
            _ = sigterm() => {
                info!("Received SIGTERM, shutting down gracefully");
            }
        }
        // Server drops here, cleaning up its runtime files
    });
}

/// Wait for SIGTERM (Unix only).
///
/// If signal registration fails, logs a warning and waits indefinitely
/// so the daemon still responds to SIGINT.
#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(
                "Failed to register SIGTERM handler: {}, daemon will only respond to SIGINT",
                e
            );
            std::future::pending::<()>().await;
        }
    }
}

/// SIGTERM is not available off Unix; never complete.
#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
