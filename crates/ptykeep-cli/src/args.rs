//! CLI argument parsing with clap derive macros.

use clap::{Parser, Subcommand};

/// Persistent terminal sessions behind a daemon.
///
/// Sessions keep running when the client that created them goes away
/// and can be reattached later. The daemon auto-starts on first use and
/// shuts itself down when idle.
#[derive(Debug, Parser)]
#[command(name = "ptykeep", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List all sessions registered in the daemon
    List,

    /// Kill one session and remove it from the daemon
    #[command(after_help = "\
Examples:
  ptykeep kill pane-3                   # Terminate the process, keep nothing
  ptykeep kill pane-3 --delete-history  # Also drop its scrollback first")]
    Kill(KillArgs),

    /// Kill every session in the daemon
    KillAll,

    /// Kill every session belonging to one workspace
    KillWorkspace(KillWorkspaceArgs),

    /// Start the daemon process (usually auto-started)
    Daemon,

    /// Stop the daemon process, killing all its sessions
    Stop,
}

#[derive(Debug, clap::Args)]
pub struct KillArgs {
    /// Session id to kill
    pub session_id: String,

    /// Drop the session's scrollback before removing it
    #[arg(long)]
    pub delete_history: bool,
}

#[derive(Debug, clap::Args)]
pub struct KillWorkspaceArgs {
    /// Workspace id whose sessions should be killed
    pub workspace_id: String,
}
