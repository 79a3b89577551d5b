//! Daemon process management: PTY ownership behind a Unix socket.
//!
//! The daemon outlives any client. Sessions created through it keep
//! running when the client disconnects and can be reattached later.

pub mod client;
pub mod paths;
pub mod pty;
pub mod registry;
pub mod server;

pub use client::{daemon_reachable, ClientNotice, DaemonClient};
pub use registry::{AttachOutcome, RegistryConfig, SessionRegistry};
pub use server::DaemonServer;
