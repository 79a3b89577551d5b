//! Client side of the daemon connection.
//!
//! One connection carries both request/response traffic and pushed
//! session events. A reader task demuxes incoming frames: responses
//! resolve entries in the dispatch table, events and transport loss are
//! surfaced to the owner as [`ClientNotice`]s.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ptykeep_core::error::ApiError;
use ptykeep_core::protocol::{Command, Frame, Request, Response, SessionEvent};

use crate::daemon::paths;
use crate::manager::dispatch::{DispatchTable, Outcome};

/// Maximum time to wait for a spawned daemon to start accepting.
const DAEMON_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between socket connection attempts during startup.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Bound on the authentication handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Out-of-band notifications delivered to the connection's owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotice {
    /// A pushed event for a subscribed session.
    Event {
        session_id: String,
        event: SessionEvent,
    },
    /// The transport dropped. Delivered at most once per connection.
    Disconnected { reason: String },
}

/// An authenticated connection to the daemon.
///
/// All methods take `&self`: the connection is shared, and the owner
/// replaces the whole client on reconnect.
pub struct DaemonClient {
    write_tx: mpsc::UnboundedSender<String>,
    dispatch: Arc<DispatchTable<Response>>,
    connected: Arc<AtomicBool>,
    request_counter: AtomicU64,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl DaemonClient {
    /// Connect to the default socket, starting the daemon if needed, and
    /// authenticate with the token from the runtime directory.
    pub async fn connect() -> Result<(Self, mpsc::UnboundedReceiver<ClientNotice>)> {
        let socket_path = paths::get_socket_path();

        if let Ok(stream) = UnixStream::connect(&socket_path).await {
            debug!("Connected to existing daemon");
            let token = paths::read_token(&paths::get_token_path())
                .context("Daemon running but token file is missing")?;
            return Self::from_stream(stream, &token).await;
        }

        info!("Daemon not running, starting...");
        let child = start_daemon()?;
        let stream = wait_for_daemon(&socket_path, child).await?;
        // The new daemon wrote a fresh token; read after connecting.
        let token = paths::read_token(&paths::get_token_path())
            .context("Daemon started but token file is missing")?;
        Self::from_stream(stream, &token).await
    }

    /// Connect to a specific socket and authenticate with `token`.
    pub async fn connect_to(
        socket_path: &Path,
        token: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientNotice>)> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("Failed to connect to daemon at {:?}", socket_path))?;
        Self::from_stream(stream, token).await
    }

    async fn from_stream(
        stream: UnixStream,
        token: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientNotice>)> {
        let (reader, mut writer) = stream.into_split();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<String>();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let dispatch = Arc::new(DispatchTable::new());
        let connected = Arc::new(AtomicBool::new(true));

        let write_task = tokio::spawn(async move {
            while let Some(line) = write_rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                    || writer.flush().await.is_err()
                {
                    debug!("Daemon writer closed");
                    break;
                }
            }
        });

        let read_task = {
            let dispatch = dispatch.clone();
            let connected = connected.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(reader);
                let mut line = String::new();
                let reason = loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) => break "daemon closed the connection".to_string(),
                        Ok(_) => {}
                        Err(e) => break format!("read error: {}", e),
                    }

                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    match serde_json::from_str::<Frame>(trimmed) {
                        Ok(Frame::Response(response)) => {
                            if !dispatch.complete(&response.id, response.clone()) {
                                debug!("Dropping late response for request {}", response.id);
                            }
                        }
                        Ok(Frame::Event { session_id, event }) => {
                            let _ = notice_tx.send(ClientNotice::Event { session_id, event });
                        }
                        Err(e) => {
                            warn!("Unparseable frame from daemon: {}", e);
                        }
                    }
                };

                connected.store(false, Ordering::SeqCst);
                dispatch.fail_all_pending(&ApiError::disconnected(&reason));
                let _ = notice_tx.send(ClientNotice::Disconnected { reason });
            })
        };

        let client = Self {
            write_tx,
            dispatch,
            connected,
            request_counter: AtomicU64::new(1),
            read_task,
            write_task,
        };

        // Authenticate before handing the connection out.
        let hello = client
            .request_with_timeout(
                Command::Hello {
                    token: token.to_string(),
                },
                HANDSHAKE_TIMEOUT,
            )
            .await;
        match hello {
            Ok(response) if response.success => Ok((client, notice_rx)),
            Ok(response) => {
                client.dispose();
                bail!(
                    "Daemon rejected authentication: {}",
                    response
                        .error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown error".to_string())
                )
            }
            Err(e) => {
                client.dispose();
                bail!("Authentication handshake failed: {}", e)
            }
        }
    }

    /// Whether the transport is still up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a command and wait for its response.
    pub async fn request(&self, command: Command) -> Result<Response, ApiError> {
        self.request_with_timeout(command, REQUEST_TIMEOUT).await
    }

    /// Send a command with a custom timeout.
    pub async fn request_with_timeout(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<Response, ApiError> {
        if !self.is_connected() {
            return Err(ApiError::disconnected("connection already closed"));
        }

        let id = self
            .request_counter
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let request = Request {
            id: id.clone(),
            command,
        };
        let json = serde_json::to_string(&request)
            .map_err(|e| ApiError::internal(format!("Failed to serialize request: {}", e)))?;

        // Register before writing so a fast response always finds its slot.
        self.dispatch.register(&id, timeout);
        if self.write_tx.send(json).is_err() {
            return Err(ApiError::disconnected("writer task gone"));
        }

        match self.dispatch.await_outcome(&id).await {
            Outcome::Completed(response) => Ok(response),
            Outcome::Failed(error) => Err(error),
            Outcome::TimedOut => Err(ApiError::command_failed(format!(
                "Request {} timed out after {:?}",
                id, timeout
            ))),
        }
    }

    /// Tear the connection down. Pending requests fail with a
    /// disconnection error.
    pub fn dispose(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.dispatch
            .fail_all_pending(&ApiError::disconnected("client disposed"));
        self.read_task.abort();
        self.write_task.abort();
    }
}

impl Drop for DaemonClient {
    fn drop(&mut self) {
        self.read_task.abort();
        self.write_task.abort();
    }
}

/// Probe for a live, authenticating daemon without starting one.
///
/// Bounded by the handshake timeout. Returns false, never an error,
/// when the daemon is absent, unreachable, or rejects the token.
pub async fn daemon_reachable() -> bool {
    let socket_path = paths::get_socket_path();
    let Some(token) = paths::read_token(&paths::get_token_path()) else {
        return false;
    };
    match tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        DaemonClient::connect_to(&socket_path, &token),
    )
    .await
    {
        Ok(Ok((client, _notices))) => {
            client.dispose();
            true
        }
        _ => false,
    }
}

/// Start the daemon as a detached background process.
///
/// process_group(0) makes the daemon a group leader so it won't receive
/// SIGHUP when the launching terminal closes.
fn start_daemon() -> Result<std::process::Child> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("Failed to get current executable path")?;

    let child = std::process::Command::new(exe)
        .arg("daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .context("Failed to spawn daemon process")?;

    Ok(child)
}

/// Wait for the daemon socket to accept, detecting early crashes so the
/// caller gets a fast error instead of the full timeout.
///
/// On timeout the child is killed and reaped before the error returns,
/// so a daemon that never binds cannot pile up across retries.
async fn wait_for_daemon(socket_path: &PathBuf, child: std::process::Child) -> Result<UnixStream> {
    wait_for_daemon_with_timeout(socket_path, child, DAEMON_STARTUP_TIMEOUT).await
}

async fn wait_for_daemon_with_timeout(
    socket_path: &PathBuf,
    mut child: std::process::Child,
    startup_timeout: Duration,
) -> Result<UnixStream> {
    let start = std::time::Instant::now();

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                bail!(
                    "Daemon exited immediately with status: {} (run 'ptykeep daemon' directly to diagnose)",
                    status
                );
            }
            Ok(None) => {}
            Err(e) => {
                debug!("Error checking daemon status: {}", e);
            }
        }

        match UnixStream::connect(socket_path).await {
            Ok(stream) => {
                info!("Connected to daemon after {:?}", start.elapsed());
                return Ok(stream);
            }
            Err(_) => {
                if start.elapsed() > startup_timeout {
                    if let Err(e) = child.kill() {
                        debug!("Failed to kill unresponsive daemon child: {}", e);
                    }
                    let _ = child.try_wait();
                    bail!("Daemon failed to start within {:?}", startup_timeout);
                }
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}
