//! Unix socket server for the daemon process.
//!
//! Frames are newline-delimited JSON. Every connection must open with a
//! `hello` carrying the daemon token; until then all commands are
//! rejected. After that the connection is full-duplex: requests get
//! correlated responses, and subscribed sessions push events interleaved
//! with them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ptykeep_core::error::ApiError;
use ptykeep_core::protocol::{Command, Frame, Request, Response, ResponseData};

use crate::daemon::paths;
use crate::daemon::registry::{RegistryConfig, SessionRegistry};

/// Maximum number of concurrent client connections.
const MAX_CONNECTIONS: usize = 100;

/// How long the daemon waits with no sessions and no clients before
/// auto-shutdown.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How often to check for idle shutdown condition.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for in-flight connections to complete during shutdown.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum request size in bytes.
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// The daemon server that listens for client connections.
pub struct DaemonServer {
    listener: UnixListener,
    socket_path: PathBuf,
    pid_path: PathBuf,
    token_path: PathBuf,
    token: String,
    registry: Arc<SessionRegistry>,
    connection_semaphore: Arc<Semaphore>,
    /// Shutdown signal for graceful termination (lets Drop clean up files).
    shutdown: Arc<Notify>,
}

impl DaemonServer {
    /// Bind to the default runtime directory paths.
    pub async fn bind() -> Result<Self> {
        paths::ensure_runtime_dir().context("Failed to create runtime directory")?;
        Self::bind_to(
            paths::get_socket_path(),
            paths::get_pid_path(),
            paths::get_token_path(),
        )
        .await
    }

    /// Bind to specific paths, generating a fresh connection token.
    ///
    /// Uses a bind-first approach to avoid TOCTOU races:
    /// 1. Try to bind directly
    /// 2. If the socket is in use, check the PID file for a live daemon
    /// 3. If that daemon is dead, remove the stale socket and retry
    /// 4. If it is alive, refuse to start
    pub async fn bind_to(
        socket_path: PathBuf,
        pid_path: PathBuf,
        token_path: PathBuf,
    ) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create socket directory for {:?}", socket_path)
            })?;
        }

        // Write the PID immediately after a successful bind so another
        // starting daemon never sees our socket without a valid PID file.
        let write_pid = |pid_path: &PathBuf| -> Result<()> {
            std::fs::write(pid_path, std::process::id().to_string())
                .with_context(|| format!("Failed to write PID file: {:?}", pid_path))
        };

        let listener = match UnixListener::bind(&socket_path) {
            Ok(l) => {
                write_pid(&pid_path)?;
                l
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if is_daemon_alive(&pid_path) {
                    anyhow::bail!(
                        "Daemon already running (socket {:?} in use, PID file valid)",
                        socket_path
                    );
                }

                // The old daemon is dead; verify the path is really a
                // socket before deleting it. Don't follow symlinks.
                let metadata = std::fs::symlink_metadata(&socket_path)
                    .with_context(|| format!("Failed to stat socket path: {:?}", socket_path))?;

                if metadata.file_type().is_symlink() {
                    anyhow::bail!(
                        "Socket path {:?} is a symlink, refusing to delete",
                        socket_path
                    );
                }

                #[cfg(unix)]
                {
                    use std::os::unix::fs::FileTypeExt;
                    if !metadata.file_type().is_socket() {
                        anyhow::bail!(
                            "Path {:?} exists but is not a socket file (type: {:?})",
                            socket_path,
                            metadata.file_type()
                        );
                    }
                }

                info!("Removing stale socket from dead daemon");
                std::fs::remove_file(&socket_path)
                    .with_context(|| format!("Failed to remove stale socket: {:?}", socket_path))?;

                let l = UnixListener::bind(&socket_path)
                    .with_context(|| format!("Failed to bind to socket: {:?}", socket_path))?;
                write_pid(&pid_path)?;
                l
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to bind to socket: {:?}", socket_path));
            }
        };

        let token = Uuid::new_v4().to_string();
        paths::write_token(&token_path, &token)
            .with_context(|| format!("Failed to write token file: {:?}", token_path))?;

        info!("Daemon listening on {:?}", socket_path);

        Ok(Self {
            listener,
            socket_path,
            pid_path,
            token_path,
            token,
            registry: Arc::new(SessionRegistry::new(RegistryConfig::default())),
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Run the server until shutdown is signaled.
    ///
    /// Spawns the registry cleaner and the idle shutdown monitor, then
    /// accepts connections behind the semaphore. On shutdown, waits for
    /// in-flight connections with a timeout before aborting them.
    pub async fn run(&self) -> Result<()> {
        self.registry.spawn_cleaner();
        self.spawn_idle_shutdown_task();

        let mut connection_tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!(
                                        "Connection limit ({}) reached, rejecting new connection",
                                        MAX_CONNECTIONS
                                    );
                                    drop(stream);
                                    continue;
                                }
                            };

                            debug!("Accepted new connection");
                            let registry = self.registry.clone();
                            let shutdown = self.shutdown.clone();
                            let token = self.token.clone();
                            connection_tasks.spawn(async move {
                                // Permit is held for the connection's lifetime
                                let _permit = permit;
                                if let Err(e) =
                                    handle_connection(stream, registry, shutdown, token).await
                                {
                                    error!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                // Reap completed connection tasks to prevent unbounded growth
                Some(_) = connection_tasks.join_next(), if !connection_tasks.is_empty() => {}
                _ = self.shutdown.notified() => {
                    info!("Shutdown signal received, waiting for in-flight connections");
                    break;
                }
            }
        }

        if !connection_tasks.is_empty() {
            info!(
                "Waiting for {} in-flight connection(s) to complete",
                connection_tasks.len()
            );

            let drained = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, async {
                while connection_tasks.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!(
                    "Graceful shutdown timed out after {:?}, aborting {} connection(s)",
                    GRACEFUL_SHUTDOWN_TIMEOUT,
                    connection_tasks.len()
                );
                connection_tasks.abort_all();
            }
        }

        Ok(())
    }

    /// The daemon exits after [`IDLE_TIMEOUT`] with no sessions and no
    /// client connections. A client connected without sessions counts as
    /// activity. Signals via Notify instead of exiting so Drop runs.
    fn spawn_idle_shutdown_task(&self) {
        let registry = self.registry.clone();
        let shutdown = self.shutdown.clone();
        let semaphore = self.connection_semaphore.clone();

        tokio::spawn(async move {
            let mut idle_since: Option<Instant> = None;

            loop {
                tokio::time::sleep(IDLE_CHECK_INTERVAL).await;

                let has_sessions = !registry.is_empty().await;
                let has_connections = semaphore.available_permits() < MAX_CONNECTIONS;

                if has_sessions || has_connections {
                    idle_since = None;
                    continue;
                }

                let idle_start = *idle_since.get_or_insert_with(Instant::now);

                if idle_start.elapsed() >= IDLE_TIMEOUT {
                    // Double-check to narrow the race window
                    let still_has_sessions = !registry.is_empty().await;
                    let still_has_connections = semaphore.available_permits() < MAX_CONNECTIONS;

                    if still_has_sessions || still_has_connections {
                        idle_since = None;
                        continue;
                    }

                    info!(
                        "No activity for {} seconds, shutting down",
                        IDLE_TIMEOUT.as_secs()
                    );
                    shutdown.notify_waiters();
                    break;
                }

                debug!(
                    "Idle for {} seconds (shutdown in {} seconds)",
                    idle_start.elapsed().as_secs(),
                    IDLE_TIMEOUT.saturating_sub(idle_start.elapsed()).as_secs()
                );
            }
        });
    }
}

impl Drop for DaemonServer {
    fn drop(&mut self) {
        for path in [&self.socket_path, &self.pid_path, &self.token_path] {
            if path.exists() && std::fs::remove_file(path).is_err() {
                warn!("Failed to remove {:?} on shutdown", path);
            }
        }
    }
}

/// Check whether a daemon process is still alive via its PID file.
fn is_daemon_alive(pid_path: &Path) -> bool {
    let pid_str = match std::fs::read_to_string(pid_path) {
        Ok(s) => s,
        Err(_) => return false,
    };

    let pid: i32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => return false,
    };

    // kill(pid, 0) checks process existence without delivering a signal.
    // SAFETY: signal 0 is a POSIX-defined existence probe; the pid was
    // validated as an i32 above.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Read a line with a size limit.
///
/// Returns the number of bytes read (0 means EOF). Errors if the line
/// exceeds `max_size` before a newline.
async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut String,
    max_size: usize,
) -> Result<usize> {
    use tokio::io::AsyncBufReadExt;

    let mut total = 0;
    let mut bytes = Vec::new();

    loop {
        let available = reader
            .fill_buf()
            .await
            .context("Failed to read from client")?;

        if available.is_empty() {
            // EOF
            if !bytes.is_empty() {
                let line = std::str::from_utf8(&bytes).context("Invalid UTF-8 in request")?;
                buf.push_str(line);
            }
            return Ok(total);
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let bytes_to_consume = newline_pos.map(|p| p + 1).unwrap_or(available.len());

        if total + bytes_to_consume > max_size {
            anyhow::bail!("Request too large: exceeded {} byte limit", max_size);
        }

        // Accumulate raw bytes; validate UTF-8 once at the end so
        // multi-byte characters split across reads stay intact.
        bytes.extend_from_slice(&available[..bytes_to_consume]);
        total += bytes_to_consume;

        reader.consume(bytes_to_consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let line = std::str::from_utf8(&bytes).context("Invalid UTF-8 in request")?;
    buf.push_str(line);
    Ok(total)
}

/// A live subscription on one connection: the registry tap id plus the
/// forwarder task moving events onto the connection's outbound channel.
struct SubscriptionHandle {
    tap_id: u64,
    forwarder: JoinHandle<()>,
}

/// Handle a single client connection.
///
/// The writer half is owned by a dedicated task fed from an unbounded
/// channel, so responses and pushed events serialize onto the stream
/// without interleaving.
async fn handle_connection(
    stream: UnixStream,
    registry: Arc<SessionRegistry>,
    shutdown: Arc<Notify>,
    token: String,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize frame: {}", e);
                    continue;
                }
            };
            if writer.write_all(json.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
                || writer.flush().await.is_err()
            {
                debug!("Client writer closed");
                break;
            }
        }
    });

    let mut authenticated = false;
    let mut subscriptions: HashMap<String, SubscriptionHandle> = HashMap::new();

    loop {
        line.clear();
        let bytes_read = read_line_bounded(&mut reader, &mut line, MAX_REQUEST_SIZE).await?;
        if bytes_read == 0 {
            debug!("Client disconnected");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => request,
            Err(e) => {
                let response = Response::error(
                    "unknown",
                    ApiError::invalid_input(format!("Invalid JSON request: {}", e)),
                );
                if out_tx.send(Frame::Response(response)).is_err() {
                    break;
                }
                continue;
            }
        };

        if !authenticated {
            match &request.command {
                Command::Hello { token: presented } if *presented == token => {
                    authenticated = true;
                    let response = Response::success(
                        &request.id,
                        ResponseData::Ok {
                            message: "Authenticated".to_string(),
                        },
                    );
                    let _ = out_tx.send(Frame::Response(response));
                }
                Command::Hello { .. } => {
                    warn!("Connection presented a bad token, closing");
                    let response = Response::error(&request.id, ApiError::auth_rejected());
                    let _ = out_tx.send(Frame::Response(response));
                    break;
                }
                _ => {
                    let response = Response::error(&request.id, ApiError::not_authenticated());
                    if out_tx.send(Frame::Response(response)).is_err() {
                        break;
                    }
                }
            }
            continue;
        }

        // Subscribe and unsubscribe touch connection-local state, so
        // they are handled here; everything else goes to the registry.
        let response = match request.command {
            Command::Subscribe { session_id } => {
                handle_subscribe(
                    &request.id,
                    &registry,
                    &out_tx,
                    &mut subscriptions,
                    session_id,
                )
                .await
            }
            Command::Unsubscribe { session_id } => {
                if let Some(handle) = subscriptions.remove(&session_id) {
                    registry.unsubscribe(&session_id, handle.tap_id).await;
                    handle.forwarder.abort();
                }
                Response::success(
                    &request.id,
                    ResponseData::Ok {
                        message: format!("Unsubscribed from {}", session_id),
                    },
                )
            }
            command => handle_request(&request.id, command, &registry, &shutdown).await,
        };

        if out_tx.send(Frame::Response(response)).is_err() {
            break;
        }
    }

    // Drop this connection's taps; other connections' subscriptions to
    // the same sessions are unaffected.
    for (session_id, handle) in subscriptions {
        registry.unsubscribe(&session_id, handle.tap_id).await;
        handle.forwarder.abort();
    }

    drop(out_tx);
    let _ = writer_task.await;
    Ok(())
}

/// Tap a session's events and forward them to this connection, returning
/// the scrollback snapshot taken atomically with the tap.
async fn handle_subscribe(
    request_id: &str,
    registry: &Arc<SessionRegistry>,
    out_tx: &mpsc::UnboundedSender<Frame>,
    subscriptions: &mut HashMap<String, SubscriptionHandle>,
    session_id: String,
) -> Response {
    // Re-subscribing replaces the existing tap, yielding a fresh snapshot.
    if let Some(old) = subscriptions.remove(&session_id) {
        registry.unsubscribe(&session_id, old.tap_id).await;
        old.forwarder.abort();
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    match registry.subscribe(&session_id, tx).await {
        Ok((tap_id, scrollback)) => {
            let out = out_tx.clone();
            let event_session = session_id.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let frame = Frame::Event {
                        session_id: event_session.clone(),
                        event,
                    };
                    if out.send(frame).is_err() {
                        break;
                    }
                }
            });
            subscriptions.insert(session_id.clone(), SubscriptionHandle { tap_id, forwarder });
            Response::success(
                request_id,
                ResponseData::Subscribed {
                    session_id,
                    scrollback,
                },
            )
        }
        Err(e) => Response::error(request_id, e),
    }
}

/// Handle a registry-backed command and produce its response.
async fn handle_request(
    request_id: &str,
    command: Command,
    registry: &Arc<SessionRegistry>,
    shutdown: &Arc<Notify>,
) -> Response {
    debug!("Handling command: {:?}", command);

    match command {
        Command::Hello { .. } => Response::success(
            request_id,
            ResponseData::Ok {
                message: "Already authenticated".to_string(),
            },
        ),

        Command::CreateOrAttach(spec) => {
            if spec.cols == 0 || spec.rows == 0 {
                return Response::error(
                    request_id,
                    ApiError::invalid_input("Terminal dimensions must be greater than 0"),
                );
            }
            match registry.create_or_attach(&spec).await {
                Ok(outcome) => Response::success(
                    request_id,
                    ResponseData::Attached {
                        session_id: outcome.session_id,
                        is_new: outcome.is_new,
                        was_recovered: outcome.was_recovered,
                        scrollback: outcome.scrollback,
                    },
                ),
                Err(e) => Response::error(request_id, e),
            }
        }

        Command::Write { session_id, data } => match registry.write(&session_id, &data).await {
            Ok(()) => Response::success(
                request_id,
                ResponseData::Ok {
                    message: format!("Wrote {} bytes", data.len()),
                },
            ),
            Err(e) => Response::error(request_id, e),
        },

        Command::Resize {
            session_id,
            cols,
            rows,
        } => {
            if cols == 0 || rows == 0 {
                return Response::error(
                    request_id,
                    ApiError::invalid_input("Terminal dimensions must be greater than 0"),
                );
            }
            match registry.resize(&session_id, cols, rows).await {
                Ok(()) => Response::success(
                    request_id,
                    ResponseData::Ok {
                        message: format!("Resized terminal to {}x{}", cols, rows),
                    },
                ),
                Err(e) => Response::error(request_id, e),
            }
        }

        Command::Signal { session_id, signal } => {
            match registry.signal(&session_id, signal.as_deref()).await {
                Ok(()) => Response::success(
                    request_id,
                    ResponseData::Ok {
                        message: "Signal delivered".to_string(),
                    },
                ),
                Err(e) => Response::error(request_id, e),
            }
        }

        Command::Kill {
            session_id,
            delete_history,
        } => match registry.kill(&session_id, delete_history).await {
            Ok(()) => {
                info!("Killed session: {}", session_id);
                Response::success(
                    request_id,
                    ResponseData::Ok {
                        message: format!("Session {} killed", session_id),
                    },
                )
            }
            Err(e) => Response::error(request_id, e),
        },

        Command::List => Response::success(
            request_id,
            ResponseData::Sessions {
                sessions: registry.list().await,
            },
        ),

        Command::KillAll => {
            let count = registry.kill_all().await;
            info!("Killed {} session(s)", count);
            Response::success(request_id, ResponseData::Killed { count })
        }

        Command::KillForWorkspace { workspace_id } => {
            let count = registry.kill_for_workspace(&workspace_id).await;
            info!("Killed {} session(s) in workspace {}", count, workspace_id);
            Response::success(request_id, ResponseData::Killed { count })
        }

        Command::Shutdown => {
            info!("Received shutdown command, stopping daemon");

            // Finish the shutdown after this response has flushed.
            let registry = registry.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let count = registry.kill_all().await;
                info!("Killed {} session(s) during shutdown", count);
                tokio::time::sleep(Duration::from_millis(50)).await;
                shutdown.notify_waiters();
            });

            Response::success(
                request_id,
                ResponseData::Ok {
                    message: "Daemon shutting down".to_string(),
                },
            )
        }

        // Handled at the connection layer.
        Command::Subscribe { .. } | Command::Unsubscribe { .. } => Response::error(
            request_id,
            ApiError::internal("Subscription command reached the registry handler"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptykeep_core::error::ErrorCode;
    use ptykeep_core::protocol::{SessionEvent, SessionSpec};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::time::timeout;

    struct TestDaemon {
        socket_path: PathBuf,
        token: String,
        server_handle: tokio::task::JoinHandle<()>,
    }

    impl TestDaemon {
        async fn start(tag: &str) -> Self {
            let short_id = Uuid::new_v4().simple().to_string();
            let socket_path = std::env::temp_dir()
                .join(format!("ptykeep-{}-{}.sock", tag, &short_id[..8]));
            let pid_path = socket_path.with_extension("pid");
            let token_path = socket_path.with_extension("token");

            let server =
                DaemonServer::bind_to(socket_path.clone(), pid_path, token_path.clone())
                    .await
                    .expect("Failed to bind server");
            let token = paths::read_token(&token_path).expect("token file");

            let server_handle = tokio::spawn(async move {
                let _ = timeout(Duration::from_secs(10), server.run()).await;
            });
            tokio::time::sleep(Duration::from_millis(50)).await;

            Self {
                socket_path,
                token,
                server_handle,
            }
        }

        async fn connect(&self) -> TestConn {
            let stream = UnixStream::connect(&self.socket_path)
                .await
                .expect("Failed to connect");
            let (reader, writer) = stream.into_split();
            TestConn {
                reader: BufReader::new(reader),
                writer,
            }
        }

        async fn connect_authenticated(&self) -> TestConn {
            let mut conn = self.connect().await;
            let response = conn
                .request(
                    "hello",
                    Command::Hello {
                        token: self.token.clone(),
                    },
                )
                .await;
            assert!(response.success, "hello failed: {:?}", response.error);
            conn
        }

        fn stop(self) {
            self.server_handle.abort();
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }

    struct TestConn {
        reader: BufReader<tokio::net::unix::OwnedReadHalf>,
        writer: tokio::net::unix::OwnedWriteHalf,
    }

    impl TestConn {
        async fn send(&mut self, id: &str, command: Command) {
            let request = Request {
                id: id.to_string(),
                command,
            };
            let json = serde_json::to_string(&request).unwrap();
            self.writer.write_all(json.as_bytes()).await.expect("write");
            self.writer.write_all(b"\n").await.expect("newline");
            self.writer.flush().await.expect("flush");
        }

        async fn next_frame(&mut self) -> Frame {
            let mut line = String::new();
            let bytes = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .expect("timeout waiting for frame")
                .expect("read frame");
            assert!(bytes > 0, "connection closed");
            serde_json::from_str(&line).expect("parse frame")
        }

        /// Send a request and wait for its response, skipping any pushed
        /// events that arrive in between.
        async fn request(&mut self, id: &str, command: Command) -> Response {
            self.send(id, command).await;
            loop {
                match self.next_frame().await {
                    Frame::Response(response) if response.id == id => return response,
                    Frame::Response(other) => {
                        panic!("unexpected response id: {}", other.id)
                    }
                    Frame::Event { .. } => continue,
                }
            }
        }
    }

    fn spec(session_id: &str, command: &[&str]) -> SessionSpec {
        SessionSpec {
            session_id: session_id.to_string(),
            workspace_id: "ws-test".to_string(),
            tab_id: session_id.to_string(),
            cwd: None,
            cols: 80,
            rows: 24,
            command: command.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn commands_before_hello_are_rejected() {
        let daemon = TestDaemon::start("auth").await;
        let mut conn = daemon.connect().await;

        let response = conn.request("1", Command::List).await;
        assert!(!response.success);
        assert_eq!(
            response.error.expect("error").code,
            ErrorCode::NotAuthenticated
        );

        // The connection survives; a correct hello still works.
        let response = conn
            .request(
                "2",
                Command::Hello {
                    token: daemon.token.clone(),
                },
            )
            .await;
        assert!(response.success);

        let response = conn.request("3", Command::List).await;
        assert!(response.success);

        daemon.stop();
    }

    #[tokio::test]
    async fn bad_token_closes_the_connection() {
        let daemon = TestDaemon::start("badtok").await;
        let mut conn = daemon.connect().await;

        let response = conn
            .request(
                "1",
                Command::Hello {
                    token: "wrong".to_string(),
                },
            )
            .await;
        assert!(!response.success);

        // Server closes after a rejected hello.
        let mut line = String::new();
        let bytes = timeout(Duration::from_secs(2), conn.reader.read_line(&mut line))
            .await
            .expect("timeout")
            .expect("read");
        assert_eq!(bytes, 0, "expected EOF after rejected token");

        daemon.stop();
    }

    #[tokio::test]
    async fn create_write_and_stream_events() {
        let daemon = TestDaemon::start("stream").await;
        let mut conn = daemon.connect_authenticated().await;

        let response = conn
            .request("create", Command::CreateOrAttach(spec("pane-1", &["cat"])))
            .await;
        assert!(response.success, "create failed: {:?}", response.error);
        match response.data {
            Some(ResponseData::Attached { is_new, .. }) => assert!(is_new),
            other => panic!("expected attached data, got {:?}", other),
        }

        let response = conn
            .request(
                "sub",
                Command::Subscribe {
                    session_id: "pane-1".to_string(),
                },
            )
            .await;
        assert!(response.success);

        conn.request(
            "write",
            Command::Write {
                session_id: "pane-1".to_string(),
                data: "hello daemon\n".to_string(),
            },
        )
        .await;

        // cat echoes the write back as a data event.
        let mut collected = String::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && !collected.contains("hello daemon") {
            if let Frame::Event {
                session_id,
                event: SessionEvent::Data { data },
            } = conn.next_frame().await
            {
                assert_eq!(session_id, "pane-1");
                collected.push_str(&data);
            }
        }
        assert!(
            collected.contains("hello daemon"),
            "echoed data not received: {:?}",
            collected
        );

        let response = conn
            .request(
                "kill",
                Command::Kill {
                    session_id: "pane-1".to_string(),
                    delete_history: false,
                },
            )
            .await;
        assert!(response.success);

        daemon.stop();
    }

    #[tokio::test]
    async fn subscribe_to_unknown_session_fails() {
        let daemon = TestDaemon::start("nosub").await;
        let mut conn = daemon.connect_authenticated().await;

        let response = conn
            .request(
                "sub",
                Command::Subscribe {
                    session_id: "ghost".to_string(),
                },
            )
            .await;
        assert!(!response.success);
        assert_eq!(
            response.error.expect("error").code,
            ErrorCode::SessionNotFound
        );

        daemon.stop();
    }

    #[tokio::test]
    async fn sessions_survive_client_disconnect() {
        let daemon = TestDaemon::start("survive").await;

        {
            let mut conn = daemon.connect_authenticated().await;
            let response = conn
                .request("create", Command::CreateOrAttach(spec("pane-keep", &["cat"])))
                .await;
            assert!(response.success);
            // Connection drops here.
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut conn = daemon.connect_authenticated().await;
        let response = conn
            .request(
                "attach",
                Command::CreateOrAttach(spec("pane-keep", &["cat"])),
            )
            .await;
        match response.data {
            Some(ResponseData::Attached {
                is_new,
                was_recovered,
                ..
            }) => {
                assert!(!is_new, "session should have survived the disconnect");
                assert!(was_recovered);
            }
            other => panic!("expected attached data, got {:?}", other),
        }

        conn.request(
            "kill",
            Command::Kill {
                session_id: "pane-keep".to_string(),
                delete_history: false,
            },
        )
        .await;
        daemon.stop();
    }

    #[tokio::test]
    async fn kill_all_reports_count() {
        let daemon = TestDaemon::start("killall").await;
        let mut conn = daemon.connect_authenticated().await;

        for i in 0..2 {
            let response = conn
                .request(
                    &format!("create-{}", i),
                    Command::CreateOrAttach(spec(&format!("pane-{}", i), &["cat"])),
                )
                .await;
            assert!(response.success);
        }

        let response = conn.request("killall", Command::KillAll).await;
        match response.data {
            Some(ResponseData::Killed { count }) => assert_eq!(count, 2),
            other => panic!("expected killed data, got {:?}", other),
        }

        daemon.stop();
    }

    #[tokio::test]
    async fn invalid_json_yields_error_response() {
        let daemon = TestDaemon::start("badjson").await;
        let mut conn = daemon.connect().await;

        conn.writer
            .write_all(b"this is not json\n")
            .await
            .expect("write");
        conn.writer.flush().await.expect("flush");

        match conn.next_frame().await {
            Frame::Response(response) => {
                assert!(!response.success);
                assert_eq!(
                    response.error.expect("error").code,
                    ErrorCode::InvalidInput
                );
            }
            other => panic!("expected response frame, got {:?}", other),
        }

        daemon.stop();
    }

    #[tokio::test]
    async fn bind_refuses_second_daemon() {
        let daemon = TestDaemon::start("double").await;

        let pid_path = daemon.socket_path.with_extension("pid");
        let token_path = daemon.socket_path.with_extension("token2");
        let result =
            DaemonServer::bind_to(daemon.socket_path.clone(), pid_path, token_path).await;
        assert!(result.is_err(), "second bind should fail while alive");

        daemon.stop();
    }
}
